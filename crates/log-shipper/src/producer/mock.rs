// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Backend, Producer, ProducerConfig, ProducerHandle, SendFailure};
use crate::errors::ProducerError;

/// In-memory backend recording everything it is asked to do.
#[derive(Debug, Default)]
pub struct MockBackend {
    pub discover_fails: AtomicBool,
    /// Producer creations to fail before succeeding.
    pub creation_failures: AtomicUsize,
    pub creation_attempts: AtomicUsize,
    pub producer: Arc<MockProducer>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_creations(count: usize) -> Arc<Self> {
        let backend = Self::default();
        backend.creation_failures.store(count, Ordering::SeqCst);
        Arc::new(backend)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn discover(&self) -> Result<(), ProducerError> {
        if self.discover_fails.load(Ordering::SeqCst) {
            return Err(ProducerError::Unreachable("mock".to_string()));
        }
        Ok(())
    }

    async fn create_producer(
        &self,
        config: ProducerConfig,
    ) -> Result<ProducerHandle, ProducerError> {
        self.creation_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.creation_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.creation_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProducerError::Creation {
                topic: config.topic,
                reason: "broker not ready".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.producer.errors.lock().unwrap() = Some(tx);
        Ok(ProducerHandle {
            producer: Arc::clone(&self.producer) as Arc<dyn Producer>,
            errors: rx,
        })
    }
}

#[derive(Debug, Default)]
pub struct MockProducer {
    pub sent: Mutex<Vec<String>>,
    /// Error texts returned for the next sends, in order.
    pub failures: Mutex<VecDeque<String>>,
    /// Makes every send hang for this long.
    pub stall: Mutex<Option<Duration>>,
    pub panic_on_send: AtomicBool,
    pub closed: AtomicBool,
    errors: Mutex<Option<mpsc::UnboundedSender<SendFailure>>>,
}

impl MockProducer {
    pub fn fail_next(&self, error: &str) {
        self.failures.lock().unwrap().push_back(error.to_string());
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Producer for MockProducer {
    async fn send(&self, payload: String) {
        assert!(
            !self.panic_on_send.load(Ordering::SeqCst),
            "producer failed hard on {payload}"
        );
        let stall = *self.stall.lock().unwrap();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(error) => {
                if let Some(tx) = self.errors.lock().unwrap().as_ref() {
                    let _ = tx.send(SendFailure::new(payload, error));
                }
            }
            None => self.sent.lock().unwrap().push(payload),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.errors.lock().unwrap().take();
    }
}
