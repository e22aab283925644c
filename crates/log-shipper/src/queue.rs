// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-destination record queues.
//!
//! Producers (the router) never block on a queue: they use `try_send` and
//! treat a full queue as congestion. The single consumer of each queue is its
//! forwarder, which stops pulling once close has been requested. A submit
//! already in progress is only given up when the queue is abandoned.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::record::{LogLine, Stream};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Creates the queue feeding the forwarder of `stream`.
#[must_use]
pub fn bounded(stream: Stream, capacity: usize) -> (QueueHandle, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    let close = CancellationToken::new();
    let abandon = CancellationToken::new();
    (
        QueueHandle {
            stream,
            tx,
            close: close.clone(),
            abandon: abandon.clone(),
        },
        QueueConsumer {
            stream,
            rx,
            close,
            abandon,
        },
    )
}

/// Producer side of a queue, plus the close switch used during shutdown.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    stream: Stream,
    tx: mpsc::Sender<LogLine>,
    close: CancellationToken,
    abandon: CancellationToken,
}

impl QueueHandle {
    #[must_use]
    pub fn stream(&self) -> Stream {
        self.stream
    }

    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<LogLine> {
        self.tx.clone()
    }

    /// Number of records waiting for the forwarder.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once nothing more can be pulled from the queue by the forwarder.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.tx.is_closed() || self.close.is_cancelled() || self.is_empty()
    }

    pub async fn wait_drained(&self) {
        while !self.is_drained() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Tells the forwarder to stop pulling and flush what is left locally.
    pub fn request_close(&self) {
        self.close.cancel();
    }

    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Closes the queue and makes the forwarder give up the record it is
    /// submitting, which then goes to the local console.
    pub fn abandon_in_flight(&self) {
        self.close.cancel();
        self.abandon.cancel();
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandon.is_cancelled()
    }
}

/// Consumer side of a queue, owned by exactly one forwarder.
#[derive(Debug)]
pub struct QueueConsumer {
    stream: Stream,
    rx: mpsc::Receiver<LogLine>,
    close: CancellationToken,
    abandon: CancellationToken,
}

impl QueueConsumer {
    #[must_use]
    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub async fn recv(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogLine> {
        self.rx.try_recv().ok()
    }

    /// Resolves once close has been requested on the queue.
    pub async fn close_requested(&self) {
        self.close.cancelled().await;
    }

    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    #[must_use]
    pub fn abandon_token(&self) -> CancellationToken {
        self.abandon.clone()
    }

    /// Closes the receiving side and hands back every record still buffered.
    pub fn close_and_take(&mut self) -> Vec<LogLine> {
        self.rx.close();
        let mut remaining = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            remaining.push(line);
        }
        remaining
    }
}
