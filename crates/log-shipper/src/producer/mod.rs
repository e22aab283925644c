// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend seam.
//!
//! A [`Backend`] discovers the broker cluster and creates one [`Producer`] per
//! destination topic. Producers accept records without waiting for the broker
//! and report failed deliveries asynchronously on the error feed returned
//! alongside them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::ProducerError;

#[cfg(test)]
pub(crate) mod mock;
pub mod rest;

pub use rest::RestBackend;

/// Error texts a broker uses when a payload exceeds its size limit.
const PAYLOAD_TOO_LARGE_MARKERS: [&str; 3] = [
    "message was too large",
    "message batch larger",
    "payload too large",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    /// Spread records over the topic's partitions in turn.
    RoundRobin,
    /// Let the broker pick the partition.
    BrokerAssigned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub topic: String,
    pub partitioner: Partitioner,
    /// Report failed deliveries on the error feed.
    pub notify_errors: bool,
}

impl ProducerConfig {
    #[must_use]
    pub fn round_robin(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partitioner: Partitioner::RoundRobin,
            notify_errors: true,
        }
    }
}

/// A record the backend could not deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub payload: String,
    pub error: String,
}

impl SendFailure {
    #[must_use]
    pub fn new(payload: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            error: error.into(),
        }
    }

    /// Oversized payloads are never resubmitted.
    #[must_use]
    pub fn is_payload_too_large(&self) -> bool {
        let error = self.error.to_lowercase();
        PAYLOAD_TOO_LARGE_MARKERS
            .iter()
            .any(|marker| error.contains(marker))
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)
    }
}

pub type ErrorFeed = mpsc::UnboundedReceiver<SendFailure>;

pub struct ProducerHandle {
    pub producer: Arc<dyn Producer>,
    pub errors: ErrorFeed,
}

impl fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerHandle").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Checks that at least one broker of the cluster is reachable.
    async fn discover(&self) -> Result<(), ProducerError>;

    async fn create_producer(&self, config: ProducerConfig)
        -> Result<ProducerHandle, ProducerError>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Submits one record. Returns once the backend has answered; failures
    /// are reported on the error feed, not returned.
    async fn send(&self, payload: String);

    /// Releases the producer. Records sent afterwards are dropped.
    async fn close(&self);
}
