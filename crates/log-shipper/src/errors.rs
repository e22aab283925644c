// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors that stop the daemon or prevent it from starting.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read from input stream: {0}")]
    InputRead(#[from] std::io::Error),

    #[error("Backend discovery failed: {0}")]
    Discovery(String),
}

/// Errors raised by a backend while discovering brokers or creating producers.
///
/// Per-record send failures are not errors of this kind: they are reported
/// asynchronously on the producer's error feed.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("Invalid broker address '{0}'")]
    InvalidBroker(String),

    #[error("No broker addresses configured")]
    NoBrokers,

    #[error("No reachable broker: {0}")]
    Unreachable(String),

    #[error("Failed to create producer for topic {topic}: {reason}")]
    Creation { topic: String, reason: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<ProducerError> for ShipperError {
    fn from(err: ProducerError) -> Self {
        ShipperError::Discovery(err.to_string())
    }
}
