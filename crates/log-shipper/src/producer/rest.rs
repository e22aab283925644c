// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broker access through a REST gateway.
//!
//! Every broker address is the base URL of a gateway exposing
//!
//! - `GET  /brokers` for discovery,
//! - `GET  /topics/{topic}` for topic metadata (its partitions),
//! - `POST /topics/{topic}` and `POST /topics/{topic}/partitions/{partition}`
//!   to produce records.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Backend, Partitioner, Producer, ProducerConfig, ProducerHandle, SendFailure,
};
use crate::config::ShipperConfig;
use crate::errors::ProducerError;

const CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";

/// Broker error code for a record over the size limit.
const MESSAGE_TOO_LARGE: i32 = 10;

#[derive(Debug, Deserialize)]
struct TopicMetadata {
    #[serde(default)]
    partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Deserialize)]
struct PartitionMetadata {
    partition: i32,
}

#[derive(Debug, Default, Deserialize)]
struct ProduceResponse {
    #[serde(default)]
    offsets: Vec<ProduceOffset>,
}

#[derive(Debug, Deserialize)]
struct ProduceOffset {
    error_code: Option<i32>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestBackend {
    brokers: Vec<String>,
    client: reqwest::Client,
}

impl RestBackend {
    pub fn new(brokers: &[String], timeout: Duration) -> Result<Self, ProducerError> {
        let brokers = brokers
            .iter()
            .map(|broker| normalize_broker(broker))
            .collect::<Result<Vec<_>, _>>()?;
        if brokers.is_empty() {
            return Err(ProducerError::NoBrokers);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { brokers, client })
    }

    pub fn from_config(config: &ShipperConfig) -> Result<Self, ProducerError> {
        Self::new(&config.brokers, config.request_timeout)
    }

    async fn topic_partitions(&self, broker: &str, topic: &str) -> Result<Vec<i32>, String> {
        let response = self
            .client
            .get(format!("{broker}/topics/{topic}"))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{status}: {body}"));
        }

        let metadata: TopicMetadata = response.json().await.map_err(|e| e.to_string())?;
        Ok(metadata.partitions.iter().map(|p| p.partition).collect())
    }
}

fn normalize_broker(broker: &str) -> Result<String, ProducerError> {
    let broker = broker.trim();
    if !(broker.starts_with("http://") || broker.starts_with("https://")) {
        return Err(ProducerError::InvalidBroker(broker.to_string()));
    }
    Ok(broker.trim_end_matches('/').to_string())
}

#[async_trait]
impl Backend for RestBackend {
    async fn discover(&self) -> Result<(), ProducerError> {
        let mut failures = Vec::with_capacity(self.brokers.len());
        for broker in &self.brokers {
            match self.client.get(format!("{broker}/brokers")).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Discovered broker cluster through {broker}");
                    return Ok(());
                }
                Ok(response) => failures.push(format!("{broker}: {}", response.status())),
                Err(e) => failures.push(format!("{broker}: {e}")),
            }
        }
        Err(ProducerError::Unreachable(failures.join(", ")))
    }

    async fn create_producer(
        &self,
        config: ProducerConfig,
    ) -> Result<ProducerHandle, ProducerError> {
        let mut last_failure = String::new();
        for broker in &self.brokers {
            match self.topic_partitions(broker, &config.topic).await {
                Ok(partitions) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let producer = RestProducer {
                        client: self.client.clone(),
                        base_url: broker.clone(),
                        topic: config.topic.clone(),
                        partitioner: config.partitioner,
                        partitions,
                        next_partition: AtomicUsize::new(0),
                        errors: Mutex::new(config.notify_errors.then_some(tx)),
                        closed: AtomicBool::new(false),
                    };
                    return Ok(ProducerHandle {
                        producer: Arc::new(producer),
                        errors: rx,
                    });
                }
                Err(reason) => {
                    warn!("Broker {broker} has no usable metadata for {}: {reason}", config.topic);
                    last_failure = reason;
                }
            }
        }
        Err(ProducerError::Creation {
            topic: config.topic,
            reason: last_failure,
        })
    }
}

#[derive(Debug)]
pub struct RestProducer {
    client: reqwest::Client,
    base_url: String,
    topic: String,
    partitioner: Partitioner,
    partitions: Vec<i32>,
    next_partition: AtomicUsize,
    errors: Mutex<Option<mpsc::UnboundedSender<SendFailure>>>,
    closed: AtomicBool,
}

impl RestProducer {
    fn target_url(&self) -> String {
        match self.partitioner {
            Partitioner::RoundRobin if !self.partitions.is_empty() => {
                let i = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
                format!(
                    "{}/topics/{}/partitions/{}",
                    self.base_url, self.topic, self.partitions[i]
                )
            }
            _ => format!("{}/topics/{}", self.base_url, self.topic),
        }
    }

    fn report(&self, payload: String, error: String) {
        debug!("Failed to deliver record to {}: {error}", self.topic);
        if let Ok(errors) = self.errors.lock() {
            if let Some(tx) = errors.as_ref() {
                // receiver gone means the forwarder stopped listening
                let _ = tx.send(SendFailure { payload, error });
            }
        }
    }

    async fn deliver(&self, payload: &str) -> Result<(), String> {
        let body = serde_json::json!({ "records": [{ "value": payload }] });
        let response = self
            .client
            .post(self.target_url())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(format!("Message was too large ({status})"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{status}: {body}"));
        }

        let produced: ProduceResponse = response.json().await.unwrap_or_default();
        match produced.offsets.into_iter().find(|o| o.error_code.is_some()) {
            Some(ProduceOffset {
                error_code: Some(MESSAGE_TOO_LARGE),
                error,
            }) => Err(format!(
                "Message was too large: {}",
                error.unwrap_or_default()
            )),
            Some(ProduceOffset { error_code, error }) => Err(format!(
                "broker error {}: {}",
                error_code.unwrap_or_default(),
                error.unwrap_or_default()
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Producer for RestProducer {
    async fn send(&self, payload: String) {
        if self.closed.load(Ordering::Acquire) {
            debug!("Producer for {} is closed, dropping record", self.topic);
            return;
        }
        if let Err(error) = self.deliver(&payload).await {
            self.report(payload, error);
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut errors) = self.errors.lock() {
            errors.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    const TOPIC: &str = "stdoutlogging";

    fn backend(url: &str) -> RestBackend {
        RestBackend::new(&[url.to_string()], Duration::from_secs(2)).unwrap()
    }

    async fn mock_topic(server: &mut Server, partitions: &str) -> mockito::Mock {
        server
            .mock("GET", format!("/topics/{TOPIC}").as_str())
            .with_status(200)
            .with_body(format!(r#"{{"name":"{TOPIC}","partitions":{partitions}}}"#))
            .create_async()
            .await
    }

    #[test]
    fn test_rejects_invalid_broker_address() {
        let result = RestBackend::new(&["kafka-1:9092".to_string()], Duration::from_secs(1));
        assert!(matches!(result, Err(ProducerError::InvalidBroker(b)) if b == "kafka-1:9092"));

        let result = RestBackend::new(&[], Duration::from_secs(1));
        match result {
            Err(e @ ProducerError::NoBrokers) => {
                assert_eq!(e.to_string(), "No broker addresses configured");
            }
            other => panic!("expected NoBrokers, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discover_uses_first_reachable_broker() {
        let mut down = Server::new_async().await;
        let mut up = Server::new_async().await;
        down.mock("GET", "/brokers").with_status(503).create_async().await;
        let ok = up
            .mock("GET", "/brokers")
            .with_status(200)
            .with_body(r#"{"brokers":[1,2]}"#)
            .create_async()
            .await;

        let backend = RestBackend::new(&[down.url(), up.url()], Duration::from_secs(2)).unwrap();
        backend.discover().await.unwrap();
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_discover_fails_when_no_broker_answers() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/brokers").with_status(500).create_async().await;

        let result = backend(&server.url()).discover().await;
        assert!(matches!(result, Err(ProducerError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_create_producer_fails_for_unknown_topic() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", format!("/topics/{TOPIC}").as_str())
            .with_status(404)
            .with_body("topic not found")
            .create_async()
            .await;

        let result = backend(&server.url())
            .create_producer(ProducerConfig::round_robin(TOPIC))
            .await;
        match result {
            Err(ProducerError::Creation { topic, reason }) => {
                assert_eq!(topic, TOPIC);
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_robin_over_partitions() {
        let mut server = Server::new_async().await;
        mock_topic(&mut server, r#"[{"partition":0},{"partition":1}]"#).await;
        let p0 = server
            .mock("POST", format!("/topics/{TOPIC}/partitions/0").as_str())
            .match_header("content-type", CONTENT_TYPE)
            .match_body(Matcher::PartialJsonString(
                r#"{"records":[{"value":"first"}]}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"offsets":[{"partition":0,"offset":1}]}"#)
            .expect(1)
            .create_async()
            .await;
        let p1 = server
            .mock("POST", format!("/topics/{TOPIC}/partitions/1").as_str())
            .with_status(200)
            .with_body(r#"{"offsets":[{"partition":1,"offset":1}]}"#)
            .expect(1)
            .create_async()
            .await;

        let mut handle = backend(&server.url())
            .create_producer(ProducerConfig::round_robin(TOPIC))
            .await
            .unwrap();
        handle.producer.send("first".to_string()).await;
        handle.producer.send("second".to_string()).await;

        p0.assert_async().await;
        p1.assert_async().await;
        assert!(handle.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_record_reported_as_too_large() {
        let mut server = Server::new_async().await;
        mock_topic(&mut server, "[]").await;
        server
            .mock("POST", format!("/topics/{TOPIC}").as_str())
            .with_status(413)
            .create_async()
            .await;

        let mut handle = backend(&server.url())
            .create_producer(ProducerConfig::round_robin(TOPIC))
            .await
            .unwrap();
        handle.producer.send("big".to_string()).await;

        let failure = handle.errors.recv().await.unwrap();
        assert_eq!(failure.payload, "big");
        assert!(failure.is_payload_too_large());
    }

    #[tokio::test]
    async fn test_broker_error_in_offsets_is_reported() {
        let mut server = Server::new_async().await;
        mock_topic(&mut server, "[]").await;
        server
            .mock("POST", format!("/topics/{TOPIC}").as_str())
            .with_status(200)
            .with_body(r#"{"offsets":[{"error_code":2,"error":"leader not available"}]}"#)
            .create_async()
            .await;

        let mut handle = backend(&server.url())
            .create_producer(ProducerConfig::round_robin(TOPIC))
            .await
            .unwrap();

        handle.producer.send("retry me".to_string()).await;
        let failure = handle.errors.recv().await.unwrap();
        assert_eq!(failure.payload, "retry me");
        assert!(!failure.is_payload_too_large());
        assert!(failure.error.contains("leader not available"));
    }

    #[tokio::test]
    async fn test_message_too_large_error_code() {
        let mut server = Server::new_async().await;
        mock_topic(&mut server, "[]").await;
        server
            .mock("POST", format!("/topics/{TOPIC}").as_str())
            .with_status(200)
            .with_body(r#"{"offsets":[{"error_code":10,"error":"record too big"}]}"#)
            .create_async()
            .await;

        let mut handle = backend(&server.url())
            .create_producer(ProducerConfig::round_robin(TOPIC))
            .await
            .unwrap();

        handle.producer.send("big".to_string()).await;
        assert!(handle.errors.recv().await.unwrap().is_payload_too_large());
    }

    #[tokio::test]
    async fn test_service_unavailable_is_retryable() {
        let mut server = Server::new_async().await;
        mock_topic(&mut server, "[]").await;
        server
            .mock("POST", format!("/topics/{TOPIC}").as_str())
            .with_status(503)
            .with_body("try later")
            .create_async()
            .await;

        let mut handle = backend(&server.url())
            .create_producer(ProducerConfig::round_robin(TOPIC))
            .await
            .unwrap();
        handle.producer.send("rec".to_string()).await;

        let failure = handle.errors.recv().await.unwrap();
        assert!(!failure.is_payload_too_large());
        assert!(failure.error.starts_with("503"));
    }

    #[tokio::test]
    async fn test_closed_producer_sends_nothing() {
        let mut server = Server::new_async().await;
        mock_topic(&mut server, "[]").await;
        let produce = server
            .mock("POST", format!("/topics/{TOPIC}").as_str())
            .expect(0)
            .create_async()
            .await;

        let mut handle = backend(&server.url())
            .create_producer(ProducerConfig::round_robin(TOPIC))
            .await
            .unwrap();
        handle.producer.close().await;
        handle.producer.send("late".to_string()).await;

        produce.assert_async().await;
        assert!(handle.errors.recv().await.is_none());
    }
}
