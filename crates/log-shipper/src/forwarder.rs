// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-queue delivery to the backend.
//!
//! A forwarder goes through `Connecting -> Active -> Draining -> Closed`. While
//! active it runs two loops: the send loop pulls records off its queue and
//! submits them, and the error-drain loop consumes the producer's error feed
//! and resubmits failed records. Every error observed pauses the send loop
//! until a full second passes without a new one.
//!
//! Closing the queue stops the pulling of new records; a submit in progress
//! is only cut short when the queue is abandoned. Failures still in the error
//! feed when the send loop ends are written to the local console.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::counters::DropReason;
use crate::producer::{Backend, ErrorFeed, Producer, ProducerConfig, ProducerHandle, SendFailure};
use crate::queue::QueueConsumer;
use crate::record::Stream;
use crate::EVENT_TARGET;

/// Quiet period after which sending resumes.
pub const OK_TO_SEND_RESET: Duration = Duration::from_secs(1);

/// Gate between the error-drain loop and the send loop.
#[derive(Debug)]
pub struct OkToSend {
    flag: AtomicBool,
    notify: Notify,
}

impl Default for OkToSend {
    fn default() -> Self {
        Self {
            flag: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }
}

impl OkToSend {
    pub fn set(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Exponential backoff, doubling from `base` and capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base.min(max),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Connecting,
    Active,
    Draining,
    Closed,
}

pub struct Forwarder {
    ctx: Arc<DaemonContext>,
    backend: Arc<dyn Backend>,
    consumer: QueueConsumer,
    close: CancellationToken,
    abandon: CancellationToken,
    ready: watch::Receiver<bool>,
    state: watch::Sender<ForwarderState>,
}

impl Forwarder {
    /// `ready` flips to `true` once backend discovery has completed.
    #[must_use]
    pub fn new(
        ctx: Arc<DaemonContext>,
        backend: Arc<dyn Backend>,
        consumer: QueueConsumer,
        ready: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(ForwarderState::Connecting);
        Self {
            ctx,
            backend,
            close: consumer.close_token(),
            abandon: consumer.abandon_token(),
            consumer,
            ready,
            state,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ForwarderState> {
        self.state.subscribe()
    }

    fn stream(&self) -> Stream {
        self.consumer.stream()
    }

    fn set_state(&self, state: ForwarderState) {
        debug!("{} forwarder is now {state:?}", self.stream());
        self.state.send_replace(state);
    }

    pub async fn run(mut self) {
        let stream = self.stream();
        let topic = self.ctx.config.topic(stream).to_string();

        let Some(ProducerHandle { producer, errors }) = self.connect(&topic).await else {
            self.set_state(ForwarderState::Draining);
            self.drain_locally();
            self.set_state(ForwarderState::Closed);
            return;
        };

        self.set_state(ForwarderState::Active);
        info!(target: EVENT_TARGET, "Producer for topic {topic} is ready");

        let ok = Arc::new(OkToSend::default());
        let stop = CancellationToken::new();
        let error_loop = tokio::spawn(drain_errors(
            Arc::clone(&self.ctx),
            Arc::clone(&producer),
            errors,
            Arc::clone(&ok),
            stop.clone(),
            self.abandon.clone(),
            stream,
        ));
        // also stops the error loop if the send loop panics
        let stop_guard = stop.drop_guard();

        self.send_loop(producer.as_ref(), &ok).await;

        self.set_state(ForwarderState::Draining);
        self.drain_locally();

        drop(stop_guard);
        if let Err(e) = error_loop.await {
            error!("Error-drain loop of the {stream} forwarder failed: {e}");
        }
        producer.close().await;
        self.set_state(ForwarderState::Closed);
    }

    /// Waits for discovery, then creates the producer, retrying forever.
    /// Returns `None` if the queue is closed first.
    async fn connect(&mut self, topic: &str) -> Option<ProducerHandle> {
        let ready = tokio::select! {
            biased;
            () = self.close.cancelled() => return None,
            ready = self.ready.wait_for(|ready| *ready) => ready.is_ok(),
        };
        if !ready {
            warn!("Backend never became ready, {} forwarder stays local", self.stream());
            return None;
        }

        let mut backoff = Backoff::new(
            self.ctx.config.retry_interval,
            self.ctx.config.retry_max_interval,
        );
        loop {
            let attempt = tokio::select! {
                biased;
                () = self.close.cancelled() => return None,
                attempt = self.backend.create_producer(ProducerConfig::round_robin(topic)) => attempt,
            };

            match attempt {
                Ok(handle) => return Some(handle),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("{e}, retrying in {delay:?}");
                    tokio::select! {
                        biased;
                        () = self.close.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn send_loop(&mut self, producer: &dyn Producer, ok: &OkToSend) {
        let stream = self.stream();
        loop {
            let line = tokio::select! {
                biased;
                () = self.close.cancelled() => break,
                line = self.consumer.recv() => line,
            };
            let Some(line) = line else { break };

            tokio::select! {
                biased;
                () = self.abandon.cancelled() => {
                    self.ctx.console.write_line(line.text());
                    break;
                }
                () = ok.wait() => {}
            }

            let started = self.ctx.latency.begin();
            tokio::select! {
                biased;
                () = self.abandon.cancelled() => {
                    self.ctx.console.write_line(line.text());
                    break;
                }
                () = producer.send(line.text().to_string()) => {}
            }
            self.ctx.latency.finish(started);
            self.ctx.stats.record_transmitted(stream);
        }
    }

    fn drain_locally(&mut self) {
        let remaining = self.consumer.close_and_take();
        if !remaining.is_empty() {
            info!(
                "Writing {} buffered records of the {} queue to the local console",
                remaining.len(),
                self.stream()
            );
        }
        for line in remaining {
            self.ctx.console.write_line(line.text());
        }
    }
}

/// Runs until `stop` is cancelled, then flushes the failures left in the
/// feed. A resubmit in progress is only given up once `abandon` is cancelled.
async fn drain_errors(
    ctx: Arc<DaemonContext>,
    producer: Arc<dyn Producer>,
    mut errors: ErrorFeed,
    ok: Arc<OkToSend>,
    stop: CancellationToken,
    abandon: CancellationToken,
    stream: Stream,
) {
    let mut feed_open = true;
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            failure = errors.recv(), if feed_open => match failure {
                Some(failure) => {
                    handle_failure(&ctx, producer.as_ref(), &ok, &abandon, stream, failure).await;
                }
                None => feed_open = false,
            },
            () = tokio::time::sleep(OK_TO_SEND_RESET) => ok.set(),
        }
    }
    flush_failures(&ctx, &mut errors, stream);
}

fn flush_failures(ctx: &DaemonContext, errors: &mut ErrorFeed, stream: Stream) {
    let mut flushed = 0;
    while let Ok(failure) = errors.try_recv() {
        ctx.record_drop(DropReason::BackendError, stream);
        if failure.is_payload_too_large() {
            debug!("Dropping oversized record for the {stream} topic: {failure}");
            continue;
        }
        ctx.console.write_line(&failure.payload);
        flushed += 1;
    }
    if flushed > 0 {
        info!("Wrote {flushed} failed records of the {stream} topic to the local console");
    }
}

async fn handle_failure(
    ctx: &DaemonContext,
    producer: &dyn Producer,
    ok: &OkToSend,
    abandon: &CancellationToken,
    stream: Stream,
    failure: SendFailure,
) {
    ok.clear();
    ctx.record_drop(DropReason::BackendError, stream);

    if failure.is_payload_too_large() {
        debug!("Dropping oversized record for the {stream} topic: {failure}");
        return;
    }

    if !ctx.mode.backend_enabled() {
        ctx.console.write_line(&failure.payload);
        return;
    }

    debug!("Resending record to the {stream} topic after: {failure}");
    let started = ctx.latency.begin();
    tokio::select! {
        biased;
        () = abandon.cancelled() => ctx.console.write_line(&failure.payload),
        () = producer.send(failure.payload.clone()) => ctx.latency.finish(started),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShipperConfig;
    use crate::console::LocalConsole;
    use crate::producer::mock::MockBackend;
    use crate::queue::{bounded, QueueHandle};
    use crate::record::LogLine;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    struct Harness {
        ctx: Arc<DaemonContext>,
        backend: Arc<MockBackend>,
        queue: QueueHandle,
        state: watch::Receiver<ForwarderState>,
        task: JoinHandle<()>,
        _ready: watch::Sender<bool>,
    }

    fn start(backend: Arc<MockBackend>, config: ShipperConfig) -> Harness {
        let ctx = DaemonContext::new(config, LocalConsole::capture());
        let (queue, consumer) = bounded(Stream::Stdout, 16);
        let (ready_tx, ready_rx) = watch::channel(true);
        let forwarder = Forwarder::new(
            Arc::clone(&ctx),
            Arc::clone(&backend) as Arc<dyn Backend>,
            consumer,
            ready_rx,
        );
        let state = forwarder.subscribe();
        let task = tokio::spawn(forwarder.run());
        Harness {
            ctx,
            backend,
            queue,
            state,
            task,
            _ready: ready_tx,
        }
    }

    fn push(queue: &QueueHandle, text: &str) {
        queue
            .sender()
            .try_send(LogLine::new(text.to_string(), Stream::Stdout))
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(30), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(15));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 15, 15]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_ok_to_send_wait_resumes_on_set() {
        let ok = Arc::new(OkToSend::default());
        ok.clear();
        let waiter = tokio::spawn({
            let ok = Arc::clone(&ok);
            async move { ok.wait().await }
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ok.set();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait did not resume")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_records_in_order() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        push(&h.queue, "one");
        push(&h.queue, "two");
        push(&h.queue, "three");

        let producer = Arc::clone(&h.backend.producer);
        wait_until(|| producer.sent().len() == 3).await;
        assert_eq!(producer.sent(), vec!["one", "two", "three"]);
        assert_eq!(h.ctx.stats.snapshot().tx_stdout, 3);
        assert_eq!(*h.state.borrow(), ForwarderState::Active);

        h.queue.request_close();
        h.task.await.unwrap();
        assert!(h.backend.producer.closed.load(Ordering::SeqCst));
        assert_eq!(*h.state.borrow(), ForwarderState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_producer_is_created() {
        let h = start(
            MockBackend::failing_creations(3),
            ShipperConfig {
                retry_interval: Duration::from_secs(1),
                retry_max_interval: Duration::from_secs(2),
                ..Default::default()
            },
        );
        push(&h.queue, "eventually");

        let producer = Arc::clone(&h.backend.producer);
        wait_until(|| producer.sent().len() == 1).await;
        assert_eq!(h.backend.creation_attempts.load(Ordering::SeqCst), 4);

        h.queue.request_close();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_connecting_writes_records_locally() {
        let h = start(MockBackend::failing_creations(usize::MAX), ShipperConfig::default());
        push(&h.queue, "a");
        push(&h.queue, "b");
        sleep(Duration::from_secs(5)).await;
        assert_eq!(*h.state.borrow(), ForwarderState::Connecting);

        h.queue.request_close();
        h.task.await.unwrap();

        assert_eq!(h.ctx.console.captured(), vec!["a", "b"]);
        assert!(h.backend.producer.sent().is_empty());
        assert_eq!(*h.state.borrow(), ForwarderState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_record_is_resent() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        h.backend.producer.fail_next("503 Service Unavailable");
        push(&h.queue, "flaky");

        let producer = Arc::clone(&h.backend.producer);
        wait_until(|| producer.sent() == vec!["flaky"]).await;
        assert_eq!(h.ctx.counters.get(DropReason::BackendError), 1);
        assert_eq!(h.ctx.stats.snapshot().err_stdout, 1);

        h.queue.request_close();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_failure_is_not_resent() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        h.backend.producer.fail_next("kafka: Message was too large");
        push(&h.queue, "huge");
        push(&h.queue, "small");

        let producer = Arc::clone(&h.backend.producer);
        wait_until(|| producer.sent() == vec!["small"]).await;
        sleep(Duration::from_secs(2)).await;
        assert_eq!(producer.sent(), vec!["small"]);
        assert_eq!(h.ctx.counters.get(DropReason::BackendError), 1);

        h.queue.request_close();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_switch_to_local_goes_to_console() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        h.ctx.mode.switch_to_local();
        h.backend.producer.fail_next("connection reset");
        push(&h.queue, "late");

        let ctx = Arc::clone(&h.ctx);
        wait_until(|| ctx.console.captured() == vec!["late"]).await;
        assert!(h.backend.producer.sent().is_empty());

        h.queue.request_close();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_lets_in_flight_submit_finish() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        *h.backend.producer.stall.lock().unwrap() = Some(Duration::from_millis(50));
        push(&h.queue, "last record");

        wait_until(|| h.queue.is_empty()).await;
        h.queue.request_close();
        h.task.await.unwrap();

        assert_eq!(h.backend.producer.sent(), vec!["last record"]);
        assert!(h.ctx.console.captured().is_empty());
        assert_eq!(h.ctx.stats.snapshot().tx_stdout, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_submit_goes_to_console() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        *h.backend.producer.stall.lock().unwrap() = Some(Duration::from_secs(3600));
        push(&h.queue, "stuck record");
        push(&h.queue, "queued record");

        wait_until(|| h.queue.len() == 1).await;
        h.queue.abandon_in_flight();
        timeout(Duration::from_secs(1), h.task)
            .await
            .expect("abandoned forwarder did not stop")
            .unwrap();

        assert!(h.backend.producer.sent().is_empty());
        assert_eq!(
            h.ctx.console.captured(),
            vec!["stuck record", "queued record"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reported_at_close_goes_to_console() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        *h.backend.producer.stall.lock().unwrap() = Some(Duration::from_millis(100));
        h.backend.producer.fail_next("503 Service Unavailable");
        push(&h.queue, "final record");

        wait_until(|| h.queue.is_empty()).await;
        h.queue.request_close();
        h.task.await.unwrap();

        assert!(h.backend.producer.sent().is_empty());
        assert_eq!(h.ctx.console.captured(), vec!["final record"]);
        assert_eq!(h.ctx.counters.get(DropReason::BackendError), 1);
    }

    #[tokio::test]
    async fn test_flush_failures_skips_oversized_payloads() {
        let ctx = DaemonContext::new(ShipperConfig::default(), LocalConsole::capture());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(SendFailure::new("kept", "503")).unwrap();
        tx.send(SendFailure::new("huge", "Message was too large")).unwrap();
        drop(tx);

        flush_failures(&ctx, &mut rx, Stream::Stderr);

        assert_eq!(ctx.console.captured(), vec!["kept"]);
        assert_eq!(ctx.counters.get(DropReason::BackendError), 2);
        assert_eq!(ctx.stats.snapshot().err_stderr, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_pause_sending_for_a_second() {
        let h = start(MockBackend::new(), ShipperConfig::default());
        h.backend.producer.fail_next("503");
        h.backend.producer.fail_next("503");
        push(&h.queue, "x");

        let ctx = Arc::clone(&h.ctx);
        wait_until(|| ctx.counters.get(DropReason::BackendError) == 2).await;

        push(&h.queue, "y");
        sleep(Duration::from_millis(500)).await;
        assert!(!h.backend.producer.sent().contains(&"y".to_string()));

        let producer = Arc::clone(&h.backend.producer);
        wait_until(|| producer.sent().contains(&"y".to_string())).await;

        h.queue.request_close();
        h.task.await.unwrap();
    }
}
