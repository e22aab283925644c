// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-time shutdown.
//!
//! A termination signal switches the daemon to local-only output, closes both
//! queues (each after it empties or after the drain timeout, whichever comes
//! first) and then stops the reader. End of input only closes the queues.
//!
//! A queue closed because it emptied lets its forwarder finish the submit in
//! progress. A queue closed by the timeout is abandoned: the record being
//! submitted is written to the local console instead.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::DaemonContext;
use crate::queue::QueueHandle;
use crate::EVENT_TARGET;

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    ctx: Arc<DaemonContext>,
    queues: [QueueHandle; 2],
    reader_stop: CancellationToken,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(
        ctx: Arc<DaemonContext>,
        stdout_queue: QueueHandle,
        stderr_queue: QueueHandle,
        reader_stop: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            queues: [stdout_queue, stderr_queue],
            reader_stop,
        }
    }

    pub async fn on_signal(&self, signal: &str) {
        if self.ctx.mode.switch_to_local() {
            info!(
                "{} received {signal}, records are now written locally",
                self.ctx.config.service_label()
            );
        } else {
            debug!("Received {signal} after switching to local output");
        }
        self.drain_queues().await;
        self.reader_stop.cancel();
    }

    pub async fn on_end_of_input(&self) {
        info!("End of input reached, draining queues");
        self.drain_queues().await;
    }

    /// A task panicked or discovery failed; treated like a termination signal.
    pub async fn on_fault(&self) {
        self.on_signal("fault").await;
    }

    /// Closes both queues concurrently; returns within one drain timeout.
    pub async fn drain_queues(&self) {
        let timeout = self.ctx.config.drain_timeout;
        let [stdout_queue, stderr_queue] = &self.queues;
        tokio::join!(
            close_queue(stdout_queue, timeout),
            close_queue(stderr_queue, timeout)
        );
    }

    /// Makes both forwarders give up whatever they are still submitting.
    pub fn abandon_in_flight(&self) {
        for queue in &self.queues {
            queue.abandon_in_flight();
        }
    }

    pub async fn finish(&self) {
        linger(&self.ctx.config.service_label(), self.ctx.config.linger).await;
    }
}

async fn close_queue(queue: &QueueHandle, timeout: Duration) {
    tokio::select! {
        () = queue.wait_drained() => {
            debug!("{} queue drained, closing it", queue.stream());
            queue.request_close();
        }
        () = tokio::time::sleep(timeout) => {
            warn!(
                "{} queue still holds {} records after {timeout:?}, closing it",
                queue.stream(),
                queue.len()
            );
            queue.abandon_in_flight();
        }
    }
}

/// Emits the shutdown event and waits before the process exits.
pub async fn linger(service: &str, delay: Duration) {
    info!(target: EVENT_TARGET, "{service} SHUTDOWN");
    tokio::time::sleep(delay).await;
}
