// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::context::DaemonContext;
use crate::counters::DropReason;
use crate::record::{LogLine, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Accepted by the destination queue.
    Enqueued,
    /// Destination queue full, record dropped.
    Congested,
    /// Written to the local console instead of a queue.
    Local,
    /// Backend disabled and local output off.
    Discarded,
}

/// Non-blocking hand-off of normalized records to their destination queue.
#[derive(Debug, Clone)]
pub struct Router {
    ctx: Arc<DaemonContext>,
    stdout_tx: mpsc::Sender<LogLine>,
    stderr_tx: mpsc::Sender<LogLine>,
}

impl Router {
    #[must_use]
    pub fn new(
        ctx: Arc<DaemonContext>,
        stdout_tx: mpsc::Sender<LogLine>,
        stderr_tx: mpsc::Sender<LogLine>,
    ) -> Self {
        Self {
            ctx,
            stdout_tx,
            stderr_tx,
        }
    }

    pub fn route(&self, line: LogLine) -> RouteOutcome {
        if !self.ctx.mode.backend_enabled() {
            if self.ctx.mode.dump_local() {
                self.ctx.console.write_line(line.text());
                return RouteOutcome::Local;
            }
            return RouteOutcome::Discarded;
        }

        let tx = match line.destination() {
            Stream::Stdout => &self.stdout_tx,
            Stream::Stderr => &self.stderr_tx,
        };

        match tx.try_send(line) {
            Ok(()) => RouteOutcome::Enqueued,
            Err(TrySendError::Full(line)) => {
                if self.ctx.config.dump_on_write_failure || self.ctx.mode.dump_local() {
                    self.ctx.console.write_line(line.text());
                } else {
                    debug!("Dropping record, {} queue is full", line.destination());
                }
                self.ctx.record_drop(DropReason::Congestion, line.destination());
                RouteOutcome::Congested
            }
            Err(TrySendError::Closed(line)) => {
                self.ctx.console.write_line(line.text());
                RouteOutcome::Local
            }
        }
    }
}
