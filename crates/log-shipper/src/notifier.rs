// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic operator reports.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context::DaemonContext;
use crate::counters::{DropReason, NotifyCounters};
use crate::ALARM_TARGET;

fn alarm_message(reason: DropReason) -> &'static str {
    match reason {
        DropReason::Congestion => "Messages dropped due to congestion",
        DropReason::Oversized => "Messages dropped due to large size",
        DropReason::RateLimit => "Messages dropped due to rate limit",
        DropReason::BackendError => "Error sending messages to backend",
    }
}

/// Swaps every counter back to zero and raises one alarm per nonzero value.
///
/// Returns the number of alarms raised.
pub fn report(counters: &NotifyCounters) -> usize {
    let mut raised = 0;
    for reason in DropReason::ALL {
        let count = counters.take(reason);
        if count > 0 {
            error!(target: ALARM_TARGET, "{}: {count}", alarm_message(reason));
            raised += 1;
        }
    }
    raised
}

pub async fn run_notifier(ctx: Arc<DaemonContext>, cancel: CancellationToken) {
    run_every(ctx.config.notify_interval, &cancel, || {
        report(&ctx.counters);
    })
    .await;
}

/// Logs lifetime totals on the stats interval; does nothing when stats are
/// disabled.
pub async fn run_stats_reporter(ctx: Arc<DaemonContext>, cancel: CancellationToken) {
    if !ctx.config.stats_enabled {
        return;
    }

    run_every(ctx.config.stats_interval, &cancel, || {
        let s = ctx.stats.snapshot();
        info!(
            rx_stdout = s.rx_stdout,
            rx_stderr = s.rx_stderr,
            rx_empty = s.rx_empty,
            tx_stdout = s.tx_stdout,
            tx_stderr = s.tx_stderr,
            err_stdout = s.err_stdout,
            err_stderr = s.err_stderr,
            dropped_congestion = s.dropped_congestion,
            dropped_rate_limit = s.dropped_rate_limit,
            dropped_oversized = s.dropped_oversized,
            "{} stats",
            ctx.config.service_label()
        );
    })
    .await;
}

async fn run_every(period: Duration, cancel: &CancellationToken, mut tick: impl FnMut()) {
    let mut ticker = interval(period);
    ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = ticker.tick() => tick(),
            () = cancel.cancelled() => break,
        }
    }
}
