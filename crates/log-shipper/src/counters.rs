// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drop/error counters and lifetime totals.
//!
//! All counters are plain atomics; no lock is ever taken to update them.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::Stream;

/// Reasons a record is dropped or fails delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Congestion,
    RateLimit,
    Oversized,
    BackendError,
}

impl DropReason {
    pub const ALL: [DropReason; 4] = [
        DropReason::Congestion,
        DropReason::Oversized,
        DropReason::RateLimit,
        DropReason::BackendError,
    ];
}

/// Counters accumulated between two notifier reports.
#[derive(Debug, Default)]
pub struct NotifyCounters {
    congestion: AtomicU64,
    rate_limit: AtomicU64,
    oversized: AtomicU64,
    backend_error: AtomicU64,
}

impl NotifyCounters {
    fn counter(&self, reason: DropReason) -> &AtomicU64 {
        match reason {
            DropReason::Congestion => &self.congestion,
            DropReason::RateLimit => &self.rate_limit,
            DropReason::Oversized => &self.oversized,
            DropReason::BackendError => &self.backend_error,
        }
    }

    pub fn incr(&self, reason: DropReason) {
        self.counter(reason).fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, reason: DropReason) -> u64 {
        self.counter(reason).load(Ordering::Relaxed)
    }

    /// Returns the accumulated value and resets it to zero.
    pub fn take(&self, reason: DropReason) -> u64 {
        self.counter(reason).swap(0, Ordering::Relaxed)
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_stdout: u64,
    pub rx_stderr: u64,
    pub rx_empty: u64,
    pub tx_stdout: u64,
    pub tx_stderr: u64,
    pub err_stdout: u64,
    pub err_stderr: u64,
    pub dropped_congestion: u64,
    pub dropped_rate_limit: u64,
    pub dropped_oversized: u64,
}

/// Lifetime totals, never reset.
#[derive(Debug, Default)]
pub struct Stats {
    rx_stdout: AtomicU64,
    rx_stderr: AtomicU64,
    rx_empty: AtomicU64,
    tx_stdout: AtomicU64,
    tx_stderr: AtomicU64,
    err_stdout: AtomicU64,
    err_stderr: AtomicU64,
    dropped_congestion: AtomicU64,
    dropped_rate_limit: AtomicU64,
    dropped_oversized: AtomicU64,
}

impl Stats {
    pub fn record_received(&self, origin: Stream) {
        match origin {
            Stream::Stdout => self.rx_stdout.fetch_add(1, Ordering::Relaxed),
            Stream::Stderr => self.rx_stderr.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_transmitted(&self, destination: Stream) {
        match destination {
            Stream::Stdout => self.tx_stdout.fetch_add(1, Ordering::Relaxed),
            Stream::Stderr => self.tx_stderr.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_empty(&self) {
        self.rx_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason, destination: Stream) {
        let counter = match (reason, destination) {
            (DropReason::Congestion, _) => &self.dropped_congestion,
            (DropReason::RateLimit, _) => &self.dropped_rate_limit,
            (DropReason::Oversized, _) => &self.dropped_oversized,
            (DropReason::BackendError, Stream::Stdout) => &self.err_stdout,
            (DropReason::BackendError, Stream::Stderr) => &self.err_stderr,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_stdout: self.rx_stdout.load(Ordering::Relaxed),
            rx_stderr: self.rx_stderr.load(Ordering::Relaxed),
            rx_empty: self.rx_empty.load(Ordering::Relaxed),
            tx_stdout: self.tx_stdout.load(Ordering::Relaxed),
            tx_stderr: self.tx_stderr.load(Ordering::Relaxed),
            err_stdout: self.err_stdout.load(Ordering::Relaxed),
            err_stderr: self.err_stderr.load(Ordering::Relaxed),
            dropped_congestion: self.dropped_congestion.load(Ordering::Relaxed),
            dropped_rate_limit: self.dropped_rate_limit.load(Ordering::Relaxed),
            dropped_oversized: self.dropped_oversized.load(Ordering::Relaxed),
        }
    }
}
