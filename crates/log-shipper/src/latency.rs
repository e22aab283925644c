// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;
use tracing::info;

/// Samples submit-to-ack latency of every Nth record.
///
/// Once `print_rate` records have been seen the mean latency of the sampled
/// records is logged and the statistics start over.
#[derive(Debug)]
pub struct LatencySampler {
    sample_rate: u64,
    print_rate: u64,
    seen: AtomicU64,
    samples: AtomicU64,
    total_us: AtomicU64,
}

impl LatencySampler {
    #[must_use]
    pub fn new(sample_rate: u64, print_rate: u64) -> Self {
        Self {
            sample_rate,
            print_rate,
            seen: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sample_rate != 0 && self.print_rate != 0 && self.print_rate >= self.sample_rate
    }

    /// Accounts for one record about to be submitted.
    ///
    /// Returns the start instant when this record is part of the sample.
    pub fn begin(&self) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }

        let seen = self.seen.fetch_add(1, Ordering::Relaxed);
        if seen + 1 >= self.print_rate {
            self.report(seen + 1);
        }

        (seen % self.sample_rate == 0).then(Instant::now)
    }

    /// Completes a measurement started by [`LatencySampler::begin`].
    pub fn finish(&self, started: Option<Instant>) {
        if let Some(started) = started {
            let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            self.total_us.fetch_add(elapsed_us, Ordering::Relaxed);
            self.samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns `(samples, cumulative microseconds)` of the current window.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.samples.load(Ordering::Relaxed),
            self.total_us.load(Ordering::Relaxed),
        )
    }

    fn report(&self, processed: u64) {
        self.seen.store(0, Ordering::Relaxed);
        let samples = self.samples.swap(0, Ordering::Relaxed);
        let total_us = self.total_us.swap(0, Ordering::Relaxed);
        if samples > 0 {
            info!(
                "Average backend write latency in us: {}, number of messages processed: {}",
                total_us / samples,
                processed
            );
        }
    }
}
