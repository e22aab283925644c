// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classifier::severity;
use crate::config::ShipperConfig;

/// Per-interval record budget.
///
/// Records whose severity is in the exclusion set bypass the limiter
/// entirely: they are neither counted nor dropped. The exclusion set is built
/// once and never mutated, so it is read without synchronization.
#[derive(Debug)]
pub struct RateLimiter {
    threshold: u64,
    count: AtomicU64,
    excluded_levels: HashSet<String>,
}

impl RateLimiter {
    #[must_use]
    pub fn new<I, S>(threshold: u64, excluded_levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            threshold,
            count: AtomicU64::new(0),
            excluded_levels: excluded_levels.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ShipperConfig) -> Self {
        Self::new(
            config.log_limit_threshold,
            config.log_limit_excluded_levels.iter().cloned(),
        )
    }

    /// Only compliant records have a severity to match against.
    #[must_use]
    pub fn is_excluded(&self, text: &str, compliant: bool) -> bool {
        if !compliant || self.excluded_levels.is_empty() {
            return false;
        }
        severity(text).is_some_and(|level| self.excluded_levels.contains(level))
    }

    /// Counts the record against the current interval and tells whether it
    /// went over budget.
    pub fn should_drop(&self, text: &str, compliant: bool) -> bool {
        if self.is_excluded(text, compliant) {
            return false;
        }
        self.count.fetch_add(1, Ordering::Relaxed) + 1 > self.threshold
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Starts a new interval, returning the count of the one that ended.
    pub fn reset(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }

    pub async fn run_reset_timer(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let count = self.reset();
                    if count > self.threshold {
                        debug!(
                            "Number of log messages dropped due to limit on log rate: {}",
                            count - self.threshold
                        );
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }
}
