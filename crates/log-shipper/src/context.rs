// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ShipperConfig;
use crate::console::LocalConsole;
use crate::counters::{DropReason, NotifyCounters, Stats};
use crate::latency::LatencySampler;
use crate::record::Stream;

/// Process-wide mode switches.
///
/// They start from configuration and are flipped at most once, by the
/// shutdown coordinator, to local-only operation.
#[derive(Debug)]
pub struct ModeFlags {
    backend_enabled: AtomicBool,
    dump_local: AtomicBool,
}

impl ModeFlags {
    #[must_use]
    pub fn new(backend_enabled: bool, dump_local: bool) -> Self {
        Self {
            backend_enabled: AtomicBool::new(backend_enabled),
            dump_local: AtomicBool::new(dump_local),
        }
    }

    #[must_use]
    pub fn backend_enabled(&self) -> bool {
        self.backend_enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dump_local(&self) -> bool {
        self.dump_local.load(Ordering::Acquire)
    }

    /// Disables the backend and forces local console output.
    ///
    /// Returns `false` if the switch had already happened.
    pub fn switch_to_local(&self) -> bool {
        self.dump_local.store(true, Ordering::Release);
        self.backend_enabled.swap(false, Ordering::AcqRel)
    }
}

/// State shared by every worker task of the daemon.
#[derive(Debug)]
pub struct DaemonContext {
    pub config: ShipperConfig,
    pub mode: ModeFlags,
    pub counters: NotifyCounters,
    pub stats: Stats,
    pub latency: LatencySampler,
    pub console: LocalConsole,
}

impl DaemonContext {
    #[must_use]
    pub fn new(config: ShipperConfig, console: LocalConsole) -> Arc<Self> {
        Arc::new(Self {
            mode: ModeFlags::new(config.backend_enabled, config.dump_msg_stdout),
            counters: NotifyCounters::default(),
            stats: Stats::default(),
            latency: LatencySampler::new(config.latency_sample_rate, config.latency_print_rate),
            console,
            config,
        })
    }

    /// Counts a dropped or failed record in both the lifetime totals and the
    /// counters of the next notifier report.
    pub fn record_drop(&self, reason: DropReason, destination: Stream) {
        self.stats.record_drop(reason, destination);
        self.counters.incr(reason);
    }
}
