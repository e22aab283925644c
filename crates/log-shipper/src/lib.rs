// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log shipping daemon core.
//!
//! Reads newline-delimited log records from an input stream, normalizes their
//! header, applies rate limiting and forwards them to one of two broker topics
//! (one per origin stream) through bounded queues. Records that cannot be
//! delivered fall back to the local console.
//!
//! ```text
//!   input ─> LineReader ─> Classifier ─> RateLimiter ─> Router
//!                                                         │
//!                                 ┌───────────────────────┴───────┐
//!                                 v                               v
//!                           stdout queue                    stderr queue
//!                                 │                               │
//!                             Forwarder                       Forwarder
//!                                 │                               │
//!                                 └──────────> Producer <─────────┘
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod classifier;
pub mod config;
pub mod console;
pub mod context;
pub mod counters;
pub mod daemon;
pub mod errors;
pub mod forwarder;
pub mod latency;
pub mod notifier;
pub mod producer;
pub mod queue;
pub mod rate_limiter;
pub mod reader;
pub mod record;
pub mod router;
pub mod shutdown;

/// Target used for alarm-level operator reports.
pub const ALARM_TARGET: &str = "alarm";

/// Target used for lifecycle events (starting, ready, shutdown).
pub const EVENT_TARGET: &str = "event";
