// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::errors::ShipperError;
use crate::record::Stream;

const DEFAULT_SERVICE_NAME: &str = "Logger";
const DEFAULT_STDOUT_TOPIC: &str = "stdoutlogging";
const DEFAULT_STDERR_TOPIC: &str = "stderrlogging";
const UNKNOWN: &str = "unknown";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Daemon configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub service_name: String,
    pub version: String,
    /// Origin stream this instance reads.
    pub stream: Stream,
    pub stdout_topic: String,
    pub stderr_topic: String,
    /// Host identifier prepended to every forwarded record.
    pub host: String,
    pub app_name: String,
    pub group_name: String,
    pub task_id: String,
    pub backend_enabled: bool,
    /// Write records to the local console when the backend is disabled.
    pub dump_msg_stdout: bool,
    /// Echo congestion-dropped records to the local console.
    pub dump_on_write_failure: bool,
    pub stats_enabled: bool,
    pub stats_interval: Duration,
    pub log_level: String,
    /// Grace delay before the first read, letting the backend connect.
    pub initial_delay: Duration,
    /// Capacity of each destination queue.
    pub channel_size: usize,
    /// Number of runtime worker threads.
    pub max_procs: usize,
    pub retry_interval: Duration,
    pub retry_max_interval: Duration,
    /// Base URLs of the broker gateways.
    pub brokers: Vec<String>,
    pub request_timeout: Duration,
    pub log_limit_enabled: bool,
    pub log_limit_interval: Duration,
    pub log_limit_threshold: u64,
    /// Severities that are never rate limited.
    pub log_limit_excluded_levels: Vec<String>,
    pub log_limit_msg_size: usize,
    pub latency_sample_rate: u64,
    pub latency_print_rate: u64,
    pub notify_interval: Duration,
    /// Per-queue wait before a queue is force-closed during shutdown.
    pub drain_timeout: Duration,
    /// Pause between the shutdown event and process exit.
    pub linger: Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            stream: Stream::Stdout,
            stdout_topic: DEFAULT_STDOUT_TOPIC.to_string(),
            stderr_topic: DEFAULT_STDERR_TOPIC.to_string(),
            host: String::new(),
            app_name: UNKNOWN.to_string(),
            group_name: UNKNOWN.to_string(),
            task_id: UNKNOWN.to_string(),
            backend_enabled: true,
            dump_msg_stdout: false,
            dump_on_write_failure: true,
            stats_enabled: false,
            stats_interval: Duration::from_secs(60),
            log_level: "info".to_string(),
            initial_delay: Duration::from_secs(5),
            channel_size: 10_000,
            max_procs: 2,
            retry_interval: Duration::from_secs(1),
            retry_max_interval: Duration::from_secs(15),
            brokers: Vec::new(),
            request_timeout: Duration::from_secs(5),
            log_limit_enabled: true,
            log_limit_interval: Duration::from_secs(1),
            log_limit_threshold: 1000,
            log_limit_excluded_levels: Vec::new(),
            log_limit_msg_size: 65_536,
            latency_sample_rate: 1,
            latency_print_rate: 0,
            notify_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(4),
            linger: Duration::from_secs(2),
        }
    }
}

impl ShipperConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ShipperError> {
        let defaults = Self::default();

        let stream = match env::var("DKT_LOGGER_STREAM") {
            Ok(val) => val.parse::<Stream>()?,
            Err(_) => defaults.stream,
        };

        let host = env::var("HOST")
            .ok()
            .filter(|val| !val.trim().is_empty())
            .unwrap_or_else(detect_hostname);

        let log_level = if env_bool("DKT_LOGGER_ENABLE_DEBUG", false) {
            "debug".to_string()
        } else {
            env::var("DKT_LOGGER_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level)
        };

        let config = Self {
            service_name: env_string("DKT_LOGGER_SVCNAME", &defaults.service_name),
            version: env_string("DKT_LOGGER_VERSION", &defaults.version),
            stream,
            stdout_topic: env_string("DKT_LOGGER_STDOUT_TOPIC", &defaults.stdout_topic),
            stderr_topic: env_string("DKT_LOGGER_STDERR_TOPIC", &defaults.stderr_topic),
            host,
            app_name: env_string("MON_APP", &defaults.app_name),
            group_name: env_string("MON_GROUP", &defaults.group_name),
            task_id: env_string("MESOS_TASK_ID", &defaults.task_id),
            backend_enabled: env_bool("DKT_LOGGER_IS_KAFKA_ENABLED", defaults.backend_enabled),
            dump_msg_stdout: env_bool("DKT_LOGGER_DUMP_MSG_STDOUT", defaults.dump_msg_stdout),
            dump_on_write_failure: env_bool(
                "DKT_LOGGER_DUMP_ON_WRITE_FAILURE",
                defaults.dump_on_write_failure,
            ),
            stats_enabled: !env_bool("DKT_LOGGER_DISABLE_STATS", !defaults.stats_enabled),
            stats_interval: env_secs("STATS_INTERVAL", defaults.stats_interval),
            log_level,
            initial_delay: env_secs("DKT_LOGGER_INITIAL_DELAY", defaults.initial_delay),
            channel_size: env_parse("DKT_LOGGER_CHANNEL_SIZE", defaults.channel_size),
            max_procs: env_parse("LOGGER_MAX_PROCS", defaults.max_procs),
            retry_interval: env_secs("LOGGER_RETRY_INTERVAL_SEC", defaults.retry_interval),
            retry_max_interval: env_secs(
                "LOGGER_RETRY_MAX_INTERVAL_SEC",
                defaults.retry_max_interval,
            ),
            brokers: env::var("LOGGER_BROKERS")
                .map(|val| split_list(&val))
                .unwrap_or_default(),
            request_timeout: env_secs("DKT_LOGGER_REQUEST_TIMEOUT_SEC", defaults.request_timeout),
            log_limit_enabled: env_bool("DKT_LOG_LIMIT_ENABLED", defaults.log_limit_enabled),
            log_limit_interval: env_secs("DKT_LOG_LIMIT_INTERVAL_SEC", defaults.log_limit_interval),
            log_limit_threshold: env_parse(
                "DKT_LOG_LIMIT_THRESHOLD_PER_INTERVAL",
                defaults.log_limit_threshold,
            ),
            log_limit_excluded_levels: env::var("DKT_LOG_LIMIT_EXCLUDE_LOGLEVEL")
                .map(|val| split_list(&val))
                .unwrap_or_default(),
            log_limit_msg_size: env_parse("DKT_LOG_LIMIT_MSGSIZE", defaults.log_limit_msg_size),
            latency_sample_rate: env_parse(
                "DKT_LOGGER_LATENCY_SAMPLE_RATE",
                defaults.latency_sample_rate,
            ),
            latency_print_rate: env_parse(
                "DKT_LOGGER_LATENCY_PRINT_RATE",
                defaults.latency_print_rate,
            ),
            notify_interval: env_secs("DKT_LOGGER_NOTIFY_INTERVAL_SEC", defaults.notify_interval),
            drain_timeout: env_secs(
                "DKT_LOGGER_KAFKA_CHANNEL_CLOSE_INTERVAL_SEC",
                defaults.drain_timeout,
            ),
            linger: env_secs(
                "DKT_LOGGER_WAIT_FOR_EXIT_BEFORE_SHUTDOWN_INTERVAL_SEC",
                defaults.linger,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ShipperError> {
        if self.channel_size == 0 {
            return Err(ShipperError::InvalidConfig(
                "channel size must be greater than 0".to_string(),
            ));
        }

        if self.max_procs == 0 {
            return Err(ShipperError::InvalidConfig(
                "max procs must be greater than 0".to_string(),
            ));
        }

        if self.retry_interval.is_zero() || self.retry_interval > self.retry_max_interval {
            return Err(ShipperError::InvalidConfig(format!(
                "retry interval ({:?}) must be non-zero and at most the max retry interval ({:?})",
                self.retry_interval, self.retry_max_interval
            )));
        }

        if self.notify_interval.is_zero() {
            return Err(ShipperError::InvalidConfig(
                "notify interval must be greater than 0".to_string(),
            ));
        }

        if self.log_limit_enabled && self.log_limit_interval.is_zero() {
            return Err(ShipperError::InvalidConfig(
                "log limit interval must be greater than 0".to_string(),
            ));
        }

        if self.stats_enabled && self.stats_interval.is_zero() {
            return Err(ShipperError::InvalidConfig(
                "stats interval must be greater than 0".to_string(),
            ));
        }

        if self.stdout_topic.trim().is_empty() || self.stderr_topic.trim().is_empty() {
            return Err(ShipperError::InvalidConfig(
                "topic names cannot be empty".to_string(),
            ));
        }

        if self.backend_enabled && self.brokers.is_empty() {
            return Err(ShipperError::InvalidConfig(
                "LOGGER_BROKERS must be set when the backend is enabled".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ShipperError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Topic the given destination queue publishes to.
    #[must_use]
    pub fn topic(&self, destination: Stream) -> &str {
        match destination {
            Stream::Stdout => &self.stdout_topic,
            Stream::Stderr => &self.stderr_topic,
        }
    }

    /// Name used in lifecycle events, e.g. `Logger::stdout`.
    #[must_use]
    pub fn service_label(&self) -> String {
        format!("{}::{}", self.service_name, self.stream)
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                warn!("{key} has invalid boolean value '{val}', using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_parse<T: FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{key} has invalid value '{val}', using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Falls back to the system hostname when `HOST` is not provided.
fn detect_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => match hostname.into_string() {
            Ok(hostname) if !hostname.is_empty() => return hostname,
            _ => warn!("System hostname is empty or not valid UTF-8"),
        },
        Err(e) => warn!("Failed to get system hostname: {e}"),
    }
    UNKNOWN.to_string()
}
