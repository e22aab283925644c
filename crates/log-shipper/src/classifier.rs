// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Header classification and normalization of incoming records.
//!
//! A compliant record carries the structured header
//!
//! ```text
//! marker|version|severity|task_id|process_id|group|app|process|correlation_id|file:line|timestamp|message
//! ```
//!
//! and only gets the host identifier prepended. Anything else is wrapped into
//! a synthesized header so that every record leaving the daemon has the same
//! leading fields.

use chrono::{DateTime, Utc};

use crate::config::ShipperConfig;
use crate::record::{LogLine, Stream};

pub const MARKER: u8 = b'*';
pub const SEPARATOR: u8 = b'|';
pub const SEPARATOR_STR: &str = "|";

/// A marker plus ten separators.
pub const MIN_HEADER_LEN: usize = 11;

/// Marker and record type of synthesized ("third-party") records.
pub const THIRD_PARTY_MARKER: &str = "*|TP";

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.9f";

/// Whether `text` starts with a structured header.
#[must_use]
pub fn is_compliant(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= MIN_HEADER_LEN && bytes[0] == MARKER && bytes[1] == SEPARATOR
}

/// Extracts the severity token, found between the 2nd and 3rd separators.
#[must_use]
pub fn severity(text: &str) -> Option<&str> {
    let mut separators = text
        .bytes()
        .enumerate()
        .filter(|(_, b)| *b == SEPARATOR)
        .map(|(i, _)| i);
    let start = separators.nth(1)? + 1;
    let end = separators.next()?;
    text.get(start..end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub compliant: bool,
    pub destination: Stream,
}

/// Tags records and rewrites their header.
#[derive(Debug, Clone)]
pub struct Classifier {
    host: String,
    task_id: String,
    group_name: String,
    app_name: String,
}

impl Classifier {
    #[must_use]
    pub fn new(config: &ShipperConfig) -> Self {
        Self {
            host: config.host.clone(),
            task_id: config.task_id.clone(),
            group_name: config.group_name.clone(),
            app_name: config.app_name.clone(),
        }
    }

    /// Non-compliant records are always downgraded to the stdout queue.
    #[must_use]
    pub fn classify(&self, text: &str, origin: Stream) -> Classification {
        let compliant = is_compliant(text);
        Classification {
            compliant,
            destination: if compliant { origin } else { Stream::Stdout },
        }
    }

    #[must_use]
    pub fn normalize(&self, text: &str, classification: Classification) -> LogLine {
        self.normalize_at(text, classification, Utc::now())
    }

    fn normalize_at(
        &self,
        text: &str,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> LogLine {
        let normalized = if classification.compliant {
            [self.host.as_str(), text].join(SEPARATOR_STR)
        } else {
            let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
            [
                self.host.as_str(),
                THIRD_PARTY_MARKER,
                self.task_id.as_str(),
                self.group_name.as_str(),
                self.app_name.as_str(),
                timestamp.as_str(),
                text,
            ]
            .join(SEPARATOR_STR)
        };
        LogLine::new(normalized, classification.destination)
    }
}
