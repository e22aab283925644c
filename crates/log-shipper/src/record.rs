// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use crate::errors::ShipperError;

/// One of the two streams the daemon deals with.
///
/// Used both for the origin of the input an instance reads and for the
/// destination queue (and topic) a record is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stream {
    type Err = ShipperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdout" | "out" => Ok(Self::Stdout),
            "stderr" | "err" => Ok(Self::Stderr),
            other => Err(ShipperError::InvalidConfig(format!(
                "Invalid stream '{other}'. Must be one of: stdout, stderr"
            ))),
        }
    }
}

/// A normalized log record bound to its destination queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    text: String,
    destination: Stream,
}

impl LogLine {
    #[must_use]
    pub fn new(text: String, destination: Stream) -> Self {
        Self { text, destination }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn destination(&self) -> Stream {
        self.destination
    }

    #[must_use]
    pub fn into_text(self) -> String {
        self.text
    }
}
