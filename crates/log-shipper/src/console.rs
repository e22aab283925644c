// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Local fallback sink for records that do not reach the backend.
#[derive(Debug, Clone)]
pub enum LocalConsole {
    /// Writes each record as one line on the process's standard output.
    Stdout,

    /// Keeps records in memory instead of printing them.
    Capture(Arc<Mutex<Vec<String>>>),
}

impl LocalConsole {
    #[must_use]
    pub fn capture() -> Self {
        Self::Capture(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn write_line(&self, line: &str) {
        match self {
            Self::Stdout => {
                let mut out = std::io::stdout().lock();
                if let Err(e) = writeln!(out, "{line}") {
                    debug!("Failed to write record to local console: {e}");
                }
            }
            Self::Capture(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push(line.to_string());
                }
            }
        }
    }

    /// Records written so far; always empty for [`LocalConsole::Stdout`].
    #[must_use]
    pub fn captured(&self) -> Vec<String> {
        match self {
            Self::Stdout => Vec::new(),
            Self::Capture(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
        }
    }
}
