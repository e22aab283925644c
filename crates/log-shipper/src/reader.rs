// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::classifier::{Classifier, MIN_HEADER_LEN};
use crate::context::DaemonContext;
use crate::counters::DropReason;
use crate::errors::ShipperError;
use crate::rate_limiter::RateLimiter;
use crate::record::Stream;
use crate::router::{RouteOutcome, Router};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    EndOfInput,
    /// Stopped by the shutdown coordinator.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Empty,
    Oversized,
    RateLimited,
    Routed(RouteOutcome),
}

/// Reads the input one line at a time and pushes every record through
/// classification, rate limiting and routing.
pub struct LineReader {
    ctx: Arc<DaemonContext>,
    classifier: Classifier,
    limiter: Arc<RateLimiter>,
    router: Router,
    origin: Stream,
}

impl LineReader {
    #[must_use]
    pub fn new(
        ctx: Arc<DaemonContext>,
        classifier: Classifier,
        limiter: Arc<RateLimiter>,
        router: Router,
        origin: Stream,
    ) -> Self {
        Self {
            ctx,
            classifier,
            limiter,
            router,
            origin,
        }
    }

    /// Runs until end of input or until `stop` is cancelled.
    ///
    /// Any read error other than end of input is returned and is fatal to the
    /// process.
    pub async fn run<R>(
        &self,
        mut input: R,
        stop: CancellationToken,
    ) -> Result<ReaderExit, ShipperError>
    where
        R: AsyncBufRead + Unpin,
    {
        // give the backend time to connect before the first record
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(ReaderExit::Stopped),
            () = tokio::time::sleep(self.ctx.config.initial_delay) => {}
        }

        let config = &self.ctx.config;
        // one byte past the limit is enough to tell a line is oversized
        let cap = if config.log_limit_enabled {
            u64::try_from(config.log_limit_msg_size)
                .unwrap_or(u64::MAX)
                .saturating_add(1)
        } else {
            u64::MAX
        };

        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                () = stop.cancelled() => return Ok(ReaderExit::Stopped),
                read = read_line(&mut input, &mut buf, cap) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Input closed, {} reader exiting", self.origin);
                    return Ok(ReaderExit::EndOfInput);
                }
                // the tail of the line was skipped
                Ok(consumed) if consumed > buf.len() => {
                    self.drop_oversized(consumed);
                }
                Ok(_) => {
                    self.process_raw(&buf);
                }
                Err(e) => {
                    error!("Failed to read records from input, terminating: {e}");
                    return Err(ShipperError::InputRead(e));
                }
            }
        }
    }

    /// Handles one raw line, terminator included.
    ///
    /// Lines too short to hold even an empty header are counted as empty.
    pub fn process_raw(&self, raw: &[u8]) -> LineOutcome {
        let body = raw.strip_suffix(b"\n").unwrap_or(raw);
        let body = body.strip_suffix(b"\r").unwrap_or(body);
        if body.len() < MIN_HEADER_LEN {
            self.ctx.stats.record_empty();
            return LineOutcome::Empty;
        }

        let config = &self.ctx.config;
        if config.log_limit_enabled && raw.len() > config.log_limit_msg_size {
            return self.drop_oversized(raw.len());
        }

        let text = String::from_utf8_lossy(body);
        let text = text.as_ref();

        let classification = self.classifier.classify(text, self.origin);
        if config.log_limit_enabled
            && self.ctx.mode.backend_enabled()
            && self.limiter.should_drop(text, classification.compliant)
        {
            self.ctx.record_drop(DropReason::RateLimit, classification.destination);
            return LineOutcome::RateLimited;
        }

        let line = self.classifier.normalize(text, classification);
        self.ctx.stats.record_received(self.origin);
        LineOutcome::Routed(self.router.route(line))
    }

    fn drop_oversized(&self, size: usize) -> LineOutcome {
        debug!("Ignoring large record of size {size}");
        self.ctx.record_drop(DropReason::Oversized, self.origin);
        LineOutcome::Oversized
    }
}

/// Reads one line into `buf`, keeping at most `cap` bytes of it. The rest of
/// a longer line is consumed and discarded.
///
/// Returns the number of bytes consumed, zero at end of input.
async fn read_line<R>(input: &mut R, buf: &mut Vec<u8>, cap: u64) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let kept = (&mut *input).take(cap).read_until(b'\n', buf).await?;
    if buf.last() == Some(&b'\n') || u64::try_from(kept).unwrap_or(u64::MAX) < cap {
        return Ok(kept);
    }
    Ok(kept + skip_line(input).await?)
}

async fn skip_line<R>(input: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let (newline, available) = {
            let chunk = input.fill_buf().await?;
            (chunk.iter().position(|b| *b == b'\n'), chunk.len())
        };
        match newline {
            Some(at) => {
                input.consume(at + 1);
                return Ok(skipped + at + 1);
            }
            None if available == 0 => return Ok(skipped),
            None => {
                input.consume(available);
                skipped += available;
            }
        }
    }
}
