// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the reader, queues, forwarders and timers together and supervises
//! them until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::context::DaemonContext;
use crate::errors::ShipperError;
use crate::forwarder::Forwarder;
use crate::notifier::{run_notifier, run_stats_reporter};
use crate::producer::Backend;
use crate::queue::bounded;
use crate::rate_limiter::RateLimiter;
use crate::reader::{LineReader, ReaderExit};
use crate::record::Stream;
use crate::router::Router;
use crate::shutdown::ShutdownCoordinator;
use crate::EVENT_TARGET;

/// How long abandoned forwarders get to write their records locally.
const ABANDON_GRACE: Duration = Duration::from_millis(500);

pub struct Daemon {
    ctx: Arc<DaemonContext>,
    backend: Option<Arc<dyn Backend>>,
}

impl Daemon {
    /// Without a backend every record takes the local path.
    #[must_use]
    pub fn new(ctx: Arc<DaemonContext>, backend: Option<Arc<dyn Backend>>) -> Self {
        Self { ctx, backend }
    }

    /// Runs until end of input, a termination signal or a fault, then lingers
    /// and returns. Only a fatal input read error is returned as an error, and
    /// without lingering.
    pub async fn run<R, S>(self, input: R, shutdown_signal: S) -> Result<(), ShipperError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        S: Future<Output = &'static str>,
    {
        let ctx = self.ctx;
        let config = &ctx.config;
        let service = config.service_label();
        info!(target: EVENT_TARGET, "{service} STARTING, version {}", config.version);

        let (stdout_queue, stdout_consumer) = bounded(Stream::Stdout, config.channel_size);
        let (stderr_queue, stderr_consumer) = bounded(Stream::Stderr, config.channel_size);
        let reader_stop = CancellationToken::new();
        let coordinator = ShutdownCoordinator::new(
            Arc::clone(&ctx),
            stdout_queue.clone(),
            stderr_queue.clone(),
            reader_stop.clone(),
        );

        let timers_cancel = CancellationToken::new();
        let mut timers = JoinSet::new();
        let limiter = Arc::new(RateLimiter::from_config(config));
        if config.log_limit_enabled {
            timers.spawn(
                Arc::clone(&limiter).run_reset_timer(config.log_limit_interval, timers_cancel.clone()),
            );
        }
        timers.spawn(run_notifier(Arc::clone(&ctx), timers_cancel.clone()));
        timers.spawn(run_stats_reporter(Arc::clone(&ctx), timers_cancel.clone()));

        let mut workers = JoinSet::new();
        match self.backend.filter(|_| ctx.mode.backend_enabled()) {
            Some(backend) => {
                let (ready_tx, ready_rx) = watch::channel(false);
                for consumer in [stdout_consumer, stderr_consumer] {
                    let forwarder = Forwarder::new(
                        Arc::clone(&ctx),
                        Arc::clone(&backend),
                        consumer,
                        ready_rx.clone(),
                    );
                    workers.spawn(forwarder.run());
                }
                workers.spawn(discover(
                    backend,
                    ready_tx,
                    coordinator.clone(),
                    service.clone(),
                ));
            }
            None => {
                debug!("Backend disabled, records are only written locally");
                drop((stdout_consumer, stderr_consumer));
                info!(target: EVENT_TARGET, "{service} READY");
            }
        }

        let reader = LineReader::new(
            Arc::clone(&ctx),
            Classifier::new(config),
            limiter,
            Router::new(Arc::clone(&ctx), stdout_queue.sender(), stderr_queue.sender()),
            config.stream,
        );
        let mut reader_task = tokio::spawn(async move { reader.run(input, reader_stop).await });

        tokio::pin!(shutdown_signal);
        let mut signalled = false;
        loop {
            tokio::select! {
                joined = &mut reader_task => {
                    match joined {
                        Ok(Ok(ReaderExit::EndOfInput)) => coordinator.on_end_of_input().await,
                        Ok(Ok(ReaderExit::Stopped)) => debug!("Reader stopped"),
                        Ok(Err(e)) => {
                            timers_cancel.cancel();
                            workers.abort_all();
                            return Err(e);
                        }
                        Err(e) => {
                            error!("Reader task failed: {e}");
                            coordinator.on_fault().await;
                        }
                    }
                    break;
                }
                signal = &mut shutdown_signal, if !signalled => {
                    signalled = true;
                    coordinator.on_signal(signal).await;
                }
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined {
                        error!("Worker task failed: {e}");
                        coordinator.on_fault().await;
                    }
                }
            }
        }

        if !join_workers(&mut workers, config.drain_timeout).await {
            warn!("Forwarders did not finish within {:?}", config.drain_timeout);
            coordinator.abandon_in_flight();
            if !join_workers(&mut workers, ABANDON_GRACE).await {
                workers.abort_all();
            }
        }

        timers_cancel.cancel();
        while timers.join_next().await.is_some() {}

        let s = ctx.stats.snapshot();
        debug!(
            rx = s.rx_stdout + s.rx_stderr,
            tx = s.tx_stdout + s.tx_stderr,
            "{service} exiting"
        );
        coordinator.finish().await;
        Ok(())
    }
}

/// Returns false if some worker was still running when `limit` elapsed.
async fn join_workers(workers: &mut JoinSet<()>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed during shutdown: {e}");
            }
        }
    })
    .await
    .is_ok()
}

async fn discover(
    backend: Arc<dyn Backend>,
    ready: watch::Sender<bool>,
    coordinator: ShutdownCoordinator,
    service: String,
) {
    match backend.discover().await {
        Ok(()) => {
            ready.send_replace(true);
            info!(target: EVENT_TARGET, "{service} READY");
        }
        Err(e) => {
            error!("{service}: {}", ShipperError::from(e));
            drop(ready);
            coordinator.on_fault().await;
        }
    }
}
