// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::backtrace::Backtrace;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use log_shipper::config::ShipperConfig;
use log_shipper::console::LocalConsole;
use log_shipper::context::DaemonContext;
use log_shipper::daemon::Daemon;
use log_shipper::producer::{Backend, RestBackend};
use log_shipper::record::Stream;
use log_shipper::shutdown::linger;

/// The blocking stdin reader thread never finishes on its own.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "log-shipper-daemon",
    version,
    about = "Ships the records written to standard input to broker topics"
)]
struct Cli {
    /// Stream of the supervised process this instance reads (stdout or stderr).
    /// Overrides DKT_LOGGER_STREAM.
    #[arg(long)]
    stream: Option<Stream>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ShipperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(stream) = cli.stream {
        config.stream = stream;
    }

    init_logging(&config.log_level);
    install_panic_hook();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.max_procs)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    code
}

async fn run(config: ShipperConfig) -> ExitCode {
    let service = config.service_label();
    let linger_delay = config.linger;

    let backend: Option<Arc<dyn Backend>> = if config.backend_enabled {
        match RestBackend::from_config(&config) {
            Ok(backend) => Some(Arc::new(backend)),
            Err(e) => {
                error!("{service}: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let ctx = DaemonContext::new(config, LocalConsole::Stdout);
    let daemon = Daemon::new(ctx, backend);
    let input = BufReader::new(tokio::io::stdin());
    let task = tokio::spawn(daemon.run(input, termination_signal()));

    match task.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("{service} terminating: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Run-time panic resulting in {service} exiting: {e}");
            linger(&service, linger_delay).await;
            ExitCode::SUCCESS
        }
    }
}

/// Registers the handlers right away so that a signal arriving during
/// startup is not lost.
#[cfg(unix)]
fn termination_signal() -> impl Future<Output = &'static str> + Send {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = signal(SignalKind::terminate());
    let interrupt = signal(SignalKind::interrupt());
    async move {
        match (terminate, interrupt) {
            (Ok(mut terminate), Ok(mut interrupt)) => tokio::select! {
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
            },
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {e}");
                std::future::pending().await
            }
        }
    }
}

#[cfg(not(unix))]
fn termination_signal() -> impl Future<Output = &'static str> + Send {
    async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending().await
            }
        }
    }
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{log_level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {e}");
        return;
    }
    debug!("Logging subsystem enabled");
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!(
            "Run-time panic: {info}. Stack dump follows:\n{}",
            Backtrace::force_capture()
        );
    }));
}
