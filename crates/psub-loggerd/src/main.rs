// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::future::Future;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use psub_logger::config::{Settings, UploadConfig};
use psub_logger::constants::{APP_NAME, DUMP_TARGET};
use psub_logger::dispatcher::{Dispatcher, DispatcherHandle, StoreFactory};
use psub_logger::upload::default_store;
use psub_logger::util::parse_bus_address;

const DEFAULT_LOG_FILE: &str = "loggerd.log";
const DEFAULT_BUS_ADDRESS: &str = "127.0.0.1:3101";

/// Records pub/sub bus traffic into rotating capture files and uploads them.
///
/// Short options can be grouped (`-de`). Options taking a value must end their
/// group (`-el loggerd.log`). The last logging level given wins.
#[derive(Parser, Debug)]
#[command(name = "psub-loggerd", version)]
struct Args {
    /// Set the logging level to DEBUG
    #[arg(short = 'd', long, overrides_with_all = ["dump", "trace", "test"])]
    debug: bool,

    /// Set the logging level to DUMP (debug plus raw bus data)
    #[arg(short = 'm', long, overrides_with_all = ["debug", "trace", "test"])]
    dump: bool,

    /// Set the logging level to TRACE
    #[arg(short = 't', long, overrides_with_all = ["debug", "dump", "test"])]
    trace: bool,

    /// Set the logging level to TEST
    #[arg(short = 'T', long, overrides_with_all = ["debug", "dump", "trace"])]
    test: bool,

    /// Run in the foreground, also logging to stderr
    #[arg(short = 'e', long = "exe")]
    foreground: bool,

    /// Bus address, `host` or `host:port`
    #[arg(short = 'b', long, value_name = "ADDRESS", default_value = DEFAULT_BUS_ADDRESS, value_parser = parse_address)]
    bus: (String, u16),

    /// Log file to append to
    #[arg(short = 'l', long, value_name = "FILE", default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,
}

fn parse_address(value: &str) -> Result<(String, u16), String> {
    parse_bus_address(value).ok_or_else(|| format!("'{value}' is not a valid bus address"))
}

impl Args {
    /// Filter directives for the selected level, if one was given.
    fn log_directives(&self) -> Option<String> {
        if self.test || self.trace {
            Some("trace".to_string())
        } else if self.dump {
            Some(format!("debug,{DUMP_TARGET}=trace"))
        } else if self.debug {
            Some("debug".to_string())
        } else {
            None
        }
    }
}

fn init_logging(args: &Args) -> io::Result<()> {
    let directives = args
        .log_directives()
        .or_else(|| env::var("PSUB_LOG_LEVEL").ok().map(|v| v.to_lowercase()))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log_file)?;
    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);
    let stderr_layer = args.foreground.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .without_time()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(io::Error::other)
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!(
            "Cannot open log file {}: {}",
            args.log_file.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let (bus_host, bus_port) = args.bus.clone();
    let settings = Arc::new(Settings {
        bus_host,
        bus_port,
        ..Settings::default()
    });
    info!(
        "{} {} starting, bus at {}, log file {}",
        APP_NAME,
        settings.version,
        settings.bus_address(),
        args.log_file.display()
    );
    if !args.foreground {
        debug!("Running under a service manager, logging to file only");
    }

    let store_factory: StoreFactory = Arc::new(|upload: &UploadConfig| default_store(upload));
    let logger = Dispatcher::start(settings, store_factory);
    let code = serve(&logger, shutdown_signal()).await;
    info!("{} exiting", APP_NAME);
    code
}

/// Runs until `signal` fires or the logger stops by itself, then shuts it down.
async fn serve<F>(logger: &DispatcherHandle, signal: F) -> ExitCode
where
    F: Future<Output = io::Result<()>>,
{
    let code = tokio::select! {
        result = signal => match result {
            Ok(()) => {
                info!("Shutdown requested");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Cannot listen for shutdown signals: {}", e);
                ExitCode::FAILURE
            }
        },
        () = logger.stopped() => {
            error!("Logger stopped unexpectedly");
            return ExitCode::FAILURE;
        }
    };
    logger.shutdown().await;
    code
}
