//! relayd entrypoint.
//!
//! Loads `~/.relay/relayd.toml`, opens the SQLite store, takes the singleton
//! lock and runs the watch loop until SIGINT/SIGTERM.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_daemon::driver::DriverRegistry;
use relay_daemon::router::FailOpenRouter;
use relay_daemon::telemetry::{NoTelemetry, TranscriptTelemetry, UsageTelemetry};
use relay_daemon::{load_config, Daemon, DaemonError, LockError, SqliteStore};

const DEBUG_ENV: &str = "RELAY_DEBUG_LOG";

fn main() -> ExitCode {
    init_logging();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(DaemonError::Lock(LockError::AlreadyRunning { pid })) => {
            warn!(pid, "relayd is already running");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "relayd failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), DaemonError> {
    let config = load_config(None)?;
    let db_path = config.resolved_db_path()?;
    let lock_path = config.resolved_lock_path()?;

    let store = SqliteStore::new(db_path.clone())?;
    let drivers = DriverRegistry::from_config(&config.drivers)?;
    let telemetry: Arc<dyn UsageTelemetry> = match TranscriptTelemetry::from_home() {
        Some(telemetry) => Arc::new(telemetry),
        None => {
            warn!("Home directory not found; usage telemetry disabled");
            Arc::new(NoTelemetry)
        }
    };
    let router = FailOpenRouter::from_config(&config.router);
    info!(
        db = %db_path.display(),
        drivers = ?drivers.names(),
        router = config.router.command.is_some(),
        poll_interval_ms = config.poll_interval_ms,
        "relayd config loaded"
    );

    let daemon = Daemon::new(&config, Arc::new(store), drivers, telemetry, router);
    let running = daemon.start(&lock_path)?;

    let stop = running.stop_handle();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        stop.stop();
    }) {
        warn!(error = %err, "Failed to install signal handler");
    }

    running.wait()
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
