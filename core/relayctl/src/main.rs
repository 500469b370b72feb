//! relayctl: operator CLI for relayd.
//!
//! ## Subcommands
//!
//! - `status`: lock holder plus managed workers, as JSON
//! - `workers`: every participant in the store, as JSON
//! - `resume <worker>`: clear a sticky `error` presence
//! - `stop`: SIGTERM the running daemon and wait for it to exit

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use commands::{CtlError, Paths};

#[derive(Parser)]
#[command(name = "relayctl")]
#[command(about = "Control and inspect the relay wake daemon")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $RELAY_CONFIG or ~/.relay/relayd.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon and managed worker status
    Status,

    /// List every participant known to the store
    Workers,

    /// Clear a worker's error presence so mentions wake it again
    Resume {
        #[arg(value_name = "WORKER")]
        worker: String,
    },

    /// Stop the running daemon
    Stop {
        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

fn main() -> ExitCode {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "relayctl failed");
            eprintln!("relayctl: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CtlError> {
    let config = relay_daemon::load_config(cli.config)?;
    let paths = Paths::from_config(&config)?;

    match cli.command {
        Commands::Status => print_json(&commands::status(&paths)?),
        Commands::Workers => print_json(&commands::workers(&paths)?),
        Commands::Resume { worker } => print_json(&commands::resume(&paths, &worker)?),
        Commands::Stop { timeout } => {
            print_json(&commands::stop(&paths, Duration::from_secs(timeout))?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CtlError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
