use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use relaunch_core::UpdateError;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

mod dispatch;
mod notify;
mod render;
mod update_flow;

/// Exit code when another run holds the lock (EX_TEMPFAIL).
const LOCK_HELD_EXIT: u8 = 75;
const SETUP_FAILED_EXIT: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "relaunch")]
#[command(about = "Self-updater for a systemd-managed service binary", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Updater configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "RELAUNCH_CONFIG",
        default_value = "relaunch.toml"
    )]
    config: PathBuf,
    /// Raise the default log level to debug.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Check for a new release and apply it.
    Run,
    /// Report whether a newer release exists without touching the service.
    Check,
    /// Show the recorded version, service state and lock holder.
    Status,
    /// Watch the running service's log and classify its health.
    Verify {
        /// Observation window in seconds; defaults to the configured window.
        #[arg(long)]
        window: Option<u64>,
    },
    /// Restore the previously installed binary and restart the service.
    Rollback,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch::run_cli(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "relaunch aborted");
            eprintln!("error: {err:#}");
            ExitCode::from(setup_exit_code(&err))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("RELAUNCH_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

pub(crate) fn setup_exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<UpdateError>() {
        Some(UpdateError::LockHeld { .. }) => LOCK_HELD_EXIT,
        _ => SETUP_FAILED_EXIT,
    }
}
