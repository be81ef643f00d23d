//! icsync — sync an iCloud photo library to a local directory.
//!
//! Enumerates the account's assets newest-added first, reconciles them
//! against the local tree (download, resume, or skip), and optionally
//! deletes on either side to keep the two in agreement. Multiple account
//! configurations run in sequence from a single invocation.

#![warn(clippy::all)]

mod auth;
mod cli;
mod config;
mod delete;
mod download;
mod error;
mod local;
mod naming;
mod notify;
mod photos;
mod retry;
mod selector;
mod session;
mod shutdown;
mod sync;
mod types;

use tracing_subscriber::EnvFilter;

use types::LogLevel;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (global, accounts) = match cli::parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            return 2;
        }
    };

    // Keep stdout machine-readable when paths are being printed.
    let filter = if global.only_print_filenames {
        "error"
    } else {
        match global.log_level {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    if let Err(e) = config::validate(&global, &accounts) {
        eprintln!("{e}");
        return 2;
    }

    let cancel = match shutdown::install_signal_handler() {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("Failed to install signal handlers: {e}");
            return 1;
        }
    };

    tracing::info!(
        configurations = accounts.len(),
        watch = ?global.watch_with_interval,
        "Starting icsync"
    );

    sync::run_all(&global, &accounts, &cancel).await
}
