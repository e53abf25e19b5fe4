//! hello-epoll: a single-threaded reactor server
//!
//! Accepts many concurrent TCP connections on one readiness multiplexer and
//! answers every request with the same canned HTTP response. A request that
//! carries `Connection: close` is not answered; the server shuts down its
//! write side and forgets the connection instead.
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod runtime;

use config::Config;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        read_buffer_size = config.read_buffer_size,
        max_events = config.max_events,
        "Starting hello-epoll server"
    );

    match runtime::run(config) {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
