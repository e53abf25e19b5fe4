//! Single-threaded reactor runtime.
//!
//! Readiness-based I/O over mio (epoll on Linux, kqueue on macOS):
//! - `listener`: listening socket construction
//! - `poller`: fd-keyed wrapper over `mio::Poll`
//! - `connection`: per-connection state and the fd → connection registry
//! - `protocol`: request classification and the fixed response
//! - `shutdown`: signal-driven cancellation
//! - `event_loop`: the reactor tying them together

mod connection;
mod event_loop;
mod listener;
mod poller;
mod protocol;
mod shutdown;

pub(crate) use event_loop::Reactor;
pub(crate) use listener::SetupError;
pub(crate) use poller::{PollError, RegistrationError};
pub(crate) use shutdown::Shutdown;

use crate::config::Config;
use std::fmt;
use std::io;
use tracing::info;

/// Anything that stops the server. All of them map to exit code 1.
#[derive(Debug)]
pub enum RuntimeError {
    Setup(SetupError),
    Poll(PollError),
    ListenerRegistration(RegistrationError),
    ShutdownRegistration(RegistrationError),
    Signals(io::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Setup(e) => write!(f, "{e}"),
            RuntimeError::Poll(e) => write!(f, "{e}"),
            RuntimeError::ListenerRegistration(e) => {
                write!(f, "could not register listener with the poller: {e}")
            }
            RuntimeError::ShutdownRegistration(e) => {
                write!(f, "could not register shutdown wake-up with the poller: {e}")
            }
            RuntimeError::Signals(e) => write!(f, "could not install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<SetupError> for RuntimeError {
    fn from(e: SetupError) -> Self {
        RuntimeError::Setup(e)
    }
}

impl From<PollError> for RuntimeError {
    fn from(e: PollError) -> Self {
        RuntimeError::Poll(e)
    }
}

/// Bind the listener, install signal handlers and run the reactor until
/// SIGINT or SIGTERM.
pub fn run(config: Config) -> Result<(), RuntimeError> {
    let addr = listener::resolve(&config.host, config.port)?;
    let listener = listener::bind(addr, config.backlog)?;

    let shutdown = Shutdown::new().map_err(RuntimeError::Signals)?;
    shutdown
        .install_signal_handlers()
        .map_err(RuntimeError::Signals)?;

    let mut reactor = Reactor::new(listener, &config, shutdown)?;
    let local = reactor.local_addr().unwrap_or(addr);
    info!(addr = %local, backlog = config.backlog, "Listening");

    reactor.run()?;
    Ok(())
}
