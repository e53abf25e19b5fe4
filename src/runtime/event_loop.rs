//! Single-threaded reactor.
//!
//! Readiness-based model: the poller tells us which sockets are ready, then
//! we perform non-blocking accept/read/write syscalls. One control flow owns
//! the listener, the poller and the connection registry; every change to a
//! connection's existence updates the poller and the registry back to back.
//!
//! Sources are edge-triggered, so every readiness event is drained until
//! `WouldBlock`. Each successful recv is one complete request:
//! - plain request: answer with the fixed response, stay open
//! - `Connection: close`: shut down our write side, remove, no response
//! - EOF: shut down our write side, remove
//! - reset or undecodable bytes: remove without shutdown
//!
//! A response that does not fit the socket buffer is kept on the connection
//! and flushed on write-readiness instead of blocking the loop. Until it is
//! flushed the connection is not read from, so at most one response waits.

use crate::config::Config;
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::poller::{PollError, Poller, ReadinessEvent};
use crate::runtime::protocol::{self, Malformed};
use crate::runtime::shutdown::Shutdown;
use crate::runtime::RuntimeError;
use bytes::Buf;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown as SocketShutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// What one recv call produced.
#[derive(Debug)]
pub enum ReadOutcome<'a> {
    Data(&'a [u8]),
    /// Peer closed its write side (FIN).
    Eof,
    /// The socket reported an error, typically a reset (RST).
    Reset(io::Error),
}

/// Why a connection's write side is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    CloseRequested,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::CloseRequested => f.write_str("close requested"),
        }
    }
}

/// Why a connection is dropped without shutdown.
#[derive(Debug)]
pub enum DropReason {
    Reset(io::Error),
    Malformed(Malformed),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Reset(e) => write!(f, "receive failed: {e}"),
            DropReason::Malformed(e) => write!(f, "malformed request: {e}"),
        }
    }
}

/// The transition a connection takes after a recv.
#[derive(Debug)]
pub enum Step {
    /// Send the fixed response and stay open.
    Respond,
    /// Shut down the local write side, then remove.
    CloseWrite(CloseReason),
    /// Remove immediately.
    Drop(DropReason),
}

/// Decide what to do with one recv result.
pub fn decide(outcome: ReadOutcome<'_>) -> Step {
    match outcome {
        ReadOutcome::Reset(e) => Step::Drop(DropReason::Reset(e)),
        ReadOutcome::Eof => Step::CloseWrite(CloseReason::PeerClosed),
        ReadOutcome::Data(bytes) => match protocol::parse(bytes) {
            Ok(request) if request.close_requested => {
                Step::CloseWrite(CloseReason::CloseRequested)
            }
            Ok(_) => Step::Respond,
            Err(e) => Step::Drop(DropReason::Malformed(e)),
        },
    }
}

pub struct Reactor {
    listener: TcpListener,
    listener_fd: RawFd,
    poller: Poller,
    registry: ConnectionRegistry,
    shutdown: Shutdown,
    read_buf: Vec<u8>,
    ready: Vec<ReadinessEvent>,
}

impl Reactor {
    /// Register the listener and the shutdown wake fd with a new poller.
    pub fn new(
        listener: TcpListener,
        config: &Config,
        shutdown: Shutdown,
    ) -> Result<Self, RuntimeError> {
        let mut poller = Poller::new(config.max_events)?;
        let listener_fd = listener.as_raw_fd();

        poller
            .register(listener_fd, Interest::READABLE)
            .map_err(RuntimeError::ListenerRegistration)?;
        poller
            .register(shutdown.fd(), Interest::READABLE)
            .map_err(RuntimeError::ShutdownRegistration)?;

        Ok(Self {
            listener,
            listener_fd,
            poller,
            registry: ConnectionRegistry::new(),
            shutdown,
            read_buf: vec![0u8; config.read_buffer_size],
            ready: Vec::with_capacity(config.max_events),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Run until shutdown is requested, then unwind.
    ///
    /// Only a poll failure ends the loop with an error.
    pub fn run(&mut self) -> Result<(), PollError> {
        loop {
            self.turn(None)?;

            if self.shutdown.is_requested() {
                self.teardown();
                return Ok(());
            }
        }
    }

    /// Poll once and dispatch every ready event.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), PollError> {
        let mut ready = std::mem::take(&mut self.ready);
        let polled = self.poller.poll(&mut ready, timeout);

        if polled.is_ok() {
            for event in &ready {
                self.dispatch(*event);
            }
        }

        self.ready = ready;
        polled
    }

    fn dispatch(&mut self, event: ReadinessEvent) {
        if event.fd == self.listener_fd {
            self.accept_connections();
            return;
        }

        if event.fd == self.shutdown.fd() {
            self.shutdown.drain();
            return;
        }

        if let Err(e) = self.registry.get(event.fd) {
            trace!(error = %e, "Ignoring stale event");
            return;
        }

        trace!(
            fd = event.fd,
            readable = event.readable,
            writable = event.writable,
            closed = event.closed,
            "Connection event"
        );

        // Reading resumes only once no response is left in flight. Data that
        // arrived while the fd was write-only raised no event, so read now.
        if self.flush(event.fd) {
            self.handle_readable(event.fd);
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!(error = %e, "Could not open a new connection");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let fd = stream.as_raw_fd();

        if let Err(e) = self.poller.register(fd, Interest::READABLE) {
            error!(peer = %peer, error = %e, "Could not register new connection");
            return;
        }

        if self
            .registry
            .insert(fd, Connection::new(stream, peer))
            .is_some()
        {
            warn!(fd, "Replaced stale connection entry");
        }

        info!(peer = %peer, fd, "Connection open");
    }

    fn handle_readable(&mut self, fd: RawFd) {
        loop {
            let Ok(conn) = self.registry.get_mut(fd) else {
                return;
            };
            if !conn.pending.is_empty() {
                return;
            }

            let step = match conn.stream.read(&mut self.read_buf) {
                Ok(0) => decide(ReadOutcome::Eof),
                Ok(n) => decide(ReadOutcome::Data(&self.read_buf[..n])),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => decide(ReadOutcome::Reset(e)),
            };

            match step {
                Step::Respond => {
                    trace!(fd, "Request");
                    conn.pending.extend_from_slice(protocol::response());
                    self.flush(fd);
                }
                Step::CloseWrite(reason) => {
                    conn.close();
                    if let Err(e) = conn.stream.shutdown(SocketShutdown::Write) {
                        debug!(peer = %conn.peer, error = %e, "Connection is already closed");
                    }
                    info!(peer = %conn.peer, %reason, "Connection closed");
                    self.remove_connection(fd);
                    return;
                }
                Step::Drop(reason) => {
                    conn.close();
                    warn!(peer = %conn.peer, %reason, "Connection dropped");
                    self.remove_connection(fd);
                    return;
                }
            }
        }
    }

    /// Write as much pending output as the socket takes.
    ///
    /// While a response is only partly written the fd is watched for
    /// writability alone, so the peer cannot queue more work until it drains
    /// what it already asked for. Returns true when the connection is still
    /// registered and nothing is left to write.
    fn flush(&mut self, fd: RawFd) -> bool {
        let Ok(conn) = self.registry.get_mut(fd) else {
            return false;
        };

        if let Err(e) = write_pending(conn) {
            conn.close();
            warn!(peer = %conn.peer, error = %e, "Could not send response");
            self.remove_connection(fd);
            return false;
        }

        let want_write = !conn.pending.is_empty();
        if want_write == conn.write_interest {
            return !want_write;
        }

        let interest = if want_write {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        conn.write_interest = want_write;

        if let Err(e) = self.poller.reregister(fd, interest) {
            conn.close();
            warn!(peer = %conn.peer, error = %e, "Could not update connection interest");
            self.remove_connection(fd);
            return false;
        }

        trace!(fd, pending = want_write, "Connection interest updated");
        !want_write
    }

    /// Unregister and drop a connection. Failures are logged, never fatal.
    fn remove_connection(&mut self, fd: RawFd) {
        if let Err(e) = self.poller.unregister(fd) {
            warn!(error = %e, "Could not unregister connection");
        }

        match self.registry.remove(fd) {
            Ok(conn) => {
                debug_assert_eq!(conn.state, ConnState::Closing);
                debug!(fd = conn.fd(), "Connection removed");
            }
            Err(e) => warn!(error = %e, "Could not remove connection"),
        }
    }

    /// Drop every client without notice and stop listening.
    fn teardown(&mut self) {
        let dropped = self.registry.len();

        for (fd, mut conn) in self.registry.drain() {
            conn.close();
            if let Err(e) = self.poller.unregister(fd) {
                warn!(peer = %conn.peer, error = %e, "Could not unregister connection");
            }
        }
        debug_assert!(self.registry.is_empty());

        for fd in [self.listener_fd, self.shutdown.fd()] {
            if let Err(e) = self.poller.unregister(fd) {
                warn!(error = %e, "Could not unregister during shutdown");
            }
        }
        debug_assert!(self.poller.registered().is_empty());

        info!(dropped, "Exiting...");
    }

    /// True when the registry holds exactly the client fds the poller watches.
    #[cfg(test)]
    fn registry_matches_poller(&self) -> bool {
        let clients: std::collections::HashSet<RawFd> = self
            .poller
            .registered()
            .iter()
            .copied()
            .filter(|&fd| fd != self.listener_fd && fd != self.shutdown.fd())
            .collect();

        clients.len() == self.registry.len() && clients.iter().all(|&fd| self.registry.contains(fd))
    }
}

fn write_pending(conn: &mut Connection) -> io::Result<()> {
    while !conn.pending.is_empty() {
        match conn.stream.write(&conn.pending) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => conn.pending.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
