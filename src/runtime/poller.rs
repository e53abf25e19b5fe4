//! Readiness multiplexer over raw file descriptors.
//!
//! Thin wrapper around `mio::Poll` (epoll on Linux, kqueue on macOS).
//! Every source is registered by fd and the fd doubles as its `Token`, so a
//! readiness event maps straight back to the descriptor it was raised for.
//! The poller also remembers which fds it holds; the reactor relies on that
//! set matching its connection registry.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// One readiness notification, copied out of the poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the socket reported an error.
    pub closed: bool,
}

/// Registration bookkeeping failures.
#[derive(Debug)]
pub enum RegistrationError {
    AlreadyRegistered(RawFd),
    NotRegistered(RawFd),
    /// The OS refused the operation (typically an invalid fd).
    Os(RawFd, io::Error),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::AlreadyRegistered(fd) => write!(f, "fd {fd} is already registered"),
            RegistrationError::NotRegistered(fd) => write!(f, "fd {fd} is not registered"),
            RegistrationError::Os(fd, e) => write!(f, "could not update registration of fd {fd}: {e}"),
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Poller failures. Both are fatal to the reactor.
#[derive(Debug)]
pub enum PollError {
    Create(io::Error),
    Wait(io::Error),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Create(e) => write!(f, "could not create poll instance: {e}"),
            PollError::Wait(e) => write!(f, "could not poll for events: {e}"),
        }
    }
}

impl std::error::Error for PollError {}

pub struct Poller {
    poll: Poll,
    events: Events,
    registered: HashSet<RawFd>,
}

impl Poller {
    /// Create a poller returning at most `max_events` events per call.
    pub fn new(max_events: usize) -> Result<Self, PollError> {
        Ok(Self {
            poll: Poll::new().map_err(PollError::Create)?,
            events: Events::with_capacity(max_events),
            registered: HashSet::new(),
        })
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> Result<(), RegistrationError> {
        if self.is_registered(fd) {
            return Err(RegistrationError::AlreadyRegistered(fd));
        }
        let token = token_for(fd)?;

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(|e| RegistrationError::Os(fd, e))?;
        self.registered.insert(fd);
        Ok(())
    }

    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> Result<(), RegistrationError> {
        if !self.is_registered(fd) {
            return Err(RegistrationError::NotRegistered(fd));
        }
        let token = token_for(fd)?;

        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
            .map_err(|e| RegistrationError::Os(fd, e))
    }

    /// Remove `fd` from the interest set.
    ///
    /// Must be called while the fd is still open. The fd is forgotten even
    /// when the OS call fails, since the caller is about to close it anyway.
    pub fn unregister(&mut self, fd: RawFd) -> Result<(), RegistrationError> {
        if !self.registered.remove(&fd) {
            return Err(RegistrationError::NotRegistered(fd));
        }

        self.poll
            .registry()
            .deregister(&mut SourceFd(&fd))
            .map_err(|e| RegistrationError::Os(fd, e))
    }

    /// Block until at least one fd is ready or `timeout` elapses.
    ///
    /// `ready` is cleared and refilled. A signal interrupting the wait yields
    /// an empty batch rather than an error.
    pub fn poll(
        &mut self,
        ready: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> Result<(), PollError> {
        ready.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(PollError::Wait(e)),
        }

        ready.extend(self.events.iter().map(|event| ReadinessEvent {
            fd: event.token().0 as RawFd,
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_error(),
        }));
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registered.contains(&fd)
    }

    /// All fds currently registered.
    pub fn registered(&self) -> &HashSet<RawFd> {
        &self.registered
    }
}

fn token_for(fd: RawFd) -> Result<Token, RegistrationError> {
    usize::try_from(fd).map(Token).map_err(|_| {
        RegistrationError::Os(
            fd,
            io::Error::new(io::ErrorKind::InvalidInput, "negative file descriptor"),
        )
    })
}
