//! Cancellation of the event loop.
//!
//! SIGINT and SIGTERM set an atomic flag and write a byte into a socket
//! pair. The read end is registered with the poller, so a signal arriving
//! while the loop is busy still wakes the next poll. The loop checks the
//! flag after every poll.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};

/// Receiving side, owned by the reactor.
#[derive(Debug)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

/// Trigger for requesting shutdown from another thread.
#[cfg(test)]
#[derive(Debug)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wake_tx: UnixStream,
}

impl Shutdown {
    pub fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        Ok(Self {
            requested: Arc::new(AtomicBool::new(false)),
            wake_rx,
            wake_tx,
        })
    }

    /// Route SIGINT and SIGTERM to this shutdown.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        for signal in [SIGINT, SIGTERM] {
            // The flag is registered first so it is set before the wake byte lands.
            signal_hook::flag::register(signal, Arc::clone(&self.requested))?;
            signal_hook::low_level::pipe::register(signal, self.wake_tx.try_clone()?)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            requested: Arc::clone(&self.requested),
            wake_tx: self.wake_tx.try_clone()?,
        })
    }

    /// The fd to register for read-interest.
    pub fn fd(&self) -> RawFd {
        self.wake_rx.as_raw_fd()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Consume pending wake bytes so the fd can signal again.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
impl ShutdownHandle {
    pub fn trigger(&self) {
        use std::io::Write;

        self.requested.store(true, Ordering::SeqCst);
        // A full socket buffer means a wake-up is already pending.
        let _ = (&self.wake_tx).write(&[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_sets_flag_and_wakes() {
        let shutdown = Shutdown::new().unwrap();
        let handle = shutdown.handle().unwrap();
        assert!(!shutdown.is_requested());

        handle.trigger();
        assert!(shutdown.is_requested());

        let mut buf = [0u8; 8];
        assert_eq!((&shutdown.wake_rx).read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn test_drain_empties_wake_socket() {
        let shutdown = Shutdown::new().unwrap();
        let handle = shutdown.handle().unwrap();
        handle.trigger();
        handle.trigger();

        shutdown.drain();

        let mut buf = [0u8; 8];
        let err = (&shutdown.wake_rx).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
