//! Connection state and the registry that owns it.
//!
//! Connections are keyed by their socket fd. The registry is the only
//! place a `Connection` lives; removing the entry closes the socket.

use bytes::BytesMut;
use mio::net::TcpStream;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered and waiting for requests.
    Open,
    /// Being torn down; removal follows in the same dispatch.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    /// Peer address, kept for logging.
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Response bytes the socket did not accept yet.
    pub pending: BytesMut,
    /// Whether the poller currently watches this fd for writability.
    pub write_interest: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Open,
            pending: BytesMut::new(),
            write_interest: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }
}

/// Lookup of an fd the registry does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFound(pub RawFd);

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no connection for fd {}", self.0)
    }
}

impl std::error::Error for NotFound {}

/// Registry of active connections keyed by fd.
///
/// Provides O(1) average insert, lookup, and remove operations.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<RawFd, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under `fd`.
    ///
    /// Returns the connection previously stored under the same fd, which
    /// can only happen if an earlier removal was skipped.
    pub fn insert(&mut self, fd: RawFd, conn: Connection) -> Option<Connection> {
        self.connections.insert(fd, conn)
    }

    pub fn get(&self, fd: RawFd) -> Result<&Connection, NotFound> {
        self.connections.get(&fd).ok_or(NotFound(fd))
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Result<&mut Connection, NotFound> {
        self.connections.get_mut(&fd).ok_or(NotFound(fd))
    }

    pub fn remove(&mut self, fd: RawFd) -> Result<Connection, NotFound> {
        self.connections.remove(&fd).ok_or(NotFound(fd))
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Take every connection out of the registry.
    pub fn drain(&mut self) -> impl Iterator<Item = (RawFd, Connection)> + '_ {
        self.connections.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Returns the server side of a loopback connection plus the client
    /// socket, which must stay alive for the duration of the test.
    fn accepted(listener: &TcpListener) -> (Connection, std::net::TcpStream) {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (Connection::new(TcpStream::from_std(server), peer), client)
    }

    #[test]
    fn test_connection_state_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut conn, client) = accepted(&listener);

        assert_eq!(conn.state, ConnState::Open);
        assert_eq!(conn.peer, client.local_addr().unwrap());
        assert!(conn.pending.is_empty());

        conn.close();
        assert_eq!(conn.state, ConnState::Closing);
    }

    #[test]
    fn test_connection_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (c1, _client1) = accepted(&listener);
        let (c2, _client2) = accepted(&listener);
        let (fd1, fd2) = (c1.fd(), c2.fd());

        let mut registry = ConnectionRegistry::new();
        assert!(registry.insert(fd1, c1).is_none());
        assert!(registry.insert(fd2, c2).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(fd1).unwrap().fd(), fd1);
        registry.get_mut(fd2).unwrap().close();
        assert_eq!(registry.get(fd2).unwrap().state, ConnState::Closing);

        let removed = registry.remove(fd1).unwrap();
        assert_eq!(removed.fd(), fd1);
        assert!(!registry.contains(fd1));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(fd2));
    }

    #[test]
    fn test_missing_fd_is_not_found() {
        let mut registry = ConnectionRegistry::new();

        assert_eq!(registry.get(42).unwrap_err(), NotFound(42));
        assert_eq!(registry.get_mut(42).unwrap_err(), NotFound(42));
        assert_eq!(registry.remove(42).unwrap_err(), NotFound(42));
    }

    #[test]
    fn test_drain_empties_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (c1, _client1) = accepted(&listener);
        let (c2, _client2) = accepted(&listener);

        let mut registry = ConnectionRegistry::new();
        registry.insert(c1.fd(), c1);
        registry.insert(c2.fd(), c2);

        assert_eq!(registry.drain().count(), 2);
        assert!(registry.is_empty());
    }
}
