//! Listening socket construction.
//!
//! Resolves the configured host to an IPv4 address and builds a
//! non-blocking, address-reusing listener with `socket2`.

use mio::net::TcpListener;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// A failed step of listener construction. All of them are fatal at startup.
#[derive(Debug)]
pub enum SetupError {
    /// Host/port could not be resolved.
    Resolve(String, io::Error),
    /// Resolution succeeded but produced no IPv4 address.
    NoIpv4Address(String),
    Socket(io::Error),
    SocketOptions(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Resolve(target, e) => {
                write!(f, "could not resolve socket address '{target}': {e}")
            }
            SetupError::NoIpv4Address(target) => {
                write!(f, "could not resolve socket address '{target}': no IPv4 address")
            }
            SetupError::Socket(e) => write!(f, "socket could not be created: {e}"),
            SetupError::SocketOptions(e) => write!(f, "socket options could not be set: {e}"),
            SetupError::Bind(addr, e) => write!(f, "socket could not be bound to {addr}: {e}"),
            SetupError::Listen(e) => write!(f, "socket could not listen for connections: {e}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Resolve(_, e)
            | SetupError::Socket(e)
            | SetupError::SocketOptions(e)
            | SetupError::Bind(_, e)
            | SetupError::Listen(e) => Some(e),
            SetupError::NoIpv4Address(_) => None,
        }
    }
}

/// Resolve `host:port`, keeping the first IPv4 address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, SetupError> {
    let target = format!("{host}:{port}");
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| SetupError::Resolve(target.clone(), e))?;

    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or(SetupError::NoIpv4Address(target))
}

/// Create the listening socket the reactor accepts on.
pub fn bind(addr: SocketAddr, backlog: i32) -> Result<TcpListener, SetupError> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(SetupError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(SetupError::SocketOptions)?;
    socket
        .set_nonblocking(true)
        .map_err(SetupError::SocketOptions)?;
    socket
        .bind(&addr.into())
        .map_err(|e| SetupError::Bind(addr, e))?;
    socket.listen(backlog).map_err(SetupError::Listen)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_localhost_ipv4() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_resolve_rejects_ipv6_only() {
        match resolve("::1", 8080) {
            Err(SetupError::NoIpv4Address(target)) => assert_eq!(target, "::1:8080"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let local = listener.local_addr().unwrap();
        assert!(local.is_ipv4());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_bind_port_in_use() {
        let first = bind("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = first.local_addr().unwrap();

        // SO_REUSEADDR does not allow two live listeners on one port.
        match bind(addr, 128) {
            Err(SetupError::Bind(failed, _)) => assert_eq!(failed, addr),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second listener bound to {addr}"),
        }
    }
}
