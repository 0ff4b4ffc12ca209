//! The socket seam.
//!
//! The state machines never touch the platform socket API directly; they
//! drive these traits. Sockets are non-blocking by construction and owned
//! by their session, so closing is dropping. The production implementation
//! lives in [`crate::sys`]; the deterministic test fabric implements the
//! same traits in the harness crate.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

/// Address family a socket is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
}

impl AddrFamily {
    /// Family of a concrete address.
    #[must_use]
    pub fn of(addr: SocketAddr) -> Self {
        if addr.is_ipv4() {
            Self::Ipv4
        } else {
            Self::Ipv6
        }
    }
}

/// The wildcard bind address for a family and port.
#[must_use]
pub fn any_addr(family: AddrFamily, port: u16) -> SocketAddr {
    match family {
        AddrFamily::Ipv4 => SocketAddr::from(([0, 0, 0, 0], port)),
        AddrFamily::Ipv6 => SocketAddr::from(([0u16; 8], port)),
    }
}

/// Parse a `host[:port]` endpoint string. A missing port means port 0.
///
/// The host may be a DNS name or a literal address; resolution picks the
/// first result.
///
/// # Errors
///
/// Returns an [`io::Error`] when the host cannot be resolved.
pub fn parse_endpoint(endpoint: &str) -> io::Result<SocketAddr> {
    let candidate = if endpoint.contains(':')
        && endpoint
            .rsplit(':')
            .next()
            .is_some_and(|tail| tail.parse::<u16>().is_ok())
    {
        endpoint.to_string()
    } else {
        format!("{endpoint}:0")
    };
    candidate
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "endpoint resolved to no address"))
}

/// Socket error taxonomy the state machines dispatch on.
///
/// The transient kinds (`WouldBlock`, `InProgress`, `Already`) are recovered
/// from transparently; `IsConn` reads as success for a connect; `ConnReset`
/// unbinds the affected socket; everything else counts against the caller's
/// retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SockError {
    /// The operation would block; retry on a later tick.
    #[error("operation would block")]
    WouldBlock,

    /// A non-blocking connect is underway.
    #[error("connection attempt in progress")]
    InProgress,

    /// A previous connect on this socket is still pending.
    #[error("previous connection attempt still pending")]
    Already,

    /// The socket is already connected.
    #[error("socket is already connected")]
    IsConn,

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    ConnReset,

    /// The operation is invalid for the socket's current state.
    #[error("invalid socket operation")]
    Invalid,

    /// Any other platform failure, by kind.
    #[error("socket error: {0:?}")]
    Io(io::ErrorKind),
}

impl SockError {
    /// True for conditions a connect loop retries rather than fails on.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::InProgress | Self::Already)
    }
}

/// A connection-oriented socket: client side, listener side, and accepted
/// peers all share this shape.
pub trait StreamSocket: Sized {
    /// Begin or continue a non-blocking connect to `addr`.
    ///
    /// # Errors
    ///
    /// `IsConn` once the socket is connected; transient kinds while the
    /// attempt is still underway.
    fn connect(&mut self, addr: SocketAddr) -> Result<(), SockError>;

    /// Bind the local address.
    ///
    /// # Errors
    ///
    /// Platform bind failures, classified.
    fn bind(&mut self, addr: SocketAddr) -> Result<(), SockError>;

    /// Mark the socket as accepting connections.
    ///
    /// # Errors
    ///
    /// `Invalid` when the socket is not bound.
    fn listen(&mut self, backlog: u32) -> Result<(), SockError>;

    /// Accept one pending connection.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when no peer is waiting.
    fn accept(&mut self) -> Result<(Self, SocketAddr), SockError>;

    /// Write bytes; returns the count actually taken.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the send buffer is full; `ConnReset` on a dead
    /// peer.
    fn send(&mut self, buf: &[u8]) -> Result<usize, SockError>;

    /// Read available bytes into `buf`; returns the count.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when nothing is pending; `ConnReset` on a dead peer.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError>;

    /// The locally bound address.
    ///
    /// # Errors
    ///
    /// `Invalid` before the socket has an address.
    fn local_addr(&self) -> Result<SocketAddr, SockError>;
}

/// A connectionless datagram socket.
pub trait DatagramSocket {
    /// Bind the local address.
    ///
    /// # Errors
    ///
    /// Platform bind failures, classified.
    fn bind(&mut self, addr: SocketAddr) -> Result<(), SockError>;

    /// Send one datagram to `addr`.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the send buffer is full; `Invalid` before bind.
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<usize, SockError>;

    /// Receive one datagram and its origin.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when nothing is pending; `Invalid` before bind.
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SockError>;

    /// The locally bound address.
    ///
    /// # Errors
    ///
    /// `Invalid` before the socket has an address.
    fn local_addr(&self) -> Result<SocketAddr, SockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_with_port() {
        let addr = parse_endpoint("127.0.0.1:9000").unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
    }

    #[test]
    fn endpoint_without_port_defaults_to_zero() {
        let addr = parse_endpoint("127.0.0.1").unwrap();
        assert_eq!(addr.port(), 0);
    }

    #[test]
    fn transient_kinds() {
        assert!(SockError::WouldBlock.is_transient());
        assert!(SockError::InProgress.is_transient());
        assert!(SockError::Already.is_transient());
        assert!(!SockError::ConnReset.is_transient());
        assert!(!SockError::IsConn.is_transient());
    }

    #[test]
    fn wildcard_addresses() {
        assert_eq!(
            any_addr(AddrFamily::Ipv4, 4000),
            SocketAddr::from(([0, 0, 0, 0], 4000))
        );
        assert!(any_addr(AddrFamily::Ipv6, 0).ip().is_unspecified());
    }
}
