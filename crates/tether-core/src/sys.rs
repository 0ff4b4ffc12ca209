//! Production environment over the platform socket API.
//!
//! TCP goes through `socket2` so a socket can be created, switched to
//! non-blocking, and then connected; UDP uses `std::net::UdpSocket`, which
//! is created at bind time. Platform error codes are folded into the
//! [`SockError`] taxonomy here and nowhere else.

use std::io::{self, Read};
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};

use crate::env::Environment;
use crate::socket::{AddrFamily, DatagramSocket, SockError, StreamSocket};

/// Fold a platform error into the session taxonomy.
fn classify(err: &io::Error) -> SockError {
    match err.kind() {
        io::ErrorKind::WouldBlock => return SockError::WouldBlock,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            return SockError::ConnReset
        }
        _ => {}
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::EINPROGRESS => return SockError::InProgress,
            libc::EALREADY => return SockError::Already,
            libc::EISCONN => return SockError::IsConn,
            libc::EINVAL => return SockError::Invalid,
            _ => {}
        }
    }

    #[cfg(windows)]
    if let Some(code) = err.raw_os_error() {
        // WSAEWOULDBLOCK / WSAEINPROGRESS / WSAEALREADY / WSAEISCONN
        match code {
            10035 => return SockError::WouldBlock,
            10036 => return SockError::InProgress,
            10037 => return SockError::Already,
            10056 => return SockError::IsConn,
            10022 => return SockError::Invalid,
            _ => {}
        }
    }

    SockError::Io(err.kind())
}

fn domain(family: AddrFamily) -> Domain {
    match family {
        AddrFamily::Ipv4 => Domain::IPV4,
        AddrFamily::Ipv6 => Domain::IPV6,
    }
}

/// Environment backed by the system clock and the platform network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Stream = SysStream;
    type Datagram = SysDatagram;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn stream_socket(&self, family: AddrFamily) -> Result<Self::Stream, SockError> {
        let sock = Socket::new(domain(family), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| classify(&e))?;
        sock.set_nonblocking(true).map_err(|e| classify(&e))?;
        Ok(SysStream { sock })
    }

    fn datagram_socket(&self, family: AddrFamily) -> Result<Self::Datagram, SockError> {
        Ok(SysDatagram {
            family,
            sock: None,
        })
    }
}

/// Non-blocking TCP socket.
#[derive(Debug)]
pub struct SysStream {
    sock: Socket,
}

impl StreamSocket for SysStream {
    fn connect(&mut self, addr: SocketAddr) -> Result<(), SockError> {
        self.sock.connect(&addr.into()).map_err(|e| classify(&e))
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<(), SockError> {
        self.sock.set_reuse_address(true).map_err(|e| classify(&e))?;
        self.sock.bind(&addr.into()).map_err(|e| classify(&e))
    }

    fn listen(&mut self, backlog: u32) -> Result<(), SockError> {
        self.sock
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(|e| classify(&e))
    }

    fn accept(&mut self) -> Result<(Self, SocketAddr), SockError> {
        let (sock, addr) = self.sock.accept().map_err(|e| classify(&e))?;
        sock.set_nonblocking(true).map_err(|e| classify(&e))?;
        let addr = addr.as_socket().ok_or(SockError::Invalid)?;
        Ok((SysStream { sock }, addr))
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        self.sock.send(buf).map_err(|e| classify(&e))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        (&self.sock).read(buf).map_err(|e| classify(&e))
    }

    fn local_addr(&self) -> Result<SocketAddr, SockError> {
        self.sock
            .local_addr()
            .map_err(|e| classify(&e))?
            .as_socket()
            .ok_or(SockError::Invalid)
    }
}

/// Non-blocking UDP socket, created when first bound.
#[derive(Debug)]
pub struct SysDatagram {
    family: AddrFamily,
    sock: Option<UdpSocket>,
}

impl DatagramSocket for SysDatagram {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), SockError> {
        debug_assert_eq!(AddrFamily::of(addr), self.family);
        let sock = UdpSocket::bind(addr).map_err(|e| classify(&e))?;
        sock.set_nonblocking(true).map_err(|e| classify(&e))?;
        self.sock = Some(sock);
        Ok(())
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<usize, SockError> {
        let sock = self.sock.as_ref().ok_or(SockError::Invalid)?;
        sock.send_to(buf, addr).map_err(|e| classify(&e))
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SockError> {
        let sock = self.sock.as_ref().ok_or(SockError::Invalid)?;
        sock.recv_from(buf).map_err(|e| classify(&e))
    }

    fn local_addr(&self) -> Result<SocketAddr, SockError> {
        let sock = self.sock.as_ref().ok_or(SockError::Invalid)?;
        sock.local_addr().map_err(|e| classify(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_classified() {
        let err = io::Error::new(io::ErrorKind::WouldBlock, "eagain");
        assert_eq!(classify(&err), SockError::WouldBlock);
    }

    #[cfg(unix)]
    #[test]
    fn errno_classification() {
        let err = io::Error::from_raw_os_error(libc::EINPROGRESS);
        assert_eq!(classify(&err), SockError::InProgress);
        let err = io::Error::from_raw_os_error(libc::EISCONN);
        assert_eq!(classify(&err), SockError::IsConn);
    }

    #[test]
    fn datagram_unbound_is_invalid() {
        let env = SystemEnv;
        let mut sock = env.datagram_socket(AddrFamily::Ipv4).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(sock.recv_from(&mut buf), Err(SockError::Invalid));
    }
}
