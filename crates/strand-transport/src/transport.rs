//! # Datagram Transports
//!
//! The endpoint is generic over an unreliable datagram transport. The only
//! production implementation wraps a blocking `std::net::UdpSocket` with a
//! read timeout; the simulator crate provides an impaired implementation for
//! tests.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// What the endpoint requires from an unreliable datagram transport.
///
/// Implementations must be shareable across the owner thread and the
/// endpoint's receive loop.
pub trait Transport: Send + Sync {
    /// Transmit one datagram to `addr`. Returns the number of bytes sent.
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, or `None` when the read timeout elapses.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// The local address the transport is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Release transport resources. Called once after the receive loop has
    /// joined; implementations relying on drop may leave this empty.
    fn close(&self);
}

/// Plain UDP transport over a blocking socket.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a socket and arm its read timeout. The timeout is what keeps
    /// the endpoint's receive loop responsive to shutdown.
    pub fn bind(addr: impl ToSocketAddrs, read_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(read_timeout))?;
        Ok(UdpTransport { socket })
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        // The socket is released on drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_local() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0", Duration::from_millis(20)).unwrap()
    }

    #[test]
    fn send_and_receive() {
        let a = bind_local();
        let b = bind_local();

        a.send_to(b"ping", b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let mut received = None;
        for _ in 0..50 {
            if let Some((len, from)) = b.recv_from(&mut buf).unwrap() {
                received = Some((buf[..len].to_vec(), from));
                break;
            }
        }
        let (data, from) = received.expect("datagram must arrive on loopback");
        assert_eq!(data, b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn read_timeout_yields_none() {
        let transport = bind_local();
        let mut buf = [0u8; 16];
        assert!(transport.recv_from(&mut buf).unwrap().is_none());
    }
}
