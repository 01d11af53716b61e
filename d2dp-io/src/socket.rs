//! Datagram sockets for D2DP
//!
//! The protocol runs over any connected, bidirectional datagram channel. The
//! [`DatagramSocket`] trait is that contract; [`UdpLink`] implements it over a
//! connected UDP socket and [`MemorySocket`] over in-process channels.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Default time a blocking receive waits before reporting `WouldBlock`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("Poll interval must be non-zero")]
    InvalidPollInterval,
}

/// Connected datagram channel
///
/// `recv` blocks for at most a bounded poll interval and then fails with
/// `WouldBlock` or `TimedOut`, so that callers can observe shutdown requests.
/// A datagram larger than `buf` is truncated to `buf.len()` bytes.
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram to the peer
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram from the peer
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: DatagramSocket + ?Sized> DatagramSocket for Arc<T> {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }
}

impl<T: DatagramSocket + ?Sized> DatagramSocket for Box<T> {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }
}

/// Connected UDP socket
pub struct UdpLink {
    inner: Socket,
}

impl UdpLink {
    /// Create a UDP socket bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(DEFAULT_POLL_INTERVAL))?;

        Ok(UdpLink { inner: socket })
    }

    /// Bind to `local` and connect to `peer`
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self, SocketError> {
        let link = Self::bind(local)?;
        link.connect_to(peer)?;
        Ok(link)
    }

    /// Connect the socket to `peer`; datagrams from other addresses are
    /// filtered by the kernel afterwards
    pub fn connect_to(&self, peer: SocketAddr) -> Result<(), SocketError> {
        self.inner.connect(&peer.into())?;
        tracing::debug!(%peer, "udp link connected");
        Ok(())
    }

    /// Set how long `recv` blocks before reporting `WouldBlock`
    pub fn set_poll_interval(&self, interval: Duration) -> Result<(), SocketError> {
        if interval.is_zero() {
            return Err(SocketError::InvalidPollInterval);
        }
        self.inner.set_read_timeout(Some(interval))?;
        Ok(())
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_send_buffer_size(size)?;
        Ok(())
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Get the address of the connected peer
    pub fn peer_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .peer_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Get a reference to the underlying socket
    pub fn as_socket(&self) -> &Socket {
        &self.inner
    }
}

impl DatagramSocket for UdpLink {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

/// In-process datagram channel
///
/// Created in connected pairs by [`MemorySocket::pair`]. Sending to a peer
/// that has been dropped silently discards the datagram, like UDP does.
pub struct MemorySocket {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    poll_interval: Duration,
}

impl MemorySocket {
    /// Create two connected endpoints
    pub fn pair() -> (MemorySocket, MemorySocket) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();
        (
            MemorySocket {
                tx: a_tx,
                rx: a_rx,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
            MemorySocket {
                tx: b_tx,
                rx: b_rx,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
        )
    }

    /// Set how long `recv` blocks before reporting `WouldBlock`
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Datagrams waiting to be received
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl DatagramSocket for MemorySocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        // a vanished peer is indistinguishable from a lossy link
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv_timeout(self.poll_interval) {
            Ok(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => Err(io::Error::from(ErrorKind::WouldBlock)),
            Err(RecvTimeoutError::Disconnected) => {
                // a vanished peer just never sends again
                thread::sleep(self.poll_interval);
                Err(io::Error::from(ErrorKind::WouldBlock))
            }
        }
    }
}
