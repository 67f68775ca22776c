//! Packet-oriented UDP endpoint.
//!
//! [`Transport`] is a thin wrapper around `std::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use thiserror::Error;

use crate::packet::{Packet, PacketError, PACKET_SIZE};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The received datagram could not be decoded as a valid packet.
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
}

impl TransportError {
    /// `true` when a receive merely ran out the configured read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Io(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
        )
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A packet-oriented UDP endpoint.
///
/// All methods take `&self`; the OS serialises concurrent sends and receives
/// on the same socket, so a [`Transport`] can be shared across threads (the
/// client's sender and receiver threads share one).
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    /// Address this endpoint is bound to (resolved after the OS assigns an
    /// ephemeral port when binding port 0).
    pub local_addr: SocketAddr,
}

impl Transport {
    /// Bind to 0.0.0.0 on the given port.  Port 0 lets the OS choose.
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        Self::bind_addr(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Bind to a specific local address.
    pub fn bind_addr(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }

    /// Bind to an ephemeral port with broadcast sends enabled.
    ///
    /// Required for the discovery phase: without `SO_BROADCAST` a send to
    /// 255.255.255.255 fails with a permission error.
    pub fn bind_broadcast() -> Result<Self, TransportError> {
        let transport = Self::bind(0)?;
        transport.socket.set_broadcast(true)?;
        Ok(transport)
    }

    /// Bound a receive to `timeout`; `None` restores blocking receives.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    pub fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), TransportError> {
        self.socket.send_to(&packet.encode(), dest)?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  Datagrams that fail to decode
    /// are returned as `Err(TransportError::Packet)` — the caller decides
    /// whether to drop and keep listening.
    pub fn recv_from(&self) -> Result<(Packet, SocketAddr), TransportError> {
        // One spare byte so an oversized datagram shows up as a size
        // mismatch instead of silently truncating to PACKET_SIZE.
        let mut buf = [0u8; PACKET_SIZE + 1];
        let (n, addr) = self.socket.recv_from(&mut buf)?;
        let packet = Packet::decode(&buf[..n])?;
        Ok((packet, addr))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
