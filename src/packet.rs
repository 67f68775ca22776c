//! Wire-format definitions for protocol datagrams.
//!
//! Every datagram exchanged between client and server is a [`Packet`]
//! occupying exactly [`PACKET_SIZE`] bytes.  This module is responsible for:
//! - Defining the on-wire binary layout (type tag, request id, payload).
//! - Serialising a [`Packet`] into a fixed-size buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed input.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Layout
//!
//! ```text
//!  offset  size  field
//!  0       1     type         (see PacketType)
//!  1       3     padding      (zero on encode, ignored on decode)
//!  4       4     request_id   u32, little-endian
//!  8       8     payload      union, selected by type:
//!                  TRANSACTION_REQUEST  dest_ip u32 (network order), value u32 LE
//!                  any *_ACK            new_balance u32 LE, rest zero
//!                  CLIENT_DISCOVERY     unused
//! ```

use std::net::Ipv4Addr;

use thiserror::Error;

/// Exact size of every datagram on the wire.  Anything else is dropped.
pub const PACKET_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// PacketType
// ---------------------------------------------------------------------------

/// Datagram type tag.
///
/// Discriminants are distinct bits so a log line can show them unambiguously;
/// exactly one is set per packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Client looks for a server (broadcast or direct).  C → S.
    ClientDiscovery = 1,
    /// Server acknowledges discovery and reports the account state.  S → C.
    ClientDiscoveryAck = 2,
    /// Transfer request.  C → S.
    TransactionRequest = 4,
    /// Transfer accepted (or replayed for a duplicate).  S → C.
    TransactionAck = 8,
    /// Transfer rejected: the sender's balance does not cover it.  S → C.
    InsufficientBalanceAck = 16,
    /// Transfer rejected: the destination is not a registered client.  S → C.
    InvalidClientAck = 32,
    /// Request rejected: the sender is not a registered client.  S → C.
    ErrorAck = 64,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::ClientDiscovery,
            2 => PacketType::ClientDiscoveryAck,
            4 => PacketType::TransactionRequest,
            8 => PacketType::TransactionAck,
            16 => PacketType::InsufficientBalanceAck,
            32 => PacketType::InvalidClientAck,
            64 => PacketType::ErrorAck,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// `true` for the server-to-client reply types.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketType::ClientDiscoveryAck
                | PacketType::TransactionAck
                | PacketType::InsufficientBalanceAck
                | PacketType::InvalidClientAck
                | PacketType::ErrorAck
        )
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The 8-byte payload union, interpreted according to the packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// `TRANSACTION_REQUEST`: where the money goes and how much.
    Request { dest: Ipv4Addr, value: u32 },
    /// Any `*_ACK`: the sender's balance after processing.
    Reply { new_balance: u32 },
    /// `CLIENT_DISCOVERY` carries no payload.
    Empty,
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A complete protocol datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub ptype: PacketType,
    pub request_id: u32,
    pub payload: Payload,
}

impl Packet {
    /// Discovery probe.  Request id 0 is reserved for discovery.
    pub fn discovery() -> Self {
        Self {
            ptype: PacketType::ClientDiscovery,
            request_id: 0,
            payload: Payload::Empty,
        }
    }

    /// Transfer request: move `value` to the account registered for `dest`.
    pub fn transfer(request_id: u32, dest: Ipv4Addr, value: u32) -> Self {
        Self {
            ptype: PacketType::TransactionRequest,
            request_id,
            payload: Payload::Request { dest, value },
        }
    }

    pub fn discovery_ack(request_id: u32, new_balance: u32) -> Self {
        Self::ack(PacketType::ClientDiscoveryAck, request_id, new_balance)
    }

    pub fn transaction_ack(request_id: u32, new_balance: u32) -> Self {
        Self::ack(PacketType::TransactionAck, request_id, new_balance)
    }

    pub fn insufficient_balance_ack(request_id: u32, new_balance: u32) -> Self {
        Self::ack(PacketType::InsufficientBalanceAck, request_id, new_balance)
    }

    pub fn invalid_client_ack(request_id: u32, new_balance: u32) -> Self {
        Self::ack(PacketType::InvalidClientAck, request_id, new_balance)
    }

    pub fn error_ack(request_id: u32, new_balance: u32) -> Self {
        Self::ack(PacketType::ErrorAck, request_id, new_balance)
    }

    fn ack(ptype: PacketType, request_id: u32, new_balance: u32) -> Self {
        Self {
            ptype,
            request_id,
            payload: Payload::Reply { new_balance },
        }
    }

    /// The reported balance, for reply packets.
    pub fn new_balance(&self) -> Option<u32> {
        match self.payload {
            Payload::Reply { new_balance } => Some(new_balance),
            _ => None,
        }
    }

    /// Serialise into the fixed wire layout.
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[0] = self.ptype.to_u8();
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        match self.payload {
            Payload::Request { dest, value } => {
                // Destination IP travels in network byte order, like the
                // address it was parsed from.
                buf[8..12].copy_from_slice(&u32::from(dest).to_be_bytes());
                buf[12..16].copy_from_slice(&value.to_le_bytes());
            }
            Payload::Reply { new_balance } => {
                buf[8..12].copy_from_slice(&new_balance.to_le_bytes());
            }
            Payload::Empty => {}
        }
        buf
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// The buffer must be exactly [`PACKET_SIZE`] bytes; peers drop anything
    /// else without replying.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() != PACKET_SIZE {
            return Err(PacketError::WrongSize(buf.len()));
        }
        let ptype = PacketType::from_u8(buf[0]).ok_or(PacketError::UnknownType(buf[0]))?;
        let request_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let payload = match ptype {
            PacketType::ClientDiscovery => Payload::Empty,
            PacketType::TransactionRequest => Payload::Request {
                dest: Ipv4Addr::from(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])),
                value: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            },
            _ => Payload::Reply {
                new_balance: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            },
        };
        Ok(Self {
            ptype,
            request_id,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram length differs from the fixed packet size.
    #[error("datagram of {0} bytes does not match the fixed packet size")]
    WrongSize(usize),
    /// The type byte is not a known packet type.
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_size_is_fixed() {
        let pkt = Packet::transfer(7, Ipv4Addr::new(10, 1, 1, 3), 30);
        assert_eq!(pkt.encode().len(), PACKET_SIZE);
        assert_eq!(Packet::discovery().encode().len(), PACKET_SIZE);
    }

    #[test]
    fn transfer_roundtrip() {
        let pkt = Packet::transfer(42, Ipv4Addr::new(192, 168, 1, 100), 1234);
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn discovery_roundtrip() {
        let pkt = Packet::discovery();
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.request_id, 0);
        assert_eq!(decoded.payload, Payload::Empty);
    }

    #[test]
    fn ack_roundtrips() {
        for pkt in [
            Packet::discovery_ack(0, 100),
            Packet::transaction_ack(3, 70),
            Packet::insufficient_balance_ack(1, 100),
            Packet::invalid_client_ack(1, 100),
            Packet::error_ack(9, 0),
        ] {
            let decoded = Packet::decode(&pkt.encode()).unwrap();
            assert_eq!(decoded, pkt);
            assert!(decoded.ptype.is_reply());
        }
    }

    #[test]
    fn dest_ip_is_network_byte_order() {
        let pkt = Packet::transfer(1, Ipv4Addr::new(10, 1, 1, 20), 0);
        let buf = pkt.encode();
        assert_eq!(&buf[8..12], &[10, 1, 1, 20]);
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::WrongSize(0)));
        let buf = [0u8; PACKET_SIZE - 1];
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketError::WrongSize(PACKET_SIZE - 1))
        );
    }

    #[test]
    fn long_buffer_rejected() {
        let buf = [0u8; PACKET_SIZE + 4];
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketError::WrongSize(PACKET_SIZE + 4))
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = Packet::discovery().encode();
        buf[0] = 3; // not a valid discriminant
        assert_eq!(Packet::decode(&buf), Err(PacketError::UnknownType(3)));
    }

    #[test]
    fn padding_bytes_ignored() {
        let pkt = Packet::transaction_ack(5, 95);
        let mut buf = pkt.encode();
        buf[1] = 0xAA;
        buf[2] = 0xBB;
        buf[3] = 0xCC;
        assert_eq!(Packet::decode(&buf).unwrap(), pkt);
    }

    #[test]
    fn request_and_reply_accessors() {
        let req = Packet::transfer(1, Ipv4Addr::new(10, 0, 0, 2), 50);
        assert_eq!(req.new_balance(), None);
        assert!(!req.ptype.is_reply());

        let ack = Packet::transaction_ack(1, 50);
        assert_eq!(ack.new_balance(), Some(50));
    }
}
