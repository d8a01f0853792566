//! Datagram encoding/decoding
//!
//! Every datagram on the wire is a [`Packet`] with a compact big-endian
//! header:
//!
//! ```text
//! +--------+--------+--------------+--------------------+----------+
//! | kind   | flags  | sequence (4) | ack (4, iff flag)  | payload  |
//! +--------+--------+--------------+--------------------+----------+
//! ```
//!
//! Flag bit 0 marks the acknowledgement field as present; the remaining
//! bits are reserved and must be zero. Only DATA datagrams carry a payload.
//! No I/O happens here, this is pure data transformation.

use std::io;

use crate::sequence::SequenceNumber;

/// Fixed header size (kind, flags, sequence).
pub const HEADER_SIZE: usize = 6;

/// Size of the optional acknowledgement field.
pub const ACK_FIELD_SIZE: usize = 4;

/// Maximum datagram size (below typical Ethernet/IPv4 UDP MTU of 1472,
/// leaving headroom against fragmentation).
pub const MAX_PACKET_SIZE: usize = 1400;

/// Maximum payload size per DATA datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE - ACK_FIELD_SIZE;

/// Flag bit 0: the acknowledgement field is present.
const FLAG_ACK: u8 = 0b0000_0001;

/// Datagram kind values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Initiates or answers a connection; carries the sender's initial
    /// sequence.
    Handshake = 0,
    /// Sequence-bearing, payload-free; completes the handshake and carries
    /// delivery confirmations.
    Keepalive = 1,
    /// Carries an application payload.
    Data = 2,
    /// Pure acknowledgement; consumes no sequence.
    Ack = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Keepalive),
            2 => Ok(Self::Data),
            3 => Ok(Self::Ack),
            _ => Err(invalid(format!("invalid datagram kind: {}", value))),
        }
    }
}

/// A decoded datagram.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,

    /// The sender's sequence for this datagram.
    pub sequence: SequenceNumber,

    /// Cumulative acknowledgement, piggy-backable on any kind.
    pub ack: Option<SequenceNumber>,

    /// Application payload; non-empty only for DATA.
    pub payload: Vec<u8>,
}

impl Packet {
    fn new(kind: PacketKind, sequence: SequenceNumber, ack: Option<SequenceNumber>) -> Self {
        Self {
            kind,
            sequence,
            ack,
            payload: Vec::new(),
        }
    }

    pub fn handshake(sequence: SequenceNumber, ack: Option<SequenceNumber>) -> Self {
        Self::new(PacketKind::Handshake, sequence, ack)
    }

    pub fn keepalive(sequence: SequenceNumber, ack: Option<SequenceNumber>) -> Self {
        Self::new(PacketKind::Keepalive, sequence, ack)
    }

    pub fn data(sequence: SequenceNumber, ack: Option<SequenceNumber>, payload: Vec<u8>) -> Self {
        let mut packet = Self::new(PacketKind::Data, sequence, ack);
        packet.payload = payload;
        packet
    }

    pub fn ack(sequence: SequenceNumber, acked: SequenceNumber) -> Self {
        Self::new(PacketKind::Ack, sequence, Some(acked))
    }

    /// Encode the datagram to bytes, network byte order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + ACK_FIELD_SIZE + self.payload.len());

        buf.push(self.kind as u8);
        buf.push(if self.ack.is_some() { FLAG_ACK } else { 0 });
        buf.extend_from_slice(&self.sequence.value().to_be_bytes());

        if let Some(ack) = self.ack {
            buf.extend_from_slice(&ack.value().to_be_bytes());
        }

        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a datagram from bytes.
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(invalid(format!("datagram too short: {} bytes", data.len())));
        }

        let kind = PacketKind::try_from(data[0])?;
        let flags = data[1];
        if flags & !FLAG_ACK != 0 {
            return Err(invalid(format!("reserved flag bits set: {:#04x}", flags)));
        }

        let sequence = SequenceNumber::new(u32::from_be_bytes([data[2], data[3], data[4], data[5]]));

        let mut offset = HEADER_SIZE;
        let ack = if flags & FLAG_ACK != 0 {
            if data.len() < offset + ACK_FIELD_SIZE {
                return Err(invalid("acknowledgement field truncated"));
            }
            let value = u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]);
            offset += ACK_FIELD_SIZE;
            Some(SequenceNumber::new(value))
        } else {
            None
        };

        let payload = data[offset..].to_vec();
        match kind {
            PacketKind::Data => {
                if payload.is_empty() {
                    return Err(invalid("data datagram without payload"));
                }
                if payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(invalid(format!(
                        "payload exceeds {} bytes: {}",
                        MAX_PAYLOAD_SIZE,
                        payload.len()
                    )));
                }
            }
            _ => {
                if !payload.is_empty() {
                    return Err(invalid(format!("unexpected payload on {:?} datagram", kind)));
                }
            }
        }

        Ok(Self {
            kind,
            sequence,
            ack,
            payload,
        })
    }

    pub fn is_handshake(&self) -> bool {
        self.kind == PacketKind::Handshake
    }

    pub fn is_keepalive(&self) -> bool {
        self.kind == PacketKind::Keepalive
    }

    pub fn is_data(&self) -> bool {
        self.kind == PacketKind::Data
    }

    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Ack
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip_without_ack() {
        let packet = Packet::handshake(SequenceNumber::new(12345), None);
        let decoded = Packet::decode(&packet.encode()).unwrap();

        assert_eq!(decoded.kind, PacketKind::Handshake);
        assert_eq!(decoded.sequence, SequenceNumber::new(12345));
        assert_eq!(decoded.ack, None);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_data_roundtrip_with_ack() {
        let payload = b"hello".to_vec();
        let packet = Packet::data(
            SequenceNumber::new(7),
            Some(SequenceNumber::new(99)),
            payload.clone(),
        );
        let decoded = Packet::decode(&packet.encode()).unwrap();

        assert_eq!(decoded.kind, PacketKind::Data);
        assert_eq!(decoded.sequence, SequenceNumber::new(7));
        assert_eq!(decoded.ack, Some(SequenceNumber::new(99)));
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let packet = Packet::keepalive(SequenceNumber::new(1), Some(SequenceNumber::new(2)));
        let decoded = Packet::decode(&packet.encode()).unwrap();

        assert!(decoded.is_keepalive());
        assert_eq!(decoded.ack, Some(SequenceNumber::new(2)));
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(Packet::decode(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut encoded = Packet::keepalive(SequenceNumber::new(0), None).encode();
        encoded[0] = 9;
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut encoded = Packet::keepalive(SequenceNumber::new(0), None).encode();
        encoded[1] = 0b1000_0000;
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn test_truncated_ack_rejected() {
        let mut encoded = Packet::keepalive(SequenceNumber::new(0), Some(SequenceNumber::new(1))).encode();
        encoded.truncate(HEADER_SIZE + 2);
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn test_payload_on_keepalive_rejected() {
        let mut encoded = Packet::keepalive(SequenceNumber::new(0), None).encode();
        encoded.push(0xAB);
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn test_empty_data_rejected() {
        // A DATA header with no payload bytes is malformed.
        let encoded = Packet::new(PacketKind::Data, SequenceNumber::new(3), None).encode();
        assert!(Packet::decode(&encoded).is_err());
    }
}
