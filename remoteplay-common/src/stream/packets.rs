//! Wire framing of the media transport: the SCTP-like control packets and
//! the feedback packet header.

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::RemotePlayError;

pub const A_RWND: u32 = 0x0001_9000;
pub const OUTBOUND_STREAMS: u16 = 0x64;
pub const INBOUND_STREAMS: u16 = 0x64;

pub const CHANNEL_HEARTBEAT: u16 = 1;
pub const CHANNEL_BIG: u16 = 2;
pub const CHANNEL_STREAM_INFO: u16 = 9;

/// `u8 type | u32 tag | u32 gmac | u32 key_pos`
pub const PACKET_HEADER_LEN: usize = 13;
pub const CHUNK_HEADER_LEN: usize = 4;
/// `u8 type | u16 sequence | u32 gmac | u32 key_pos`
pub const FEEDBACK_HEADER_LEN: usize = 11;

/// Packet class, carried in the low nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Control = 0,
    Video = 2,
    Audio = 3,
    FeedbackState = 4,
    FeedbackEvent = 5,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_u8(byte & 0x0f)
    }

    pub fn is_av(&self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ChunkType {
    Data = 0,
    Init = 1,
    InitAck = 2,
    DataAck = 3,
    Cookie = 10,
    CookieAck = 11,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        const BEGIN = 0b001;
        const END = 0b100;
    }
}

impl ChunkFlags {
    /// Flags of an unfragmented DATA chunk.
    pub fn single() -> Self {
        Self::BEGIN | Self::END
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: ChunkType,
    pub flags: ChunkFlags,
    pub payload: Vec<u8>,
}

/// A control packet: transport header plus one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub tag: u32,
    pub gmac: u32,
    pub key_pos: u32,
    pub chunk: Chunk,
}

impl ControlPacket {
    pub fn new(tag: u32, chunk: Chunk) -> Self {
        Self {
            tag,
            gmac: 0,
            key_pos: 0,
            chunk,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(PACKET_HEADER_LEN + CHUNK_HEADER_LEN + self.chunk.payload.len());
        buf.push(PacketType::Control as u8);
        buf.extend_from_slice(&self.tag.to_be_bytes());
        buf.extend_from_slice(&self.gmac.to_be_bytes());
        buf.extend_from_slice(&self.key_pos.to_be_bytes());
        buf.push(self.chunk.kind as u8);
        buf.push(self.chunk.flags.bits());
        let length = (self.chunk.payload.len() + CHUNK_HEADER_LEN) as u16;
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.chunk.payload);
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, RemotePlayError> {
        if data.len() < PACKET_HEADER_LEN + CHUNK_HEADER_LEN {
            return Err(RemotePlayError::Protocol(format!(
                "control packet too short: {} bytes",
                data.len()
            )));
        }
        if PacketType::from_byte(data[0]) != Some(PacketType::Control) {
            return Err(RemotePlayError::Protocol(format!(
                "not a control packet: type {:#04x}",
                data[0]
            )));
        }
        let tag = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let gmac = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let key_pos = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);

        let kind = ChunkType::from_u8(data[PACKET_HEADER_LEN]).ok_or_else(|| {
            RemotePlayError::Protocol(format!("unknown chunk kind {}", data[PACKET_HEADER_LEN]))
        })?;
        let flags = ChunkFlags::from_bits_truncate(data[PACKET_HEADER_LEN + 1]);
        let length = u16::from_be_bytes([data[PACKET_HEADER_LEN + 2], data[PACKET_HEADER_LEN + 3]])
            as usize;
        if length < CHUNK_HEADER_LEN || PACKET_HEADER_LEN + length > data.len() {
            return Err(RemotePlayError::Protocol(format!(
                "chunk length {length} out of bounds"
            )));
        }
        let payload =
            data[PACKET_HEADER_LEN + CHUNK_HEADER_LEN..PACKET_HEADER_LEN + length].to_vec();

        Ok(Self {
            tag,
            gmac,
            key_pos,
            chunk: Chunk {
                kind,
                flags,
                payload,
            },
        })
    }

    /// Zero the gmac and key_pos header fields in an encoded packet, as
    /// required while computing or verifying its GMAC.
    pub fn zero_auth_fields(encoded: &mut [u8]) {
        if encoded.len() >= PACKET_HEADER_LEN {
            encoded[5..PACKET_HEADER_LEN].fill(0);
        }
    }
}

/// INIT chunk body sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitPayload {
    pub tag: u32,
    pub a_rwnd: u32,
    pub outbound: u16,
    pub inbound: u16,
    pub tsn: u32,
}

impl InitPayload {
    pub fn new(tag: u32, tsn: u32) -> Self {
        Self {
            tag,
            a_rwnd: A_RWND,
            outbound: OUTBOUND_STREAMS,
            inbound: INBOUND_STREAMS,
            tsn,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.tag.to_be_bytes());
        buf.extend_from_slice(&self.a_rwnd.to_be_bytes());
        buf.extend_from_slice(&self.outbound.to_be_bytes());
        buf.extend_from_slice(&self.inbound.to_be_bytes());
        buf.extend_from_slice(&self.tsn.to_be_bytes());
        buf
    }
}

/// INIT_ACK chunk body: the server's tag and cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAckPayload {
    pub tag: u32,
    pub a_rwnd: u32,
    pub outbound: u16,
    pub inbound: u16,
    pub tsn: u32,
    pub cookie: Vec<u8>,
}

impl InitAckPayload {
    pub fn parse(data: &[u8]) -> Result<Self, RemotePlayError> {
        if data.len() < 16 {
            return Err(RemotePlayError::Protocol(format!(
                "INIT_ACK body too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            tag: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            a_rwnd: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            outbound: u16::from_be_bytes([data[8], data[9]]),
            inbound: u16::from_be_bytes([data[10], data[11]]),
            tsn: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            cookie: data[16..].to_vec(),
        })
    }
}

/// DATA chunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub tsn: u32,
    pub channel: u16,
    pub sequence: u16,
    pub proto_id: u32,
    pub data: Vec<u8>,
}

impl DataPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.data.len());
        buf.extend_from_slice(&self.tsn.to_be_bytes());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.proto_id.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, RemotePlayError> {
        if data.len() < 12 {
            return Err(RemotePlayError::Protocol(format!(
                "DATA body too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            tsn: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            channel: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            proto_id: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data: data[12..].to_vec(),
        })
    }
}

/// DATA_ACK chunk body. Gap-ack and duplicate reporting are always empty;
/// the transport is stop-and-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAckPayload {
    pub tsn: u32,
    pub a_rwnd: u32,
    pub gap_ack_blocks: u16,
    pub dup_tsns: u16,
}

impl DataAckPayload {
    pub fn new(tsn: u32) -> Self {
        Self {
            tsn,
            a_rwnd: A_RWND,
            gap_ack_blocks: 0,
            dup_tsns: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.tsn.to_be_bytes());
        buf.extend_from_slice(&self.a_rwnd.to_be_bytes());
        buf.extend_from_slice(&self.gap_ack_blocks.to_be_bytes());
        buf.extend_from_slice(&self.dup_tsns.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, RemotePlayError> {
        if data.len() < 12 {
            return Err(RemotePlayError::Protocol(format!(
                "DATA_ACK body too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            tsn: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            a_rwnd: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            gap_ack_blocks: u16::from_be_bytes([data[8], data[9]]),
            dup_tsns: u16::from_be_bytes([data[10], data[11]]),
        })
    }
}

/// Header of an outbound feedback packet. The payload follows encrypted.
pub fn feedback_packet(
    kind: PacketType,
    sequence: u16,
    gmac: u32,
    key_pos: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FEEDBACK_HEADER_LEN + payload.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&gmac.to_be_bytes());
    buf.extend_from_slice(&key_pos.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Zero a feedback packet's gmac and key_pos fields for GMAC computation.
pub fn zero_feedback_auth_fields(encoded: &mut [u8]) {
    if encoded.len() >= FEEDBACK_HEADER_LEN {
        encoded[3..FEEDBACK_HEADER_LEN].fill(0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_control_packet_round_trip() {
        let packet = ControlPacket {
            tag: 0xdead_beef,
            gmac: 0x0102_0304,
            key_pos: 77,
            chunk: Chunk {
                kind: ChunkType::Data,
                flags: ChunkFlags::single(),
                payload: b"hello".to_vec(),
            },
        };
        let encoded = packet.to_bytes();
        assert_eq!(encoded[0], 0);
        assert_eq!(ControlPacket::parse(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_zero_auth_fields() {
        let packet = ControlPacket {
            tag: 1,
            gmac: 0xffff_ffff,
            key_pos: 0xffff_ffff,
            chunk: Chunk {
                kind: ChunkType::Data,
                flags: ChunkFlags::single(),
                payload: vec![],
            },
        };
        let mut encoded = packet.to_bytes();
        ControlPacket::zero_auth_fields(&mut encoded);
        let zeroed = ControlPacket::parse(&encoded).unwrap();
        assert_eq!(zeroed.gmac, 0);
        assert_eq!(zeroed.key_pos, 0);
        assert_eq!(zeroed.tag, 1);
    }

    #[test]
    fn test_data_payload_round_trip() {
        let payload = DataPayload {
            tsn: 42,
            channel: CHANNEL_BIG,
            sequence: 3,
            proto_id: 0,
            data: vec![1, 2, 3, 4],
        };
        assert_eq!(DataPayload::parse(&payload.to_bytes()).unwrap(), payload);
    }

    #[test]
    fn test_init_ack_parse() {
        let mut body = InitPayload::new(0x1111_2222, 9).to_bytes();
        body.extend_from_slice(b"cookie-bytes");
        let parsed = InitAckPayload::parse(&body).unwrap();
        assert_eq!(parsed.tag, 0x1111_2222);
        assert_eq!(parsed.tsn, 9);
        assert_eq!(parsed.cookie, b"cookie-bytes");
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(ControlPacket::parse(&[0u8; 10]).is_err());
        assert!(DataPayload::parse(&[0u8; 4]).is_err());
        assert!(InitAckPayload::parse(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_packet_type_nibble() {
        assert_eq!(PacketType::from_byte(0x12), Some(PacketType::Video));
        assert_eq!(PacketType::from_byte(0x03), Some(PacketType::Audio));
        assert_eq!(PacketType::from_byte(0x0f), None);
        assert!(PacketType::Video.is_av());
        assert!(!PacketType::Control.is_av());
    }
}
