//! Reliable datagram endpoint: the INIT/COOKIE handshake, DATA with
//! stop-and-wait retransmission, and GMAC sealing once media ciphers are
//! live. The state machine is free of I/O; the stream driver moves bytes.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use log::{debug, info, warn};
use openssl::rand::rand_bytes;
use tokio::time::Instant;

use crate::{
    RemotePlayError,
    crypto::StreamCipher,
    stream::packets::{
        Chunk, ChunkFlags, ChunkType, ControlPacket, DataAckPayload, DataPayload, InitAckPayload,
        InitPayload, PacketType, feedback_packet, zero_feedback_auth_fields,
    },
};

pub const DEFAULT_RTT: Duration = Duration::from_secs(1);
pub const DEFAULT_MTU: u32 = 1454;

/// Bound on unacknowledged outbound DATA.
const OUTBOUND_BUFFER: usize = 64;
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    InitSent,
    CookieSent,
    Established,
}

/// Something the endpoint wants the driver to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportEvent {
    HandshakeComplete,
    Data { channel: u16, payload: Vec<u8> },
}

struct PendingData {
    tsn: u32,
    encoded: Vec<u8>,
    sent_at: Instant,
    retries: u32,
}

/// Per-direction transport state: verification tags, TSNs, per-channel
/// sequence numbers, the retransmit buffer and the media cipher pair.
pub(crate) struct TransportEndpoint {
    state: HandshakeState,
    tag_local: u32,
    tag_remote: u32,
    tsn: u32,
    stream_seq: HashMap<u16, u16>,
    outbound: VecDeque<PendingData>,
    cipher: Option<StreamCipher>,
    rto: Duration,
}

impl TransportEndpoint {
    pub fn new() -> Result<Self, RemotePlayError> {
        let mut tag = [0u8; 4];
        rand_bytes(&mut tag)?;
        Ok(Self::with_tag(u32::from_be_bytes(tag).max(1)))
    }

    pub fn with_tag(tag_local: u32) -> Self {
        Self {
            state: HandshakeState::InitSent,
            tag_local,
            tag_remote: 0,
            tsn: 1,
            stream_seq: HashMap::new(),
            outbound: VecDeque::new(),
            cipher: None,
            rto: DEFAULT_RTT,
        }
    }

    pub fn tag_local(&self) -> u32 {
        self.tag_local
    }

    pub fn tag_remote(&self) -> u32 {
        self.tag_remote
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn set_rto(&mut self, rto: Duration) {
        self.rto = rto;
    }

    pub fn install_cipher(&mut self, cipher: StreamCipher) {
        self.cipher = Some(cipher);
    }

    pub fn cipher_mut(&mut self) -> Option<&mut StreamCipher> {
        self.cipher.as_mut()
    }

    /// First packet of the handshake.
    pub fn start_handshake(&mut self) -> Vec<u8> {
        let payload = InitPayload::new(self.tag_local, self.tsn).to_bytes();
        ControlPacket::new(
            0,
            Chunk {
                kind: ChunkType::Init,
                flags: ChunkFlags::empty(),
                payload,
            },
        )
        .to_bytes()
    }

    /// Feed one received datagram. Returns events for the driver plus any
    /// datagrams to transmit in response.
    pub fn handle_packet(
        &mut self,
        data: &[u8],
    ) -> Result<(Vec<TransportEvent>, Vec<Vec<u8>>), RemotePlayError> {
        let packet = ControlPacket::parse(data)?;

        if let Some(cipher) = &mut self.cipher {
            let gmac = packet.gmac.to_be_bytes();
            let mut zeroed = data.to_vec();
            ControlPacket::zero_auth_fields(&mut zeroed);
            if !cipher.verify_gmac(&zeroed, u64::from(packet.key_pos), &gmac)? {
                return Err(RemotePlayError::Protocol(format!(
                    "GMAC verification failed for chunk {:?}",
                    packet.chunk.kind
                )));
            }
        }

        let mut events = Vec::new();
        let mut out = Vec::new();
        match packet.chunk.kind {
            ChunkType::InitAck => {
                let ack = InitAckPayload::parse(&packet.chunk.payload)?;
                self.tag_remote = ack.tag;
                debug!(
                    "INIT_ACK: remote tag {:#010x}, cookie {} bytes",
                    ack.tag,
                    ack.cookie.len()
                );
                self.state = HandshakeState::CookieSent;
                out.push(self.cookie_packet(ack.cookie));
            }
            ChunkType::CookieAck => {
                if self.state == HandshakeState::CookieSent {
                    info!("transport handshake complete");
                    self.state = HandshakeState::Established;
                    events.push(TransportEvent::HandshakeComplete);
                }
            }
            ChunkType::Data => {
                let data = DataPayload::parse(&packet.chunk.payload)?;
                out.push(self.data_ack_packet(data.tsn)?);
                let mut payload = data.data;
                if let Some(cipher) = &mut self.cipher {
                    payload = cipher.decrypt(&payload, u64::from(packet.key_pos))?;
                }
                events.push(TransportEvent::Data {
                    channel: data.channel,
                    payload,
                });
            }
            ChunkType::DataAck => {
                let ack = DataAckPayload::parse(&packet.chunk.payload)?;
                debug!(
                    "DATA_ACK: tsn {}, rwnd {:#x}, gaps {}, dups {}",
                    ack.tsn, ack.a_rwnd, ack.gap_ack_blocks, ack.dup_tsns
                );
                self.outbound.retain(|pending| pending.tsn > ack.tsn);
            }
            ChunkType::Init | ChunkType::Cookie => {
                return Err(RemotePlayError::Protocol(format!(
                    "unexpected server chunk {:?}",
                    packet.chunk.kind
                )));
            }
        }
        Ok((events, out))
    }

    fn cookie_packet(&mut self, cookie: Vec<u8>) -> Vec<u8> {
        ControlPacket::new(
            self.tag_remote,
            Chunk {
                kind: ChunkType::Cookie,
                flags: ChunkFlags::empty(),
                payload: cookie,
            },
        )
        .to_bytes()
    }

    fn data_ack_packet(&mut self, tsn: u32) -> Result<Vec<u8>, RemotePlayError> {
        let chunk = Chunk {
            kind: ChunkType::DataAck,
            flags: ChunkFlags::empty(),
            payload: DataAckPayload::new(tsn).to_bytes(),
        };
        self.seal_control(chunk, 0)
    }

    /// Queue a reliable DATA send on a channel. The returned datagram is
    /// also buffered until the matching ack; `advance` advances the key
    /// position by the plaintext length (protobuf sends only).
    pub fn send_data(
        &mut self,
        channel: u16,
        payload: Vec<u8>,
        advance: bool,
    ) -> Result<Vec<u8>, RemotePlayError> {
        if self.outbound.len() >= OUTBOUND_BUFFER {
            return Err(RemotePlayError::Backpressure);
        }

        if self.is_established() && self.cipher.is_some() {
            self.tsn = self.tsn.wrapping_add(1);
        }
        let seq = self.stream_seq.entry(channel).or_insert(0);
        let sequence = *seq;
        *seq = seq.wrapping_add(1);

        let plaintext_len = payload.len();
        let tsn = self.tsn;
        let mut body = DataPayload {
            tsn,
            channel,
            sequence,
            proto_id: 0,
            data: payload,
        };
        if let Some(cipher) = &mut self.cipher {
            body.data = cipher.encrypt(&body.data)?;
        }
        let chunk = Chunk {
            kind: ChunkType::Data,
            flags: ChunkFlags::single(),
            payload: body.to_bytes(),
        };
        let encoded = self.seal_control(chunk, if advance { plaintext_len } else { 0 })?;

        self.outbound.push_back(PendingData {
            tsn,
            encoded: encoded.clone(),
            sent_at: Instant::now(),
            retries: 0,
        });
        Ok(encoded)
    }

    /// Encode a control packet, applying GMAC and key position once the
    /// media ciphers are live.
    fn seal_control(&mut self, chunk: Chunk, advance_by: usize) -> Result<Vec<u8>, RemotePlayError> {
        let mut packet = ControlPacket::new(self.tag_remote, chunk);
        let Some(cipher) = &mut self.cipher else {
            return Ok(packet.to_bytes());
        };

        packet.key_pos = cipher.key_pos() as u32;
        let mut encoded = packet.to_bytes();
        let mut zeroed = encoded.clone();
        ControlPacket::zero_auth_fields(&mut zeroed);
        let gmac = cipher.gmac(&zeroed)?;
        encoded[5..9].copy_from_slice(&gmac);
        if advance_by > 0 {
            cipher.advance_key_pos(advance_by);
        }
        Ok(encoded)
    }

    /// Seal an unreliable feedback packet. Not buffered, not acked.
    pub fn seal_feedback(
        &mut self,
        kind: PacketType,
        sequence: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, RemotePlayError> {
        let cipher = self.cipher.as_mut().ok_or_else(|| {
            RemotePlayError::Protocol("feedback before media ciphers are live".into())
        })?;
        let key_pos = cipher.key_pos() as u32;
        let encrypted = cipher.encrypt(payload)?;
        let mut encoded = feedback_packet(kind, sequence, 0, key_pos, &encrypted);
        let mut zeroed = encoded.clone();
        zero_feedback_auth_fields(&mut zeroed);
        let gmac = cipher.gmac(&zeroed)?;
        encoded[3..7].copy_from_slice(&gmac);
        cipher.advance_key_pos(payload.len());
        Ok(encoded)
    }

    /// Sealed datagrams whose ack timer expired. Packets are resent with
    /// their original TSN and key position.
    pub fn retransmit_due(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, RemotePlayError> {
        let mut due = Vec::new();
        let mut expired = false;
        for pending in &mut self.outbound {
            if now.duration_since(pending.sent_at) < self.rto {
                continue;
            }
            if pending.retries >= MAX_RETRIES {
                expired = true;
                continue;
            }
            pending.retries += 1;
            pending.sent_at = now;
            warn!(
                "retransmitting tsn {} (attempt {})",
                pending.tsn, pending.retries
            );
            due.push(pending.encoded.clone());
        }
        if expired {
            return Err(RemotePlayError::Timeout("data acknowledgement"));
        }
        Ok(due)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}
