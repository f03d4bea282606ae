//! Audio/video packet parsing and frame reassembly. One frame is rebuilt
//! at a time per media kind from its source units; FEC units are received
//! but not used for repair, so a frame missing a source unit when the next
//! frame starts is dropped and reported upstream.

use std::{fs::File, io::Write, path::Path, time::Instant};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::{RemotePlayError, crypto::StreamCipher, stream::packets::PacketType};

/// Fixed AV header bytes following the type byte.
const AV_HEADER_LEN: usize = 18;

/// One parsed media packet, payload still encrypted.
#[derive(Debug, Clone)]
pub struct AvPacket {
    pub kind: PacketType,
    pub has_nalu: bool,
    pub packet_index: u16,
    pub frame_index: u16,
    pub codec: u8,
    pub key_pos: u32,
    pub unit_index: u16,
    pub total_units: u16,
    pub source_units: u16,
    pub fec_units: u16,
    pub payload: Vec<u8>,
}

impl AvPacket {
    pub fn parse(data: &[u8]) -> Result<Self, RemotePlayError> {
        if data.len() < AV_HEADER_LEN {
            return Err(RemotePlayError::Protocol(format!(
                "av packet too short: {} bytes",
                data.len()
            )));
        }
        let kind = PacketType::from_byte(data[0])
            .filter(PacketType::is_av)
            .ok_or_else(|| {
                RemotePlayError::Protocol(format!("not an av packet: type {:#04x}", data[0]))
            })?;
        let has_nalu = data[0] & 0x10 != 0;
        let packet_index = u16::from_be_bytes([data[1], data[2]]);
        let frame_index = u16::from_be_bytes([data[3], data[4]]);
        let dword_2 = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let codec = data[9];
        let key_pos = u32::from_be_bytes([data[14], data[15], data[16], data[17]]);
        let payload = &data[AV_HEADER_LEN..];

        let (unit_index, total_units, source_units, fec_units, payload) = match kind {
            PacketType::Video => {
                let unit_index = ((dword_2 >> 0x15) & 0x7ff) as u16;
                let total_units = (((dword_2 >> 0xa) & 0x7ff) + 1) as u16;
                let fec_units = (dword_2 & 0x3ff) as u16;
                let source_units = total_units.saturating_sub(fec_units);
                // Skip the two flag bytes and the adaptive-stream byte, and
                // the NAL start-code length when this unit begins a NAL.
                let trim = if has_nalu { 3 + 3 } else { 3 };
                if payload.len() < trim {
                    return Err(RemotePlayError::Protocol(
                        "video unit shorter than its prefix".into(),
                    ));
                }
                (
                    unit_index,
                    total_units,
                    source_units,
                    fec_units,
                    payload[trim..].to_vec(),
                )
            }
            _ => {
                let unit_index = ((dword_2 >> 0x18) & 0xff) as u16;
                let total_units = (((dword_2 >> 0x10) & 0xff) + 1) as u16;
                let trailer = (dword_2 & 0xffff) as u16;
                let source_units = trailer & 0xf;
                let fec_units = (trailer >> 4) & 0xf;
                if payload.is_empty() {
                    return Err(RemotePlayError::Protocol("empty audio unit".into()));
                }
                (
                    unit_index,
                    total_units,
                    source_units,
                    fec_units,
                    payload[1..].to_vec(),
                )
            }
        };

        Ok(Self {
            kind,
            has_nalu,
            packet_index,
            frame_index,
            codec,
            key_pos,
            unit_index,
            total_units,
            source_units,
            fec_units,
            payload,
        })
    }
}

/// Audio parameters announced in the stream-info header. Consumers size
/// their buffers from this before the first audio frame arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    pub channels: u8,
    pub bits: u8,
    pub rate: u32,
    pub frame_size: u32,
}

impl AudioConfig {
    pub fn parse(header: &[u8]) -> Option<Self> {
        if header.len() < 10 {
            return None;
        }
        Some(Self {
            channels: header[0],
            bits: header[1],
            rate: u32::from_be_bytes([header[2], header[3], header[4], header[5]]),
            frame_size: u32::from_be_bytes([header[6], header[7], header[8], header[9]]),
        })
    }
}

/// Consumer of reassembled frames. The first `accept_video` call delivers
/// the codec header announced in stream info.
pub trait FrameSink: Send {
    fn accept_video(&mut self, frame: &[u8]);
    fn accept_audio(&mut self, frame: &[u8]);
    fn on_audio_config(&mut self, config: &AudioConfig);
}

/// Reassembly state for a single frame.
struct Frame {
    frame_index: u16,
    source_units: usize,
    source: Vec<Option<Vec<u8>>>,
    fec: Vec<Option<Vec<u8>>>,
    received: usize,
    complete: bool,
    started: Instant,
}

impl Frame {
    fn new(packet: &AvPacket) -> Self {
        Self {
            frame_index: packet.frame_index,
            source_units: packet.source_units as usize,
            source: vec![None; packet.source_units as usize],
            fec: vec![None; packet.fec_units as usize],
            received: 0,
            complete: false,
            started: Instant::now(),
        }
    }

    /// Deposit one decrypted unit. Returns the assembled frame when the
    /// last source unit lands.
    fn add_unit(&mut self, unit_index: usize, payload: Vec<u8>) -> Option<Vec<u8>> {
        if unit_index < self.source_units {
            let slot = &mut self.source[unit_index];
            if slot.is_none() {
                self.received += 1;
            }
            *slot = Some(payload);
        } else {
            let fec_index = unit_index - self.source_units;
            if let Some(slot) = self.fec.get_mut(fec_index) {
                *slot = Some(payload);
            } else {
                debug!(
                    "frame {}: fec unit {} out of range",
                    self.frame_index, unit_index
                );
            }
            return None;
        }

        if self.received == self.source_units && !self.complete {
            self.complete = true;
            let mut frame = Vec::new();
            for unit in &self.source {
                frame.extend_from_slice(unit.as_deref().unwrap_or_default());
            }
            return Some(frame);
        }
        None
    }
}

struct MediaLane {
    current: Option<Frame>,
    completed: u64,
    dropped: u64,
}

impl MediaLane {
    fn new() -> Self {
        Self {
            current: None,
            completed: 0,
            dropped: 0,
        }
    }
}

/// Frame range that failed reassembly and should be reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptRange {
    pub start: u16,
    pub end: u16,
}

pub struct AvHandler {
    sink: Box<dyn FrameSink>,
    video: MediaLane,
    audio: MediaLane,
    video_header: Option<Vec<u8>>,
    header_delivered: bool,
}

impl AvHandler {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            sink,
            video: MediaLane::new(),
            audio: MediaLane::new(),
            video_header: None,
            header_delivered: false,
        }
    }

    pub fn set_headers(&mut self, video_header: Vec<u8>, audio_header: &[u8]) {
        match AudioConfig::parse(audio_header) {
            Some(config) => {
                info!(
                    "audio config: {} ch, {} bit, {} Hz, frame size {}",
                    config.channels, config.bits, config.rate, config.frame_size
                );
                self.sink.on_audio_config(&config);
            }
            None => warn!("audio header too short: {}", hex::encode(audio_header)),
        }
        self.video_header = Some(video_header);
    }

    pub fn completed_frames(&self) -> (u64, u64) {
        (self.video.completed, self.audio.completed)
    }

    pub fn dropped_frames(&self) -> (u64, u64) {
        (self.video.dropped, self.audio.dropped)
    }

    /// Decrypt and route one media packet. A returned range identifies a
    /// frame that was abandoned incomplete.
    pub fn handle_packet(
        &mut self,
        packet: AvPacket,
        cipher: Option<&mut StreamCipher>,
    ) -> Result<Option<CorruptRange>, RemotePlayError> {
        let Some(cipher) = cipher else {
            debug!("av packet before ciphers are live, dropping");
            return Ok(None);
        };
        let payload = cipher.decrypt(&packet.payload, u64::from(packet.key_pos))?;

        if packet.kind == PacketType::Video && !self.header_delivered {
            if let Some(header) = self.video_header.take() {
                self.sink.accept_video(&header);
            }
            self.header_delivered = true;
        }

        let is_video = packet.kind == PacketType::Video;
        let AvHandler {
            sink, video, audio, ..
        } = self;
        let lane = if is_video { video } else { audio };

        let mut corrupt = None;
        match &mut lane.current {
            Some(frame) if frame.frame_index == packet.frame_index => {
                if let Some(done) = frame.add_unit(packet.unit_index as usize, payload) {
                    Self::deliver(sink.as_mut(), is_video, &done, frame.started);
                    lane.completed += 1;
                }
            }
            Some(frame) if packet.frame_index > frame.frame_index => {
                if !frame.complete {
                    lane.dropped += 1;
                    corrupt = Some(CorruptRange {
                        start: frame.frame_index,
                        end: frame.frame_index,
                    });
                    if packet.frame_index > frame.frame_index + 1 {
                        error!(
                            "unfinished frame {}, got frame {}",
                            frame.frame_index, packet.frame_index
                        );
                    }
                }
                let mut next = Frame::new(&packet);
                if let Some(done) = next.add_unit(packet.unit_index as usize, payload) {
                    Self::deliver(sink.as_mut(), is_video, &done, next.started);
                    lane.completed += 1;
                }
                lane.current = Some(next);
            }
            Some(frame) => {
                debug!(
                    "stale unit for frame {} while on {}",
                    packet.frame_index, frame.frame_index
                );
            }
            None => {
                let mut frame = Frame::new(&packet);
                if let Some(done) = frame.add_unit(packet.unit_index as usize, payload) {
                    Self::deliver(sink.as_mut(), is_video, &done, frame.started);
                    lane.completed += 1;
                }
                lane.current = Some(frame);
            }
        }
        Ok(corrupt)
    }

    fn deliver(sink: &mut dyn FrameSink, is_video: bool, frame: &[u8], started: Instant) {
        debug!(
            "{} frame complete, {} bytes in {:?}",
            if is_video { "video" } else { "audio" },
            frame.len(),
            started.elapsed()
        );
        if is_video {
            sink.accept_video(frame);
        } else {
            sink.accept_audio(frame);
        }
    }
}

/// Writes encoded video to a file, discarding audio.
pub struct FileSink {
    video: File,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            video: File::create(path)?,
        })
    }
}

impl FrameSink for FileSink {
    fn accept_video(&mut self, frame: &[u8]) {
        if let Err(err) = self.video.write_all(frame) {
            error!("failed to write video frame: {err}");
        }
    }

    fn accept_audio(&mut self, _frame: &[u8]) {}

    fn on_audio_config(&mut self, config: &AudioConfig) {
        info!("file sink ignoring audio ({} Hz)", config.rate);
    }
}

/// Delivers frames over channels to an in-process consumer.
pub struct ChannelSink {
    video: mpsc::UnboundedSender<Vec<u8>>,
    audio: mpsc::UnboundedSender<Vec<u8>>,
    config: mpsc::UnboundedSender<AudioConfig>,
}

pub struct ChannelSinkReceivers {
    pub video: mpsc::UnboundedReceiver<Vec<u8>>,
    pub audio: mpsc::UnboundedReceiver<Vec<u8>>,
    pub config: mpsc::UnboundedReceiver<AudioConfig>,
}

impl ChannelSink {
    pub fn new() -> (Self, ChannelSinkReceivers) {
        let (video, video_rx) = mpsc::unbounded_channel();
        let (audio, audio_rx) = mpsc::unbounded_channel();
        let (config, config_rx) = mpsc::unbounded_channel();
        (
            Self {
                video,
                audio,
                config,
            },
            ChannelSinkReceivers {
                video: video_rx,
                audio: audio_rx,
                config: config_rx,
            },
        )
    }
}

impl FrameSink for ChannelSink {
    fn accept_video(&mut self, frame: &[u8]) {
        let _ = self.video.send(frame.to_vec());
    }

    fn accept_audio(&mut self, frame: &[u8]) {
        let _ = self.audio.send(frame.to_vec());
    }

    fn on_audio_config(&mut self, config: &AudioConfig) {
        let _ = self.config.send(*config);
    }
}

/// Test sink collecting frames into shared vectors.
#[cfg(test)]
pub(crate) struct CollectSink {
    pub video: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    pub audio: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
}

#[cfg(test)]
impl FrameSink for CollectSink {
    fn accept_video(&mut self, frame: &[u8]) {
        self.video.lock().expect("lock").push(frame.to_vec());
    }

    fn accept_audio(&mut self, frame: &[u8]) {
        self.audio.lock().expect("lock").push(frame.to_vec());
    }

    fn on_audio_config(&mut self, _config: &AudioConfig) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::crypto::MediaCipher;

    fn video_packet_bytes(
        frame_index: u16,
        unit_index: u16,
        total_units: u16,
        fec_units: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let dword_2 = (u32::from(unit_index) << 0x15)
            | ((u32::from(total_units) - 1) << 0xa)
            | u32::from(fec_units);
        let mut buf = vec![PacketType::Video as u8];
        buf.extend_from_slice(&0u16.to_be_bytes()); // packet index
        buf.extend_from_slice(&frame_index.to_be_bytes());
        buf.extend_from_slice(&dword_2.to_be_bytes());
        buf.push(0x01); // codec
        buf.extend_from_slice(&0u32.to_be_bytes()); // unknown
        buf.extend_from_slice(&0u32.to_be_bytes()); // key pos
        buf.extend_from_slice(&[0, 0, 0]); // flag + adaptive stream bytes
        buf.extend_from_slice(payload);
        buf
    }

    fn null_cipher() -> StreamCipher {
        // Same base index on both sides makes encrypt/decrypt symmetric,
        // and decrypting at matching positions inverts cleanly.
        let handshake = [0u8; 16];
        let secret = [0u8; 32];
        StreamCipher::new(
            MediaCipher::new(&handshake, &secret, 3).unwrap(),
            MediaCipher::new(&handshake, &secret, 3).unwrap(),
        )
    }

    fn encrypt_payload(payload: &[u8]) -> Vec<u8> {
        let mut cipher = null_cipher();
        cipher.encrypt(payload).unwrap()
    }

    fn handler() -> (AvHandler, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let video = Arc::new(Mutex::new(Vec::new()));
        let audio = Arc::new(Mutex::new(Vec::new()));
        let sink = CollectSink {
            video: video.clone(),
            audio: audio.clone(),
        };
        (AvHandler::new(Box::new(sink)), video, audio)
    }

    #[test]
    fn test_parse_video_packet() {
        let bytes = video_packet_bytes(7, 3, 5, 1, b"unit-payload");
        let packet = AvPacket::parse(&bytes).unwrap();
        assert_eq!(packet.kind, PacketType::Video);
        assert_eq!(packet.frame_index, 7);
        assert_eq!(packet.unit_index, 3);
        assert_eq!(packet.total_units, 5);
        assert_eq!(packet.fec_units, 1);
        assert_eq!(packet.source_units, 4);
        assert!(!packet.has_nalu);
        assert_eq!(packet.payload, b"unit-payload");
    }

    #[test]
    fn test_parse_nalu_marker_trims_start_code() {
        let mut bytes = video_packet_bytes(1, 0, 1, 0, b"\x00\x00\x01frame");
        bytes[0] |= 0x10;
        let packet = AvPacket::parse(&bytes).unwrap();
        assert!(packet.has_nalu);
        assert_eq!(packet.payload, b"frame");
    }

    #[test]
    fn test_reassembles_out_of_order_units() {
        let (mut handler, video, _) = handler();
        let mut cipher = null_cipher();

        let units: [&[u8]; 4] = [b"u0-", b"u1-", b"u2-", b"u3"];
        // Frame 7: 5 total units, 1 FEC, source units delivered [3, 1, 0, 2].
        for index in [3u16, 1, 0, 2] {
            let bytes = video_packet_bytes(
                7,
                index,
                5,
                1,
                &encrypt_payload(units[index as usize]),
            );
            let packet = AvPacket::parse(&bytes).unwrap();
            let outcome = handler.handle_packet(packet, Some(&mut cipher)).unwrap();
            assert_eq!(outcome, None);
        }

        let frames = video.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"u0-u1-u2-u3");
        assert_eq!(handler.completed_frames().0, 1);
    }

    #[test]
    fn test_incomplete_frame_is_dropped_and_reported() {
        let (mut handler, video, _) = handler();
        let mut cipher = null_cipher();

        // Frame 7 gets three of four source units.
        for index in [0u16, 1, 2] {
            let bytes = video_packet_bytes(7, index, 5, 1, &encrypt_payload(b"x"));
            let packet = AvPacket::parse(&bytes).unwrap();
            handler.handle_packet(packet, Some(&mut cipher)).unwrap();
        }
        // Frame 8 arrives first; frame 7 must be abandoned and reported.
        let bytes = video_packet_bytes(8, 0, 3, 1, &encrypt_payload(b"ne"));
        let packet = AvPacket::parse(&bytes).unwrap();
        let outcome = handler.handle_packet(packet, Some(&mut cipher)).unwrap();
        assert_eq!(outcome, Some(CorruptRange { start: 7, end: 7 }));

        assert!(video.lock().unwrap().is_empty());
        assert_eq!(handler.dropped_frames().0, 1);
        assert_eq!(handler.completed_frames().0, 0);

        // Frame 8 still completes normally afterwards.
        let bytes = video_packet_bytes(8, 1, 3, 1, &encrypt_payload(b"xt"));
        let packet = AvPacket::parse(&bytes).unwrap();
        handler.handle_packet(packet, Some(&mut cipher)).unwrap();
        assert_eq!(handler.completed_frames().0, 1);
        assert_eq!(video.lock().unwrap()[0], b"next");
    }

    #[test]
    fn test_fec_units_do_not_complete_frames() {
        let (mut handler, video, _) = handler();
        let mut cipher = null_cipher();

        // total 3, fec 1 -> two source units; send source 0 and the FEC unit.
        for index in [0u16, 2] {
            let bytes = video_packet_bytes(4, index, 3, 1, &encrypt_payload(b"p"));
            let packet = AvPacket::parse(&bytes).unwrap();
            let outcome = handler.handle_packet(packet, Some(&mut cipher)).unwrap();
            assert_eq!(outcome, None);
        }
        assert!(video.lock().unwrap().is_empty());

        // The missing source unit finishes the frame.
        let bytes = video_packet_bytes(4, 1, 3, 1, &encrypt_payload(b"q"));
        let packet = AvPacket::parse(&bytes).unwrap();
        handler.handle_packet(packet, Some(&mut cipher)).unwrap();
        assert_eq!(video.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_units_counted_once() {
        let (mut handler, video, _) = handler();
        let mut cipher = null_cipher();

        for _ in 0..2 {
            let bytes = video_packet_bytes(2, 0, 2, 0, &encrypt_payload(b"dup"));
            let packet = AvPacket::parse(&bytes).unwrap();
            handler.handle_packet(packet, Some(&mut cipher)).unwrap();
        }
        assert!(video.lock().unwrap().is_empty());

        let bytes = video_packet_bytes(2, 1, 2, 0, &encrypt_payload(b"end"));
        let packet = AvPacket::parse(&bytes).unwrap();
        handler.handle_packet(packet, Some(&mut cipher)).unwrap();
        assert_eq!(video.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_audio_config_parse() {
        let mut header = vec![2u8, 16];
        header.extend_from_slice(&48000u32.to_be_bytes());
        header.extend_from_slice(&480u32.to_be_bytes());
        header.extend_from_slice(&[0u8; 22]);
        let config = AudioConfig::parse(&header).unwrap();
        assert_eq!(config.channels, 2);
        assert_eq!(config.bits, 16);
        assert_eq!(config.rate, 48000);
        assert_eq!(config.frame_size, 480);
        assert!(AudioConfig::parse(&[0u8; 4]).is_none());
    }
}
