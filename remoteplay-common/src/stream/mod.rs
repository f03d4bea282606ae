//! The media stream: UDP transport bring-up, big-payload negotiation,
//! stream-info exchange and the fan-out to A/V reassembly and feedback.

pub mod av;
pub mod feedback;
pub mod packets;
pub mod proto;
pub(crate) mod transport;

use std::{net::IpAddr, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::{debug, error, info, warn};
use prost::Message as _;
use tokio::{
    net::UdpSocket,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{
    RemotePlayError, ResolutionPreset, STREAM_PORT,
    crypto::{SessionCipher, StreamEcdh},
    stop::StopToken,
    stream::{
        av::{AudioConfig, AvHandler, AvPacket, FrameSink},
        feedback::Controller,
        packets::{CHANNEL_BIG, CHANNEL_HEARTBEAT, CHANNEL_STREAM_INFO, PacketType},
        proto::{PayloadType, SenkushaCommand, TakionMessage},
        transport::{DEFAULT_MTU, TransportEndpoint, TransportEvent},
    },
};

pub use transport::DEFAULT_RTT;

/// Client version tag carried in the big payload.
const RP_CLIENT_VERSION: u32 = 9;

/// Raw marker the server sends when the stream proper begins.
const STREAM_START: &[u8] = b"\x00\x00\x00\x40\x01\x00\x00";

const SENKUSHA_TIMEOUT: Duration = Duration::from_secs(3);
const SENKUSHA_MTU_ID: u32 = 1;
const RETRANSMIT_TICK: Duration = Duration::from_millis(100);

/// Progress notifications surfaced to the session orchestrator.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// BANG accepted, media ciphers installed.
    CiphersReady,
    /// STREAMINFO received and acked.
    StreamInfo { audio_config: Option<AudioConfig> },
    /// The stream is fully up.
    Ready,
    /// The stream ended; `None` means an orderly disconnect.
    Stopped(Option<RemotePlayError>),
}

pub(crate) struct StreamConfig {
    pub host: IpAddr,
    pub session_id: Vec<u8>,
    pub resolution: ResolutionPreset,
    pub max_fps: u32,
    /// Clone of the control cipher, used to seal the launch spec at
    /// counter zero.
    pub control_cipher: SessionCipher,
    pub sink: Box<dyn FrameSink>,
    pub controller: Controller,
}

#[derive(Default)]
struct SenkushaProbe {
    echo_sent: Option<Instant>,
    rtt: Option<Duration>,
    mtu: Option<u32>,
}

struct StreamInner {
    transport: TransportEndpoint,
    av: AvHandler,
    ecdh: Option<StreamEcdh>,
    recv_bang: bool,
    recv_info: bool,
    senkusha: SenkushaProbe,
    malformed_packets: u64,
}

/// Cheap handle for sending on the stream from other tasks.
#[derive(Clone)]
pub(crate) struct StreamHandle {
    socket: Arc<UdpSocket>,
    inner: Arc<Mutex<StreamInner>>,
}

impl StreamHandle {
    /// Seal and transmit an unreliable feedback packet.
    pub(crate) async fn send_feedback(
        &self,
        kind: PacketType,
        sequence: u16,
        payload: &[u8],
    ) -> Result<(), RemotePlayError> {
        let encoded = {
            let mut inner = self.inner.lock().await;
            inner.transport.seal_feedback(kind, sequence, payload)?
        };
        self.socket.send(&encoded).await?;
        Ok(())
    }

    /// Queue and transmit a reliable protobuf message.
    async fn send_proto(&self, channel: u16, payload: Vec<u8>) -> Result<(), RemotePlayError> {
        let encoded = {
            let mut inner = self.inner.lock().await;
            inner.transport.send_data(channel, payload, true)?
        };
        self.socket.send(&encoded).await?;
        Ok(())
    }
}

pub(crate) struct RpStream {
    handle: StreamHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl RpStream {
    /// Connect the transport and drive the stream until the stop token
    /// fires. Progress is reported on `events`.
    pub(crate) async fn start(
        config: StreamConfig,
        events: mpsc::UnboundedSender<StreamEvent>,
        stop: StopToken,
    ) -> Result<Self, RemotePlayError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((config.host, STREAM_PORT)).await?;
        let socket = Arc::new(socket);
        info!("stream transport connecting to {}:{STREAM_PORT}", config.host);

        let mut transport = TransportEndpoint::new()?;
        let init = transport.start_handshake();

        let inner = Arc::new(Mutex::new(StreamInner {
            transport,
            av: AvHandler::new(config.sink),
            ecdh: None,
            recv_bang: false,
            recv_info: false,
            senkusha: SenkushaProbe::default(),
            malformed_packets: 0,
        }));
        let handle = StreamHandle {
            socket: socket.clone(),
            inner: inner.clone(),
        };

        socket.send(&init).await?;

        let driver = StreamDriver {
            handle: handle.clone(),
            session_id: config.session_id,
            resolution: config.resolution,
            max_fps: config.max_fps,
            control_cipher: config.control_cipher,
            controller: config.controller,
            events: events.clone(),
            stop: stop.clone(),
        };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(driver.run()));
        tasks.push(tokio::spawn(retransmit_task(
            handle.clone(),
            events,
            stop.clone(),
        )));

        Ok(Self { handle, tasks })
    }

    pub(crate) fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Best-effort orderly disconnect.
    pub(crate) async fn send_disconnect(&self) {
        if let Err(err) = self
            .handle
            .send_proto(CHANNEL_BIG, proto::disconnect())
            .await
        {
            debug!("disconnect send failed: {err}");
        }
    }

    pub(crate) async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

struct StreamDriver {
    handle: StreamHandle,
    session_id: Vec<u8>,
    resolution: ResolutionPreset,
    max_fps: u32,
    control_cipher: SessionCipher,
    controller: Controller,
    events: mpsc::UnboundedSender<StreamEvent>,
    stop: StopToken,
}

impl StreamDriver {
    async fn run(self) {
        let socket = self.handle.socket.clone();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let received = tokio::select! {
                _ = self.stop.wait() => break,
                received = socket.recv(&mut buf) => received,
            };
            let len = match received {
                Ok(len) => len,
                Err(err) => {
                    error!("stream socket error: {err}");
                    let _ = self.events.send(StreamEvent::Stopped(Some(err.into())));
                    self.stop.stop();
                    break;
                }
            };
            if let Err(err) = self.handle_datagram(&buf[..len]).await {
                error!("stream failed: {err}");
                let _ = self.events.send(StreamEvent::Stopped(Some(err)));
                self.stop.stop();
                break;
            }
        }
        debug!("stream driver exiting");
    }

    async fn handle_datagram(&self, data: &[u8]) -> Result<(), RemotePlayError> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(packet_type) = PacketType::from_byte(data[0]) else {
            debug!("unknown packet type {:#04x}", data[0]);
            return Ok(());
        };

        if packet_type.is_av() {
            self.handle_av(data).await;
            return Ok(());
        }
        if packet_type != PacketType::Control {
            return Ok(());
        }

        let handled = {
            let mut inner = self.handle.inner.lock().await;
            inner.transport.handle_packet(data)
        };
        let (events, out) = match handled {
            Ok(handled) => handled,
            Err(err) => {
                // A single bad datagram is counted, not fatal.
                let mut inner = self.handle.inner.lock().await;
                inner.malformed_packets += 1;
                warn!(
                    "dropping control packet ({} so far): {err}",
                    inner.malformed_packets
                );
                return Ok(());
            }
        };
        for datagram in out {
            self.handle.socket.send(&datagram).await?;
        }
        for event in events {
            match event {
                TransportEvent::HandshakeComplete => self.send_big().await?,
                TransportEvent::Data { channel, payload } => {
                    self.handle_data(channel, &payload).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_av(&self, data: &[u8]) {
        let packet = match AvPacket::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                let mut inner = self.handle.inner.lock().await;
                inner.malformed_packets += 1;
                debug!("bad av packet: {err}");
                return;
            }
        };
        let corrupt = {
            let mut inner = self.handle.inner.lock().await;
            let StreamInner { transport, av, .. } = &mut *inner;
            av.handle_packet(packet, transport.cipher_mut())
        };
        match corrupt {
            Ok(None) => {}
            Ok(Some(range)) => {
                // Tell the server so it can force a keyframe.
                warn!("requesting keyframe for frames {}..{}", range.start, range.end);
                let report =
                    proto::corrupt_frame(u32::from(range.start), u32::from(range.end));
                if let Err(err) = self.handle.send_proto(CHANNEL_HEARTBEAT, report).await {
                    warn!("corrupt frame report failed: {err}");
                }
            }
            Err(err) => {
                let mut inner = self.handle.inner.lock().await;
                inner.malformed_packets += 1;
                debug!("av decrypt failed: {err}");
            }
        }
    }

    /// Send the big payload: launch spec sealed with the control cipher's
    /// counter-zero keystream plus our half of the key agreement.
    async fn send_big(&self) -> Result<(), RemotePlayError> {
        let ecdh = StreamEcdh::new()?;
        let session_id = String::from_utf8_lossy(&self.session_id).into_owned();
        let launch_spec = proto::launch_spec(
            &session_id,
            &self.resolution,
            self.max_fps,
            DEFAULT_MTU,
            DEFAULT_RTT.as_secs() as u32,
            ecdh.handshake_key(),
        );

        let keystream = self
            .control_cipher
            .encrypt_at(0, &vec![0u8; launch_spec.len()])?;
        let sealed: Vec<u8> = launch_spec
            .iter()
            .zip(&keystream)
            .map(|(byte, key)| byte ^ key)
            .collect();
        let sealed = BASE64.encode(sealed).into_bytes();

        let big = proto::big_payload(
            RP_CLIENT_VERSION,
            &self.session_id,
            &sealed,
            &[0u8; 4],
            ecdh.public_key(),
            &ecdh.public_sig()?,
        );
        debug!("sending big payload ({} bytes)", big.len());

        let encoded = {
            let mut inner = self.handle.inner.lock().await;
            inner.ecdh = Some(ecdh);
            inner.transport.send_data(CHANNEL_BIG, big, false)?
        };
        self.handle.socket.send(&encoded).await?;
        Ok(())
    }

    async fn handle_data(&self, channel: u16, payload: &[u8]) -> Result<(), RemotePlayError> {
        if payload == STREAM_START {
            info!("stream started");
            return Ok(());
        }
        let msg = match TakionMessage::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                let mut inner = self.handle.inner.lock().await;
                inner.malformed_packets += 1;
                warn!("protobuf error on channel {channel}: {err}");
                return Ok(());
            }
        };
        let Some(payload_type) = msg.payload_type() else {
            debug!("unknown takion payload type {}", msg.r#type);
            return Ok(());
        };
        debug!("received {payload_type:?} on channel {channel}");

        match payload_type {
            PayloadType::Bang => self.handle_bang(msg).await,
            PayloadType::StreamInfo => self.handle_stream_info(msg).await,
            PayloadType::Heartbeat => {
                self.handle
                    .send_proto(CHANNEL_HEARTBEAT, proto::heartbeat())
                    .await
            }
            PayloadType::Disconnect => {
                let reason = msg
                    .disconnect_payload
                    .map(|payload| String::from_utf8_lossy(&payload.reason).into_owned())
                    .unwrap_or_default();
                info!("host disconnected: {reason}");
                let _ = self.events.send(StreamEvent::Stopped(None));
                self.stop.stop();
                Ok(())
            }
            PayloadType::Senkusha => {
                self.handle_senkusha(msg).await;
                Ok(())
            }
            PayloadType::Big => Ok(()),
            other => {
                info!("unhandled payload type {other:?}");
                Ok(())
            }
        }
    }

    async fn handle_bang(&self, msg: TakionMessage) -> Result<(), RemotePlayError> {
        let Some(bang) = msg.bang_payload else {
            return Err(RemotePlayError::Protocol("BANG without payload".into()));
        };
        {
            let inner = self.handle.inner.lock().await;
            if inner.recv_bang {
                return Ok(());
            }
        }
        if !bang.version_accepted {
            error!("launch spec version not accepted");
            return Err(RemotePlayError::CryptoRejected("version not accepted"));
        }
        if !bang.encrypted_key_accepted {
            error!("encrypted key not accepted");
            return Err(RemotePlayError::CryptoRejected("encrypted key not accepted"));
        }

        let mut inner = self.handle.inner.lock().await;
        let ecdh = inner
            .ecdh
            .as_ref()
            .ok_or_else(|| RemotePlayError::Protocol("BANG before big payload".into()))?;
        let cipher = ecdh.derive(&bang.ecdh_pub_key, &bang.ecdh_sig)?;
        inner.transport.install_cipher(cipher);
        inner.recv_bang = true;
        drop(inner);

        info!("media ciphers installed");
        let _ = self.events.send(StreamEvent::CiphersReady);
        Ok(())
    }

    async fn handle_stream_info(&self, msg: TakionMessage) -> Result<(), RemotePlayError> {
        let Some(payload) = msg.stream_info_payload else {
            return Err(RemotePlayError::Protocol("STREAMINFO without payload".into()));
        };

        let first = {
            let mut inner = self.handle.inner.lock().await;
            let first = !inner.recv_info;
            if first {
                inner.recv_info = true;
                let video_header = payload
                    .resolution
                    .first()
                    .map(|res| res.video_header.clone())
                    .unwrap_or_default();
                debug!(
                    "stream info: video header {} bytes, audio header {} bytes, \
                     start timeout {}s",
                    video_header.len(),
                    payload.audio_header.len(),
                    payload.start_timeout
                );
                inner.av.set_headers(video_header, &payload.audio_header);
            }
            first
        };

        // Ack on the stream-info channel even for repeats.
        self.handle
            .send_proto(CHANNEL_STREAM_INFO, proto::stream_info_ack())
            .await?;

        if first {
            let _ = self.events.send(StreamEvent::StreamInfo {
                audio_config: AudioConfig::parse(&payload.audio_header),
            });
            let _ = self.events.send(StreamEvent::Ready);

            // The stream is live: start feeding input and probe the path.
            tokio::spawn(feedback::feedback_worker(
                self.controller.clone(),
                self.handle.clone(),
                self.stop.clone(),
            ));
            tokio::spawn(senkusha_probe(self.handle.clone(), self.stop.clone()));
        }
        Ok(())
    }

    async fn handle_senkusha(&self, msg: TakionMessage) {
        let Some(payload) = msg.senkusha_payload else {
            return;
        };
        let mut inner = self.handle.inner.lock().await;
        match SenkushaCommand::try_from(payload.command) {
            Ok(SenkushaCommand::EchoCommand) => {
                if let Some(sent) = inner.senkusha.echo_sent {
                    let rtt = sent.elapsed();
                    debug!("echo returned in {rtt:?}");
                    inner.senkusha.rtt.get_or_insert(rtt);
                }
            }
            Ok(SenkushaCommand::MtuCommand) => {
                if let Some(mtu) = payload.mtu_command {
                    let sent = mtu.mtu_sent.unwrap_or(mtu.mtu_req);
                    debug!("mtu probe answered: req {}, sent {}", mtu.mtu_req, sent);
                    inner.senkusha.mtu.get_or_insert(sent.min(mtu.mtu_req));
                }
            }
            _ => {}
        }
    }
}

/// MTU and RTT probe. Runs once after the stream is ready; gives up after
/// three seconds and keeps the defaults.
async fn senkusha_probe(handle: StreamHandle, stop: StopToken) {
    let started = Instant::now();
    {
        let mut inner = handle.inner.lock().await;
        inner.senkusha.echo_sent = Some(started);
    }
    if let Err(err) = handle
        .send_proto(
            CHANNEL_HEARTBEAT,
            proto::senkusha_mtu(SENKUSHA_MTU_ID, DEFAULT_MTU, 1),
        )
        .await
    {
        warn!("mtu probe send failed: {err}");
    }
    if let Err(err) = handle
        .send_proto(CHANNEL_HEARTBEAT, proto::senkusha_echo(true))
        .await
    {
        warn!("echo probe send failed: {err}");
    }

    let (rtt, mtu) = loop {
        if started.elapsed() >= SENKUSHA_TIMEOUT || stop.is_stopped() {
            let inner = handle.inner.lock().await;
            break (inner.senkusha.rtt, inner.senkusha.mtu);
        }
        {
            let inner = handle.inner.lock().await;
            if inner.senkusha.rtt.is_some() && inner.senkusha.mtu.is_some() {
                break (inner.senkusha.rtt, inner.senkusha.mtu);
            }
        }
        tokio::select! {
            _ = stop.wait() => {}
            _ = time::sleep(Duration::from_millis(100)) => {}
        }
    };

    match (rtt, mtu) {
        (Some(rtt), mtu) => {
            let mtu = mtu.unwrap_or(DEFAULT_MTU);
            info!("network test: mtu {mtu}, rtt {} ms", rtt.as_millis());
            let mut inner = handle.inner.lock().await;
            inner.transport.set_rto(rtt.max(Duration::from_millis(50)) * 2);
        }
        _ => warn!("network test timed out, using default MTU and RTT"),
    }

    if !stop.is_stopped() {
        if let Err(err) = handle
            .send_proto(CHANNEL_HEARTBEAT, proto::senkusha_echo(false))
            .await
        {
            debug!("echo disable send failed: {err}");
        }
    }
}

/// Resend timer for the reliable channel.
async fn retransmit_task(
    handle: StreamHandle,
    events: mpsc::UnboundedSender<StreamEvent>,
    stop: StopToken,
) {
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            _ = time::sleep(RETRANSMIT_TICK) => {}
        }
        if stop.is_stopped() {
            break;
        }
        let due = {
            let mut inner = handle.inner.lock().await;
            inner.transport.retransmit_due(Instant::now())
        };
        match due {
            Ok(datagrams) => {
                for datagram in datagrams {
                    if let Err(err) = handle.socket.send(&datagram).await {
                        warn!("retransmit send failed: {err}");
                    }
                }
            }
            Err(err) => {
                error!("reliable channel gave up: {err}");
                let _ = events.send(StreamEvent::Stopped(Some(err)));
                stop.stop();
                break;
            }
        }
    }
}
