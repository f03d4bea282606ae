//! The session orchestrator: control-channel authentication, the framed
//! control stream with its heartbeat, and the state machine that brings
//! the media stream up and tears everything down together.

use std::{
    collections::HashMap,
    io,
    net::IpAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use openssl::rand::rand_bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{
    AppReason, ConsoleType, Fps, OS_TYPE, RP_PORT, RP_VERSION, RemotePlayError, Resolution,
    USER_AGENT, crypto::SessionCipher, ddp, device::Device, keys, profile::HostProfile,
    stop::StopToken,
    stream::{
        RpStream, StreamConfig, StreamEvent, av::AudioConfig, av::FrameSink, feedback::Controller,
    },
};

pub const RP_INIT_PATH: &str = "/sie/ps4/rp/sess/init";
pub const RP_SESSION_PATH: &str = "/sie/ps4/rp/sess/ctrl";

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(3);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

const DID_PREFIX: [u8; 10] = [0x00, 0x18, 0x00, 0x00, 0x00, 0x07, 0x00, 0x40, 0x00, 0x80];
const HEARTBEAT_RESPONSE: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x01, 0xfe, 0x00, 0x00];

const HEADER_LEN: usize = 8;
const MAX_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum MessageType {
    LoginPinRequest = 0x04,
    LoginPinResponse = 0x8004,
    Login = 0x05,
    SessionId = 0x33,
    HeartbeatRequest = 0xfe,
    HeartbeatResponse = 0x1fe,
    Standby = 0x50,
    KeyboardEnableToggle = 0x20,
    KeyboardOpen = 0x21,
    KeyboardCloseRemote = 0x22,
    KeyboardTextChangeReq = 0x23,
    KeyboardTextChangeRes = 0x24,
    KeyboardCloseReq = 0x25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    AuthPending,
    ControlReady,
    BigPending,
    StreamReady,
    Running,
    Stopped,
}

/// Notifications delivered to the session's subscriber.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Announced once stream info arrives so audio consumers can size
    /// their buffers.
    AudioConfig(AudioConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub resolution: Resolution,
    pub fps: Fps,
    pub hdr: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            resolution: Resolution::R720p,
            fps: Fps::High,
            hdr: false,
        }
    }
}

/// Nonce transform feeding the control-cipher IV.
fn rp_nonce_transform(nonce: &[u8; 16]) -> [u8; 16] {
    let offset = usize::from(nonce[0] >> 3) * 112;
    let table = &keys::SESSION_KEY_0[offset..];
    let mut out = [0u8; 16];
    for (index, byte) in out.iter_mut().enumerate() {
        *byte = nonce[index]
            .wrapping_add(54)
            .wrapping_add(index as u8)
            ^ table[index];
    }
    out
}

/// Key transform mixing the per-console RP key into the control cipher.
fn aes_key_transform(nonce: &[u8; 16], rp_key: &[u8; 16]) -> [u8; 16] {
    let offset = usize::from(nonce[7] >> 3) * 112;
    let table = &keys::SESSION_KEY_1[offset..];
    let mut out = [0u8; 16];
    for (index, byte) in out.iter_mut().enumerate() {
        *byte = (table[index] ^ rp_key[index])
            .wrapping_add(33)
            .wrapping_add(index as u8)
            ^ nonce[index];
    }
    out
}

/// Session ids are expected to be ASCII, but hosts occasionally mix in
/// bytes above 0x7f; those are widened to their UTF-8 encoding.
fn sanitize_session_id(raw: &[u8]) -> Vec<u8> {
    if str::from_utf8(raw).is_ok() {
        return raw.to_vec();
    }
    warn!("received malformed session id, widening");
    raw.iter()
        .map(|&byte| byte as char)
        .collect::<String>()
        .into_bytes()
}

/// Frame a control message: length, type, two reserved bytes, payload.
fn build_frame(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(msg_type as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);
    buf
}

struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    stream: TcpStream,
    /// Bytes that arrived after the header terminator.
    remainder: Vec<u8>,
}

fn parse_http_header(raw: &[u8]) -> Result<(u16, HashMap<String, String>), RemotePlayError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| RemotePlayError::Protocol("empty http response".into()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            RemotePlayError::Protocol(format!("bad http status line: {status_line}"))
        })?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok((status, headers))
}

/// One GET against the console's session endpoint. The console speaks
/// just enough HTTP that a real client library cannot be used: the auth
/// response's connection must be kept and reused as the control stream.
async fn http_get(
    host: IpAddr,
    path: &str,
    headers: &[(&str, String)],
) -> Result<HttpResponse, RemotePlayError> {
    let mut request = format!("GET {path} HTTP/1.1\r\n");
    for (key, value) in headers {
        request.push_str(&format!("{key}: {value}\r\n"));
    }
    request.push_str("\r\n");

    let mut stream = time::timeout(HTTP_TIMEOUT, TcpStream::connect((host, RP_PORT)))
        .await
        .map_err(|_| RemotePlayError::Timeout("http connect"))??;
    stream.set_nodelay(true)?;
    stream.write_all(request.as_bytes()).await?;

    let deadline = Instant::now() + HTTP_TIMEOUT;
    let mut buf = Vec::with_capacity(2048);
    let header_end = loop {
        if let Some(at) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break at;
        }
        if buf.len() > 64 * 1024 {
            return Err(RemotePlayError::Protocol("http header too large".into()));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RemotePlayError::Timeout("http response"));
        }
        let mut chunk = [0u8; 2048];
        let read = time::timeout(remaining, stream.read(&mut chunk))
            .await
            .map_err(|_| RemotePlayError::Timeout("http response"))??;
        if read == 0 {
            return Err(RemotePlayError::Protocol("connection closed mid-response".into()));
        }
        buf.extend_from_slice(&chunk[..read]);
    };

    let (status, headers) = parse_http_header(&buf[..header_end])?;
    let remainder = buf[header_end + 4..].to_vec();
    debug!("GET {path} -> {status}");
    Ok(HttpResponse {
        status,
        headers,
        stream,
        remainder,
    })
}

/// Writer half of the control stream together with the session cipher.
/// Everything that encrypts or decrypts control traffic goes through one
/// lock on this.
struct ControlLink {
    writer: OwnedWriteHalf,
    cipher: SessionCipher,
}

impl ControlLink {
    async fn send_message(
        &mut self,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<(), RemotePlayError> {
        // The cipher advances on every message, payload or not.
        let encrypted = self.cipher.encrypt(payload)?;
        self.writer
            .write_all(&build_frame(msg_type, &encrypted))
            .await?;
        debug!("control send {msg_type:?} ({} bytes)", payload.len());
        Ok(())
    }
}

/// Buffered reader for the framed control stream.
struct FrameReader {
    reader: OwnedReadHalf,
    pending: BytesMut,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf, pending: Vec<u8>) -> Self {
        Self {
            reader,
            pending: BytesMut::from(&pending[..]),
        }
    }

    async fn fill(&mut self, wanted: usize) -> io::Result<()> {
        while self.pending.len() < wanted {
            let mut chunk = [0u8; 4096];
            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> io::Result<(u16, Vec<u8>)> {
        self.fill(HEADER_LEN).await?;
        let len = u32::from_be_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]) as usize;
        let msg_type = u16::from_be_bytes([self.pending[4], self.pending[5]]);
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control payload of {len} bytes"),
            ));
        }
        self.fill(HEADER_LEN + len).await?;
        self.pending.advance(HEADER_LEN);
        let payload = self.pending.split_to(len).to_vec();
        Ok((msg_type, payload))
    }
}

struct HeartbeatState {
    last_traffic: Instant,
    request_sent: bool,
}

struct Shared {
    state: StdMutex<SessionState>,
    error: StdMutex<Option<String>>,
    stop: StopToken,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    /// Move the state machine. `Stopped` is absorbing.
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().expect("state lock");
        if *state == SessionState::Stopped || *state == next {
            return;
        }
        debug!("session state {:?} -> {next:?}", *state);
        *state = next;
        drop(state);
        let _ = self.events.send(SessionEvent::StateChanged(next));
    }

    fn fail(&self, err: &RemotePlayError) {
        error!("session failed: {err}");
        self.error
            .lock()
            .expect("error lock")
            .get_or_insert_with(|| err.to_string());
        self.shutdown();
    }

    fn shutdown(&self) {
        self.set_state(SessionState::Stopped);
        self.stop.stop();
    }
}

/// A live Remote Play session against one console.
pub struct Session {
    host: IpAddr,
    kind: ConsoleType,
    name: Option<String>,
    regist_key: String,
    rp_key: [u8; 16],
    options: SessionOptions,
    shared: Arc<Shared>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    controller: Controller,
    sink: Option<Box<dyn FrameSink>>,
    session_id: Vec<u8>,
    server_type: Option<u32>,
    link: Option<Arc<Mutex<ControlLink>>>,
    stream: Option<RpStream>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Build a session from a discovered device and the user's credential
    /// for it. The frame sink receives decoded-stream output once running.
    pub fn new(
        device: &Device,
        profile: &HostProfile,
        options: SessionOptions,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self, RemotePlayError> {
        profile.validate()?;
        let regist_key = profile
            .regist_key()
            .expect("validated regist key")
            .to_string();
        let rp_key = profile.rp_key().expect("validated rp key");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            host: device.host(),
            kind: device.kind().unwrap_or(profile.kind),
            name: device.name().map(str::to_string),
            regist_key,
            rp_key,
            options,
            shared: Arc::new(Shared {
                state: StdMutex::new(SessionState::Init),
                error: StdMutex::new(None),
                stop: StopToken::new(),
                events: events_tx,
            }),
            events_rx: Some(events_rx),
            controller: Controller::new(),
            sink: Some(sink),
            session_id: Vec::new(),
            server_type: None,
            link: None,
            stream: None,
            tasks: Vec::new(),
        })
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn kind(&self) -> ConsoleType {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state() != SessionState::Stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state() == SessionState::Stopped
    }

    /// Last failure, if the session stopped on one.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().expect("error lock").clone()
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// Server kind tag decrypted from the auth response.
    pub fn server_type(&self) -> Option<u32> {
        self.server_type
    }

    /// Input handle. Clones stay valid for the session's lifetime.
    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    /// Session notifications. Can be taken once; drain it to observe
    /// state changes.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Wake the console from standby using this session's credential.
    pub async fn wakeup(&self) -> Result<(), RemotePlayError> {
        let credential = ddp::credential_from_regist_key(&self.regist_key)?;
        ddp::wakeup(self.host, self.kind, credential).await
    }

    /// Drive the session up to `Running`: reachability check, control
    /// authentication, session-id capture, then the media stream.
    pub async fn start(&mut self) -> Result<(), RemotePlayError> {
        if self.shared.state() != SessionState::Init {
            return Err(RemotePlayError::Protocol("session was already started".into()));
        }

        match self.run_to_ready().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.fail(&err);
                Err(err)
            }
        }
    }

    async fn run_to_ready(&mut self) -> Result<(), RemotePlayError> {
        // Reachability gate.
        let status = ddp::status(self.host, ddp::SEARCH_TIMEOUT).await?;
        let Some(status) = status else {
            return Err(RemotePlayError::Unreachable);
        };
        if !status.is_ok() {
            info!(
                "host {} is not on (status {}); wake it first",
                self.host, status.code
            );
            return Err(RemotePlayError::Unreachable);
        }
        self.shared.set_state(SessionState::AuthPending);

        let (link, reader) = self.authenticate().await?;
        let link = Arc::new(Mutex::new(link));
        self.link = Some(link.clone());
        self.shared.set_state(SessionState::ControlReady);

        // Control stream tasks: reader and heartbeat writer.
        let heartbeat = Arc::new(StdMutex::new(HeartbeatState {
            last_traffic: Instant::now(),
            request_sent: false,
        }));
        let (id_tx, mut id_rx) = watch::channel::<Option<Vec<u8>>>(None);
        self.tasks.push(tokio::spawn(control_reader(
            reader,
            link.clone(),
            self.shared.clone(),
            heartbeat.clone(),
            id_tx,
        )));
        self.tasks.push(tokio::spawn(heartbeat_task(
            link.clone(),
            self.shared.clone(),
            heartbeat,
        )));

        // Wait for the console to assign a session id.
        let session_id = loop {
            if let Some(id) = id_rx.borrow().clone() {
                break id;
            }
            tokio::select! {
                _ = self.shared.stop.wait() => {
                    return Err(RemotePlayError::Protocol("session stopped during login".into()));
                }
                changed = id_rx.changed() => {
                    changed.map_err(|_| {
                        RemotePlayError::Protocol("control stream closed during login".into())
                    })?;
                }
            }
        };
        info!("session id received ({} bytes)", session_id.len());
        self.session_id = session_id.clone();
        self.shared.set_state(SessionState::BigPending);

        // Bring the media stream up.
        let sink = self
            .sink
            .take()
            .ok_or_else(|| RemotePlayError::Protocol("session sink already consumed".into()))?;
        let control_cipher = link.lock().await.cipher.clone();
        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
        let stream = RpStream::start(
            StreamConfig {
                host: self.host,
                session_id,
                resolution: self.options.resolution.preset(),
                max_fps: self.options.fps.as_u32(),
                control_cipher,
                sink,
                controller: self.controller.clone(),
            },
            stream_tx,
            self.shared.stop.clone(),
        )
        .await?;
        self.stream = Some(stream);

        loop {
            let event = tokio::select! {
                _ = self.shared.stop.wait() => {
                    return Err(RemotePlayError::Protocol("session stopped during stream setup".into()));
                }
                event = stream_rx.recv() => event,
            };
            match event {
                None => {
                    return Err(RemotePlayError::Protocol("stream ended during setup".into()));
                }
                Some(StreamEvent::CiphersReady) => {
                    self.shared.set_state(SessionState::StreamReady);
                }
                Some(StreamEvent::StreamInfo { audio_config }) => {
                    if let Some(config) = audio_config {
                        let _ = self.shared.events.send(SessionEvent::AudioConfig(config));
                    }
                }
                Some(StreamEvent::Ready) => {
                    self.shared.set_state(SessionState::Running);
                    break;
                }
                Some(StreamEvent::Stopped(err)) => {
                    return Err(err.unwrap_or_else(|| {
                        RemotePlayError::Protocol("stream stopped during setup".into())
                    }));
                }
            }
        }

        // Keep consuming stream events for the session's lifetime.
        self.tasks
            .push(tokio::spawn(stream_event_pump(stream_rx, self.shared.clone())));
        info!("session running against {} ({})", self.host, self.kind);
        Ok(())
    }

    /// The init and auth HTTP exchanges. Returns the retained control
    /// connection, split and keyed.
    async fn authenticate(&mut self) -> Result<(ControlLink, FrameReader), RemotePlayError> {
        let host_header = format!("{}:{RP_PORT}", self.host);

        // Init: learn the nonce (or the refusal reason).
        let response = http_get(
            self.host,
            RP_INIT_PATH,
            &[
                ("Host", host_header.clone()),
                ("User-Agent", USER_AGENT.to_string()),
                ("Connection", "close".to_string()),
                ("Content-Length", "0".to_string()),
                ("RP-Registkey", self.regist_key.clone()),
                ("Rp-Version", RP_VERSION.to_string()),
            ],
        )
        .await?;
        if response.status != 200 {
            if let Some(reason) = response.headers.get("rp-application-reason") {
                let code = u32::from_str_radix(reason, 16).unwrap_or(0);
                let reason = AppReason::from_code(code);
                error!("failed to init session: {reason}");
                return Err(RemotePlayError::Application(reason));
            }
            return Err(RemotePlayError::AuthFailed(response.status));
        }
        let nonce: [u8; 16] = response
            .headers
            .get("rp-nonce")
            .and_then(|nonce| BASE64.decode(nonce).ok())
            .and_then(|nonce| nonce.try_into().ok())
            .ok_or_else(|| RemotePlayError::Protocol("init response carries no nonce".into()))?;
        debug!("nonce: {}", hex::encode(nonce));

        // Key the control cipher and authenticate.
        let rp_nonce = rp_nonce_transform(&nonce);
        let aes_key = aes_key_transform(&nonce, &self.rp_key);
        let mut cipher = SessionCipher::new(aes_key, rp_nonce);

        let mut regist_key = hex::decode(&self.regist_key)
            .map_err(|err| RemotePlayError::Protocol(format!("regist key is not hex: {err}")))?;
        regist_key.extend_from_slice(&[0u8; 8]);

        let mut did = Vec::with_capacity(40);
        did.extend_from_slice(&DID_PREFIX);
        let mut random = [0u8; 16];
        rand_bytes(&mut random)?;
        did.extend_from_slice(&random);
        did.extend_from_slice(&[0u8; 6]);

        let mut os_type = OS_TYPE.as_bytes().to_vec();
        os_type.resize(10, 0);

        let auth = BASE64.encode(cipher.encrypt(&regist_key)?);
        let did = BASE64.encode(cipher.encrypt(&did)?);
        let os_type = BASE64.encode(cipher.encrypt(&os_type)?);
        let bitrate = BASE64.encode(cipher.encrypt(&[0u8; 4])?);

        let response = http_get(
            self.host,
            RP_SESSION_PATH,
            &[
                ("Host", host_header),
                ("User-Agent", USER_AGENT.to_string()),
                ("Connection", "keep-alive".to_string()),
                ("Content-Length", "0".to_string()),
                ("RP-Auth", auth),
                ("RP-Version", RP_VERSION.to_string()),
                ("RP-Did", did),
                ("RP-ControllerType", "3".to_string()),
                ("RP-ClientType", "11".to_string()),
                ("RP-OSType", os_type),
                ("RP-ConPath", "1".to_string()),
                ("RP-StartBitrate", bitrate),
            ],
        )
        .await?;

        let server_type = response.headers.get("rp-server-type");
        if response.status != 200 || server_type.is_none() {
            return Err(RemotePlayError::AuthFailed(response.status));
        }
        if let Some(server_type) = server_type
            .and_then(|value| BASE64.decode(value).ok())
            .and_then(|value| cipher.decrypt(&value).ok())
        {
            let mut tag = [0u8; 4];
            let len = server_type.len().min(4);
            tag[..len].copy_from_slice(&server_type[..len]);
            self.server_type = Some(u32::from_le_bytes(tag));
            debug!("server type: {:?}", self.server_type);
        }
        info!("session auth success");

        let (reader, writer) = response.stream.into_split();
        Ok((
            ControlLink { writer, cipher },
            FrameReader::new(reader, response.remainder),
        ))
    }

    /// Ask the console to go to standby, then stop the session.
    pub async fn standby(&mut self) -> Result<(), RemotePlayError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| RemotePlayError::Protocol("control channel is not up".into()))?;
        link.lock()
            .await
            .send_message(MessageType::Standby, &[])
            .await?;
        info!("sent standby");
        self.stop().await;
        Ok(())
    }

    /// Stop the session. Idempotent; all tasks exit promptly.
    pub async fn stop(&mut self) {
        if self.shared.stop.is_stopped() {
            debug!("session already stopping");
        } else {
            info!("session received stop signal");
            if let Some(stream) = &self.stream {
                stream.send_disconnect().await;
            }
        }
        self.shared.shutdown();
        if let Some(mut stream) = self.stream.take() {
            stream.join().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Reads and dispatches framed control messages.
async fn control_reader(
    mut reader: FrameReader,
    link: Arc<Mutex<ControlLink>>,
    shared: Arc<Shared>,
    heartbeat: Arc<StdMutex<HeartbeatState>>,
    id_tx: watch::Sender<Option<Vec<u8>>>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.stop.wait() => break,
            frame = reader.read_frame() => frame,
        };
        let (raw_type, payload) = match frame {
            Ok(frame) => frame,
            Err(err) => {
                if !shared.stop.is_stopped() {
                    shared.fail(&err.into());
                }
                break;
            }
        };

        // Any inbound traffic feeds the liveness timer.
        {
            let mut heartbeat = heartbeat.lock().expect("heartbeat lock");
            heartbeat.last_traffic = Instant::now();
            heartbeat.request_sent = false;
        }

        // The receive counter advances for every non-empty payload,
        // whether or not the type is known.
        let payload = if payload.is_empty() {
            payload
        } else {
            match link.lock().await.cipher.decrypt(&payload) {
                Ok(payload) => payload,
                Err(err) => {
                    shared.fail(&err.into());
                    break;
                }
            }
        };

        let Some(msg_type) = MessageType::from_u16(raw_type) else {
            debug!("control message with unknown type {raw_type:#06x}");
            continue;
        };
        debug!("control recv {msg_type:?}");

        match msg_type {
            MessageType::HeartbeatRequest => {
                let sent = link
                    .lock()
                    .await
                    .send_message(MessageType::HeartbeatResponse, &HEARTBEAT_RESPONSE)
                    .await;
                if let Err(err) = sent {
                    shared.fail(&err);
                    break;
                }
            }
            MessageType::HeartbeatResponse => {}
            MessageType::SessionId => {
                if id_tx.borrow().is_some() {
                    warn!("received session id again");
                    continue;
                }
                if payload.len() < 2 {
                    warn!("session id payload too short");
                    continue;
                }
                let session_id = sanitize_session_id(&payload[2..]);
                let _ = id_tx.send(Some(session_id));
            }
            MessageType::Standby => info!("host acknowledged standby"),
            MessageType::Login | MessageType::LoginPinRequest | MessageType::LoginPinResponse => {
                debug!("login message: {msg_type:?}");
            }
            MessageType::KeyboardEnableToggle
            | MessageType::KeyboardOpen
            | MessageType::KeyboardCloseRemote
            | MessageType::KeyboardTextChangeReq
            | MessageType::KeyboardTextChangeRes
            | MessageType::KeyboardCloseReq => {
                debug!("ignoring keyboard message {msg_type:?}");
            }
        }
    }
    debug!("control reader exiting");
}

/// Emits one heartbeat request per quiet period of five seconds.
async fn heartbeat_task(
    link: Arc<Mutex<ControlLink>>,
    shared: Arc<Shared>,
    heartbeat: Arc<StdMutex<HeartbeatState>>,
) {
    loop {
        tokio::select! {
            _ = shared.stop.wait() => break,
            _ = time::sleep(Duration::from_secs(1)) => {}
        }
        if shared.stop.is_stopped() {
            break;
        }
        let due = {
            let mut heartbeat = heartbeat.lock().expect("heartbeat lock");
            if !heartbeat.request_sent
                && heartbeat.last_traffic.elapsed() > HEARTBEAT_TIMEOUT
            {
                heartbeat.request_sent = true;
                true
            } else {
                false
            }
        };
        if due {
            info!("heartbeat timeout, sending request");
            let sent = link
                .lock()
                .await
                .send_message(MessageType::HeartbeatRequest, &[])
                .await;
            if let Err(err) = sent {
                shared.fail(&err);
                break;
            }
        }
    }
    debug!("heartbeat task exiting");
}

/// Tail consumer for stream events after the session reached `Running`.
async fn stream_event_pump(
    mut stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
    shared: Arc<Shared>,
) {
    while let Some(event) = stream_rx.recv().await {
        match event {
            StreamEvent::Stopped(Some(err)) => {
                shared.fail(&err);
                break;
            }
            StreamEvent::Stopped(None) => {
                shared.shutdown();
                break;
            }
            StreamEvent::StreamInfo { audio_config } => {
                if let Some(config) = audio_config {
                    let _ = shared.events.send(SessionEvent::AudioConfig(config));
                }
            }
            StreamEvent::CiphersReady | StreamEvent::Ready => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rp_nonce_transform_formula() {
        let mut nonce = [0u8; 16];
        for (index, byte) in nonce.iter_mut().enumerate() {
            *byte = (index as u8) * 0x11 + 0x11;
        }
        let rp_nonce = rp_nonce_transform(&nonce);
        let offset = usize::from(nonce[0] >> 3) * 112;
        for index in 0..16 {
            let expected = nonce[index]
                .wrapping_add(54)
                .wrapping_add(index as u8)
                ^ keys::SESSION_KEY_0[offset + index];
            assert_eq!(rp_nonce[index], expected);
        }
    }

    #[test]
    fn test_aes_key_transform_formula() {
        let nonce = [0xffu8; 16];
        let rp_key = [0x5au8; 16];
        let key = aes_key_transform(&nonce, &rp_key);
        let offset = usize::from(nonce[7] >> 3) * 112;
        for index in 0..16 {
            let expected = (keys::SESSION_KEY_1[offset + index] ^ rp_key[index])
                .wrapping_add(33)
                .wrapping_add(index as u8)
                ^ nonce[index];
            assert_eq!(key[index], expected);
        }
    }

    #[test]
    fn test_transforms_differ_per_nonce() {
        let nonce_a = [0x00u8; 16];
        let nonce_b = [0xf8u8; 16];
        assert_ne!(rp_nonce_transform(&nonce_a), rp_nonce_transform(&nonce_b));
        let rp_key = [1u8; 16];
        assert_ne!(
            aes_key_transform(&nonce_a, &rp_key),
            aes_key_transform(&nonce_b, &rp_key)
        );
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(MessageType::HeartbeatResponse, &HEARTBEAT_RESPONSE);
        assert_eq!(frame.len(), HEADER_LEN + 8);
        assert_eq!(&frame[0..4], &8u32.to_be_bytes());
        assert_eq!(&frame[4..6], &0x01feu16.to_be_bytes());
        assert_eq!(&frame[6..8], &[0, 0]);
        assert_eq!(&frame[8..], &HEARTBEAT_RESPONSE);
    }

    #[test]
    fn test_message_types_from_wire() {
        assert_eq!(MessageType::from_u16(0x33), Some(MessageType::SessionId));
        assert_eq!(
            MessageType::from_u16(0x8004),
            Some(MessageType::LoginPinResponse)
        );
        assert_eq!(MessageType::from_u16(0x1fe), Some(MessageType::HeartbeatResponse));
        assert_eq!(MessageType::from_u16(0x9999), None);
    }

    #[test]
    fn test_sanitize_session_id() {
        assert_eq!(sanitize_session_id(b"abcDEF123"), b"abcDEF123");
        // A lone 0x9c widens to its UTF-8 encoding.
        let sanitized = sanitize_session_id(&[b'a', 0x9c, b'b']);
        assert_eq!(sanitized, vec![b'a', 0xc2, 0x9c, b'b']);
        assert!(str::from_utf8(&sanitized).is_ok());
    }

    #[test]
    fn test_parse_http_header() {
        let raw = b"HTTP/1.1 200 OK\r\nRP-Nonce: QUJD\r\nRP-Server-Type: eHl6\r\n";
        let (status, headers) = parse_http_header(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers.get("rp-nonce").map(String::as_str), Some("QUJD"));
        assert_eq!(
            headers.get("rp-server-type").map(String::as_str),
            Some("eHl6")
        );
        assert!(parse_http_header(b"garbage").is_err());
    }

    #[test]
    fn test_auth_field_shapes() {
        // Mirror of the field construction in authenticate().
        let mut regist_key = hex::decode("30313233343536373839616263646566").unwrap();
        regist_key.extend_from_slice(&[0u8; 8]);
        assert_eq!(regist_key.len(), 24);

        let mut did = Vec::new();
        did.extend_from_slice(&DID_PREFIX);
        did.extend_from_slice(&[0u8; 16]);
        did.extend_from_slice(&[0u8; 6]);
        assert_eq!(did.len(), 40);
        assert_eq!(&did[..10], &DID_PREFIX);

        let mut os_type = OS_TYPE.as_bytes().to_vec();
        os_type.resize(10, 0);
        assert_eq!(os_type.len(), 10);
        assert!(os_type.starts_with(b"Win10.0.0"));
    }

    #[test]
    fn test_control_frame_cipher_round_trip() {
        let key = [0x21u8; 16];
        let nonce = [0x43u8; 16];
        let mut sender = SessionCipher::new(key, nonce);
        let mut receiver = SessionCipher::new(key, nonce);

        // An empty heartbeat still advances the counters on both ends.
        let empty = sender.encrypt(&[]).unwrap();
        assert!(empty.is_empty());
        let _ = receiver.decrypt(&[]).unwrap();

        let encrypted = sender.encrypt(&HEARTBEAT_RESPONSE).unwrap();
        let frame = build_frame(MessageType::HeartbeatResponse, &encrypted);
        let decrypted = receiver.decrypt(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(decrypted, HEARTBEAT_RESPONSE);
    }

    fn test_shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Shared {
                state: StdMutex::new(SessionState::Init),
                error: StdMutex::new(None),
                stop: StopToken::new(),
                events,
            }),
            events_rx,
        )
    }

    #[test]
    fn test_state_machine_progression() {
        let (shared, mut events) = test_shared();
        for state in [
            SessionState::AuthPending,
            SessionState::ControlReady,
            SessionState::BigPending,
            SessionState::StreamReady,
            SessionState::Running,
        ] {
            shared.set_state(state);
            assert_eq!(shared.state(), state);
            let Some(SessionEvent::StateChanged(emitted)) = events.try_recv().ok() else {
                panic!("no state event for {state:?}");
            };
            assert_eq!(emitted, state);
        }
    }

    #[test]
    fn test_stopped_is_absorbing() {
        let (shared, _events) = test_shared();
        shared.set_state(SessionState::Running);
        shared.shutdown();
        assert_eq!(shared.state(), SessionState::Stopped);
        assert!(shared.stop.is_stopped());

        // No transition leaves Stopped.
        shared.set_state(SessionState::Running);
        assert_eq!(shared.state(), SessionState::Stopped);

        // Shutdown is idempotent.
        shared.shutdown();
        assert_eq!(shared.state(), SessionState::Stopped);
    }

    #[test]
    fn test_fail_records_first_error() {
        let (shared, _events) = test_shared();
        shared.fail(&RemotePlayError::Unreachable);
        shared.fail(&RemotePlayError::Backpressure);
        assert_eq!(
            shared.error.lock().unwrap().as_deref(),
            Some("host did not respond")
        );
        assert_eq!(shared.state(), SessionState::Stopped);
    }
}
