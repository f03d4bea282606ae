//! Takion protobuf messages and the launch-spec negotiation blob.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use prost::Message;
use serde::Serialize;

use crate::ResolutionPreset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    Big = 0,
    Bang = 1,
    Info = 2,
    Heartbeat = 3,
    PacketLoss = 4,
    CorruptFrame = 5,
    Cursor = 6,
    Timer = 7,
    Disconnect = 8,
    Log = 9,
    HeaderRequest = 10,
    Debug = 11,
    Senkusha = 12,
    StreamInfo = 13,
    StreamInfoAck = 14,
    XmbCommand = 15,
    ConnectionQuality = 16,
    ClientMetric = 17,
    PlayTimeLeft = 18,
    DeepLink = 19,
    ClientInfo = 20,
    FrameLostEvent = 21,
    PeriodicTimestamp = 22,
    ServerMessage = 23,
}

#[derive(Clone, PartialEq, Message)]
pub struct TakionMessage {
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "8")]
    pub big_payload: Option<BigPayload>,
    #[prost(message, optional, tag = "9")]
    pub bang_payload: Option<BangPayload>,
    #[prost(message, optional, tag = "10")]
    pub stream_info_payload: Option<StreamInfoPayload>,
    #[prost(message, optional, tag = "12")]
    pub disconnect_payload: Option<DisconnectPayload>,
    #[prost(message, optional, tag = "14")]
    pub corrupt_payload: Option<CorruptFramePayload>,
    #[prost(message, optional, tag = "20")]
    pub senkusha_payload: Option<SenkushaPayload>,
}

impl TakionMessage {
    pub fn payload_type(&self) -> Option<PayloadType> {
        PayloadType::try_from(self.r#type).ok()
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct BigPayload {
    #[prost(uint32, tag = "1")]
    pub client_version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub session_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub launch_spec: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub encrypted_key: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub ecdh_pub_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub ecdh_sig: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BangPayload {
    #[prost(bool, tag = "1")]
    pub version_accepted: bool,
    #[prost(bool, tag = "2")]
    pub encrypted_key_accepted: bool,
    #[prost(bytes = "vec", tag = "3")]
    pub ecdh_pub_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub ecdh_sig: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResolutionPayload {
    #[prost(uint32, tag = "1")]
    pub width: u32,
    #[prost(uint32, tag = "2")]
    pub height: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub video_header: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamInfoPayload {
    #[prost(message, repeated, tag = "1")]
    pub resolution: Vec<ResolutionPayload>,
    #[prost(bytes = "vec", tag = "2")]
    pub audio_header: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub start_timeout: u32,
    #[prost(uint32, tag = "4")]
    pub afk_timeout: u32,
    #[prost(uint32, tag = "5")]
    pub afk_timeout_disconnect: u32,
    #[prost(uint32, tag = "6")]
    pub congestion_control_interval: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DisconnectPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub reason: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CorruptFramePayload {
    #[prost(uint32, tag = "1")]
    pub start: u32,
    #[prost(uint32, tag = "2")]
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum SenkushaCommand {
    EchoCommand = 0,
    MtuCommand = 1,
    ClientMtuCommand = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct SenkushaPayload {
    #[prost(enumeration = "SenkushaCommand", tag = "1")]
    pub command: i32,
    #[prost(message, optional, tag = "2")]
    pub echo_command: Option<EchoCommand>,
    #[prost(message, optional, tag = "3")]
    pub mtu_command: Option<MtuCommand>,
    #[prost(message, optional, tag = "4")]
    pub client_mtu_command: Option<ClientMtuCommand>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EchoCommand {
    #[prost(bool, tag = "1")]
    pub state: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct MtuCommand {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub mtu_req: u32,
    #[prost(uint32, optional, tag = "3")]
    pub mtu_sent: Option<u32>,
    #[prost(uint32, tag = "4")]
    pub num: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientMtuCommand {
    #[prost(bool, tag = "1")]
    pub state: bool,
    #[prost(uint32, tag = "2")]
    pub id: u32,
    #[prost(uint32, tag = "3")]
    pub mtu_req: u32,
    #[prost(uint32, tag = "4")]
    pub mtu_down: u32,
}

fn message(payload_type: PayloadType) -> TakionMessage {
    TakionMessage {
        r#type: payload_type as i32,
        ..Default::default()
    }
}

pub fn big_payload(
    client_version: u32,
    session_key: &[u8],
    launch_spec: &[u8],
    encrypted_key: &[u8],
    ecdh_pub_key: &[u8],
    ecdh_sig: &[u8],
) -> Vec<u8> {
    let mut msg = message(PayloadType::Big);
    msg.big_payload = Some(BigPayload {
        client_version,
        session_key: session_key.to_vec(),
        launch_spec: launch_spec.to_vec(),
        encrypted_key: encrypted_key.to_vec(),
        ecdh_pub_key: Some(ecdh_pub_key.to_vec()),
        ecdh_sig: Some(ecdh_sig.to_vec()),
    });
    msg.encode_to_vec()
}

/// Report a frame range that could not be reassembled so the server can
/// force a keyframe.
pub fn corrupt_frame(start: u32, end: u32) -> Vec<u8> {
    let mut msg = message(PayloadType::CorruptFrame);
    msg.corrupt_payload = Some(CorruptFramePayload { start, end });
    msg.encode_to_vec()
}

pub fn disconnect() -> Vec<u8> {
    let mut msg = message(PayloadType::Disconnect);
    msg.disconnect_payload = Some(DisconnectPayload {
        reason: b"Client Disconnecting".to_vec(),
    });
    msg.encode_to_vec()
}

pub fn heartbeat() -> Vec<u8> {
    message(PayloadType::Heartbeat).encode_to_vec()
}

pub fn stream_info_ack() -> Vec<u8> {
    message(PayloadType::StreamInfoAck).encode_to_vec()
}

pub fn senkusha_echo(state: bool) -> Vec<u8> {
    let mut msg = message(PayloadType::Senkusha);
    msg.senkusha_payload = Some(SenkushaPayload {
        command: SenkushaCommand::EchoCommand as i32,
        echo_command: Some(EchoCommand { state }),
        ..Default::default()
    });
    msg.encode_to_vec()
}

pub fn senkusha_mtu(id: u32, mtu_req: u32, num: u32) -> Vec<u8> {
    let mut msg = message(PayloadType::Senkusha);
    msg.senkusha_payload = Some(SenkushaPayload {
        command: SenkushaCommand::MtuCommand as i32,
        mtu_command: Some(MtuCommand {
            id,
            mtu_req,
            mtu_sent: None,
            num,
        }),
        ..Default::default()
    });
    msg.encode_to_vec()
}

pub fn senkusha_mtu_client(state: bool, id: u32, mtu_req: u32, mtu_down: u32) -> Vec<u8> {
    let mut msg = message(PayloadType::Senkusha);
    msg.senkusha_payload = Some(SenkushaPayload {
        command: SenkushaCommand::ClientMtuCommand as i32,
        client_mtu_command: Some(ClientMtuCommand {
            state,
            id,
            mtu_req,
            mtu_down,
        }),
        ..Default::default()
    });
    msg.encode_to_vec()
}

// Launch spec. Field order matters to the receiver, so the structs mirror
// the expected document exactly.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchSpec<'a> {
    session_id: &'a str,
    stream_resolutions: [StreamResolution; 1],
    network: Network,
    slot_id: u32,
    app_specification: AppSpecification<'a>,
    konan: Konan<'a>,
    request_game_specification: RequestGameSpecification<'a>,
    user_profile: LaunchUserProfile<'a>,
    handshake_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamResolution {
    resolution: Size,
    max_fps: u32,
    score: u32,
}

#[derive(Serialize)]
struct Size {
    width: u32,
    height: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Network {
    bw_kbps_sent: u32,
    bw_loss: f64,
    mtu: u32,
    rtt: u32,
    ports: [u16; 2],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppSpecification<'a> {
    min_fps: u32,
    min_bandwidth: u32,
    ext_title_id: &'a str,
    version: u32,
    time_limit: u32,
    start_timeout: u32,
    afk_timeout: u32,
    afk_timeout_disconnect: u32,
}

#[derive(Serialize)]
struct Konan<'a> {
    #[serde(rename = "ps3AccessToken")]
    ps3_access_token: &'a str,
    #[serde(rename = "ps3RefreshToken")]
    ps3_refresh_token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestGameSpecification<'a> {
    model: &'a str,
    platform: &'a str,
    audio_channels: &'a str,
    language: &'a str,
    accept_button: &'a str,
    connected_controllers: [&'a str; 3],
    yuv_coefficient: &'a str,
    video_encoder_profile: &'a str,
    audio_encoder_profile: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchUserProfile<'a> {
    online_id: &'a str,
    np_id: &'a str,
    region: &'a str,
    languages_used: [&'a str; 2],
}

/// Build the minified launch-spec document. The receiver requires the loss
/// rate spelled with six decimals and a trailing NUL byte.
pub fn launch_spec(
    session_id: &str,
    resolution: &ResolutionPreset,
    max_fps: u32,
    mtu: u32,
    rtt_secs: u32,
    handshake_key: &[u8; 16],
) -> Vec<u8> {
    let spec = LaunchSpec {
        session_id,
        stream_resolutions: [StreamResolution {
            resolution: Size {
                width: resolution.width,
                height: resolution.height,
            },
            max_fps,
            score: 10,
        }],
        network: Network {
            bw_kbps_sent: resolution.bitrate_kbps,
            bw_loss: 0.001,
            mtu,
            rtt: rtt_secs,
            ports: [53, 2053],
        },
        slot_id: 1,
        app_specification: AppSpecification {
            min_fps: 30,
            min_bandwidth: 0,
            ext_title_id: "ps3",
            version: 1,
            time_limit: 1,
            start_timeout: 100,
            afk_timeout: 100,
            afk_timeout_disconnect: 100,
        },
        konan: Konan {
            ps3_access_token: "accessToken",
            ps3_refresh_token: "refreshToken",
        },
        request_game_specification: RequestGameSpecification {
            model: "bravia_tv",
            platform: "android",
            audio_channels: "5.1",
            language: "sp",
            accept_button: "X",
            connected_controllers: ["xinput", "ds3", "ds4"],
            yuv_coefficient: "bt601",
            video_encoder_profile: "hw4.1",
            audio_encoder_profile: "audio1",
        },
        user_profile: LaunchUserProfile {
            online_id: "psnId",
            np_id: "npId",
            region: "US",
            languages_used: ["en", "jp"],
        },
        handshake_key: BASE64.encode(handshake_key),
    };

    let json = serde_json::to_string(&spec).expect("launch spec serializes");
    let json = json.replace(":0.001,", ":0.001000,");
    let mut bytes = json.into_bytes();
    bytes.push(0);
    bytes
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Resolution;

    #[test]
    fn test_big_payload_round_trip() {
        let data = big_payload(9, b"session", b"spec", &[0, 0, 0, 0], b"pubkey", b"sig");
        let msg = TakionMessage::decode(data.as_slice()).unwrap();
        assert_eq!(msg.payload_type(), Some(PayloadType::Big));
        let big = msg.big_payload.unwrap();
        assert_eq!(big.client_version, 9);
        assert_eq!(big.session_key, b"session");
        assert_eq!(big.encrypted_key, vec![0u8; 4]);
        assert_eq!(big.ecdh_pub_key.as_deref(), Some(&b"pubkey"[..]));
        assert_eq!(big.ecdh_sig.as_deref(), Some(&b"sig"[..]));
    }

    #[test]
    fn test_corrupt_frame_round_trip() {
        let data = corrupt_frame(7, 7);
        let msg = TakionMessage::decode(data.as_slice()).unwrap();
        assert_eq!(msg.payload_type(), Some(PayloadType::CorruptFrame));
        let corrupt = msg.corrupt_payload.unwrap();
        assert_eq!((corrupt.start, corrupt.end), (7, 7));
    }

    #[test]
    fn test_stream_info_ack_is_bare() {
        let data = stream_info_ack();
        let msg = TakionMessage::decode(data.as_slice()).unwrap();
        assert_eq!(msg.payload_type(), Some(PayloadType::StreamInfoAck));
        assert!(msg.stream_info_payload.is_none());
        assert!(msg.big_payload.is_none());
    }

    #[test]
    fn test_senkusha_builders() {
        let msg = TakionMessage::decode(senkusha_mtu(1, 1454, 1).as_slice()).unwrap();
        let payload = msg.senkusha_payload.unwrap();
        assert_eq!(payload.command, SenkushaCommand::MtuCommand as i32);
        assert_eq!(payload.mtu_command.unwrap().mtu_req, 1454);

        let msg = TakionMessage::decode(senkusha_echo(true).as_slice()).unwrap();
        assert!(msg.senkusha_payload.unwrap().echo_command.unwrap().state);
    }

    #[test]
    fn test_launch_spec_document() {
        let preset = Resolution::R720p.preset();
        let key = [0xaau8; 16];
        let bytes = launch_spec("sessionId4321", &preset, 60, 1454, 1, &key);

        assert_eq!(*bytes.last().unwrap(), 0);
        let json = str::from_utf8(&bytes[..bytes.len() - 1]).unwrap();
        // Minified, with the loss rate widened to six decimals.
        assert!(!json.contains(' '));
        assert!(json.contains("\"bwLoss\":0.001000,"));
        assert!(json.starts_with("{\"sessionId\":\"sessionId4321\""));
        assert!(json.contains("\"resolution\":{\"width\":1280,\"height\":720}"));
        assert!(json.contains("\"maxFps\":60"));
        assert!(json.contains("\"mtu\":1454"));
        assert!(json.contains("\"ports\":[53,2053]"));
        assert!(json.contains(&format!("\"handshakeKey\":\"{}\"", BASE64.encode(key))));
        assert!(json.ends_with('}'));

        let parsed: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(parsed["slotId"], 1);
        assert_eq!(parsed["appSpecification"]["extTitleId"], "ps3");
        assert_eq!(parsed["konan"]["ps3AccessToken"], "accessToken");
        assert_eq!(parsed["userProfile"]["region"], "US");
    }
}
