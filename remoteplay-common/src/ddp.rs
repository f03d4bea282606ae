//! Device Discovery Protocol: plain-text search, wakeup and launch
//! messages over UDP, one port per console generation.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use log::debug;
use tokio::{net::UdpSocket, time};

use crate::{ConsoleType, RemotePlayError};

pub const DDP_VERSION: &str = "00030010";
pub const BROADCAST: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

pub const STATUS_OK: u32 = 200;
pub const STATUS_STANDBY: u32 = 620;

pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

const RECV_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdpCommand {
    Search,
    Wakeup,
    Launch,
}

impl DdpCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "SRCH",
            Self::Wakeup => "WAKEUP",
            Self::Launch => "LAUNCH",
        }
    }
}

/// Last observed status of a host, parsed from a discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    pub code: u32,
    pub status: String,
    pub host_ip: Option<IpAddr>,
    pub host_type: Option<String>,
    pub host_id: Option<String>,
    pub host_name: Option<String>,
    pub running_app_name: Option<String>,
    pub running_app_titleid: Option<String>,
    /// Response fields the core does not interpret.
    pub extra: HashMap<String, String>,
}

impl DeviceStatus {
    pub fn is_ok(&self) -> bool {
        self.code == STATUS_OK
    }

    pub fn is_standby(&self) -> bool {
        self.code == STATUS_STANDBY
    }

    pub fn console_type(&self) -> Option<ConsoleType> {
        self.host_type.as_deref()?.parse().ok()
    }
}

pub fn build_message(command: DdpCommand, fields: &[(&str, String)]) -> String {
    let mut msg = format!("{} * HTTP/1.1\n", command.as_str());
    for (key, value) in fields {
        msg.push_str(&format!("{key}:{value}\n"));
    }
    msg.push_str(&format!(
        "device-discovery-protocol-version:{DDP_VERSION}\n"
    ));
    msg
}

pub fn search_message() -> String {
    build_message(DdpCommand::Search, &[])
}

pub fn wakeup_message(credential: u64) -> String {
    build_message(
        DdpCommand::Wakeup,
        &[
            ("user-credential", credential.to_string()),
            ("client-type", "vr".to_string()),
            ("auth-type", "R".to_string()),
            ("model", "w".to_string()),
            ("app-type", "r".to_string()),
        ],
    )
}

pub fn launch_message(credential: u64) -> String {
    build_message(
        DdpCommand::Launch,
        &[
            ("user-credential", credential.to_string()),
            ("client-type", "a".to_string()),
            ("auth-type", "C".to_string()),
        ],
    )
}

/// Decode a stored RegistKey into the integer credential the console
/// expects in wakeup and launch messages. The stored key is hex of an
/// ASCII hex string of the credential.
pub fn credential_from_regist_key(regist_key: &str) -> Result<u64, RemotePlayError> {
    let decoded = hex::decode(regist_key)
        .map_err(|err| RemotePlayError::Protocol(format!("regist key is not hex: {err}")))?;
    let text = str::from_utf8(&decoded)
        .map_err(|err| RemotePlayError::Protocol(format!("regist key is not ascii: {err}")))?;
    u64::from_str_radix(text.trim_end_matches('\0'), 16)
        .map_err(|err| RemotePlayError::Protocol(format!("regist key is not a credential: {err}")))
}

/// Parse a discovery response. Returns `None` for datagrams that are not a
/// status response (our own broadcast searches included).
pub fn parse_response(data: &[u8]) -> Option<DeviceStatus> {
    let Ok(text) = str::from_utf8(data) else {
        debug!("discovery message is not utf-8: {}", hex::encode(data));
        return None;
    };
    if text.contains("SRCH") {
        return None;
    }

    let mut status = DeviceStatus::default();
    let mut any = false;
    for raw in text.lines() {
        // The app name may itself contain colons; keep the value verbatim.
        if let Some(value) = raw.strip_prefix("running-app-name:") {
            status.running_app_name = Some(value.to_string());
            any = true;
            continue;
        }
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("HTTP/1.1 ") {
            let mut parts = rest.splitn(2, ' ');
            if let Ok(code) = parts.next().unwrap_or_default().parse() {
                status.code = code;
                status.status = parts.next().unwrap_or_default().to_string();
                any = true;
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            debug!("discovery line without key/value: {line}");
            continue;
        };
        any = true;
        match key {
            "host-type" => status.host_type = Some(value.to_string()),
            "host-id" => status.host_id = Some(value.to_string()),
            "host-name" => status.host_name = Some(value.to_string()),
            "host-ip" => status.host_ip = value.parse().ok(),
            "running-app-titleid" => status.running_app_titleid = Some(value.to_string()),
            _ => {
                status.extra.insert(key.to_string(), value.to_string());
            }
        }
    }
    any.then_some(status)
}

async fn broadcast_socket() -> Result<UdpSocket, RemotePlayError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn send_to_all_ports(
    socket: &UdpSocket,
    target: IpAddr,
    message: &str,
) -> Result<(), RemotePlayError> {
    for kind in ConsoleType::ALL {
        socket
            .send_to(message.as_bytes(), (target, kind.ddp_port()))
            .await?;
    }
    Ok(())
}

/// Search for hosts. With a target address the first response wins; a
/// broadcast search collects every response within the timeout.
pub async fn search(
    host: Option<IpAddr>,
    timeout: Duration,
) -> Result<Vec<DeviceStatus>, RemotePlayError> {
    let socket = broadcast_socket().await?;
    let target = host.unwrap_or(BROADCAST);
    send_to_all_ports(&socket, target, &search_message()).await?;

    let mut found: Vec<DeviceStatus> = Vec::new();
    let deadline = time::Instant::now() + timeout;
    let mut buf = [0u8; RECV_BUFFER];
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let received = match time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(err)) => {
                debug!("discovery receive error: {err}");
                continue;
            }
            Ok(Ok(received)) => received,
        };
        let (len, addr) = received;
        if let Some(mut status) = parse_response(&buf[..len]) {
            status.host_ip.get_or_insert(addr.ip());
            if !found.contains(&status) {
                debug!("discovered {:?} at {}", status.host_name, addr.ip());
                found.push(status);
            }
            if host.is_some() {
                break;
            }
        }
    }
    Ok(found)
}

/// Status of a single host, if it responds within the timeout.
pub async fn status(
    host: IpAddr,
    timeout: Duration,
) -> Result<Option<DeviceStatus>, RemotePlayError> {
    Ok(search(Some(host), timeout).await?.into_iter().next())
}

/// Wake a standby host using the stored registration credential.
pub async fn wakeup(
    host: IpAddr,
    kind: ConsoleType,
    credential: u64,
) -> Result<(), RemotePlayError> {
    let socket = broadcast_socket().await?;
    socket
        .send_to(wakeup_message(credential).as_bytes(), (host, kind.ddp_port()))
        .await?;
    Ok(())
}

/// Ask the host to launch Remote Play.
pub async fn launch(
    host: IpAddr,
    kind: ConsoleType,
    credential: u64,
) -> Result<(), RemotePlayError> {
    let socket = broadcast_socket().await?;
    socket
        .send_to(launch_message(credential).as_bytes(), (host, kind.ddp_port()))
        .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_search_message_shape() {
        let msg = search_message();
        assert!(msg.starts_with("SRCH * HTTP/1.1\n"));
        assert!(msg.ends_with("device-discovery-protocol-version:00030010\n"));
    }

    #[test]
    fn test_wakeup_message_round_trip() {
        let msg = wakeup_message(0x1234_5678);
        let status = parse_response(msg.as_bytes()).unwrap();
        assert_eq!(
            status.extra.get("user-credential").map(String::as_str),
            Some("305419896")
        );
        assert_eq!(status.extra.get("client-type").map(String::as_str), Some("vr"));
        assert_eq!(status.extra.get("auth-type").map(String::as_str), Some("R"));
        assert_eq!(
            status
                .extra
                .get("device-discovery-protocol-version")
                .map(String::as_str),
            Some(DDP_VERSION)
        );
    }

    #[test]
    fn test_launch_message_round_trip() {
        let msg = launch_message(42);
        let status = parse_response(msg.as_bytes()).unwrap();
        assert_eq!(status.extra.get("user-credential").map(String::as_str), Some("42"));
        assert_eq!(status.extra.get("auth-type").map(String::as_str), Some("C"));
    }

    #[test]
    fn test_parse_status_response() {
        let response = "HTTP/1.1 200 Ok\n\
                        host-id:1234567890AB\n\
                        host-type:PS4\n\
                        host-name:Living Room\n\
                        running-app-name:Game: The Sequel: Remastered\n\
                        running-app-titleid:CUSA00001\n\
                        host-request-port:997\n";
        let status = parse_response(response.as_bytes()).unwrap();
        assert_eq!(status.code, 200);
        assert_eq!(status.status, "Ok");
        assert!(status.is_ok());
        assert_eq!(status.console_type(), Some(ConsoleType::Ps4));
        assert_eq!(status.host_name.as_deref(), Some("Living Room"));
        // Colons inside the app name survive verbatim.
        assert_eq!(
            status.running_app_name.as_deref(),
            Some("Game: The Sequel: Remastered")
        );
        assert_eq!(status.running_app_titleid.as_deref(), Some("CUSA00001"));
        assert_eq!(
            status.extra.get("host-request-port").map(String::as_str),
            Some("997")
        );
    }

    #[test]
    fn test_parse_standby_response() {
        let status = parse_response(b"HTTP/1.1 620 Server Standby\nhost-id:AA\n").unwrap();
        assert!(status.is_standby());
        assert_eq!(status.status, "Server Standby");
    }

    #[test]
    fn test_parse_rejects_search_and_garbage() {
        assert!(parse_response(search_message().as_bytes()).is_none());
        assert!(parse_response(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_credential_from_regist_key() {
        // "1234abcd" as ASCII, hex encoded.
        let stored = hex::encode(b"1234abcd");
        assert_eq!(credential_from_regist_key(&stored).unwrap(), 0x1234abcd);
        assert!(credential_from_regist_key("zz").is_err());
    }
}
