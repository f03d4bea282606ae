//! One-time registration with a console: the `SRC2`/`RES2` probe followed
//! by the encrypted credential POST.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use log::{debug, error, info};
use openssl::rand::rand_bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time,
};

use crate::{
    ConsoleType, RP_PORT, RP_VERSION, RemotePlayError, USER_AGENT, crypto::SessionCipher, keys,
};

pub const CLIENT_TYPE: &str = "dabfa2ec873de5839bee8d3f4c0239c4282c07c25c6077a2931afcf0adc0d34f";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const REG_INIT: &[u8; 4] = b"SRC2";
const REG_START: &[u8; 4] = b"RES2";
const REG_PAYLOAD_LEN: usize = 480;
const REG_KEY_SIZE: usize = 16;

/// Credentials issued by the console for one user.
#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    pub kind: ConsoleType,
    pub mac: String,
    pub nickname: String,
    pub regist_key: String,
    pub rp_key: String,
    /// Every decrypted response field, keyed as sent by the console.
    pub fields: HashMap<String, String>,
}

fn key_0(pin: u32) -> [u8; 16] {
    let mut key = [0u8; REG_KEY_SIZE];
    for (index, byte) in key.iter_mut().enumerate() {
        *byte = keys::REG_KEY_0[index * 32 + 1];
    }
    // The PIN is folded into the last four bytes, big endian.
    for (shift, index) in (12..REG_KEY_SIZE).enumerate() {
        key[index] ^= (pin >> (24 - shift * 8)) as u8;
    }
    key
}

fn key_1(nonce: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; REG_KEY_SIZE];
    for (index, byte) in key.iter_mut().enumerate() {
        let shift = keys::REG_KEY_1[index * 32 + 8];
        *byte = (nonce[index] ^ shift)
            .wrapping_add(41)
            .wrapping_add(index as u8);
    }
    key
}

fn payload(key_1: &[u8; 16]) -> [u8; REG_PAYLOAD_LEN] {
    let mut payload = [b'A'; REG_PAYLOAD_LEN];
    payload[199..207].copy_from_slice(&key_1[8..]);
    payload[401..409].copy_from_slice(&key_1[..8]);
    payload
}

fn headers(payload_len: usize) -> String {
    // The console expects this exact malformed request line; do not fix it.
    format!(
        "POST /sie/ps4/rp/sess/rgst HTTP/1.1\r\n HTTP/1.1\r\n\
         HOST: 10.0.2.15\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Connection: close\r\n\
         Content-Length: {payload_len}\r\n\
         RP-Version: {RP_VERSION}\r\n\r\n"
    )
}

fn parse_response(
    cipher: &mut SessionCipher,
    response: &[u8],
) -> Result<RegistrationRecord, RemotePlayError> {
    let mut parts = response.split(|&byte| byte == b'\n');
    let status_line = parts.next().unwrap_or_default();
    let status_line = String::from_utf8_lossy(status_line);
    if !status_line.contains("200 OK") {
        error!("registration rejected: {}", status_line.trim_end());
        let code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        return Err(RemotePlayError::AuthFailed(code));
    }

    let body = response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| &response[at + 4..])
        .filter(|body| !body.is_empty())
        .ok_or_else(|| RemotePlayError::Protocol("registration response has no body".into()))?;

    let decrypted = cipher.decrypt(body)?;
    let text = String::from_utf8_lossy(&decrypted);
    let mut fields = HashMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(": ") else {
            debug!("registration line without key/value: {line}");
            continue;
        };
        fields.insert(key.to_string(), value.to_string());
    }

    let kind = ConsoleType::ALL
        .into_iter()
        .find(|kind| fields.contains_key(&format!("{kind}-RegistKey")))
        .ok_or_else(|| {
            RemotePlayError::Protocol("registration response names no console type".into())
        })?;
    let field = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| RemotePlayError::Protocol(format!("registration is missing {name}")))
    };

    Ok(RegistrationRecord {
        kind,
        mac: field(&format!("{kind}-Mac"))?,
        nickname: field(&format!("{kind}-Nickname"))?,
        regist_key: field(&format!("{kind}-RegistKey"))?,
        rp_key: field("RP-Key")?,
        fields,
    })
}

/// Probe whether the console is accepting registrations.
async fn init_probe(host: IpAddr, timeout: Duration) -> Result<(), RemotePlayError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.send_to(REG_INIT, (host, RP_PORT)).await?;

    let mut buf = [0u8; 32];
    let received = time::timeout(timeout, socket.recv_from(&mut buf)).await;
    match received {
        Ok(Ok((len, _))) if buf[..len].starts_with(REG_START) => {
            info!("register started");
            Ok(())
        }
        Ok(Ok(_)) => {
            error!("unknown register response");
            Err(RemotePlayError::NotInRegistMode)
        }
        Ok(Err(err)) => Err(err.into()),
        Err(_) => {
            error!(
                "device not in register mode; go to Settings -> \
                 Remote Play Connection Settings -> Add Device"
            );
            Err(RemotePlayError::NotInRegistMode)
        }
    }
}

/// Register this client with the console and return the issued credentials.
/// `pin` is the 8-digit number the console displays.
pub async fn register(
    host: IpAddr,
    psn_id: &str,
    pin: u32,
    timeout: Duration,
) -> Result<RegistrationRecord, RemotePlayError> {
    init_probe(host, timeout).await?;

    let mut nonce = [0u8; 16];
    rand_bytes(&mut nonce)?;
    let key_0 = key_0(pin);
    let key_1 = key_1(&nonce);
    let mut cipher = SessionCipher::new(key_0, nonce);

    let body = format!("Client-Type: {CLIENT_TYPE}\r\nNp-AccountId: {psn_id}\r\n");
    let encrypted = cipher.encrypt(body.as_bytes())?;
    let mut request = Vec::with_capacity(REG_PAYLOAD_LEN + encrypted.len() + 256);
    let payload_len = REG_PAYLOAD_LEN + encrypted.len();
    request.extend_from_slice(headers(payload_len).as_bytes());
    request.extend_from_slice(&payload(&key_1));
    request.extend_from_slice(&encrypted);

    let mut stream = time::timeout(timeout, TcpStream::connect((host, RP_PORT)))
        .await
        .map_err(|_| RemotePlayError::Timeout("register connect"))??;
    stream.set_nodelay(true)?;
    stream.write_all(&request).await?;

    let mut response = Vec::new();
    time::timeout(timeout, stream.read_to_end(&mut response))
        .await
        .map_err(|_| RemotePlayError::Timeout("register response"))??;
    if response.is_empty() {
        return Err(RemotePlayError::Protocol("empty registration response".into()));
    }

    let record = parse_response(&mut cipher, &response)?;
    info!(
        "registered with {} \"{}\" ({})",
        record.kind, record.nickname, record.mac
    );
    Ok(record)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_0_folds_pin_into_tail() {
        let key_no_pin = key_0(0);
        let key = key_0(0x1234_5678);
        assert_eq!(key[..12], key_no_pin[..12]);
        assert_eq!(key[12], key_no_pin[12] ^ 0x12);
        assert_eq!(key[13], key_no_pin[13] ^ 0x34);
        assert_eq!(key[14], key_no_pin[14] ^ 0x56);
        assert_eq!(key[15], key_no_pin[15] ^ 0x78);
        for (index, byte) in key_no_pin.iter().enumerate() {
            assert_eq!(*byte, keys::REG_KEY_0[index * 32 + 1]);
        }
    }

    #[test]
    fn test_key_1_transform() {
        let nonce = [0x42u8; 16];
        let key = key_1(&nonce);
        for index in 0..16 {
            let expected = (nonce[index] ^ keys::REG_KEY_1[index * 32 + 8])
                .wrapping_add(41)
                .wrapping_add(index as u8);
            assert_eq!(key[index], expected);
        }
    }

    #[test]
    fn test_payload_overlays() {
        let key = [
            0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
        ];
        let payload = payload(&key);
        assert_eq!(payload.len(), REG_PAYLOAD_LEN);
        assert_eq!(&payload[..199], &[b'A'; 199][..]);
        assert_eq!(&payload[199..207], &key[8..]);
        assert_eq!(&payload[207..401], &[b'A'; 194][..]);
        assert_eq!(&payload[401..409], &key[..8]);
        assert_eq!(&payload[409..], &[b'A'; 71][..]);
    }

    #[test]
    fn test_headers_keep_doubled_request_line() {
        let headers = headers(500);
        assert!(headers.starts_with("POST /sie/ps4/rp/sess/rgst HTTP/1.1\r\n HTTP/1.1\r\n"));
        assert!(headers.contains("Content-Length: 500\r\n"));
        assert!(headers.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_response_round_trip() {
        let nonce = [0x07u8; 16];
        let key = key_0(12345678);
        // The console's first response encryption and the client's first
        // decryption both run at counter zero; the client's request
        // encryption only advanced its send counter.
        let mut console = SessionCipher::new(key, nonce);
        let mut client = SessionCipher::new(key, nonce);
        let _ = client.encrypt(b"request body").unwrap();

        let body = "PS5-Mac: aabbccddeeff\r\n\
                    PS5-RegistKey: 30313233343536373839616263646566\r\n\
                    PS5-Nickname: MyConsole\r\n\
                    RP-Key: 000102030405060708090a0b0c0d0e0f\r\n";
        let encrypted = console.encrypt(body.as_bytes()).unwrap();
        let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\n".to_vec();
        response.extend_from_slice(&encrypted);

        let record = parse_response(&mut client, &response).unwrap();
        assert_eq!(record.kind, ConsoleType::Ps5);
        assert_eq!(record.mac, "aabbccddeeff");
        assert_eq!(record.nickname, "MyConsole");
        assert_eq!(record.regist_key, "30313233343536373839616263646566");
        assert_eq!(record.rp_key, "000102030405060708090a0b0c0d0e0f");
        assert!(record.fields.contains_key("PS5-RegistKey"));
    }

    #[test]
    fn test_parse_response_rejects_failure() {
        let mut cipher = SessionCipher::new([0u8; 16], [0u8; 16]);
        let err = parse_response(&mut cipher, b"HTTP/1.1 403 Forbidden\r\n\r\n").unwrap_err();
        assert!(matches!(err, RemotePlayError::AuthFailed(403)));
    }
}
