//! Client implementation of the Remote Play streaming protocol: device
//! discovery, registration, session authentication and the encrypted
//! audio/video/feedback transport.

use std::{fmt, fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod crypto;
pub mod ddp;
pub mod device;
pub mod keys;
pub mod profile;
pub mod register;
pub mod session;
pub mod stream;
pub mod stop;
pub mod tracker;

/// TCP port used for registration and session control.
pub const RP_PORT: u16 = 9295;
/// UDP port carrying the media transport.
pub const STREAM_PORT: u16 = 9296;

pub const RP_VERSION: &str = "10.0";
pub const USER_AGENT: &str = "remoteplay Windows";
pub const OS_TYPE: &str = "Win10.0.0";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemotePlayError {
    #[error("host did not respond")]
    Unreachable,
    #[error("host is not in register mode")]
    NotInRegistMode,
    #[error("{0}")]
    Application(AppReason),
    #[error("authentication rejected with status {0}")]
    AuthFailed(u16),
    #[error("remote crypto handshake rejected: {0}")]
    CryptoRejected(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("outbound buffer is full")]
    Backpressure,
    #[error("crypto failure: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Failure reason reported by the host in the `RP-Application-Reason` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppReason {
    RegistFailed,
    InvalidPsnId,
    InUse,
    Crashed,
    VersionMismatch,
    Unknown(u32),
}

impl AppReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x8010_8b09 => Self::RegistFailed,
            0x8010_8b02 => Self::InvalidPsnId,
            0x8010_8b10 => Self::InUse,
            0x8010_8b15 => Self::Crashed,
            0x8010_8b11 => Self::VersionMismatch,
            other => Self::Unknown(other),
        }
    }
}

impl Display for AppReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistFailed => write!(f, "registering failed"),
            Self::InvalidPsnId => write!(f, "PSN ID does not exist on host"),
            Self::InUse => write!(f, "another session is connected to host"),
            Self::Crashed => write!(f, "Remote Play crashed on host; host needs restart"),
            Self::VersionMismatch => write!(f, "Remote Play versions do not match"),
            Self::Unknown(code) => write!(f, "unknown host error {code:#010x}"),
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("failed to parse console type")]
pub struct ParseConsoleTypeError;

/// Console generation a host belongs to. Determines the discovery port and
/// the expected video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsoleType {
    #[serde(rename = "PS4")]
    Ps4,
    #[serde(rename = "PS5")]
    Ps5,
}

impl ConsoleType {
    pub const ALL: [ConsoleType; 2] = [ConsoleType::Ps4, ConsoleType::Ps5];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ps4 => "PS4",
            Self::Ps5 => "PS5",
        }
    }

    /// UDP port the console listens on for discovery messages.
    pub fn ddp_port(&self) -> u16 {
        match self {
            Self::Ps4 => 987,
            Self::Ps5 => 9302,
        }
    }

    pub fn video_codec(&self) -> &'static str {
        match self {
            Self::Ps4 => "h264",
            Self::Ps5 => "h265",
        }
    }
}

impl Display for ConsoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsoleType {
    type Err = ParseConsoleTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PS4" => Ok(Self::Ps4),
            "PS5" => Ok(Self::Ps5),
            _ => Err(ParseConsoleTypeError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionPreset {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Error, Clone)]
#[error("expected one of 360p, 540p, 720p, 1080p")]
pub struct ParseResolutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    R360p,
    R540p,
    R720p,
    R1080p,
}

impl Resolution {
    pub fn preset(&self) -> ResolutionPreset {
        match self {
            Self::R360p => ResolutionPreset {
                width: 640,
                height: 360,
                bitrate_kbps: 2000,
            },
            Self::R540p => ResolutionPreset {
                width: 960,
                height: 540,
                bitrate_kbps: 6000,
            },
            Self::R720p => ResolutionPreset {
                width: 1280,
                height: 720,
                bitrate_kbps: 10000,
            },
            Self::R1080p => ResolutionPreset {
                width: 1920,
                height: 1080,
                bitrate_kbps: 10000,
            },
        }
    }
}

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "360p" => Ok(Self::R360p),
            "540p" => Ok(Self::R540p),
            "720p" => Ok(Self::R720p),
            "1080p" => Ok(Self::R1080p),
            _ => Err(ParseResolutionError),
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("expected one of low, high, 30, 60")]
pub struct ParseFpsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fps {
    Low,
    High,
}

impl Fps {
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Low => 30,
            Self::High => 60,
        }
    }
}

impl FromStr for Fps {
    type Err = ParseFpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "30" => Ok(Self::Low),
            "high" | "60" => Ok(Self::High),
            _ => Err(ParseFpsError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_reason_codes() {
        assert_eq!(AppReason::from_code(0x80108b09), AppReason::RegistFailed);
        assert_eq!(AppReason::from_code(0x80108b02), AppReason::InvalidPsnId);
        assert_eq!(AppReason::from_code(0x80108b10), AppReason::InUse);
        assert_eq!(AppReason::from_code(0x80108b15), AppReason::Crashed);
        assert_eq!(
            AppReason::from_code(0x80108b11),
            AppReason::VersionMismatch
        );
        assert_eq!(
            AppReason::from_code(0x80108bff),
            AppReason::Unknown(0x80108bff)
        );
    }

    #[test]
    fn test_resolution_presets() {
        assert_eq!("720p".parse::<Resolution>().unwrap(), Resolution::R720p);
        let preset = Resolution::R1080p.preset();
        assert_eq!((preset.width, preset.height), (1920, 1080));
        assert_eq!("high".parse::<Fps>().unwrap().as_u32(), 60);
    }
}
