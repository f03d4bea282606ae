//! User profile records. The persistent store belongs to the embedding
//! application; the core only reads credentials out of it during session
//! setup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ConsoleType, RemotePlayError, register::RegistrationRecord};

/// All profiles known to the client, keyed by PSN username.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profiles(pub HashMap<String, UserProfile>);

impl Profiles {
    pub fn user(&self, name: &str) -> Option<&UserProfile> {
        self.0.get(name)
    }

    pub fn user_mut(&mut self, name: &str) -> Option<&mut UserProfile> {
        self.0.get_mut(name)
    }
}

/// A PSN identity and its per-console credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Opaque account id, base64 as issued by PSN.
    pub id: String,
    /// Host credentials keyed by console hardware id.
    #[serde(default)]
    pub hosts: HashMap<String, HostProfile>,
}

impl UserProfile {
    pub fn host(&self, mac: &str) -> Option<&HostProfile> {
        self.hosts.get(mac)
    }

    pub fn update_host(&mut self, record: &RegistrationRecord) {
        self.hosts
            .insert(record.mac.clone(), HostProfile::from_record(record));
    }
}

/// Credentials for one (user, console) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    #[serde(rename = "type")]
    pub kind: ConsoleType,
    /// Raw response fields from registration, keyed as the console sent
    /// them (`PS4-RegistKey`, `RP-Key`, ...).
    pub data: HashMap<String, String>,
}

impl HostProfile {
    pub fn from_record(record: &RegistrationRecord) -> Self {
        Self {
            kind: record.kind,
            data: record.fields.clone(),
        }
    }

    pub fn regist_key(&self) -> Option<&str> {
        self.data
            .get(&format!("{}-RegistKey", self.kind))
            .map(String::as_str)
    }

    pub fn nickname(&self) -> Option<&str> {
        self.data
            .get(&format!("{}-Nickname", self.kind))
            .map(String::as_str)
    }

    pub fn rp_key(&self) -> Option<[u8; 16]> {
        let raw = hex::decode(self.data.get("RP-Key")?).ok()?;
        raw.try_into().ok()
    }

    /// Check the invariants a usable credential must satisfy.
    pub fn validate(&self) -> Result<(), RemotePlayError> {
        if self.regist_key().is_none_or(str::is_empty) {
            return Err(RemotePlayError::Protocol(
                "host profile has no RegistKey".into(),
            ));
        }
        if self.rp_key().is_none() {
            return Err(RemotePlayError::Protocol(
                "host profile has no 16-byte RP-Key".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_layout() {
        let json = r#"{
            "player1": {
                "id": "YWJjZGVmZw==",
                "hosts": {
                    "aabbccddeeff": {
                        "type": "PS4",
                        "data": {
                            "PS4-RegistKey": "3132333435363738",
                            "RP-Key": "000102030405060708090a0b0c0d0e0f",
                            "PS4-Mac": "aabbccddeeff",
                            "PS4-Nickname": "Console"
                        }
                    }
                }
            }
        }"#;
        let profiles: Profiles = serde_json::from_str(json).unwrap();
        let user = profiles.user("player1").unwrap();
        assert_eq!(user.id, "YWJjZGVmZw==");
        let host = user.host("aabbccddeeff").unwrap();
        assert_eq!(host.kind, ConsoleType::Ps4);
        assert_eq!(host.regist_key(), Some("3132333435363738"));
        assert_eq!(host.nickname(), Some("Console"));
        assert_eq!(host.rp_key().unwrap()[15], 0x0f);
        host.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_keys() {
        let host = HostProfile {
            kind: ConsoleType::Ps5,
            data: HashMap::from([("PS5-RegistKey".to_string(), "aabb".to_string())]),
        };
        assert!(host.validate().is_err());
    }

    #[test]
    fn test_update_host_from_record() {
        let record = RegistrationRecord {
            kind: ConsoleType::Ps5,
            mac: "001122334455".to_string(),
            nickname: "Bedroom".to_string(),
            regist_key: "8899aabb".to_string(),
            rp_key: "000102030405060708090a0b0c0d0e0f".to_string(),
            fields: HashMap::from([
                ("PS5-RegistKey".to_string(), "8899aabb".to_string()),
                (
                    "RP-Key".to_string(),
                    "000102030405060708090a0b0c0d0e0f".to_string(),
                ),
            ]),
        };
        let mut user = UserProfile::default();
        user.update_host(&record);
        let host = user.host("001122334455").unwrap();
        assert_eq!(host.regist_key(), Some("8899aabb"));
        host.validate().unwrap();
    }
}
