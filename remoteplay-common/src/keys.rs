//! Static key material shared with the console firmware.
//!
//! The session tables are indexed in 112-byte strides selected by nonce
//! bits, the registration tables in 32-byte strides. All of them are part
//! of the wire contract and must not change.

/// Table backing the control-session nonce transform.
pub static SESSION_KEY_0: &[u8; 3584] = include_bytes!("keys/session_key_0.bin");
/// Table backing the control-session AES key transform.
pub static SESSION_KEY_1: &[u8; 3584] = include_bytes!("keys/session_key_1.bin");

/// Table backing the PIN-derived registration key.
pub static REG_KEY_0: &[u8; 512] = include_bytes!("keys/reg_key_0.bin");
/// Table backing the nonce-derived registration key.
pub static REG_KEY_1: &[u8; 512] = include_bytes!("keys/reg_key_1.bin");

/// Fixed HMAC key used to derive control-cipher IVs.
pub static HMAC_KEY: &[u8; 32] = include_bytes!("keys/hmac_key.bin");
