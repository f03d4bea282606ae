//! Cryptographic constructions of the Remote Play protocol: the AES-CFB
//! control cipher with HMAC-derived rotating IVs, the AES-CTR media
//! keystream with GMAC packet authentication, and the secp256k1 key
//! agreement that seeds the media ciphers.

use std::{cmp::Ordering, collections::VecDeque};

use log::{debug, error};
use openssl::{
    bn::BigNumContext,
    derive::Deriver,
    ec::{EcGroup, EcKey, EcPoint, PointConversionForm},
    error::ErrorStack,
    hash::MessageDigest,
    memcmp,
    nid::Nid,
    pkey::{PKey, Private},
    rand::rand_bytes,
    sha::sha256,
    sign::Signer,
    symm::{Cipher, Crypter, Mode, encrypt_aead},
};

use crate::{RemotePlayError, keys};

/// Length of one pre-generated keystream block.
pub const KEYSTREAM_BLOCK: usize = 0x1000;
/// IV advance per GMAC key rotation.
const GMAC_REFRESH_IV: u64 = 44910;
/// Key-position interval after which the GMAC key rotates.
const GMAC_REFRESH_KEY_POS: u64 = 45000;

const GMAC_LEN: usize = 4;
const AES_BLOCK: usize = 16;

/// Add `counter` to the IV block, treating the block as a little-endian
/// integer with per-byte carry.
pub fn counter_add(counter: u64, iv: &[u8; 16]) -> [u8; 16] {
    let mut out = *iv;
    let mut carry = u128::from(counter);
    for byte in out.iter_mut() {
        if carry == 0 {
            break;
        }
        let add = u128::from(*byte) + carry;
        *byte = (add & 0xff) as u8;
        carry = add >> 8;
    }
    out
}

pub(crate) fn hmac_sha256(key: &[u8], msg: &[u8]) -> Result<[u8; 32], ErrorStack> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(msg)?;
    let mut out = [0u8; 32];
    signer.sign(&mut out)?;
    Ok(out)
}

fn aes_cfb(
    mode: Mode,
    key: &[u8; 16],
    iv: &[u8; 16],
    data: &[u8],
) -> Result<Vec<u8>, ErrorStack> {
    let cipher = Cipher::aes_128_cfb128();
    let mut crypter = Crypter::new(cipher, mode, key, Some(iv))?;
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut written = crypter.update(data, &mut out)?;
    written += crypter.finalize(&mut out[written..])?;
    out.truncate(written);
    Ok(out)
}

fn xor_keystream(data: &[u8], keystream: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(keystream)
        .map(|(byte, key)| byte ^ key)
        .collect()
}

/// Derive the GMAC key for a rotation index: SHA-256 over the key and the
/// advanced IV, folded to 16 bytes by XOR of the halves.
fn gmac_key(index: u64, key: &[u8; 16], iv: &[u8; 16]) -> [u8; 16] {
    let counter_iv = counter_add(index * GMAC_REFRESH_IV, iv);
    let mut buf = [0u8; 32];
    buf[..16].copy_from_slice(key);
    buf[16..].copy_from_slice(&counter_iv);
    let digest = sha256(&buf);
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = digest[i] ^ digest[i + 16];
    }
    out
}

/// Derive the base key and IV of a media cipher from the ECDH secret.
/// `base_index` is 2 for the sending side and 3 for the receiving side.
fn base_key_iv(
    secret: &[u8],
    handshake_key: &[u8; 16],
    base_index: u8,
) -> Result<([u8; 16], [u8; 16]), ErrorStack> {
    let mut msg = [0u8; 21];
    msg[0] = 0x01;
    msg[1] = base_index;
    msg[2] = 0x00;
    msg[3..19].copy_from_slice(handshake_key);
    msg[19] = 0x01;
    msg[20] = 0x00;
    let mac = hmac_sha256(secret, &msg)?;
    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&mac[..16]);
    iv.copy_from_slice(&mac[16..]);
    Ok((key, iv))
}

/// GMAC tag of a packet: AES-GCM over empty plaintext with the packet as
/// additional data, truncated to four bytes.
fn gmac_tag(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<[u8; 4], ErrorStack> {
    let mut tag = [0u8; 16];
    encrypt_aead(Cipher::aes_128_gcm(), key, Some(iv), data, &[], &mut tag)?;
    let mut out = [0u8; GMAC_LEN];
    out.copy_from_slice(&tag[..GMAC_LEN]);
    Ok(out)
}

/// Produce `len` bytes of CTR keystream starting at `key_pos`: AES-ECB over
/// successive advanced IV blocks, trimmed to the block-internal offset.
fn key_stream(
    key: &[u8; 16],
    iv: &[u8; 16],
    key_pos: u64,
    len: usize,
) -> Result<Vec<u8>, ErrorStack> {
    let padding = (key_pos % AES_BLOCK as u64) as usize;
    let aligned = key_pos - padding as u64;
    let blocks = (padding + len).div_ceil(AES_BLOCK);

    let block_offset = aligned / AES_BLOCK as u64 + 1;
    let mut ivs = Vec::with_capacity(blocks * AES_BLOCK);
    for block in 0..blocks as u64 {
        ivs.extend_from_slice(&counter_add(block_offset + block, iv));
    }

    let cipher = Cipher::aes_128_ecb();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, None)?;
    crypter.pad(false);
    let mut out = vec![0u8; ivs.len() + cipher.block_size()];
    let mut written = crypter.update(&ivs, &mut out)?;
    written += crypter.finalize(&mut out[written..])?;
    out.truncate(written);

    out.drain(..padding);
    out.truncate(len);
    Ok(out)
}

/// One direction of the media cipher: CTR keystream with a look-ahead block
/// queue plus the rotating GMAC key state.
pub struct MediaCipher {
    base_key: [u8; 16],
    base_iv: [u8; 16],
    base_gmac_key: [u8; 16],
    current_gmac_key: [u8; 16],
    gmac_index: u64,
    keystreams: VecDeque<(u64, Vec<u8>)>,
    keystream_index: u64,
}

impl MediaCipher {
    pub fn new(
        handshake_key: &[u8; 16],
        secret: &[u8],
        base_index: u8,
    ) -> Result<Self, ErrorStack> {
        let (base_key, base_iv) = base_key_iv(secret, handshake_key, base_index)?;
        let base_gmac_key = gmac_key(0, &base_key, &base_iv);
        let mut cipher = Self {
            base_key,
            base_iv,
            base_gmac_key,
            current_gmac_key: base_gmac_key,
            gmac_index: 0,
            keystreams: VecDeque::new(),
            keystream_index: 0,
        };
        cipher.fill_keystreams()?;
        Ok(cipher)
    }

    fn fill_keystreams(&mut self) -> Result<(), ErrorStack> {
        while self.keystreams.len() < 3 {
            let key_pos = self.keystream_index * KEYSTREAM_BLOCK as u64;
            let stream = key_stream(&self.base_key, &self.base_iv, key_pos, KEYSTREAM_BLOCK)?;
            self.keystreams.push_back((self.keystream_index, stream));
            self.keystream_index += 1;
        }
        Ok(())
    }

    /// Keystream bytes `[key_pos, key_pos + len)`, spliced out of the block
    /// queue. Blocks the position has moved past are dropped; positions the
    /// queue cannot serve (retransmits of an old position) are generated
    /// directly.
    fn keystream(&mut self, key_pos: u64, len: usize) -> Result<Vec<u8>, ErrorStack> {
        let block = key_pos / KEYSTREAM_BLOCK as u64;
        while self
            .keystreams
            .front()
            .is_some_and(|(index, _)| *index < block)
        {
            self.keystreams.pop_front();
        }
        if self.keystreams.is_empty() {
            self.keystream_index = block;
        }
        self.fill_keystreams()?;

        if self.keystreams.front().map(|(index, _)| *index) != Some(block) {
            return key_stream(&self.base_key, &self.base_iv, key_pos, len);
        }

        let mut out = Vec::with_capacity(len);
        let mut offset = (key_pos % KEYSTREAM_BLOCK as u64) as usize;
        let mut needed = len;
        for (_, stream) in &self.keystreams {
            let end = (offset + needed).min(stream.len());
            out.extend_from_slice(&stream[offset..end]);
            needed -= end - offset;
            if needed == 0 {
                break;
            }
            offset = 0;
        }
        if needed > 0 {
            // Longer than the queued look-ahead.
            return key_stream(&self.base_key, &self.base_iv, key_pos, len);
        }
        Ok(out)
    }

    pub fn apply(&mut self, data: &[u8], key_pos: u64) -> Result<Vec<u8>, ErrorStack> {
        let keystream = self.keystream(key_pos, data.len())?;
        Ok(xor_keystream(data, &keystream))
    }

    /// GMAC tag for a packet at `key_pos`. The key rotates forward every
    /// 45000 bytes of key position; a position behind the current rotation
    /// (a retransmit) is served with a key regenerated from the base.
    pub fn gmac(&mut self, data: &[u8], key_pos: u64) -> Result<[u8; 4], ErrorStack> {
        let iv = counter_add(key_pos / AES_BLOCK as u64, &self.base_iv);
        let index = if key_pos > 0 {
            (key_pos - 1) / GMAC_REFRESH_KEY_POS
        } else {
            0
        };
        let key = match index.cmp(&self.gmac_index) {
            Ordering::Greater => {
                self.gmac_index = index;
                self.current_gmac_key = gmac_key(index, &self.base_gmac_key, &self.base_iv);
                debug!("media cipher rotated GMAC key to index {index}");
                self.current_gmac_key
            }
            Ordering::Less => gmac_key(index, &self.base_key, &self.base_iv),
            Ordering::Equal => self.current_gmac_key,
        };
        gmac_tag(data, &key, &iv)
    }
}

/// The local/remote media cipher pair of a running stream. The local side
/// tracks the cumulative key position of everything sent.
pub struct StreamCipher {
    local: MediaCipher,
    remote: MediaCipher,
    key_pos: u64,
}

impl StreamCipher {
    pub fn new(local: MediaCipher, remote: MediaCipher) -> Self {
        Self {
            local,
            remote,
            key_pos: 0,
        }
    }

    pub fn key_pos(&self) -> u64 {
        self.key_pos
    }

    pub fn advance_key_pos(&mut self, by: usize) {
        self.key_pos += by as u64;
        debug!("advanced key pos by {by} to {}", self.key_pos);
    }

    /// Encrypt outbound payload at the current key position.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        self.local.apply(data, self.key_pos)
    }

    /// Decrypt inbound payload at the key position carried in its header.
    pub fn decrypt(&mut self, data: &[u8], key_pos: u64) -> Result<Vec<u8>, ErrorStack> {
        self.remote.apply(data, key_pos)
    }

    pub fn gmac(&mut self, data: &[u8]) -> Result<[u8; 4], ErrorStack> {
        self.local.gmac(data, self.key_pos)
    }

    pub fn verify_gmac(
        &mut self,
        data: &[u8],
        key_pos: u64,
        gmac: &[u8; 4],
    ) -> Result<bool, ErrorStack> {
        let tag = self.remote.gmac(data, key_pos)?;
        let verified = memcmp::eq(&tag, gmac);
        if !verified {
            debug!(
                "GMAC mismatch: expected {}, received {}",
                hex::encode(tag),
                hex::encode(gmac)
            );
        }
        Ok(verified)
    }
}

/// AES-CFB-128 pair for the control session. Send and receive maintain
/// independent counters; a fresh cipher is keyed for every operation from
/// the truncated HMAC of nonce and counter.
#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; 16],
    nonce: [u8; 16],
    enc_counter: u64,
    dec_counter: u64,
}

impl SessionCipher {
    pub fn new(key: [u8; 16], nonce: [u8; 16]) -> Self {
        Self {
            key,
            nonce,
            enc_counter: 0,
            dec_counter: 0,
        }
    }

    fn iv(&self, counter: u64) -> Result<[u8; 16], ErrorStack> {
        let mut msg = [0u8; 24];
        msg[..16].copy_from_slice(&self.nonce);
        msg[16..].copy_from_slice(&counter.to_be_bytes());
        let mac = hmac_sha256(keys::HMAC_KEY, &msg)?;
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&mac[..16]);
        Ok(iv)
    }

    pub fn encrypt(&mut self, msg: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let iv = self.iv(self.enc_counter)?;
        self.enc_counter += 1;
        aes_cfb(Mode::Encrypt, &self.key, &iv, msg)
    }

    /// Encrypt at an explicit counter without advancing the send counter.
    pub fn encrypt_at(&self, counter: u64, msg: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let iv = self.iv(counter)?;
        aes_cfb(Mode::Encrypt, &self.key, &iv, msg)
    }

    pub fn decrypt(&mut self, msg: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let iv = self.iv(self.dec_counter)?;
        self.dec_counter += 1;
        aes_cfb(Mode::Decrypt, &self.key, &iv, msg)
    }

    pub fn enc_counter(&self) -> u64 {
        self.enc_counter
    }

    pub fn dec_counter(&self) -> u64 {
        self.dec_counter
    }
}

/// secp256k1 key agreement for the big-payload exchange. The handshake key
/// authenticates both public keys via HMAC signatures.
pub struct StreamEcdh {
    handshake_key: [u8; 16],
    key: EcKey<Private>,
    public_key: Vec<u8>,
}

impl StreamEcdh {
    pub fn new() -> Result<Self, ErrorStack> {
        let mut handshake_key = [0u8; 16];
        rand_bytes(&mut handshake_key)?;
        Self::with_handshake_key(handshake_key)
    }

    pub fn with_handshake_key(handshake_key: [u8; 16]) -> Result<Self, ErrorStack> {
        let group = EcGroup::from_curve_name(Nid::SECP256K1)?;
        let key = EcKey::generate(&group)?;
        let mut ctx = BigNumContext::new()?;
        let public_key =
            key.public_key()
                .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;
        Ok(Self {
            handshake_key,
            key,
            public_key,
        })
    }

    pub fn handshake_key(&self) -> &[u8; 16] {
        &self.handshake_key
    }

    /// Uncompressed public key point, 65 bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn public_sig(&self) -> Result<[u8; 32], ErrorStack> {
        hmac_sha256(&self.handshake_key, &self.public_key)
    }

    /// Verify the remote signature, derive the shared secret and build the
    /// media cipher pair.
    pub fn derive(
        &self,
        remote_key: &[u8],
        remote_sig: &[u8],
    ) -> Result<StreamCipher, RemotePlayError> {
        let expected = hmac_sha256(&self.handshake_key, remote_key)?;
        if remote_sig.len() != expected.len() || !memcmp::eq(&expected, remote_sig) {
            error!("remote ECDH signature invalid");
            return Err(RemotePlayError::CryptoRejected(
                "remote public key signature mismatch",
            ));
        }

        let group = EcGroup::from_curve_name(Nid::SECP256K1)?;
        let mut ctx = BigNumContext::new()?;
        let point = EcPoint::from_bytes(&group, remote_key, &mut ctx)?;
        let remote = EcKey::from_public_key(&group, &point)?;

        let local = PKey::from_ec_key(self.key.clone())?;
        let remote = PKey::from_ec_key(remote)?;
        let mut deriver = Deriver::new(&local)?;
        deriver.set_peer(&remote)?;
        let secret = deriver.derive_to_vec()?;
        debug!("derived {}-byte ECDH secret", secret.len());

        let local = MediaCipher::new(&self.handshake_key, &secret, 2)?;
        let remote = MediaCipher::new(&self.handshake_key, &secret, 3)?;
        Ok(StreamCipher::new(local, remote))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_identity() {
        let iv = [0x37u8; 16];
        assert_eq!(counter_add(0, &iv), iv);
    }

    #[test]
    fn test_counter_add_associative() {
        let iv = [0xfe, 0xff, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];
        let split = counter_add(1000, &counter_add(234, &iv));
        assert_eq!(split, counter_add(1234, &iv));
    }

    #[test]
    fn test_counter_add_gmac_rotation_step() {
        // 44910 = 0xaf6e added to a block whose low byte is 1.
        let mut iv = [0u8; 16];
        iv[0] = 0x01;
        let out = counter_add(44910, &iv);
        assert_eq!(out[0], 0x6f);
        assert_eq!(out[1], 0xaf);
        assert_eq!(&out[2..], &[0u8; 14]);
    }

    #[test]
    fn test_counter_add_carries_through() {
        let mut iv = [0xffu8; 16];
        iv[15] = 0x00;
        let out = counter_add(1, &iv);
        assert_eq!(&out[..15], &[0u8; 15]);
        assert_eq!(out[15], 0x01);
    }

    #[test]
    fn test_key_stream_offset_alignment() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        // A stream sliced at an unaligned position must equal the tail of
        // the stream generated from the enclosing block start.
        let full = key_stream(&key, &iv, 0, 64).unwrap();
        let sliced = key_stream(&key, &iv, 21, 43).unwrap();
        assert_eq!(sliced, full[21..]);
    }

    #[test]
    fn test_session_cipher_round_trip() {
        let key = [0xa5u8; 16];
        let nonce = [0x5au8; 16];
        let mut alice = SessionCipher::new(key, nonce);
        let mut bob = SessionCipher::new(key, nonce);

        let first = alice.encrypt(b"first message").unwrap();
        let second = alice.encrypt(b"second message").unwrap();
        assert_eq!(bob.decrypt(&first).unwrap(), b"first message");
        assert_eq!(bob.decrypt(&second).unwrap(), b"second message");
        assert_eq!(alice.enc_counter(), 2);
        assert_eq!(bob.dec_counter(), 2);
    }

    #[test]
    fn test_session_cipher_counters_are_independent() {
        let key = [0x01u8; 16];
        let nonce = [0x02u8; 16];
        let mut cipher = SessionCipher::new(key, nonce);

        let at_zero = cipher.encrypt_at(0, b"payload").unwrap();
        let sent = cipher.encrypt(b"payload").unwrap();
        // The explicit-counter path does not advance the send counter.
        assert_eq!(at_zero, sent);
        assert_eq!(cipher.enc_counter(), 1);

        let next = cipher.encrypt(b"payload").unwrap();
        assert_ne!(next, sent);
    }

    fn test_stream_cipher() -> StreamCipher {
        let handshake = [0x10u8; 16];
        let secret = [0x77u8; 32];
        let local = MediaCipher::new(&handshake, &secret, 2).unwrap();
        let remote = MediaCipher::new(&handshake, &secret, 2).unwrap();
        StreamCipher::new(local, remote)
    }

    #[test]
    fn test_media_cipher_round_trip() {
        // Peer ciphers share the base index so encrypt/decrypt mirror.
        let mut cipher = test_stream_cipher();
        let plain = vec![0xabu8; 100];
        let sealed = cipher.encrypt(&plain).unwrap();
        assert_ne!(sealed, plain);
        assert_eq!(cipher.decrypt(&sealed, 0).unwrap(), plain);

        cipher.advance_key_pos(plain.len());
        let sealed_next = cipher.encrypt(&plain).unwrap();
        assert_ne!(sealed_next, sealed);
        assert_eq!(cipher.decrypt(&sealed_next, 100).unwrap(), plain);
    }

    #[test]
    fn test_media_cipher_keystream_crosses_blocks() {
        let mut cipher = test_stream_cipher();
        let plain = vec![0x42u8; KEYSTREAM_BLOCK + 77];
        let key_pos = (KEYSTREAM_BLOCK - 33) as u64;
        let sealed = cipher.local.apply(&plain, key_pos).unwrap();
        let opened = cipher.remote.apply(&sealed, key_pos).unwrap();
        assert_eq!(opened, plain);
    }

    #[test]
    fn test_media_cipher_serves_old_positions() {
        let mut cipher = test_stream_cipher();
        let plain = b"retransmitted data".to_vec();
        let early = cipher.local.apply(&plain, 16).unwrap();
        // Push the queue far ahead, then ask for the old position again.
        let _ = cipher
            .local
            .apply(&[0u8; 32], (KEYSTREAM_BLOCK * 5) as u64)
            .unwrap();
        let again = cipher.local.apply(&plain, 16).unwrap();
        assert_eq!(early, again);
    }

    #[test]
    fn test_gmac_detects_flipped_byte() {
        let mut cipher = test_stream_cipher();
        let mut packet = vec![0u8; 64];
        packet[10] = 0x55;
        let tag = cipher.gmac(&packet).unwrap();
        assert!(cipher.verify_gmac(&packet, 0, &tag).unwrap());
        packet[20] ^= 0x01;
        assert!(!cipher.verify_gmac(&packet, 0, &tag).unwrap());
    }

    #[test]
    fn test_gmac_rotation_and_retransmit() {
        let mut cipher = test_stream_cipher();
        let packet = vec![0x99u8; 32];
        let tag_before = cipher.local.gmac(&packet, 1000).unwrap();
        // Cross the rotation boundary, then go back to the old position.
        let _ = cipher.local.gmac(&packet, 46000).unwrap();
        let tag_again = cipher.local.gmac(&packet, 1000).unwrap();
        assert_eq!(tag_before, tag_again);
    }

    #[test]
    fn test_ecdh_signature_round_trip() {
        let alice = StreamEcdh::new().unwrap();
        let bob = StreamEcdh::with_handshake_key(*alice.handshake_key()).unwrap();

        let sig = bob.public_sig().unwrap();
        assert!(alice.derive(bob.public_key(), &sig).is_ok());

        let mut bad_sig = sig;
        bad_sig[0] ^= 0xff;
        assert!(matches!(
            alice.derive(bob.public_key(), &bad_sig),
            Err(RemotePlayError::CryptoRejected(_))
        ));
    }

    #[test]
    fn test_ecdh_peers_agree() {
        let alice = StreamEcdh::new().unwrap();
        let bob = StreamEcdh::with_handshake_key(*alice.handshake_key()).unwrap();

        let mut from_alice = alice
            .derive(bob.public_key(), &bob.public_sig().unwrap())
            .unwrap();
        let mut from_bob = bob
            .derive(alice.public_key(), &alice.public_sig().unwrap())
            .unwrap();

        // Equal shared secrets produce identical send keystreams.
        let sealed_a = from_alice.encrypt(b"media payload").unwrap();
        let sealed_b = from_bob.encrypt(b"media payload").unwrap();
        assert_eq!(sealed_a, sealed_b);
    }
}
