//! Stateless miIO crypto and framing helpers for the mock device.
//!
//! Implemented independently of the client crate so the mock exercises the
//! protocol from the device side.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Frame header length.
pub const HEADER_LEN: usize = 32;

/// MD5 digest helper.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive the AES key and IV from a device token.
pub fn derive_key_iv(token: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    let key = md5_digest(token);
    let mut seed = [0u8; 32];
    seed[..16].copy_from_slice(&key);
    seed[16..].copy_from_slice(token);
    (key, md5_digest(&seed))
}

/// Parse a 32-character hex token.
pub fn parse_token_hex(token_hex: &str) -> Option<[u8; 16]> {
    if token_hex.len() != 32 {
        return None;
    }
    let bytes = hex::decode(token_hex).ok()?;
    let mut token = [0u8; 16];
    token.copy_from_slice(&bytes);
    Some(token)
}

/// Encrypt JSON text the way a device does: NUL terminator, PKCS#7, CBC.
pub fn encrypt_payload(json: &str, key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(json.len() + 1);
    plain.extend_from_slice(json.as_bytes());
    plain.push(0x00);
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&plain)
}

/// Decrypt an encrypted payload back to JSON text, or `None` when the
/// ciphertext does not unpad or decode.
pub fn decrypt_payload(cipher: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Option<String> {
    if cipher.is_empty() || cipher.len() % 16 != 0 {
        return None;
    }
    let mut plain = Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(cipher)
        .ok()?;
    while plain.last() == Some(&0x00) {
        plain.pop();
    }
    String::from_utf8(plain).ok()
}

/// Whether a datagram is the 32-byte all-0xFF hello frame.
pub fn is_hello(data: &[u8]) -> bool {
    data.len() == HEADER_LEN
        && data[..4] == [0x21, 0x31, 0x00, 0x20]
        && data[4..].iter().all(|&b| b == 0xFF)
}

/// Build the 32-byte hello reply carrying the device identity.
pub fn hello_reply(device_id: [u8; 4], stamp: u32) -> [u8; HEADER_LEN] {
    let mut reply = [0xFFu8; HEADER_LEN];
    reply[..4].copy_from_slice(&[0x21, 0x31, 0x00, 0x20]);
    reply[4..8].copy_from_slice(&[0, 0, 0, 0]);
    reply[8..12].copy_from_slice(&device_id);
    reply[12..16].copy_from_slice(&stamp.to_be_bytes());
    reply
}

/// Verify an inbound frame's checksum against the device token.
pub fn checksum_matches(frame: &[u8], token: &[u8; 16]) -> bool {
    if frame.len() <= HEADER_LEN {
        return false;
    }
    let mut preimage = Vec::with_capacity(frame.len());
    preimage.extend_from_slice(&frame[..16]);
    preimage.extend_from_slice(token);
    preimage.extend_from_slice(&frame[HEADER_LEN..]);
    md5_digest(&preimage) == frame[16..HEADER_LEN]
}

/// Build a complete device-to-client frame around an encrypted payload.
pub fn encode_frame(device_id: [u8; 4], stamp: u32, token: &[u8; 16], cipher: &[u8]) -> Vec<u8> {
    let total = HEADER_LEN + cipher.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&0x2131u16.to_be_bytes());
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]);
    frame.extend_from_slice(&device_id);
    frame.extend_from_slice(&stamp.to_be_bytes());

    let mut preimage = Vec::with_capacity(16 + 16 + cipher.len());
    preimage.extend_from_slice(&frame[..16]);
    preimage.extend_from_slice(token);
    preimage.extend_from_slice(cipher);
    frame.extend_from_slice(&md5_digest(&preimage));

    frame.extend_from_slice(cipher);
    frame
}
