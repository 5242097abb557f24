//! miIO wire protocol codec.
//!
//! Every miIO datagram is a 32-byte big-endian header followed by an
//! AES-128-CBC encrypted payload (possibly empty). The AES key and IV derive
//! from the per-device 16-byte token (`key = MD5(token)`,
//! `iv0 = MD5(key || token)`), and the header checksum is the MD5 of the
//! header with the checksum field replaced by the token, concatenated with
//! the ciphertext. Payload plaintext is JSON text plus a mandatory NUL
//! terminator, PKCS#7-padded to a 16-byte multiple.

use std::sync::atomic::{AtomicU32, Ordering};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::Value;

use crate::error::FanError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// UDP port miIO devices listen on.
pub const MIIO_PORT: u16 = 54321;

/// Length of the frame header.
pub const HEADER_LEN: usize = 32;

/// Frame magic, first two header bytes.
pub const MAGIC: u16 = 0x2131;

/// Largest datagram the client accepts.
pub const UDP_BUFFER_LEN: usize = 512;

/// The `miIO.info` request body. The id is fixed; info queries are not part
/// of the command id sequence.
pub const INFO_REQUEST_JSON: &str = r#"{"id":1,"method":"miIO.info","params":[]}"#;

static NEXT_MSG_ID: AtomicU32 = AtomicU32::new(1);

/// Next process-wide command id. Starts at 1, increments per command.
pub fn next_msg_id() -> u32 {
    NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed)
}

/// MD5 digest helper.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive the AES key and initial IV from a device token.
pub fn derive_key_iv(token: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    let key = md5_digest(token);
    let mut seed = [0u8; 32];
    seed[..16].copy_from_slice(&key);
    seed[16..].copy_from_slice(token);
    let iv = md5_digest(&seed);
    (key, iv)
}

/// Parse a 32-character hex token string into its 16 raw bytes.
pub fn parse_token_hex(token_hex: &str) -> Option<[u8; 16]> {
    if token_hex.len() != 32 {
        return None;
    }
    let bytes = hex::decode(token_hex).ok()?;
    let mut token = [0u8; 16];
    token.copy_from_slice(&bytes);
    Some(token)
}

/// The hello frame used for discovery and handshakes: magic, length 0x20,
/// remaining 28 bytes 0xFF.
pub fn hello_frame() -> [u8; HEADER_LEN] {
    let mut frame = [0xFFu8; HEADER_LEN];
    frame[0] = 0x21;
    frame[1] = 0x31;
    frame[2] = 0x00;
    frame[3] = 0x20;
    frame
}

/// Device identity carried in a hello reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloReply {
    /// Raw device id bytes, echoed back in every subsequent frame header.
    pub device_id: [u8; 4],
    /// Device-published timestamp at hello time.
    pub stamp: u32,
}

/// Parse a hello reply. Accepts exactly-32-byte datagrams; bytes 8..12 are
/// the device id and bytes 12..16 the big-endian device timestamp.
pub fn parse_hello_reply(data: &[u8]) -> Option<HelloReply> {
    if data.len() != HEADER_LEN {
        return None;
    }
    let mut device_id = [0u8; 4];
    device_id.copy_from_slice(&data[8..12]);
    let stamp = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    Some(HelloReply { device_id, stamp })
}

/// Encrypt a JSON payload: append the NUL terminator, PKCS#7 pad to a
/// 16-byte multiple, AES-128-CBC with the token-derived key and IV.
pub fn encrypt_payload(json: &str, key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(json.len() + 1);
    plain.extend_from_slice(json.as_bytes());
    plain.push(0x00);
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&plain)
}

/// Decrypt an encrypted payload back to JSON text.
///
/// Strips PKCS#7 padding and any trailing NUL terminator. Unpadding failures
/// classify as `DecryptFail`; non-UTF-8 plaintext as `InvalidResponse`.
pub fn decrypt_payload(cipher: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<String, FanError> {
    if cipher.is_empty() || cipher.len() % 16 != 0 {
        return Err(FanError::DecryptFail);
    }
    let mut plain = Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(cipher)
        .map_err(|_| FanError::DecryptFail)?;
    while plain.last() == Some(&0x00) {
        plain.pop();
    }
    String::from_utf8(plain).map_err(|_| FanError::InvalidResponse)
}

/// Build a complete frame: header (with checksum) followed by the ciphertext.
///
/// The checksum is the MD5 of the 16-byte header prefix, the token in place
/// of the checksum field, and the ciphertext.
pub fn encode_frame(device_id: [u8; 4], stamp: u32, token: &[u8; 16], cipher: &[u8]) -> Vec<u8> {
    let total = HEADER_LEN + cipher.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&MAGIC.to_be_bytes());
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

#[derive(Serialize)]
struct MiotProperty<'a> {
    siid: u8,
    piid: u8,
    value: &'a Value,
}

#[derive(Serialize)]
struct MiotCommand<'a> {
    id: u32,
    method: &'static str,
    params: [MiotProperty<'a>; 1],
}

/// Serialize a `set_properties` command body.
///
/// Field order is fixed by struct declaration so the wire text is exactly
/// `{"id":N,"method":"set_properties","params":[{"siid":S,"piid":P,"value":V}]}`.
pub fn set_properties_json(id: u32, siid: u8, piid: u8, value: &Value) -> String {
    let command = MiotCommand {
        id,
        method: "set_properties",
        params: [MiotProperty { siid, piid, value }],
    };
    serde_json::to_string(&command).expect("command body serializes infallibly")
}

/// Fields extracted from a `miIO.info` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanInfo {
    pub model: String,
    pub fw_ver: String,
    pub hw_ver: String,
    /// Device id; falls back to the big-endian header device id when the
    /// reply carries none.
    pub did: u32,
}

/// Parse a `miIO.info` reply.
///
/// The fields may sit at the JSON root or nested under `"result"`, and `did`
/// may be a quoted string or an unquoted integer. A missing `model` field
/// classifies as `InvalidResponse`.
pub fn parse_info_response(json: &str, header_device_id: [u8; 4]) -> Result<FanInfo, FanError> {
    let value: Value = serde_json::from_str(json).map_err(|_| FanError::InvalidResponse)?;
    let root = value.as_object().ok_or(FanError::InvalidResponse)?;
    let fields = match root.get("result").and_then(Value::as_object) {
        Some(result) if result.contains_key("model") => result,
        _ => root,
    };

    let model = fields
        .get("model")
        .and_then(Value::as_str)
        .ok_or(FanError::InvalidResponse)?;

    let string_field = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let mut did = fields.get("did").map_or(0, did_from_value);
    if did == 0 {
        did = u32::from_be_bytes(header_device_id);
    }

    Ok(FanInfo {
        model: model.to_string(),
        fw_ver: string_field("fw_ver"),
        hw_ver: string_field("hw_ver"),
        did,
    })
}

fn did_from_value(value: &Value) -> u32 {
    match value {
        Value::String(s) => s.trim().parse().unwrap_or(0),
        Value::Number(n) => n.as_u64().map_or(0, |v| v as u32),
        _ => 0,
    }
}
