//! Mock device configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Identity and wire parameters for a mock fan.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// 32-character hex token the device encrypts with.
    pub token_hex: String,
    /// Model string reported by `miIO.info`.
    pub model: String,
    /// Firmware version reported by `miIO.info`.
    pub fw_ver: String,
    /// Hardware version reported by `miIO.info`.
    pub hw_ver: String,
    /// Device id reported by `miIO.info`; 0 omits the field.
    pub did: u64,
    /// Report `did` as a quoted string instead of an integer.
    pub did_as_string: bool,
    /// Raw device id bytes carried in hello replies and frame headers.
    pub device_id: [u8; 4],
    /// Initial device timestamp; advances by one per hello reply.
    pub stamp: u32,
    /// Address to bind; defaults to an ephemeral loopback port.
    pub bind_address: SocketAddr,
    /// Socket read timeout for the server loop.
    pub read_timeout: Duration,
}

impl DeviceConfig {
    /// Create a config for a za5 fan with the given token.
    pub fn new(token_hex: &str) -> Self {
        Self {
            token_hex: token_hex.to_string(),
            model: "zhimi.fan.za5".to_string(),
            fw_ver: "2.0.6".to_string(),
            hw_ver: "esp32".to_string(),
            did: 123_456_789,
            did_as_string: false,
            device_id: [0xDE, 0xAD, 0xBE, 0xEF],
            stamp: 100,
            bind_address: "127.0.0.1:0".parse().expect("loopback address parses"),
            read_timeout: Duration::from_millis(50),
        }
    }

    /// Set the reported model string.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Set the reported device id, optionally quoted as a string.
    pub fn with_did(mut self, did: u64, as_string: bool) -> Self {
        self.did = did;
        self.did_as_string = as_string;
        self
    }

    /// Set the raw device id bytes and initial timestamp.
    pub fn with_identity(mut self, device_id: [u8; 4], stamp: u32) -> Self {
        self.device_id = device_id;
        self.stamp = stamp;
        self
    }
}
