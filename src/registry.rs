//! Device registry.
//!
//! A bounded table of discovered fans plus the per-index soft-active
//! override flags. Records are created by discovery, the unicast query, or
//! fast-connect registration, and persist until an explicit reset (smart
//! connect may remove records whose fast-connect validation failed). Index
//! identity is stable between resets.

use std::net::Ipv4Addr;

use crate::model::FanModelType;
use crate::protocol;
use crate::types::{MiioErr, MAX_DEVICES};

/// Longest model string stored on a record.
pub const MODEL_MAX_LEN: usize = 23;

/// Longest firmware/hardware version string stored on a record.
pub const VERSION_MAX_LEN: usize = 15;

/// One discovered (or statically registered) fan.
#[derive(Debug, Clone)]
pub struct DiscoveredFan {
    /// Device IP address; unique within the registry.
    pub ip: Ipv4Addr,
    /// Raw device id bytes from the hello reply; zeroed until known.
    pub device_id: [u8; 4],
    /// Derived 32-bit device id from `miIO.info` (0 if unknown).
    pub did: u32,
    /// Model string, e.g. "zhimi.fan.za5". Empty until known.
    pub model: String,
    /// 32-character hex token.
    pub token_hex: String,
    /// Firmware version reported by the device.
    pub fw_ver: String,
    /// Hardware version reported by the device.
    pub hw_ver: String,
    /// True only after a successful handshake.
    pub ready: bool,
    /// Last transport outcome observed for this fan.
    pub last_error: MiioErr,
    /// Host intent: false excludes the fan from orchestrated commands.
    pub user_enabled: bool,
    /// Parsed token bytes; valid when `crypto_cached`.
    pub token: [u8; 16],
    /// AES key derived from the token; valid when `crypto_cached`.
    pub key: [u8; 16],
    /// Initial AES IV derived from the token; valid when `crypto_cached`.
    pub iv0: [u8; 16],
    /// Cached model classification; valid when `crypto_cached`.
    pub model_type: FanModelType,
    /// Whether `token`/`key`/`iv0`/`model_type` are populated.
    pub crypto_cached: bool,
}

impl DiscoveredFan {
    /// Create a record with only address and token known.
    pub fn new(ip: Ipv4Addr, token_hex: &str) -> Self {
        Self {
            ip,
            device_id: [0; 4],
            did: 0,
            model: String::new(),
            token_hex: token_hex.to_string(),
            fw_ver: String::new(),
            hw_ver: String::new(),
            ready: false,
            last_error: MiioErr::Ok,
            user_enabled: true,
            token: [0; 16],
            key: [0; 16],
            iv0: [0; 16],
            model_type: FanModelType::Unknown,
            crypto_cached: false,
        }
    }

    /// Store the model string, truncated to the record capacity, and drop
    /// the crypto cache so the model type is re-derived.
    pub fn set_model(&mut self, model: &str) {
        self.model = truncated(model, MODEL_MAX_LEN);
        self.crypto_cached = false;
    }

    /// Store firmware/hardware version strings, truncated to capacity.
    pub fn set_versions(&mut self, fw_ver: &str, hw_ver: &str) {
        self.fw_ver = truncated(fw_ver, VERSION_MAX_LEN);
        self.hw_ver = truncated(hw_ver, VERSION_MAX_LEN);
    }

    /// Populate the cached crypto material from the hex token.
    ///
    /// Idempotent; returns false (leaving the cache unset) when the token is
    /// not 32 hex characters. A record is unusable by the session layer
    /// until this succeeds.
    pub fn cache_crypto(&mut self) -> bool {
        if self.crypto_cached {
            return true;
        }
        let Some(token) = protocol::parse_token_hex(&self.token_hex) else {
            return false;
        };
        let (key, iv0) = protocol::derive_key_iv(&token);
        self.token = token;
        self.key = key;
        self.iv0 = iv0;
        self.model_type = FanModelType::from_model(&self.model);
        self.crypto_cached = true;
        true
    }
}

fn truncated(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

/// Bounded table of discovered fans with soft-active overrides.
#[derive(Default)]
pub struct FanRegistry {
    fans: Vec<DiscoveredFan>,
    soft_active: [bool; MAX_DEVICES],
}

impl FanRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn count(&self) -> usize {
        self.fans.len()
    }

    /// All records, index-ordered.
    pub fn fans(&self) -> &[DiscoveredFan] {
        &self.fans
    }

    /// Record at `index`.
    pub fn get(&self, index: usize) -> Option<&DiscoveredFan> {
        self.fans.get(index)
    }

    /// Mutable record at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut DiscoveredFan> {
        self.fans.get_mut(index)
    }

    /// Index of the record with the given IP.
    pub fn index_of_ip(&self, ip: Ipv4Addr) -> Option<usize> {
        self.fans.iter().position(|fan| fan.ip == ip)
    }

    /// Insert a record, caching its crypto material.
    ///
    /// Rejected (returning false, registry untouched) when the table is
    /// full, a record with the same IP exists, or a record with the same
    /// nonzero derived id exists.
    pub fn insert(&mut self, fan: DiscoveredFan) -> bool {
        if self.fans.len() >= MAX_DEVICES {
            return false;
        }
        let duplicate = self.fans.iter().any(|existing| {
            existing.ip == fan.ip || (fan.did != 0 && existing.did != 0 && existing.did == fan.did)
        });
        if duplicate {
            return false;
        }
        let mut fan = fan;
        fan.cache_crypto();
        self.fans.push(fan);
        true
    }

    /// Remove the record with the given IP, shifting later records down
    /// (their soft-active flags move with them).
    pub fn remove_by_ip(&mut self, ip: Ipv4Addr) -> bool {
        let Some(index) = self.index_of_ip(ip) else {
            return false;
        };
        self.fans.remove(index);
        for i in index..MAX_DEVICES - 1 {
            self.soft_active[i] = self.soft_active[i + 1];
        }
        self.soft_active[MAX_DEVICES - 1] = false;
        true
    }

    /// Clear all records and soft-active flags.
    pub fn reset(&mut self) {
        self.fans.clear();
        self.soft_active = [false; MAX_DEVICES];
    }

    /// Set the soft-active override for a fan index.
    pub fn set_soft_active(&mut self, index: usize, enabled: bool) {
        if index < MAX_DEVICES {
            self.soft_active[index] = enabled;
        }
    }

    /// Whether the soft-active override is set for a fan index.
    pub fn is_soft_active(&self, index: usize) -> bool {
        index < MAX_DEVICES && self.soft_active[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_HEX: &str = "0123456789abcdef0123456789abcdef";

    fn fan(last_octet: u8) -> DiscoveredFan {
        DiscoveredFan::new(Ipv4Addr::new(192, 168, 1, last_octet), TOKEN_HEX)
    }

    #[test]
    fn test_insert_rejects_duplicate_ip() {
        let mut registry = FanRegistry::new();
        assert!(registry.insert(fan(10)));
        assert!(!registry.insert(fan(10)));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_insert_rejects_duplicate_nonzero_did() {
        let mut registry = FanRegistry::new();
        let mut a = fan(10);
        a.did = 42;
        let mut b = fan(11);
        b.did = 42;
        assert!(registry.insert(a));
        assert!(!registry.insert(b));

        // Zero ids never collide.
        assert!(registry.insert(fan(12)));
        assert!(registry.insert(fan(13)));
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn test_capacity_is_sixteen() {
        let mut registry = FanRegistry::new();
        for i in 0..MAX_DEVICES {
            assert!(registry.insert(fan(i as u8 + 1)));
        }
        let before: Vec<Ipv4Addr> = registry.fans().iter().map(|f| f.ip).collect();
        assert!(!registry.insert(fan(200)));
        assert_eq!(registry.count(), MAX_DEVICES);
        let after: Vec<Ipv4Addr> = registry.fans().iter().map(|f| f.ip).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_insert_caches_crypto() {
        let mut registry = FanRegistry::new();
        let mut record = fan(10);
        record.set_model("zhimi.fan.za5");
        assert!(registry.insert(record));

        let stored = registry.get(0).unwrap();
        assert!(stored.crypto_cached);
        let (key, iv0) = crate::protocol::derive_key_iv(&stored.token);
        assert_eq!(stored.key, key);
        assert_eq!(stored.iv0, iv0);
        assert_eq!(stored.model_type, FanModelType::ZhimiFanZa5);
    }

    #[test]
    fn test_cache_crypto_rejects_bad_token() {
        let mut record = DiscoveredFan::new(Ipv4Addr::new(192, 168, 1, 10), "not-a-token");
        assert!(!record.cache_crypto());
        assert!(!record.crypto_cached);
    }

    #[test]
    fn test_remove_by_ip_shifts_soft_active() {
        let mut registry = FanRegistry::new();
        registry.insert(fan(10));
        registry.insert(fan(11));
        registry.insert(fan(12));
        registry.set_soft_active(2, true);

        assert!(registry.remove_by_ip(Ipv4Addr::new(192, 168, 1, 11)));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get(1).unwrap().ip, Ipv4Addr::new(192, 168, 1, 12));
        assert!(registry.is_soft_active(1));
        assert!(!registry.is_soft_active(2));

        assert!(!registry.remove_by_ip(Ipv4Addr::new(192, 168, 1, 99)));
    }

    #[test]
    fn test_reset_clears_records_and_overrides() {
        let mut registry = FanRegistry::new();
        registry.insert(fan(10));
        registry.set_soft_active(0, true);
        registry.reset();
        assert_eq!(registry.count(), 0);
        assert!(!registry.is_soft_active(0));
    }

    #[test]
    fn test_model_truncation() {
        let mut record = fan(10);
        record.set_model("dmaker.fan.p11-with-an-absurdly-long-suffix");
        assert_eq!(record.model.len(), MODEL_MAX_LEN);
        record.set_versions("2.0.6-very-long-build-tag", "esp32");
        assert_eq!(record.fw_ver.len(), VERSION_MAX_LEN);
        assert_eq!(record.hw_ver, "esp32");
    }
}
