//! Core public types for the fan fleet.
//!
//! Provides the error classification, callback payloads, participation
//! states, and the fleet configuration value shared by the session, the
//! connection state machines, and the orchestrator.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maximum number of fans a fleet can track.
pub const MAX_DEVICES: usize = 16;

/// Maximum number of fast-connect configuration entries.
pub const MAX_FAST_CONNECT: usize = 4;

/// Default handshake cache TTL in milliseconds.
///
/// After the TTL, the next command triggers a fresh handshake. This prevents
/// sticky invalid sessions from transient UDP issues.
pub const HANDSHAKE_TTL_MS: u64 = 60_000;

/// Minimum time between orchestrated commands in milliseconds.
pub const COMMAND_COOLDOWN_MS: u64 = 100;

/// Classification of miIO transport outcomes, stored per device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MiioErr {
    /// Last operation succeeded.
    #[default]
    Ok,
    /// No response from the device.
    Timeout,
    /// UDP response from an unexpected IP.
    WrongSourceIp,
    /// AES decrypt failed (likely wrong token or stale handshake).
    DecryptFail,
    /// Decrypted but malformed or unexpected payload.
    InvalidResponse,
}

impl fmt::Display for MiioErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MiioErr::Ok => "OK",
            MiioErr::Timeout => "TIMEOUT",
            MiioErr::WrongSourceIp => "WRONG_SOURCE_IP",
            MiioErr::DecryptFail => "DECRYPT_FAIL",
            MiioErr::InvalidResponse => "INVALID_RESPONSE",
        };
        write!(f, "{}", s)
    }
}

/// The operation during which an error was observed.
///
/// Carried in [`FanErrorInfo`] only; it never affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOp {
    /// Hello exchange establishing device id and timestamp.
    Handshake,
    /// Sending an encrypted command frame.
    SendCommand,
    /// Waiting for a command or info reply.
    ReceiveResponse,
    /// Handshake forced by a health check.
    HealthCheck,
}

/// Project-level system state tag.
///
/// Part of the public API for host-side state management. The library never
/// sets or changes system state internally; hosts define their own state
/// machine over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// Sensors connected, UI interaction, or outgoing fan commands.
    Active,
    /// No interaction, system remains awake.
    Idle,
    /// Prolonged inactivity, miIO transport is inactive.
    Sleep,
}

/// Per-fan participation state, derived from user intent and the last error.
///
/// `ready == false` does not imply `Error`; it means "not handshaked yet".
/// `Error` is derived only from `last_error != Ok` without a soft-active
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipationState {
    /// Participates in orchestrated control.
    Active,
    /// Excluded by the user or host.
    Inactive,
    /// Not available until a health check or soft-active override.
    Error,
}

impl fmt::Display for ParticipationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParticipationState::Active => "ACTIVE",
            ParticipationState::Inactive => "INACTIVE",
            ParticipationState::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Error report delivered to the fleet error callback.
///
/// Informational only. Callbacks must never block, trigger retries, or
/// reenter the fleet.
#[derive(Debug, Clone)]
pub struct FanErrorInfo {
    /// Registry index of the affected fan.
    pub fan_index: u8,
    /// Expected peer address of the operation.
    pub ip: Ipv4Addr,
    /// The operation that observed the error.
    pub operation: FanOp,
    /// Classification of the error.
    pub error: MiioErr,
    /// Elapsed time of the operation when the error was observed.
    pub elapsed_ms: u32,
    /// Whether the session handshake cache was invalidated.
    pub handshake_invalidated: bool,
}

/// Callback invoked when a session operation observes an error.
pub type FanErrorCallback = Box<dyn FnMut(&FanErrorInfo) + Send + 'static>;

/// Shared error sink handed to each session by the fleet.
///
/// Sessions created standalone carry an empty sink and emit nothing.
pub(crate) type ErrorSink = Arc<Mutex<Option<FanErrorCallback>>>;

/// One fast-connect configuration entry supplied by the host.
#[derive(Debug, Clone)]
pub struct FastConnectEntry {
    /// Device IP address as a string (e.g. "192.168.1.100").
    pub ip: String,
    /// 32-character hex token string.
    pub token_hex: String,
    /// Optional model string; when set, validation skips the info query.
    pub model: Option<String>,
}

/// Outcome of validating one fast-connect entry.
#[derive(Debug, Clone)]
pub struct FastConnectResult {
    /// Device IP address.
    pub ip: Ipv4Addr,
    /// Hex token of the entry.
    pub token_hex: String,
    /// Whether handshake (and info query, if needed) succeeded.
    pub success: bool,
}

/// Callback invoked once after all fast-connect entries are validated.
pub type ValidationCallback = Box<dyn FnMut(&[FastConnectResult]) + Send + 'static>;

/// Configuration for a fan fleet.
///
/// The defaults match the miIO protocol deployment values; tests override
/// `port` to point sessions at a mock device on localhost.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// UDP port the devices listen on.
    pub port: u16,
    /// Handshake cache TTL.
    pub handshake_ttl: Duration,
    /// Deadline for a single handshake attempt.
    pub handshake_timeout: Duration,
    /// Deadline for a command reply.
    pub command_timeout: Duration,
    /// Deadline for a `miIO.info` reply.
    pub info_timeout: Duration,
    /// Minimum time between orchestrated command bursts.
    pub command_cooldown: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::MIIO_PORT,
            handshake_ttl: Duration::from_millis(HANDSHAKE_TTL_MS),
            handshake_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(1500),
            info_timeout: Duration::from_secs(2),
            command_cooldown: Duration::from_millis(COMMAND_COOLDOWN_MS),
        }
    }
}

impl FleetConfig {
    /// Create a configuration with protocol defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target UDP port (builder pattern).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the handshake cache TTL (builder pattern).
    pub fn with_handshake_ttl(mut self, ttl: Duration) -> Self {
        self.handshake_ttl = ttl;
        self
    }

    /// Set the handshake attempt deadline (builder pattern).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the command reply deadline (builder pattern).
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the orchestrated-command cooldown (builder pattern).
    pub fn with_command_cooldown(mut self, cooldown: Duration) -> Self {
        self.command_cooldown = cooldown;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_config_defaults_match_protocol_constants() {
        let config = FleetConfig::default();
        assert_eq!(config.port, 54321);
        assert_eq!(config.handshake_ttl, Duration::from_millis(60_000));
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.command_timeout, Duration::from_millis(1500));
        assert_eq!(config.command_cooldown, Duration::from_millis(100));
    }

    #[test]
    fn test_fleet_config_builder_overrides() {
        let config = FleetConfig::new()
            .with_port(12345)
            .with_handshake_ttl(Duration::from_secs(5))
            .with_command_timeout(Duration::from_millis(250));
        assert_eq!(config.port, 12345);
        assert_eq!(config.handshake_ttl, Duration::from_secs(5));
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        // Untouched fields keep their defaults.
        assert_eq!(config.info_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_miio_err_default_is_ok() {
        assert_eq!(MiioErr::default(), MiioErr::Ok);
        assert_eq!(format!("{}", MiioErr::DecryptFail), "DECRYPT_FAIL");
    }
}
