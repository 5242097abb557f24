//! Fast-connect and smart-connect.
//!
//! Fast-connect skips broadcast discovery for fans with a pre-known
//! `(ip, token[, model])`, registering them directly and validating each
//! with a handshake (plus an info query when the model is unknown).
//! Smart-connect composes the two flows: register and validate the
//! fast-connect list, then run discovery using only the tokens whose
//! devices failed validation.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::discovery::Discovery;
use crate::protocol;
use crate::registry::{DiscoveredFan, FanRegistry};
use crate::session::FanSession;
use crate::transport::UdpEndpoint;
use crate::types::{
    ErrorSink, FastConnectEntry, FastConnectResult, FleetConfig, MiioErr, ValidationCallback,
    MAX_FAST_CONNECT,
};

/// Pause between a validation handshake and the follow-up info query,
/// giving the device time to settle.
const POST_HANDSHAKE_PAUSE: Duration = Duration::from_millis(100);

/// A validated fast-connect configuration entry.
#[derive(Debug, Clone)]
struct ConfigEntry {
    ip: Ipv4Addr,
    token_hex: String,
    model: Option<String>,
}

/// Fast-connect: static registration and validation of known fans.
pub struct FastConnect {
    entries: Vec<ConfigEntry>,
    enabled: bool,
    callback: Option<ValidationCallback>,
    config: FleetConfig,
}

impl FastConnect {
    /// Create an unconfigured, disabled fast-connect.
    pub fn new(config: FleetConfig) -> Self {
        Self {
            entries: Vec::new(),
            enabled: false,
            callback: None,
            config,
        }
    }

    /// Install the configuration list (capacity 4).
    ///
    /// Entries with an unparseable IP or a token that is not 32 hex
    /// characters are silently skipped. When at least one valid entry
    /// remains, fast-connect is enabled automatically. Returns whether any
    /// entry was accepted.
    pub fn set_config(&mut self, entries: &[FastConnectEntry]) -> bool {
        if entries.is_empty() || entries.len() > MAX_FAST_CONNECT {
            return false;
        }
        self.entries.clear();
        for entry in entries {
            let Ok(ip) = entry.ip.parse::<Ipv4Addr>() else {
                debug!("fast-connect entry skipped: bad ip {:?}", entry.ip);
                continue;
            };
            if protocol::parse_token_hex(&entry.token_hex).is_none() {
                debug!("fast-connect entry skipped: bad token for {}", ip);
                continue;
            }
            self.entries.push(ConfigEntry {
                ip,
                token_hex: entry.token_hex.clone(),
                model: entry.model.clone().filter(|m| !m.is_empty()),
            });
        }
        if !self.entries.is_empty() {
            self.enabled = true;
        }
        !self.entries.is_empty()
    }

    /// Drop the configuration.
    pub fn clear_config(&mut self) {
        self.entries.clear();
    }

    /// Whether any valid entries are configured.
    pub fn is_configured(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Whether fast-connect is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable fast-connect without touching the configuration.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Install the validation callback, invoked once per validation run.
    pub fn set_callback(&mut self, callback: Option<ValidationCallback>) {
        self.callback = callback;
    }

    /// Create a not-ready registry record per configured entry.
    ///
    /// Returns whether the registry holds any records afterwards.
    pub fn register(&self, registry: &mut FanRegistry) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        for entry in &self.entries {
            let mut fan = DiscoveredFan::new(entry.ip, &entry.token_hex);
            if let Some(model) = &entry.model {
                fan.set_model(model);
            }
            registry.insert(fan);
        }
        registry.count() > 0
    }

    /// Validate every configured entry in order: handshake, then an info
    /// query when the entry carries no model.
    ///
    /// Registry records are updated in place; the validation callback fires
    /// exactly once with the full result array. Returns the results and
    /// whether every entry validated.
    pub fn validate(
        &mut self,
        udp: &mut UdpEndpoint,
        registry: &mut FanRegistry,
        sink: &ErrorSink,
    ) -> (Vec<FastConnectResult>, bool) {
        let mut results = Vec::with_capacity(self.entries.len());
        let mut overall = true;

        let entries = self.entries.clone();
        for entry in &entries {
            let success = self.validate_entry(udp, registry, sink, entry);
            overall &= success;
            results.push(FastConnectResult {
                ip: entry.ip,
                token_hex: entry.token_hex.clone(),
                success,
            });
        }

        if let Some(callback) = self.callback.as_mut() {
            if !results.is_empty() {
                callback(&results);
            }
        }
        (results, overall)
    }

    fn validate_entry(
        &self,
        udp: &mut UdpEndpoint,
        registry: &mut FanRegistry,
        sink: &ErrorSink,
        entry: &ConfigEntry,
    ) -> bool {
        let Some(index) = registry.index_of_ip(entry.ip) else {
            warn!("fast-connect: no registry record for {}", entry.ip);
            return false;
        };

        {
            let Some(record) = registry.get_mut(index) else {
                return false;
            };
            if !record.cache_crypto() {
                record.ready = false;
                record.last_error = MiioErr::Timeout;
                return false;
            }
        }

        let record = registry.get(index).cloned();
        let Some(record) = record else {
            return false;
        };
        let mut session = FanSession::with_config(record.ip, record.token, self.config.clone());
        session.configure(&record, index as u8, Arc::clone(sink));

        if let Err(e) = session.handshake(udp, self.config.handshake_timeout) {
            debug!("fast-connect handshake failed for {}: {}", entry.ip, e);
            if let Some(record) = registry.get_mut(index) {
                record.ready = false;
                record.last_error = MiioErr::Timeout;
            }
            return false;
        }

        if let Some(record) = registry.get_mut(index) {
            record.ready = true;
            record.last_error = MiioErr::Ok;
        }

        if entry.model.is_some() {
            return true;
        }

        // The model is unknown; identify the device before declaring success.
        cooperative_pause(POST_HANDSHAKE_PAUSE);
        match session.query_info(udp, self.config.info_timeout) {
            Ok(fan_info) => {
                if let Some(record) = registry.get_mut(index) {
                    record.set_model(&fan_info.model);
                    record.set_versions(&fan_info.fw_ver, &fan_info.hw_ver);
                    if fan_info.did != 0 {
                        record.did = fan_info.did;
                    }
                    record.cache_crypto();
                }
                info!("fast-connect validated {} as {}", entry.ip, fan_info.model);
                true
            }
            Err(e) => {
                debug!("fast-connect info query failed for {}: {}", entry.ip, e);
                false
            }
        }
    }
}

/// Yield the scheduler for roughly `duration` in small slices.
fn cooperative_pause(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::thread::sleep(crate::transport::POLL_INTERVAL);
    }
}

// ---------------------------------------------------------------------------
// Smart-connect
// ---------------------------------------------------------------------------

/// Smart-connect state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmartConnectState {
    #[default]
    Idle,
    /// Running fast-connect validation.
    ValidatingFastConnect,
    /// Handing the failed tokens to discovery.
    StartingDiscovery,
    /// Discovery over the failed tokens is in flight.
    Discovering,
    Complete,
}

/// Composite connect flow: fast-connect first, discovery over its failures.
pub struct SmartConnect {
    state: SmartConnectState,
    window: Duration,
    failed_tokens: Vec<String>,
}

impl Default for SmartConnect {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartConnect {
    /// Create an idle smart-connect machine.
    pub fn new() -> Self {
        Self {
            state: SmartConnectState::Idle,
            window: Duration::ZERO,
            failed_tokens: Vec::new(),
        }
    }

    /// Begin the flow.
    ///
    /// With a configured and enabled fast-connect, registers its fans and
    /// moves to validation. Without one there are no tokens to discover
    /// with, so the flow completes immediately.
    pub fn start(
        &mut self,
        fast_connect: &FastConnect,
        registry: &mut FanRegistry,
        window: Duration,
    ) -> bool {
        if self.state != SmartConnectState::Idle {
            return false;
        }
        self.window = window;
        self.failed_tokens.clear();

        if fast_connect.is_configured() && fast_connect.is_enabled() {
            fast_connect.register(registry);
            self.state = SmartConnectState::ValidatingFastConnect;
        } else {
            debug!("smart-connect: no fast-connect configuration, completing");
            self.state = SmartConnectState::Complete;
        }
        true
    }

    /// Drive the machine one step. Returns true while work remains.
    pub fn update(
        &mut self,
        udp: &mut UdpEndpoint,
        fast_connect: &mut FastConnect,
        discovery: &mut Discovery,
        registry: &mut FanRegistry,
        sink: &ErrorSink,
    ) -> bool {
        match self.state {
            SmartConnectState::Idle | SmartConnectState::Complete => false,

            SmartConnectState::ValidatingFastConnect => {
                let (results, _) = fast_connect.validate(udp, registry, sink);
                for result in &results {
                    if !result.success {
                        info!("smart-connect: {} failed validation", result.ip);
                        self.failed_tokens.push(result.token_hex.clone());
                        registry.remove_by_ip(result.ip);
                    }
                }
                if self.failed_tokens.is_empty() {
                    self.state = SmartConnectState::Complete;
                    false
                } else {
                    self.state = SmartConnectState::StartingDiscovery;
                    true
                }
            }

            SmartConnectState::StartingDiscovery => {
                discovery.cancel();
                if discovery.start(udp, &self.failed_tokens, self.window) {
                    self.state = SmartConnectState::Discovering;
                    true
                } else {
                    warn!("smart-connect: discovery failed to start");
                    self.state = SmartConnectState::Complete;
                    false
                }
            }

            SmartConnectState::Discovering => {
                if discovery.update(udp, registry) {
                    true
                } else {
                    self.state = SmartConnectState::Complete;
                    false
                }
            }
        }
    }

    /// Current machine state.
    pub fn state(&self) -> SmartConnectState {
        self.state
    }

    /// Whether the flow finished.
    pub fn is_complete(&self) -> bool {
        self.state == SmartConnectState::Complete
    }

    /// Whether the flow is running (not idle, not complete).
    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self.state,
            SmartConnectState::Idle | SmartConnectState::Complete
        )
    }

    /// Abort and return to idle.
    pub fn cancel(&mut self) {
        self.state = SmartConnectState::Idle;
        self.failed_tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const TOKEN_HEX: &str = "0123456789abcdef0123456789abcdef";

    fn entry(ip: &str, token: &str, model: Option<&str>) -> FastConnectEntry {
        FastConnectEntry {
            ip: ip.to_string(),
            token_hex: token.to_string(),
            model: model.map(str::to_string),
        }
    }

    fn short_config() -> FleetConfig {
        FleetConfig::new()
            .with_handshake_timeout(Duration::from_millis(40))
            .with_port(1)
    }

    #[test]
    fn test_set_config_skips_invalid_entries() {
        let mut fast = FastConnect::new(FleetConfig::default());
        assert!(!fast.is_enabled());

        let accepted = fast.set_config(&[
            entry("192.168.1.10", TOKEN_HEX, None),
            entry("not-an-ip", TOKEN_HEX, None),
            entry("192.168.1.11", "deadbeef", None),
            entry("192.168.1.12", TOKEN_HEX, Some("zhimi.fan.za5")),
        ]);
        assert!(accepted);
        assert!(fast.is_enabled());
        assert_eq!(fast.entries.len(), 2);
    }

    #[test]
    fn test_set_config_rejects_empty_and_oversized() {
        let mut fast = FastConnect::new(FleetConfig::default());
        assert!(!fast.set_config(&[]));
        let too_many: Vec<_> = (0..5)
            .map(|i| entry(&format!("192.168.1.{}", i + 1), TOKEN_HEX, None))
            .collect();
        assert!(!fast.set_config(&too_many));
        assert!(!fast.is_configured());
    }

    #[test]
    fn test_register_creates_not_ready_records() {
        let mut fast = FastConnect::new(FleetConfig::default());
        fast.set_config(&[
            entry("192.168.1.10", TOKEN_HEX, Some("zhimi.fan.za5")),
            entry("192.168.1.11", TOKEN_HEX, None),
        ]);

        let mut registry = FanRegistry::new();
        assert!(fast.register(&mut registry));
        assert_eq!(registry.count(), 2);

        let first = registry.get(0).unwrap();
        assert!(!first.ready);
        assert_eq!(first.model, "zhimi.fan.za5");
        assert_eq!(first.last_error, MiioErr::Ok);
        assert!(registry.get(1).unwrap().model.is_empty());
    }

    #[test]
    fn test_validate_reports_unreachable_entries_once() {
        let mut fast = FastConnect::new(short_config());
        // Port 1 on localhost: nothing answers, handshakes time out fast.
        fast.set_config(&[
            entry("127.0.0.1", TOKEN_HEX, Some("zhimi.fan.za5")),
        ]);

        let calls = Arc::new(Mutex::new(0usize));
        let calls_in_cb = Arc::clone(&calls);
        fast.set_callback(Some(Box::new(move |results| {
            *calls_in_cb.lock().unwrap() += 1;
            assert_eq!(results.len(), 1);
            assert!(!results[0].success);
        })));

        let mut registry = FanRegistry::new();
        fast.register(&mut registry);

        let mut udp = UdpEndpoint::bind().unwrap();
        let sink: ErrorSink = Arc::new(Mutex::new(None));
        let (results, overall) = fast.validate(&mut udp, &mut registry, &sink);

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(results.len(), 1);
        assert!(!overall);
        let record = registry.get(0).unwrap();
        assert!(!record.ready);
        assert_eq!(record.last_error, MiioErr::Timeout);
    }

    #[test]
    fn test_smart_connect_without_config_completes_immediately() {
        let fast = FastConnect::new(FleetConfig::default());
        let mut registry = FanRegistry::new();
        let mut smart = SmartConnect::new();

        assert!(smart.start(&fast, &mut registry, Duration::from_millis(500)));
        assert!(smart.is_complete());
        assert!(!smart.is_in_progress());
        assert_eq!(registry.count(), 0);

        // Not restartable until cancelled back to idle.
        assert!(!smart.start(&fast, &mut registry, Duration::from_millis(500)));
        smart.cancel();
        assert!(smart.start(&fast, &mut registry, Duration::from_millis(500)));
    }

    #[test]
    fn test_smart_connect_collects_failed_tokens_and_removes_records() {
        let config = short_config();
        let mut fast = FastConnect::new(config);
        fast.set_config(&[entry("127.0.0.1", TOKEN_HEX, Some("zhimi.fan.za5"))]);

        let mut registry = FanRegistry::new();
        let mut discovery = Discovery::new(1);
        let mut smart = SmartConnect::new();
        let mut udp = UdpEndpoint::bind().unwrap();
        let sink: ErrorSink = Arc::new(Mutex::new(None));

        assert!(smart.start(&fast, &mut registry, Duration::from_millis(30)));
        assert_eq!(smart.state(), SmartConnectState::ValidatingFastConnect);
        assert_eq!(registry.count(), 1);

        // Validation fails (nothing listens), the record is removed, and the
        // failed token flows into discovery.
        assert!(smart.update(&mut udp, &mut fast, &mut discovery, &mut registry, &sink));
        assert_eq!(smart.state(), SmartConnectState::StartingDiscovery);
        assert_eq!(registry.count(), 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while smart.update(&mut udp, &mut fast, &mut discovery, &mut registry, &sink) {
            assert!(Instant::now() < deadline, "smart connect failed to finish");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(smart.is_complete());
    }
}
