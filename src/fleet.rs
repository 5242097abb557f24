//! Fleet orchestration.
//!
//! [`FanFleet`] owns the shared UDP endpoint, the device registry, one
//! session per registry index, and the connection state machines, and
//! fans commands out to every fan whose participation state is `Active`.
//! Command coalescing drops orchestrated bursts issued within the cooldown
//! window; sleep/wake hooks tear down and rebuild the transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::connect::{FastConnect, SmartConnect, SmartConnectState};
use crate::discovery::{DeviceQuery, Discovery, DiscoveryState, QueryState};
use crate::error::Result;
use crate::registry::{DiscoveredFan, FanRegistry};
use crate::session::FanSession;
use crate::transport::UdpEndpoint;
use crate::types::{
    ErrorSink, FanErrorCallback, FanOp, FastConnectEntry, FleetConfig, MiioErr,
    ParticipationState, ValidationCallback, MAX_DEVICES,
};

/// Orchestrator for a fleet of up to 16 fans.
pub struct FanFleet {
    config: FleetConfig,
    udp: Option<UdpEndpoint>,
    registry: FanRegistry,
    sessions: Vec<FanSession>,
    discovery: Discovery,
    query: DeviceQuery,
    fast_connect: FastConnect,
    smart_connect: SmartConnect,
    error_sink: ErrorSink,
    last_command: Option<Instant>,
}

impl Default for FanFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl FanFleet {
    /// Create a fleet with default protocol configuration.
    pub fn new() -> Self {
        Self::with_config(FleetConfig::default())
    }

    /// Create a fleet with explicit configuration.
    pub fn with_config(config: FleetConfig) -> Self {
        Self {
            udp: None,
            registry: FanRegistry::new(),
            sessions: Vec::new(),
            discovery: Discovery::new(config.port),
            query: DeviceQuery::new(config.port),
            fast_connect: FastConnect::new(config.clone()),
            smart_connect: SmartConnect::new(),
            error_sink: Arc::new(Mutex::new(None)),
            last_command: None,
            config,
        }
    }

    /// Bind the shared endpoint on demand.
    fn ensure_endpoint(&mut self) -> bool {
        if self.udp.is_none() {
            match UdpEndpoint::bind() {
                Ok(udp) => self.udp = Some(udp),
                Err(e) => {
                    log::warn!("failed to bind UDP endpoint: {}", e);
                    return false;
                }
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Registry access
    // ---------------------------------------------------------------------

    /// All registry records, index-ordered.
    pub fn fans(&self) -> &[DiscoveredFan] {
        self.registry.fans()
    }

    /// Record at `index`.
    pub fn fan(&self, index: usize) -> Option<&DiscoveredFan> {
        self.registry.get(index)
    }

    /// Number of registry records.
    pub fn fan_count(&self) -> usize {
        self.registry.count()
    }

    /// Clear all records, sessions, and soft-active overrides.
    pub fn reset(&mut self) {
        self.registry.reset();
        self.sessions.clear();
    }

    /// Log a diagnostic summary of every record.
    pub fn print_fans(&self) {
        info!("discovered fans:");
        if self.registry.count() == 0 {
            info!("  (none)");
            return;
        }
        for (i, fan) in self.registry.fans().iter().enumerate() {
            info!(
                "  [{}] {} at {} did={} fw={} hw={} enabled={} ready={} last_error={} participation={}",
                i,
                fan.model,
                fan.ip,
                fan.did,
                fan.fw_ver,
                fan.hw_ver,
                fan.user_enabled,
                fan.ready,
                fan.last_error,
                self.participation(i)
            );
        }
    }

    // ---------------------------------------------------------------------
    // Discovery surface
    // ---------------------------------------------------------------------

    /// Begin broadcast discovery with the given tokens and collection window.
    pub fn start_discovery(&mut self, tokens: &[String], window: Duration) -> bool {
        if !self.ensure_endpoint() {
            return false;
        }
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        self.discovery.start(udp, tokens, window)
    }

    /// Drive discovery one step. Returns true while in progress.
    pub fn update_discovery(&mut self) -> bool {
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        self.discovery.update(udp, &mut self.registry)
    }

    /// Current discovery state.
    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    /// Whether discovery finished successfully.
    pub fn is_discovery_complete(&self) -> bool {
        self.discovery.is_complete()
    }

    /// Whether discovery is running.
    pub fn is_discovery_in_progress(&self) -> bool {
        self.discovery.is_in_progress()
    }

    /// Abort discovery.
    pub fn cancel_discovery(&mut self) {
        self.discovery.cancel();
    }

    /// Point discovery hellos at a single unicast address (mock devices).
    #[cfg(any(test, feature = "testutils"))]
    pub fn set_discovery_target(&mut self, addr: std::net::SocketAddr) {
        self.discovery.set_unicast_target(addr);
    }

    // ---------------------------------------------------------------------
    // Unicast query surface
    // ---------------------------------------------------------------------

    /// Begin a unicast query of a known IP with a hex token.
    pub fn start_query(&mut self, ip: std::net::Ipv4Addr, token_hex: &str) -> bool {
        if !self.ensure_endpoint() {
            return false;
        }
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        self.query.start(udp, ip, token_hex)
    }

    /// Drive the query one step. Returns true while in progress.
    pub fn update_query(&mut self) -> bool {
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        self.query.update(udp, &mut self.registry)
    }

    /// Current query state.
    pub fn query_state(&self) -> QueryState {
        self.query.state()
    }

    /// Whether the query finished successfully.
    pub fn is_query_complete(&self) -> bool {
        self.query.is_complete()
    }

    /// Whether the query is running.
    pub fn is_query_in_progress(&self) -> bool {
        self.query.is_in_progress()
    }

    /// Abort the query.
    pub fn cancel_query(&mut self) {
        self.query.cancel();
    }

    // ---------------------------------------------------------------------
    // Fast-connect surface
    // ---------------------------------------------------------------------

    /// Install the fast-connect configuration (capacity 4); invalid entries
    /// are skipped, and fast-connect auto-enables when any remain.
    pub fn set_fast_connect_config(&mut self, entries: &[FastConnectEntry]) -> bool {
        self.fast_connect.set_config(entries)
    }

    /// Drop the fast-connect configuration.
    pub fn clear_fast_connect_config(&mut self) {
        self.fast_connect.clear_config();
    }

    /// Whether fast-connect is enabled.
    pub fn is_fast_connect_enabled(&self) -> bool {
        self.fast_connect.is_enabled()
    }

    /// Enable or disable fast-connect.
    pub fn set_fast_connect_enabled(&mut self, enabled: bool) {
        self.fast_connect.set_enabled(enabled);
    }

    /// Register a not-ready record per configured entry.
    pub fn register_fast_connect(&mut self) -> bool {
        if !self.ensure_endpoint() {
            return false;
        }
        self.fast_connect.register(&mut self.registry)
    }

    /// Install the validation callback (fired once per validation run).
    pub fn set_validation_callback(&mut self, callback: Option<ValidationCallback>) {
        self.fast_connect.set_callback(callback);
    }

    /// Validate every configured entry. Returns whether all succeeded.
    pub fn validate_fast_connect(&mut self) -> bool {
        if !self.ensure_endpoint() {
            return false;
        }
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        let (_, overall) = self
            .fast_connect
            .validate(udp, &mut self.registry, &self.error_sink);
        overall
    }

    // ---------------------------------------------------------------------
    // Smart-connect surface
    // ---------------------------------------------------------------------

    /// Begin smart-connect: fast-connect validation, then discovery over
    /// the tokens whose devices failed.
    pub fn start_smart_connect(&mut self, window: Duration) -> bool {
        if !self.ensure_endpoint() {
            return false;
        }
        self.smart_connect
            .start(&self.fast_connect, &mut self.registry, window)
    }

    /// Drive smart-connect one step. Returns true while in progress.
    pub fn update_smart_connect(&mut self) -> bool {
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        self.smart_connect.update(
            udp,
            &mut self.fast_connect,
            &mut self.discovery,
            &mut self.registry,
            &self.error_sink,
        )
    }

    /// Current smart-connect state.
    pub fn smart_connect_state(&self) -> SmartConnectState {
        self.smart_connect.state()
    }

    /// Whether smart-connect finished.
    pub fn is_smart_connect_complete(&self) -> bool {
        self.smart_connect.is_complete()
    }

    /// Whether smart-connect is running.
    pub fn is_smart_connect_in_progress(&self) -> bool {
        self.smart_connect.is_in_progress()
    }

    /// Abort smart-connect (and any discovery it started).
    pub fn cancel_smart_connect(&mut self) {
        self.discovery.cancel();
        self.smart_connect.cancel();
    }

    // ---------------------------------------------------------------------
    // Error and health surface
    // ---------------------------------------------------------------------

    /// Install (or clear) the error callback.
    ///
    /// Callbacks are informational and must never block, retry, or reenter
    /// the fleet.
    pub fn set_error_callback(&mut self, callback: Option<FanErrorCallback>) {
        if let Ok(mut guard) = self.error_sink.lock() {
            *guard = callback;
        }
    }

    /// Whether the fan at `index` has a usable handshake.
    pub fn is_fan_ready(&self, index: usize) -> bool {
        self.registry.get(index).is_some_and(|fan| fan.ready)
    }

    /// Last transport outcome for the fan at `index`; out-of-range indices
    /// read as `Timeout`.
    pub fn last_error(&self, index: usize) -> MiioErr {
        self.registry
            .get(index)
            .map_or(MiioErr::Timeout, |fan| fan.last_error)
    }

    /// Force a fresh handshake for one fan and refresh its record.
    pub fn health_check(&mut self, index: usize, timeout: Duration) -> bool {
        if index >= self.registry.count() || !self.ensure_endpoint() {
            return false;
        }
        if !self.prepare_session(index) {
            return false;
        }
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        let session = &mut self.sessions[index];
        session.invalidate_handshake();
        let result = session.handshake_as(udp, timeout, FanOp::HealthCheck);
        self.apply_result(index, result)
    }

    /// Health-check every record. Returns whether all are healthy.
    pub fn health_check_all(&mut self, timeout: Duration) -> bool {
        let mut all_healthy = true;
        for index in 0..self.registry.count() {
            if !self.health_check(index, timeout) {
                all_healthy = false;
            }
        }
        all_healthy
    }

    // ---------------------------------------------------------------------
    // Sleep hooks
    // ---------------------------------------------------------------------

    /// Mark every fan not-ready before the host sleeps; optionally close
    /// the endpoint and invalidate session caches. Resets the coalescing
    /// timer.
    pub fn prepare_for_sleep(&mut self, close_udp: bool, invalidate_handshakes: bool) {
        for index in 0..self.registry.count() {
            if let Some(fan) = self.registry.get_mut(index) {
                fan.ready = false;
            }
        }
        if close_udp {
            self.udp = None;
        }
        if invalidate_handshakes {
            for session in &mut self.sessions {
                session.invalidate_handshake();
            }
        }
        self.last_command = None;
        debug!("prepared for sleep (close_udp={})", close_udp);
    }

    /// Rebind the endpoint and force re-handshake and crypto re-derivation
    /// on every fan's next use.
    pub fn soft_wake_up(&mut self) {
        match self.udp.as_mut() {
            Some(udp) => {
                let _ = udp.rebind();
            }
            None => self.udp = UdpEndpoint::bind().ok(),
        }
        for index in 0..self.registry.count() {
            if let Some(fan) = self.registry.get_mut(index) {
                fan.ready = false;
                fan.crypto_cached = false;
            }
        }
        for session in &mut self.sessions {
            session.invalidate_handshake();
        }
        debug!("soft wake-up: transport re-bound, caches dropped");
    }

    // ---------------------------------------------------------------------
    // Participation
    // ---------------------------------------------------------------------

    /// Derived participation state; out-of-range indices read as `Error`.
    pub fn participation(&self, index: usize) -> ParticipationState {
        let Some(fan) = self.registry.get(index) else {
            return ParticipationState::Error;
        };
        if !fan.user_enabled {
            return ParticipationState::Inactive;
        }
        if fan.last_error != MiioErr::Ok && !self.registry.is_soft_active(index) {
            return ParticipationState::Error;
        }
        ParticipationState::Active
    }

    /// Set host intent for a fan; disabled fans are excluded from
    /// orchestrated commands.
    pub fn set_enabled(&mut self, index: usize, enabled: bool) {
        if let Some(fan) = self.registry.get_mut(index) {
            fan.user_enabled = enabled;
        }
    }

    /// Whether the fan at `index` is host-enabled.
    pub fn is_enabled(&self, index: usize) -> bool {
        self.registry.get(index).is_some_and(|fan| fan.user_enabled)
    }

    /// Keep a fan `Active` despite `last_error != Ok`; intended for
    /// host-level retry logic.
    pub fn set_soft_active(&mut self, index: usize, enabled: bool) {
        self.registry.set_soft_active(index, enabled);
    }

    // ---------------------------------------------------------------------
    // Orchestrated commands
    // ---------------------------------------------------------------------

    /// Switch every `Active` fan on or off, index-ascending.
    pub fn power_all_orchestrated(&mut self, on: bool) -> bool {
        self.orchestrate(move |session, udp| session.set_power(udp, on))
    }

    /// Set every `Active` fan's speed percent, index-ascending.
    pub fn speed_all_orchestrated(&mut self, percent: u8) -> bool {
        self.orchestrate(move |session, udp| session.set_speed(udp, percent))
    }

    fn orchestrate<F>(&mut self, mut op: F) -> bool
    where
        F: FnMut(&mut FanSession, &mut UdpEndpoint) -> Result<()>,
    {
        if !self.ensure_endpoint() {
            return false;
        }

        // Coalesce bursts arriving inside the cooldown window.
        if let Some(last) = self.last_command {
            if last.elapsed() < self.config.command_cooldown {
                debug!("orchestrated command coalesced");
                return true;
            }
        }
        self.last_command = Some(Instant::now());

        let mut any_success = false;
        for index in 0..self.registry.count() {
            if self.participation(index) != ParticipationState::Active {
                continue;
            }
            if !self.prepare_session(index) {
                if let Some(fan) = self.registry.get_mut(index) {
                    fan.last_error = MiioErr::Timeout;
                }
                continue;
            }
            let Some(udp) = self.udp.as_mut() else {
                break;
            };
            let result = op(&mut self.sessions[index], udp);
            if self.apply_result(index, result) {
                any_success = true;
            }
        }
        any_success
    }

    /// Handshake every enabled fan that is not waiting on a health check.
    pub fn handshake_all_orchestrated(&mut self) -> bool {
        if !self.ensure_endpoint() {
            return false;
        }
        let mut any_success = false;
        for index in 0..self.registry.count() {
            let Some(fan) = self.registry.get(index) else {
                continue;
            };
            if !fan.user_enabled {
                continue;
            }
            // Fans in error state need a health check first.
            if fan.last_error != MiioErr::Ok && !fan.ready {
                continue;
            }
            if !self.prepare_session(index) {
                continue;
            }
            let Some(udp) = self.udp.as_mut() else {
                break;
            };
            let timeout = self.config.handshake_timeout;
            let result = self.sessions[index].handshake(udp, timeout);
            if self.apply_result(index, result) {
                any_success = true;
            }
        }
        any_success
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Make session `index` exist and match its registry record. Fails when
    /// the record's token cannot be parsed.
    fn prepare_session(&mut self, index: usize) -> bool {
        if index >= MAX_DEVICES {
            return false;
        }
        let sink = Arc::clone(&self.error_sink);
        let config = self.config.clone();
        let Some(record) = self.registry.get_mut(index) else {
            return false;
        };
        if !record.cache_crypto() {
            return false;
        }
        let record = record.clone();
        while self.sessions.len() <= index {
            self.sessions
                .push(FanSession::with_config(record.ip, record.token, config.clone()));
        }
        self.sessions[index].configure(&record, index as u8, sink);
        true
    }

    /// Map a session result onto the registry record per the error design.
    fn apply_result(&mut self, index: usize, result: Result<()>) -> bool {
        let Some(fan) = self.registry.get_mut(index) else {
            return false;
        };
        match result {
            Ok(()) => {
                fan.ready = true;
                fan.last_error = MiioErr::Ok;
                true
            }
            Err(e) => {
                fan.ready = false;
                fan.last_error = e.to_miio();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const TOKEN_HEX: &str = "0123456789abcdef0123456789abcdef";

    fn fleet_with_fans(count: u8) -> FanFleet {
        let mut fleet = FanFleet::new();
        for i in 0..count {
            let fan = DiscoveredFan::new(Ipv4Addr::new(192, 0, 2, i + 1), TOKEN_HEX);
            assert!(fleet.registry.insert(fan));
        }
        fleet
    }

    #[test]
    fn test_participation_derivation() {
        let mut fleet = fleet_with_fans(3);

        // Default: enabled, no error -> Active.
        assert_eq!(fleet.participation(0), ParticipationState::Active);

        // Disabled -> Inactive, regardless of errors.
        fleet.set_enabled(0, false);
        fleet.registry.get_mut(0).unwrap().last_error = MiioErr::Timeout;
        assert_eq!(fleet.participation(0), ParticipationState::Inactive);
        assert!(!fleet.is_enabled(0));

        // Enabled with an error -> Error; soft-active forces Active.
        fleet.registry.get_mut(1).unwrap().last_error = MiioErr::DecryptFail;
        assert_eq!(fleet.participation(1), ParticipationState::Error);
        fleet.set_soft_active(1, true);
        assert_eq!(fleet.participation(1), ParticipationState::Active);

        // ready == false alone does not mean Error.
        let fan = fleet.registry.get_mut(2).unwrap();
        assert!(!fan.ready);
        assert_eq!(fan.last_error, MiioErr::Ok);
        assert_eq!(fleet.participation(2), ParticipationState::Active);

        // Out of range reads as Error.
        assert_eq!(fleet.participation(42), ParticipationState::Error);
    }

    #[test]
    fn test_accessor_bounds() {
        let fleet = fleet_with_fans(1);
        assert!(!fleet.is_fan_ready(0));
        assert!(!fleet.is_fan_ready(9));
        assert_eq!(fleet.last_error(0), MiioErr::Ok);
        assert_eq!(fleet.last_error(9), MiioErr::Timeout);
        assert!(fleet.is_enabled(0));
        assert!(!fleet.is_enabled(9));
    }

    #[test]
    fn test_command_coalescing_window() {
        let mut fleet = FanFleet::new();

        // No fans: the burst itself reports no success, but it arms the
        // coalescing timer.
        assert!(!fleet.power_all_orchestrated(true));
        // Within the cooldown the command is dropped and reported done.
        assert!(fleet.power_all_orchestrated(false));
        assert!(fleet.speed_all_orchestrated(50));

        // After the cooldown the fan-out runs again.
        std::thread::sleep(Duration::from_millis(120));
        assert!(!fleet.power_all_orchestrated(false));
    }

    #[test]
    fn test_prepare_for_sleep_resets_coalescing_and_readiness() {
        let mut fleet = fleet_with_fans(2);
        fleet.registry.get_mut(0).unwrap().ready = true;

        assert!(!fleet.power_all_orchestrated(true));
        fleet.prepare_for_sleep(true, true);

        assert!(!fleet.is_fan_ready(0));
        // Coalescing timer was reset: the next burst is not dropped.
        assert!(!fleet.power_all_orchestrated(true));
    }

    #[test]
    fn test_soft_wake_up_drops_crypto_cache() {
        let mut fleet = fleet_with_fans(1);
        assert!(fleet.registry.get(0).unwrap().crypto_cached);
        fleet.soft_wake_up();
        let fan = fleet.registry.get(0).unwrap();
        assert!(!fan.ready);
        assert!(!fan.crypto_cached);
    }

    #[test]
    fn test_reset_clears_registry_and_sessions() {
        let mut fleet = fleet_with_fans(2);
        assert!(fleet.prepare_session(0));
        assert_eq!(fleet.fan_count(), 2);
        fleet.reset();
        assert_eq!(fleet.fan_count(), 0);
        assert!(fleet.sessions.is_empty());
    }

    #[test]
    fn test_prepare_session_rejects_bad_token() {
        let mut fleet = FanFleet::new();
        let fan = DiscoveredFan::new(Ipv4Addr::new(192, 0, 2, 1), "bogus");
        // Insert bypassing token validation; caching fails later.
        fleet.registry.insert(fan);
        assert!(!fleet.prepare_session(0));
    }

    #[test]
    fn test_health_check_rejects_out_of_range() {
        let mut fleet = FanFleet::new();
        assert!(!fleet.health_check(0, Duration::from_millis(10)));
    }
}
