//! Broadcast discovery and unicast device query.
//!
//! Both are cooperative state machines: the host calls `update()` from its
//! main loop and no call blocks beyond a single non-blocking socket poll.
//! Discovery broadcasts hellos, collects responding candidates, then probes
//! the cartesian product of candidates and configured tokens with encrypted
//! `miIO.info` queries; every successful probe inserts a registry record.
//! The query variant runs the same probe against one known IP.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::model;
use crate::net_utils;
use crate::protocol::{self, FanInfo};
use crate::registry::{DiscoveredFan, FanRegistry};
use crate::session::HELLO_RESEND_INTERVAL;
use crate::transport::UdpEndpoint;
use crate::types::{MiioErr, MAX_DEVICES};

/// How long a single `miIO.info` probe waits for its reply.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-(candidate, token) budget used by the whole-discovery guard.
const PROBE_BUDGET: Duration = Duration::from_millis(2500);

/// How long the unicast query waits for a hello reply.
const QUERY_HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// Discovery state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Idle,
    /// Broadcasting hellos and collecting candidates.
    SendingHello,
    /// Probing candidates with `miIO.info` per token.
    QueryingDevices,
    Complete,
    Error,
    Timeout,
}

/// Unicast query state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryState {
    #[default]
    Idle,
    /// Sending unicast hellos, waiting for the 32-byte reply.
    WaitingHello,
    /// Running the `miIO.info` probe.
    SendingQuery,
    Complete,
    Error,
    Timeout,
}

/// A device that answered a hello but has not been identified yet.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    ip: Ipv4Addr,
    device_id: [u8; 4],
    stamp: u32,
}

/// Overall guard for the probing phase: generous enough for every
/// (candidate, token) pair, never less than three discovery windows.
fn querying_guard(window: Duration, candidates: usize, tokens: usize) -> Duration {
    let budget = window + PROBE_BUDGET * (candidates * tokens) as u32;
    budget.max(window * 3)
}

// ---------------------------------------------------------------------------
// miIO.info probe, shared by discovery and the unicast query
// ---------------------------------------------------------------------------

enum ProbeOutcome {
    InProgress,
    Success(FanInfo),
    Failed(MiioErr),
}

/// One in-flight encrypted `miIO.info` attempt against a candidate using a
/// specific token.
struct InfoProbe {
    target: SocketAddr,
    candidate: Candidate,
    token: [u8; 16],
    key: [u8; 16],
    iv0: [u8; 16],
    sent_at: Option<Instant>,
}

impl InfoProbe {
    fn new(candidate: Candidate, token_hex: &str, port: u16) -> Option<Self> {
        let token = protocol::parse_token_hex(token_hex)?;
        let (key, iv0) = protocol::derive_key_iv(&token);
        Some(Self {
            target: SocketAddr::new(IpAddr::V4(candidate.ip), port),
            candidate,
            token,
            key,
            iv0,
            sent_at: None,
        })
    }

    fn poll(&mut self, udp: &mut UdpEndpoint) -> ProbeOutcome {
        let Some(sent_at) = self.sent_at else {
            return match self.send(udp) {
                Ok(()) => ProbeOutcome::InProgress,
                Err(e) => {
                    warn!("info probe to {} failed to send: {}", self.target, e);
                    ProbeOutcome::Failed(MiioErr::Timeout)
                }
            };
        };

        if sent_at.elapsed() > PROBE_TIMEOUT {
            return ProbeOutcome::Failed(MiioErr::Timeout);
        }

        let mut buf = [0u8; protocol::UDP_BUFFER_LEN];
        match udp.poll_recv(&mut buf) {
            Ok(Some((len, src))) => {
                if src.ip() != IpAddr::V4(self.candidate.ip) || len <= protocol::HEADER_LEN {
                    return ProbeOutcome::InProgress;
                }
                match self.parse_reply(&buf[protocol::HEADER_LEN..len]) {
                    Ok(info) => ProbeOutcome::Success(info),
                    Err(err) => ProbeOutcome::Failed(err),
                }
            }
            Ok(None) => ProbeOutcome::InProgress,
            Err(e) => {
                warn!("info probe recv error: {}", e);
                ProbeOutcome::Failed(MiioErr::Timeout)
            }
        }
    }

    /// Rebind (flushing stale hello traffic) and send the encrypted query,
    /// stamped with the candidate's hello timestamp plus one.
    fn send(&mut self, udp: &mut UdpEndpoint) -> std::io::Result<()> {
        udp.rebind()?;
        let cipher = protocol::encrypt_payload(protocol::INFO_REQUEST_JSON, &self.key, &self.iv0);
        let frame = protocol::encode_frame(
            self.candidate.device_id,
            self.candidate.stamp.wrapping_add(1),
            &self.token,
            &cipher,
        );
        udp.send_to(&frame, self.target)?;
        self.sent_at = Some(Instant::now());
        Ok(())
    }

    fn parse_reply(&self, cipher: &[u8]) -> Result<FanInfo, MiioErr> {
        let json = protocol::decrypt_payload(cipher, &self.key, &self.iv0)
            .map_err(|e| e.to_miio())?;
        let info = protocol::parse_info_response(&json, self.candidate.device_id)
            .map_err(|e| e.to_miio())?;
        if !model::is_supported_model(&info.model) {
            debug!("ignoring unsupported model {} at {}", info.model, self.candidate.ip);
            return Err(MiioErr::InvalidResponse);
        }
        Ok(info)
    }

    fn build_record(candidate: Candidate, token_hex: &str, info: &FanInfo) -> DiscoveredFan {
        let mut fan = DiscoveredFan::new(candidate.ip, token_hex);
        fan.device_id = candidate.device_id;
        fan.did = info.did;
        fan.set_model(&info.model);
        fan.set_versions(&info.fw_ver, &info.hw_ver);
        fan
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Broadcast discovery state machine.
pub struct Discovery {
    state: DiscoveryState,
    port: u16,
    window: Duration,
    tokens: Vec<String>,
    started: Option<Instant>,
    last_hello: Option<Instant>,
    candidates: Vec<Candidate>,
    candidate_index: usize,
    token_index: usize,
    probe: Option<InfoProbe>,
    unicast_target: Option<SocketAddr>,
}

impl Discovery {
    /// Create an idle discovery machine targeting the given device port.
    pub fn new(port: u16) -> Self {
        Self {
            state: DiscoveryState::Idle,
            port,
            window: Duration::ZERO,
            tokens: Vec::new(),
            started: None,
            last_hello: None,
            candidates: Vec::new(),
            candidate_index: 0,
            token_index: 0,
            probe: None,
            unicast_target: None,
        }
    }

    /// Replace the broadcast hello targets with a single unicast address.
    ///
    /// Broadcasts do not traverse loopback; tests point discovery at a mock
    /// device this way.
    #[cfg(any(test, feature = "testutils"))]
    pub fn set_unicast_target(&mut self, addr: SocketAddr) {
        self.unicast_target = Some(addr);
    }

    /// Begin discovery: rebind the endpoint and send the first hello burst.
    ///
    /// Returns false (and does nothing) without tokens or when not idle.
    pub fn start(&mut self, udp: &mut UdpEndpoint, tokens: &[String], window: Duration) -> bool {
        if tokens.is_empty() || self.state != DiscoveryState::Idle {
            return false;
        }
        if udp.rebind().is_err() {
            return false;
        }

        self.window = window;
        self.tokens = tokens.to_vec();
        self.candidates.clear();
        self.candidate_index = 0;
        self.token_index = 0;
        self.probe = None;
        self.started = Some(Instant::now());

        self.send_hellos(udp);
        self.last_hello = Some(Instant::now());
        self.state = DiscoveryState::SendingHello;
        debug!(
            "discovery started: window {:?}, {} token(s)",
            window,
            self.tokens.len()
        );
        true
    }

    fn hello_targets(&self) -> Vec<SocketAddr> {
        if let Some(target) = self.unicast_target {
            return vec![target];
        }
        let mut targets: Vec<SocketAddr> = net_utils::broadcast_addresses()
            .unwrap_or_default()
            .into_iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), self.port))
            .collect();
        targets.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.port));
        targets
    }

    fn send_hellos(&self, udp: &UdpEndpoint) {
        let hello = protocol::hello_frame();
        for target in self.hello_targets() {
            let _ = udp.send_to(&hello, target);
        }
    }

    /// Drive the machine one step. Returns true while work remains.
    pub fn update(&mut self, udp: &mut UdpEndpoint, registry: &mut FanRegistry) -> bool {
        match self.state {
            DiscoveryState::Idle
            | DiscoveryState::Complete
            | DiscoveryState::Error
            | DiscoveryState::Timeout => false,
            DiscoveryState::SendingHello => {
                self.update_hello(udp);
                true
            }
            DiscoveryState::QueryingDevices => self.update_querying(udp, registry),
        }
    }

    fn update_hello(&mut self, udp: &mut UdpEndpoint) {
        if self.last_hello.map_or(true, |t| t.elapsed() >= HELLO_RESEND_INTERVAL) {
            self.send_hellos(udp);
            self.last_hello = Some(Instant::now());
        }

        let mut buf = [0u8; protocol::UDP_BUFFER_LEN];
        if let Ok(Some((len, src))) = udp.poll_recv(&mut buf) {
            if let (IpAddr::V4(ip), Some(reply)) = (src.ip(), protocol::parse_hello_reply(&buf[..len]))
            {
                let known = self.candidates.iter().any(|c| c.ip == ip);
                if !known && self.candidates.len() < MAX_DEVICES {
                    debug!("discovery candidate {} (ts {})", ip, reply.stamp);
                    self.candidates.push(Candidate {
                        ip,
                        device_id: reply.device_id,
                        stamp: reply.stamp,
                    });
                }
            }
        }

        if self.started.map_or(false, |t| t.elapsed() >= self.window) {
            debug!(
                "discovery window over, probing {} candidate(s)",
                self.candidates.len()
            );
            self.state = DiscoveryState::QueryingDevices;
        }
    }

    fn update_querying(&mut self, udp: &mut UdpEndpoint, registry: &mut FanRegistry) -> bool {
        let guard = querying_guard(self.window, self.candidates.len(), self.tokens.len());
        if self.started.map_or(false, |t| t.elapsed() > guard) {
            warn!("discovery guard timeout after {:?}", guard);
            self.state = DiscoveryState::Timeout;
            return false;
        }

        if registry.count() >= MAX_DEVICES || self.candidate_index >= self.candidates.len() {
            self.state = DiscoveryState::Complete;
            return false;
        }

        if self.probe.is_none() {
            let candidate = self.candidates[self.candidate_index];
            let token_hex = &self.tokens[self.token_index];
            match InfoProbe::new(candidate, token_hex, self.port) {
                Some(probe) => self.probe = Some(probe),
                None => {
                    // Malformed token: skip this pair.
                    self.advance();
                    return true;
                }
            }
        }

        let outcome = match self.probe.as_mut() {
            Some(probe) => probe.poll(udp),
            None => return true,
        };
        match outcome {
            ProbeOutcome::InProgress => {}
            ProbeOutcome::Success(info) => {
                let candidate = self.candidates[self.candidate_index];
                let token_hex = self.tokens[self.token_index].clone();
                let fan = InfoProbe::build_record(candidate, &token_hex, &info);
                if registry.insert(fan) {
                    debug!("discovered {} at {}", info.model, candidate.ip);
                }
                self.advance();
            }
            ProbeOutcome::Failed(err) => {
                debug!(
                    "probe failed for candidate {} token #{}: {}",
                    self.candidates[self.candidate_index].ip, self.token_index, err
                );
                self.advance();
            }
        }
        true
    }

    /// Advance the (candidate, token) iterator: tokens inner, candidates outer.
    fn advance(&mut self) {
        self.probe = None;
        self.token_index += 1;
        if self.token_index >= self.tokens.len() {
            self.token_index = 0;
            self.candidate_index += 1;
        }
    }

    /// Current machine state.
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Whether discovery finished successfully.
    pub fn is_complete(&self) -> bool {
        self.state == DiscoveryState::Complete
    }

    /// Whether discovery is running (not idle, not terminal).
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.state,
            DiscoveryState::SendingHello | DiscoveryState::QueryingDevices
        )
    }

    /// Abort and return to idle, clearing all scratch state.
    pub fn cancel(&mut self) {
        self.state = DiscoveryState::Idle;
        self.tokens.clear();
        self.candidates.clear();
        self.candidate_index = 0;
        self.token_index = 0;
        self.probe = None;
        self.started = None;
        self.last_hello = None;
    }
}

// ---------------------------------------------------------------------------
// Unicast device query
// ---------------------------------------------------------------------------

/// Unicast query state machine: hello a known IP, then identify it.
pub struct DeviceQuery {
    state: QueryState,
    port: u16,
    target_ip: Ipv4Addr,
    token_hex: String,
    started: Option<Instant>,
    last_hello: Option<Instant>,
    candidate: Option<Candidate>,
    probe: Option<InfoProbe>,
}

impl DeviceQuery {
    /// Create an idle query machine targeting the given device port.
    pub fn new(port: u16) -> Self {
        Self {
            state: QueryState::Idle,
            port,
            target_ip: Ipv4Addr::UNSPECIFIED,
            token_hex: String::new(),
            started: None,
            last_hello: None,
            candidate: None,
            probe: None,
        }
    }

    /// Begin querying `ip` with the given hex token.
    ///
    /// Returns false (and does nothing) with an empty token or when not idle.
    pub fn start(&mut self, udp: &mut UdpEndpoint, ip: Ipv4Addr, token_hex: &str) -> bool {
        if token_hex.is_empty() || self.state != QueryState::Idle {
            return false;
        }
        if udp.rebind().is_err() {
            return false;
        }

        self.target_ip = ip;
        self.token_hex = token_hex.to_string();
        self.candidate = None;
        self.probe = None;
        self.started = Some(Instant::now());

        let hello = protocol::hello_frame();
        let _ = udp.send_to(&hello, self.target());
        self.last_hello = Some(Instant::now());
        self.state = QueryState::WaitingHello;
        debug!("device query started for {}", ip);
        true
    }

    fn target(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.target_ip), self.port)
    }

    /// Drive the machine one step. Returns true while work remains.
    pub fn update(&mut self, udp: &mut UdpEndpoint, registry: &mut FanRegistry) -> bool {
        match self.state {
            QueryState::Idle
            | QueryState::Complete
            | QueryState::Error
            | QueryState::Timeout => false,
            QueryState::WaitingHello => self.update_hello(udp),
            QueryState::SendingQuery => self.update_probe(udp, registry),
        }
    }

    fn update_hello(&mut self, udp: &mut UdpEndpoint) -> bool {
        if self.started.map_or(false, |t| t.elapsed() > QUERY_HELLO_TIMEOUT) {
            warn!("device query hello timeout for {}", self.target_ip);
            self.state = QueryState::Timeout;
            return false;
        }

        if self.last_hello.map_or(true, |t| t.elapsed() >= HELLO_RESEND_INTERVAL) {
            let hello = protocol::hello_frame();
            let _ = udp.send_to(&hello, self.target());
            self.last_hello = Some(Instant::now());
        }

        let mut buf = [0u8; protocol::UDP_BUFFER_LEN];
        if let Ok(Some((len, src))) = udp.poll_recv(&mut buf) {
            if src.ip() == IpAddr::V4(self.target_ip) {
                if let Some(reply) = protocol::parse_hello_reply(&buf[..len]) {
                    self.candidate = Some(Candidate {
                        ip: self.target_ip,
                        device_id: reply.device_id,
                        stamp: reply.stamp,
                    });
                    self.probe = None;
                    self.state = QueryState::SendingQuery;
                }
            }
        }
        true
    }

    fn update_probe(&mut self, udp: &mut UdpEndpoint, registry: &mut FanRegistry) -> bool {
        let Some(candidate) = self.candidate else {
            self.state = QueryState::Error;
            return false;
        };

        if self.probe.is_none() {
            match InfoProbe::new(candidate, &self.token_hex, self.port) {
                Some(probe) => self.probe = Some(probe),
                None => {
                    self.state = QueryState::Error;
                    return false;
                }
            }
        }

        let outcome = match self.probe.as_mut() {
            Some(probe) => probe.poll(udp),
            None => return true,
        };
        match outcome {
            ProbeOutcome::InProgress => true,
            ProbeOutcome::Success(info) => {
                let fan = InfoProbe::build_record(candidate, &self.token_hex, &info);
                if registry.insert(fan) {
                    debug!("query identified {} at {}", info.model, candidate.ip);
                }
                self.state = QueryState::Complete;
                false
            }
            ProbeOutcome::Failed(err) => {
                warn!("device query failed for {}: {}", self.target_ip, err);
                self.state = QueryState::Error;
                false
            }
        }
    }

    /// Current machine state.
    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Whether the query finished successfully.
    pub fn is_complete(&self) -> bool {
        self.state == QueryState::Complete
    }

    /// Whether the query is running (not idle, not terminal).
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.state,
            QueryState::WaitingHello | QueryState::SendingQuery
        )
    }

    /// Abort and return to idle, clearing all scratch state.
    pub fn cancel(&mut self) {
        self.state = QueryState::Idle;
        self.token_hex.clear();
        self.candidate = None;
        self.probe = None;
        self.started = None;
        self.last_hello = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_querying_guard_formula() {
        let window = Duration::from_millis(500);
        // Zero pairs: three windows dominate.
        assert_eq!(querying_guard(window, 0, 2), Duration::from_millis(1500));
        // One candidate, two tokens: window + 2 * 2500 ms.
        assert_eq!(querying_guard(window, 1, 2), Duration::from_millis(5500));
        // Large window dominates the pair budget.
        let wide = Duration::from_secs(10);
        assert_eq!(querying_guard(wide, 1, 1), Duration::from_secs(30));
    }

    #[test]
    fn test_start_requires_tokens_and_idle() {
        let mut udp = UdpEndpoint::bind().unwrap();
        let mut discovery = Discovery::new(protocol::MIIO_PORT);
        discovery.set_unicast_target("127.0.0.1:1".parse().unwrap());

        assert!(!discovery.start(&mut udp, &[], Duration::from_millis(50)));
        assert_eq!(discovery.state(), DiscoveryState::Idle);

        let tokens = vec!["0123456789abcdef0123456789abcdef".to_string()];
        assert!(discovery.start(&mut udp, &tokens, Duration::from_millis(50)));
        assert!(discovery.is_in_progress());
        assert!(!discovery.start(&mut udp, &tokens, Duration::from_millis(50)));

        discovery.cancel();
        assert_eq!(discovery.state(), DiscoveryState::Idle);
        assert!(!discovery.is_in_progress());
    }

    #[test]
    fn test_discovery_completes_with_no_responders() {
        let mut udp = UdpEndpoint::bind().unwrap();
        let mut registry = FanRegistry::new();
        let mut discovery = Discovery::new(protocol::MIIO_PORT);
        // Nothing listens here; no candidate will ever answer.
        discovery.set_unicast_target("127.0.0.1:9".parse().unwrap());

        let window = Duration::from_millis(60);
        let tokens = vec!["0123456789abcdef0123456789abcdef".to_string()];
        assert!(discovery.start(&mut udp, &tokens, window));

        let deadline = Instant::now() + querying_guard(window, 0, 1) + Duration::from_secs(1);
        while discovery.update(&mut udp, &mut registry) {
            assert!(Instant::now() < deadline, "discovery failed to terminate");
            std::thread::sleep(Duration::from_millis(2));
        }

        assert!(discovery.is_complete());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_query_times_out_without_peer() {
        let mut udp = UdpEndpoint::bind().unwrap();
        let mut registry = FanRegistry::new();
        let mut query = DeviceQuery::new(protocol::MIIO_PORT);

        assert!(!query.start(&mut udp, Ipv4Addr::new(127, 0, 0, 1), ""));
        assert!(query.start(
            &mut udp,
            Ipv4Addr::new(127, 0, 0, 1),
            "0123456789abcdef0123456789abcdef"
        ));

        let deadline = Instant::now() + QUERY_HELLO_TIMEOUT + Duration::from_secs(1);
        while query.update(&mut udp, &mut registry) {
            assert!(Instant::now() < deadline, "query failed to terminate");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(query.state(), QueryState::Timeout);
        assert!(!query.is_complete());
    }
}
