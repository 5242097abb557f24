//! Per-device client session.
//!
//! A [`FanSession`] holds the crypto material and handshake state for one
//! fan and drives the request/response exchanges over the shared UDP
//! endpoint: hello handshake, `miIO.info` query, and `set_properties`
//! commands. Handshakes are cached with a TTL so stale sessions refresh
//! lazily before the next command.
//!
//! All waits are bounded poll loops that sleep a few milliseconds between
//! non-blocking reads; no call holds the thread longer than its deadline.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;

use crate::error::{FanError, Result};
use crate::model::{fan_level_for_percent, FanModelType, POWER_PIID, POWER_SIID};
use crate::protocol::{self, FanInfo};
use crate::registry::DiscoveredFan;
use crate::transport::{UdpEndpoint, POLL_INTERVAL};
use crate::types::{ErrorSink, FanErrorInfo, FanOp, FleetConfig, MiioErr};

/// Interval between hello re-sends while waiting for a handshake reply.
pub const HELLO_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Client session for a single fan.
pub struct FanSession {
    addr: SocketAddr,
    token: [u8; 16],
    key: [u8; 16],
    iv0: [u8; 16],
    model_type: FanModelType,
    device_id: [u8; 4],
    device_ts: u32,
    ready: bool,
    handshake_valid: bool,
    last_handshake: Option<Instant>,
    config: FleetConfig,
    fan_index: u8,
    error_sink: ErrorSink,
}

impl FanSession {
    /// Create a session for a fan at `ip` with the given raw token, using
    /// default protocol timeouts.
    pub fn new(ip: Ipv4Addr, token: [u8; 16]) -> Self {
        Self::with_config(ip, token, FleetConfig::default())
    }

    /// Create a session with explicit timeouts and target port.
    pub fn with_config(ip: Ipv4Addr, token: [u8; 16], config: FleetConfig) -> Self {
        let (key, iv0) = protocol::derive_key_iv(&token);
        Self {
            addr: SocketAddr::new(IpAddr::V4(ip), config.port),
            token,
            key,
            iv0,
            model_type: FanModelType::Unknown,
            device_id: [0; 4],
            device_ts: 0,
            ready: false,
            handshake_valid: false,
            last_handshake: None,
            config,
            fan_index: 0,
            error_sink: Arc::new(Mutex::new(None)),
        }
    }

    /// The fan's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the last handshake succeeded and has not been invalidated.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The cached model type used for speed-property addressing.
    pub fn model_type(&self) -> FanModelType {
        self.model_type
    }

    /// Set the model type directly (e.g. from a registry record).
    pub fn set_model_type(&mut self, model_type: FanModelType) {
        self.model_type = model_type;
    }

    /// The device timestamp observed from the last exchange.
    pub fn device_ts(&self) -> u32 {
        self.device_ts
    }

    /// Re-point the session at a registry record, keeping handshake state
    /// when address and token are unchanged.
    pub(crate) fn configure(&mut self, record: &DiscoveredFan, index: u8, sink: ErrorSink) {
        let addr = SocketAddr::new(IpAddr::V4(record.ip), self.config.port);
        if addr != self.addr || self.token != record.token {
            self.addr = addr;
            self.invalidate_handshake();
        }
        self.token = record.token;
        self.key = record.key;
        self.iv0 = record.iv0;
        self.model_type = record.model_type;
        self.fan_index = index;
        self.error_sink = sink;
    }

    // ---------------------------------------------------------------------
    // Handshake cache
    // ---------------------------------------------------------------------

    /// Whether the handshake cache is valid within `ttl`.
    pub fn is_handshake_valid(&self, ttl: Duration) -> bool {
        if !self.handshake_valid || !self.ready {
            return false;
        }
        self.last_handshake.is_some_and(|t| t.elapsed() < ttl)
    }

    /// Age of the current handshake; zero when invalid.
    pub fn handshake_age(&self) -> Duration {
        if !self.handshake_valid || !self.ready {
            return Duration::ZERO;
        }
        self.last_handshake.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Drop the handshake cache, forcing a fresh hello on the next command.
    pub fn invalidate_handshake(&mut self) {
        self.ready = false;
        self.handshake_valid = false;
        self.last_handshake = None;
    }

    /// Ensure a valid handshake within `ttl`, performing one if needed.
    pub fn ensure_handshake(
        &mut self,
        udp: &mut UdpEndpoint,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<()> {
        if self.is_handshake_valid(ttl) {
            return Ok(());
        }
        self.handshake(udp, timeout)
    }

    /// Perform (or reuse) a hello handshake.
    ///
    /// Reuses the cached session while it is valid within the configured
    /// TTL. Otherwise rebinds the endpoint to a fresh ephemeral port, sends
    /// a hello every 500 ms, and accepts the first 32-byte reply from the
    /// expected IP before `timeout` elapses.
    pub fn handshake(&mut self, udp: &mut UdpEndpoint, timeout: Duration) -> Result<()> {
        self.handshake_as(udp, timeout, FanOp::Handshake)
    }

    pub(crate) fn handshake_as(
        &mut self,
        udp: &mut UdpEndpoint,
        timeout: Duration,
        op: FanOp,
    ) -> Result<()> {
        if self.is_handshake_valid(self.config.handshake_ttl) {
            return Ok(());
        }
        if self.handshake_valid {
            debug!("handshake cache expired for {}, refreshing", self.addr);
        }
        self.ready = false;
        self.handshake_valid = false;

        udp.rebind()?;

        let hello = protocol::hello_frame();
        let start = Instant::now();
        let mut last_send: Option<Instant> = None;
        let mut wrong_source_seen = false;
        let mut buf = [0u8; protocol::UDP_BUFFER_LEN];

        while start.elapsed() < timeout {
            if last_send.map_or(true, |t| t.elapsed() >= HELLO_RESEND_INTERVAL) {
                self.send(udp, &hello, op, start)?;
                last_send = Some(Instant::now());
            }

            match udp.poll_recv(&mut buf)? {
                Some((len, src)) => {
                    if src.ip() != self.addr.ip() {
                        self.note_wrong_source(&mut wrong_source_seen, op, start);
                        continue;
                    }
                    if let Some(reply) = protocol::parse_hello_reply(&buf[..len]) {
                        self.device_id = reply.device_id;
                        self.device_ts = reply.stamp;
                        self.ready = true;
                        self.handshake_valid = true;
                        self.last_handshake = Some(Instant::now());
                        debug!(
                            "handshake ok for {} (device id {:02x?}, ts {})",
                            self.addr, self.device_id, self.device_ts
                        );
                        return Ok(());
                    }
                    // Late or malformed datagram from the expected peer:
                    // drain by discarding.
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }

        warn!("handshake timeout for {} after {:?}", self.addr, timeout);
        self.emit(op, MiioErr::Timeout, timeout, false);
        Err(FanError::Timeout)
    }

    // ---------------------------------------------------------------------
    // Info query
    // ---------------------------------------------------------------------

    /// Query `miIO.info` for model and version strings.
    ///
    /// Requires a prior successful handshake. On success the session's model
    /// type is refreshed from the reported model.
    pub fn query_info(&mut self, udp: &mut UdpEndpoint, timeout: Duration) -> Result<FanInfo> {
        if !self.ready {
            return Err(FanError::SessionNotReady);
        }

        let cipher = protocol::encrypt_payload(protocol::INFO_REQUEST_JSON, &self.key, &self.iv0);
        self.send_frame(udp, &cipher)?;

        let start = Instant::now();
        let mut wrong_source_seen = false;
        let mut buf = [0u8; protocol::UDP_BUFFER_LEN];

        while start.elapsed() < timeout {
            match udp.poll_recv(&mut buf)? {
                Some((len, src)) => {
                    if src.ip() != self.addr.ip() {
                        self.note_wrong_source(&mut wrong_source_seen, FanOp::ReceiveResponse, start);
                        continue;
                    }
                    if len <= protocol::HEADER_LEN {
                        continue;
                    }
                    let result = self.parse_info_frame(&buf[protocol::HEADER_LEN..len]);
                    if let Err(err) = &result {
                        self.emit(FanOp::ReceiveResponse, err.to_miio(), start.elapsed(), false);
                    }
                    return result;
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }

        warn!("info query timeout for {}", self.addr);
        self.emit(FanOp::ReceiveResponse, MiioErr::Timeout, timeout, false);
        Err(FanError::Timeout)
    }

    fn parse_info_frame(&mut self, cipher: &[u8]) -> Result<FanInfo> {
        let json = protocol::decrypt_payload(cipher, &self.key, &self.iv0)?;
        let info = protocol::parse_info_response(&json, self.device_id)?;
        self.model_type = FanModelType::from_model(&info.model);
        debug!(
            "info for {}: model={} fw={} hw={} did={}",
            self.addr, info.model, info.fw_ver, info.hw_ver, info.did
        );
        Ok(info)
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// Switch the fan on or off. Power is `(siid 2, piid 1)` on every model.
    pub fn set_power(&mut self, udp: &mut UdpEndpoint, on: bool) -> Result<()> {
        self.set_property(udp, POWER_SIID, POWER_PIID, Value::Bool(on))
    }

    /// Set the fan speed as a percent, clamped to 1..=100.
    ///
    /// Models with discrete levels receive the mapped level 1..=3 instead of
    /// the raw percent.
    pub fn set_speed(&mut self, udp: &mut UdpEndpoint, percent: u8) -> Result<()> {
        let percent = percent.clamp(1, 100);
        let params = self.model_type.speed_params();
        let value = if params.use_fan_level {
            Value::from(fan_level_for_percent(percent))
        } else {
            Value::from(percent)
        };
        self.set_property(udp, params.siid, params.piid, value)
    }

    fn set_property(
        &mut self,
        udp: &mut UdpEndpoint,
        siid: u8,
        piid: u8,
        value: Value,
    ) -> Result<()> {
        self.handshake(udp, self.config.handshake_timeout)?;

        let json = protocol::set_properties_json(protocol::next_msg_id(), siid, piid, &value);
        let cipher = protocol::encrypt_payload(&json, &self.key, &self.iv0);
        self.send_frame(udp, &cipher)?;

        // Any well-formed reply from the right source counts as success; the
        // device is authoritative and its echo is discarded.
        let start = Instant::now();
        let timeout = self.config.command_timeout;
        let mut wrong_source_seen = false;
        let mut buf = [0u8; protocol::UDP_BUFFER_LEN];

        while start.elapsed() < timeout {
            match udp.poll_recv(&mut buf)? {
                Some((_, src)) => {
                    if src.ip() == self.addr.ip() {
                        return Ok(());
                    }
                    self.note_wrong_source(&mut wrong_source_seen, FanOp::ReceiveResponse, start);
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }

        warn!("command reply timeout for {}", self.addr);
        self.invalidate_handshake();
        self.emit(FanOp::ReceiveResponse, MiioErr::Timeout, timeout, true);
        Err(FanError::Timeout)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Encrypt-and-send path shared by the info query and commands: the
    /// frame carries `device_ts + 1`, and the counter advances after send.
    fn send_frame(&mut self, udp: &mut UdpEndpoint, cipher: &[u8]) -> Result<()> {
        let stamp = self.device_ts.wrapping_add(1);
        let frame = protocol::encode_frame(self.device_id, stamp, &self.token, cipher);
        self.send(udp, &frame, FanOp::SendCommand, Instant::now())?;
        self.device_ts = stamp;
        Ok(())
    }

    fn send(
        &self,
        udp: &mut UdpEndpoint,
        data: &[u8],
        op: FanOp,
        started: Instant,
    ) -> Result<()> {
        if let Err(e) = udp.send_to(data, self.addr) {
            warn!("send to {} failed: {}", self.addr, e);
            self.emit(op, MiioErr::Timeout, started.elapsed(), false);
            return Err(e.into());
        }
        Ok(())
    }

    fn note_wrong_source(&self, seen: &mut bool, op: FanOp, started: Instant) {
        if !*seen {
            *seen = true;
            warn!("discarding response from unexpected source (expected {})", self.addr);
            self.emit(op, MiioErr::WrongSourceIp, started.elapsed(), false);
        }
    }

    fn emit(&self, operation: FanOp, error: MiioErr, elapsed: Duration, invalidated: bool) {
        let Ok(mut guard) = self.error_sink.lock() else {
            return;
        };
        if let Some(callback) = guard.as_mut() {
            let IpAddr::V4(ip) = self.addr.ip() else {
                return;
            };
            callback(&FanErrorInfo {
                fan_index: self.fan_index,
                ip,
                operation,
                error,
                elapsed_ms: elapsed.as_millis() as u32,
                handshake_invalidated: invalidated,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> [u8; 16] {
        protocol::parse_token_hex("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn test_new_session_has_no_handshake() {
        let session = FanSession::new(Ipv4Addr::new(192, 0, 2, 10), token());
        assert!(!session.is_ready());
        assert!(!session.is_handshake_valid(Duration::from_secs(60)));
        assert_eq!(session.handshake_age(), Duration::ZERO);
        assert_eq!(session.addr().port(), protocol::MIIO_PORT);
    }

    #[test]
    fn test_invalidate_clears_state() {
        let mut session = FanSession::new(Ipv4Addr::new(192, 0, 2, 10), token());
        session.ready = true;
        session.handshake_valid = true;
        session.last_handshake = Some(Instant::now());
        assert!(session.is_handshake_valid(Duration::from_secs(60)));

        session.invalidate_handshake();
        assert!(!session.is_ready());
        assert!(!session.is_handshake_valid(Duration::from_secs(60)));
        assert_eq!(session.handshake_age(), Duration::ZERO);
    }

    #[test]
    fn test_handshake_ttl_expiry_is_observable() {
        let mut session = FanSession::new(Ipv4Addr::new(192, 0, 2, 10), token());
        session.ready = true;
        session.handshake_valid = true;
        session.last_handshake = Some(Instant::now() - Duration::from_millis(50));

        assert!(session.is_handshake_valid(Duration::from_secs(60)));
        assert!(!session.is_handshake_valid(Duration::from_millis(10)));
        assert!(session.handshake_age() >= Duration::from_millis(50));
    }

    #[test]
    fn test_query_info_requires_handshake() {
        let mut session = FanSession::new(Ipv4Addr::new(192, 0, 2, 10), token());
        let mut udp = UdpEndpoint::bind().unwrap();
        assert!(matches!(
            session.query_info(&mut udp, Duration::from_millis(10)),
            Err(FanError::SessionNotReady)
        ));
    }

    #[test]
    fn test_configure_resets_on_address_change() {
        let sink: ErrorSink = Arc::new(Mutex::new(None));
        let mut session = FanSession::new(Ipv4Addr::new(192, 0, 2, 10), token());
        session.ready = true;
        session.handshake_valid = true;
        session.last_handshake = Some(Instant::now());

        let mut same = DiscoveredFan::new(
            Ipv4Addr::new(192, 0, 2, 10),
            "0123456789abcdef0123456789abcdef",
        );
        same.cache_crypto();
        session.configure(&same, 3, Arc::clone(&sink));
        assert!(session.is_ready(), "unchanged record keeps the handshake");

        let mut moved = DiscoveredFan::new(
            Ipv4Addr::new(192, 0, 2, 11),
            "0123456789abcdef0123456789abcdef",
        );
        moved.cache_crypto();
        session.configure(&moved, 3, sink);
        assert!(!session.is_ready(), "address change drops the handshake");
        assert_eq!(session.addr().ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11)));
    }
}
