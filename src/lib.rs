//! miIO client and fleet orchestrator for Xiaomi-family smart fans.
//!
//! This crate speaks the miIO LAN protocol (UDP port 54321, 32-byte header,
//! AES-128-CBC body) to discover, identify, and control a small fleet of
//! smart fans, using a single shared UDP endpoint and cooperative,
//! non-blocking state machines the host drives from its main loop.
//!
//! # Getting Started
//!
//! Discover fans with their provisioning tokens, then fan out commands to
//! the fleet:
//!
//! ```no_run
//! use miio_fan::FanFleet;
//! use std::time::Duration;
//!
//! let tokens = vec!["0123456789abcdef0123456789abcdef".to_string()];
//!
//! let mut fleet = FanFleet::new();
//! fleet.start_discovery(&tokens, Duration::from_secs(3));
//! while fleet.update_discovery() {
//!     // Host loop continues; discovery never blocks.
//! }
//!
//! if fleet.is_discovery_complete() {
//!     fleet.print_fans();
//!     fleet.handshake_all_orchestrated();
//!     fleet.power_all_orchestrated(true);
//!     fleet.speed_all_orchestrated(45);
//! }
//! ```
//!
//! # Connecting without discovery
//!
//! With a pre-known `(ip, token)` list, fast-connect registers the fans
//! directly; smart-connect validates that list and falls back to discovery
//! for the devices that did not answer:
//!
//! ```no_run
//! use miio_fan::{FanFleet, FastConnectEntry};
//! use std::time::Duration;
//!
//! let mut fleet = FanFleet::new();
//! fleet.set_fast_connect_config(&[FastConnectEntry {
//!     ip: "192.168.1.100".to_string(),
//!     token_hex: "0123456789abcdef0123456789abcdef".to_string(),
//!     model: Some("zhimi.fan.za5".to_string()),
//! }]);
//! fleet.start_smart_connect(Duration::from_secs(3));
//! while fleet.update_smart_connect() {}
//! ```
//!
//! # Single-fan sessions
//!
//! [`FanSession`] exposes the per-device contract directly: handshake with
//! TTL-cached reuse, `miIO.info` queries, and power/speed commands.
//!
//! # Concurrency model
//!
//! The entire crate is single-threaded and cooperative. Long-running flows
//! (discovery, validation) expose `update()` methods; session calls poll in
//! bounded loops (1.5–2 s) that yield between reads. One request/response
//! exchange is in flight at a time on the shared endpoint.

pub mod connect;
pub mod discovery;
mod error;
pub mod fleet;
pub mod model;
mod net_utils;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

// Crate-level error types
pub use error::{FanError, Result};

// Orchestrator
pub use fleet::FanFleet;

// Registry types
pub use registry::{DiscoveredFan, FanRegistry};

// Session
pub use session::FanSession;

// Connection state machines
pub use connect::{FastConnect, SmartConnect, SmartConnectState};
pub use discovery::{DeviceQuery, Discovery, DiscoveryState, QueryState};

// Transport
pub use transport::UdpEndpoint;

// Wire types
pub use protocol::{FanInfo, MIIO_PORT};

// Core types
pub use model::{FanModelType, SpeedParams};
pub use types::{
    FanErrorCallback,
    FanErrorInfo,
    FanOp,
    FastConnectEntry,
    FastConnectResult,
    FleetConfig,
    MiioErr,
    ParticipationState,
    SystemState,
    ValidationCallback,
    COMMAND_COOLDOWN_MS,
    HANDSHAKE_TTL_MS,
    MAX_DEVICES,
    MAX_FAST_CONNECT,
};
