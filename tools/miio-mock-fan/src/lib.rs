//! Mock miIO fan device for testing and simulation.
//!
//! This crate provides a reusable mock fan that speaks the miIO LAN
//! protocol over UDP: it answers hello frames with the 32-byte identity
//! reply and encrypted `set_properties` / `miIO.info` frames with encrypted
//! results. Response behavior is customizable via the [`DeviceBehavior`]
//! trait. It is used by:
//! - Test infrastructure for end-to-end protocol testing
//! - Local experimentation without fan hardware
//!
//! # Example
//!
//! ```ignore
//! use miio_mock_fan::{DefaultBehavior, DeviceConfig, MockFanDevice};
//!
//! let config = DeviceConfig::new("0123456789abcdef0123456789abcdef")
//!     .with_model("zhimi.fan.za5");
//! let device = MockFanDevice::new(config, DefaultBehavior)?;
//! let handle = device.spawn();
//! println!("mock fan at {}", handle.addr);
//! ```

mod behavior;
mod codec;
mod config;
mod server;

pub use behavior::{DefaultBehavior, DeviceBehavior, RequestKind};
pub use codec::{decrypt_payload, derive_key_iv, encrypt_payload, md5_digest, parse_token_hex};
pub use config::DeviceConfig;
pub use server::{DeviceHandle, MockFanDevice};
