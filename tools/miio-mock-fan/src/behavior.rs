//! Behavior hooks for the mock device.

/// What kind of datagram the device received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// The 32-byte all-0xFF hello frame.
    Hello,
    /// An encrypted command or query frame.
    Encrypted,
}

/// Customization hooks for a [`crate::MockFanDevice`].
pub trait DeviceBehavior: Send + 'static {
    /// Called with every raw datagram before processing.
    fn on_frame_received(&mut self, _raw: &[u8]) {}

    /// Whether the device answers this request at all. Returning false
    /// simulates a silent or sleeping device.
    fn should_respond(&self, _request: RequestKind) -> bool {
        true
    }

    /// Whether to answer frames that fail checksum or decryption with a
    /// canned encrypted result (encrypted with the device's own token).
    ///
    /// Real devices drop such frames; enabling this lets tests exercise a
    /// client holding the wrong token through its decrypt-failure path.
    fn reply_when_undecryptable(&self) -> bool {
        false
    }
}

/// Always-responding behavior with real-device semantics.
#[derive(Debug, Default)]
pub struct DefaultBehavior;

impl DeviceBehavior for DefaultBehavior {}
