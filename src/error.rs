//! Crate-level error types.

use std::io;

use crate::types::MiioErr;

/// Error type for session and probe operations.
///
/// The wire-level classification mirrors [`MiioErr`]; transport-level
/// failures that the miIO classification cannot express (`Io`,
/// `SessionNotReady`) collapse into `Timeout` when stored on a device record,
/// since either way no usable response was observed.
#[derive(thiserror::Error, Debug)]
pub enum FanError {
    /// No response from the device within the operation deadline.
    #[error("no response from device within timeout")]
    Timeout,

    /// A datagram arrived from an IP other than the expected peer.
    #[error("response from unexpected source IP")]
    WrongSourceIp,

    /// AES-CBC decryption or PKCS#7 unpadding failed (wrong token or stale
    /// handshake).
    #[error("payload decryption failed")]
    DecryptFail,

    /// The payload decrypted but was not the expected JSON shape.
    #[error("malformed or unexpected response payload")]
    InvalidResponse,

    /// The operation requires a prior successful handshake.
    #[error("session has no valid handshake")]
    SessionNotReady,

    /// A socket operation failed.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl FanError {
    /// Classify this error for storage on a device record.
    pub fn to_miio(&self) -> MiioErr {
        match self {
            FanError::Timeout => MiioErr::Timeout,
            FanError::WrongSourceIp => MiioErr::WrongSourceIp,
            FanError::DecryptFail => MiioErr::DecryptFail,
            FanError::InvalidResponse => MiioErr::InvalidResponse,
            FanError::SessionNotReady | FanError::Io(_) => MiioErr::Timeout,
        }
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, FanError>;
