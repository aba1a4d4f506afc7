//! # Error Types
//!
//! Error handling for the world-server wire protocol.
//!
//! Every failure a connection or session can run into maps to one variant of
//! [`ProtocolError`]. The variants mirror how the server reacts:
//!
//! ## Error Categories
//! - **MalformedHeader**: bad size or opcode, disconnect without a response
//! - **MalformedPayload**: buffer underrun while parsing a known opcode, disconnect
//! - **AuthRejected**: a terminal auth response was sent, then disconnect
//! - **OverspeedPing**: keep-alive cadence abuse, disconnect
//! - **ClockSyncAnomaly**: recoverable, the caller falls back to server time
//! - **I/O / Compression / Crypto**: transport level failures
//!
//! ## Example Usage
//! ```rust
//! use realm_wire::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn parse_counter(bytes: &[u8]) -> Result<u32> {
//!     let raw: [u8; 4] = bytes
//!         .get(..4)
//!         .and_then(|b| b.try_into().ok())
//!         .ok_or(ProtocolError::MalformedPayload { opcode: 0x1DC })?;
//!     Ok(u32::from_le_bytes(raw))
//! }
//!
//! if let Err(e) = parse_counter(&[1, 2]) {
//!     error!(error = %e, "Dropping packet");
//! }
//! ```

use crate::protocol::handshake::AuthResponseCode;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher errors
    pub const ERR_OPCODE_OUT_OF_RANGE: &str = "Opcode outside of the client opcode space";
    pub const ERR_HANDLER_ALREADY_REGISTERED: &str = "Handler already registered for opcode";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_AUTH_TIMEOUT: &str = "Client did not authenticate in time";
    pub const ERR_NOT_AUTHENTICATED: &str = "Opcode requires an authenticated session";
    pub const ERR_DUPLICATE_AUTH: &str = "Duplicate AUTH_SESSION on an authenticated connection";

    /// Cryptographic errors
    pub const ERR_HMAC_KEY: &str = "Invalid HMAC key length";
    pub const ERR_RANDOM_SOURCE: &str = "Operating system random source unavailable";

    /// Handshake errors
    pub const ERR_STATE_REGRESSION: &str = "Handshake state cannot move backwards";
    pub const ERR_ACCOUNT_LOOKUP: &str = "Account lookup failed";

    /// World errors
    pub const ERR_WORLD_STOPPED: &str = "World update loop is not running";
}

/// Primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed header (size: {size}, opcode: {opcode:#06x})")]
    MalformedHeader { size: u32, opcode: u32 },

    #[error("Malformed payload for opcode {opcode:#06x}")]
    MalformedPayload { opcode: u16 },

    #[error("Authentication rejected: {0:?}")]
    AuthRejected(AuthResponseCode),

    #[error("Too many over-speed pings ({count})")]
    OverspeedPing { count: u32 },

    #[error("Clock delta {delta:?} cannot translate client time {client_time}")]
    ClockSyncAnomaly { delta: Option<i64>, client_time: u32 },

    #[error("Inbound queue full ({limit} packets)")]
    QueueFull { limit: usize },

    #[error("Unexpected opcode {0:#06x}")]
    UnexpectedOpcode(u32),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the connection has to be closed after this error.
    ///
    /// Only clock-sync anomalies are recoverable in place.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::ClockSyncAnomaly { .. })
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_sync_anomaly_is_recoverable() {
        let err = ProtocolError::ClockSyncAnomaly {
            delta: None,
            client_time: 5,
        };
        assert!(!err.is_fatal());
        assert!(ProtocolError::MalformedHeader { size: 0, opcode: 0 }.is_fatal());
        assert!(ProtocolError::AuthRejected(AuthResponseCode::Banned).is_fatal());
    }

    #[test]
    fn test_display_formats_opcode_as_hex() {
        let err = ProtocolError::MalformedPayload { opcode: 0x1ED };
        assert_eq!(err.to_string(), "Malformed payload for opcode 0x01ed");
    }
}
