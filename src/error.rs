//! # Error Types
//!
//! Error handling for the bus protocol core.
//!
//! This module defines every error variant that can surface from the wire codec,
//! the framer, the authentication handshake, and the call correlation engine.
//!
//! ## Error Categories
//! - **Stream errors**: I/O failures, malformed or truncated data, framing violations.
//!   These are fatal to a connection because the byte stream can no longer be
//!   trusted to sit on a message boundary.
//! - **Handshake errors**: authentication rejected or aborted by the peer
//! - **Per-call errors**: timeouts, cancellation, and error replies from the remote side.
//!   These never affect other in-flight calls.
//! - **Setup errors**: invalid names, addresses, and configuration
//!
//! ## Example Usage
//! ```rust
//! use bus_protocol::error::{BusError, Result};
//! use tracing::{error, info};
//!
//! fn check_serial(serial: u32) -> Result<u32> {
//!     if serial == 0 {
//!         return Err(BusError::Framing("serial must be non-zero".into()));
//!     }
//!     Ok(serial)
//! }
//!
//! match check_serial(0) {
//!     Ok(serial) => info!(serial, "serial accepted"),
//!     Err(e) => error!(error = %e, "serial rejected"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Codec errors
    pub const ERR_TRUNCATED: &str = "Input truncated mid-value";
    pub const ERR_NONZERO_PADDING: &str = "Alignment padding contains non-zero bytes";
    pub const ERR_MISSING_NUL: &str = "String is missing its NUL terminator";
    pub const ERR_INTERIOR_NUL: &str = "String contains an interior NUL byte";
    pub const ERR_INVALID_UTF8: &str = "String is not valid UTF-8";
    pub const ERR_INVALID_BOOLEAN: &str = "Boolean value is neither 0 nor 1";
    pub const ERR_ARRAY_LENGTH: &str = "Array elements disagree with the declared byte length";
    pub const ERR_ARRAY_TOO_LONG: &str = "Array exceeds the maximum length of 64 MiB";
    pub const ERR_NESTING_TOO_DEEP: &str = "Value nesting exceeds the maximum depth";
    pub const ERR_VARIANT_SIGNATURE: &str = "Variant signature must be exactly one complete type";

    /// Framing errors
    pub const ERR_INVALID_ENDIAN: &str = "Invalid byte order marker";
    pub const ERR_ZERO_SERIAL: &str = "Message serial must be non-zero";
    pub const ERR_TRUNCATED_FRAME: &str = "Transport closed mid-frame";
    pub const ERR_MISSING_HEADER_FIELD: &str = "Required header field missing";
    pub const ERR_BODY_LENGTH: &str = "Body length disagrees with the body signature";

    /// Handshake errors
    pub const ERR_PEER_CLOSED_DURING_AUTH: &str = "Peer closed the connection during authentication";
    pub const ERR_AUTH_LINE_TOO_LONG: &str = "Authentication line exceeds the maximum length";
    pub const ERR_AUTH_NOT_UTF8: &str = "Authentication line is not valid ASCII";
    pub const ERR_HANDSHAKE_STATE: &str = "Handshake step invoked in the wrong state";

    /// Connection errors
    pub const ERR_SERIAL_IN_FLIGHT: &str = "Serial already has a pending call";
    pub const ERR_UNKNOWN_SERIAL: &str = "No pending call is parked for this serial";
    pub const ERR_NO_ADDRESS: &str = "No usable bus address";
}

/// Primary error type for all bus operations
#[derive(Error, Debug)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Message too large: {size} bytes (limit {limit})")]
    OversizedMessage { size: usize, limit: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Remote error {name}: {message}")]
    Remote { name: String, message: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl BusError {
    /// Whether this error leaves the byte stream in an untrustworthy state.
    ///
    /// A connection that hits a fatal error on its receive path is torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BusError::Io(_)
                | BusError::Codec(_)
                | BusError::Framing(_)
                | BusError::OversizedMessage { .. }
                | BusError::UnknownMessageType(_)
                | BusError::UnsupportedVersion(_)
        )
    }

    /// Name of the remote error, if this is an error reply from the peer
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            BusError::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    pub(crate) fn codec(msg: &str) -> Self {
        BusError::Codec(msg.to_string())
    }

    pub(crate) fn framing(msg: &str) -> Self {
        BusError::Framing(msg.to_string())
    }
}

/// Type alias for Results using BusError
pub type Result<T> = std::result::Result<T, BusError>;
