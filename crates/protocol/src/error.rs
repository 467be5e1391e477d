//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Encode errors
    /// A field value cannot be represented on the wire.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    // Frame errors
    /// Payload exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced or actual payload size.
        size: u64,
        /// Maximum allowed size.
        max: u64,
    },

    /// A header line grew past the line length limit without a terminator.
    #[error("header line too long: {len} bytes exceeds maximum of {max} bytes")]
    LineTooLong {
        /// Bytes buffered so far.
        len: usize,
        /// Maximum allowed line length.
        max: usize,
    },

    /// The stream ended before a frame's binary payload was complete.
    #[error("truncated payload: expected {expected} bytes, received {received}")]
    TruncatedPayload {
        /// Size announced by the header.
        expected: usize,
        /// Bytes actually available.
        received: usize,
    },
}

impl ProtocolError {
    /// Convenience constructor for [`ProtocolError::InvalidField`].
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
