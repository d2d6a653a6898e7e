//! Error types for frame parsing in usbscale-types.

use thiserror::Error;

/// Errors that can occur when decoding scale frames.
///
/// This error type is platform-agnostic and does not include
/// USB transport errors (those belong in usbscale-core).
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The frame is shorter than the fixed report layout.
    #[error("Frame too short: requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },
}

/// Result type alias using usbscale-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
