//! Error types for usbscale-core.
//!
//! This module defines all error types that can occur when talking to a USB
//! scale, plus the classification the acquisition worker uses to decide
//! between retrying, reconnecting, and counting a failed iteration.
//!
//! # Error Classification
//!
//! | Kind | Meaning | Worker reaction |
//! |------|---------|-----------------|
//! | [`ErrorKind::NotFound`] | No matching device enumerated | Stay in reconnect-wait |
//! | [`ErrorKind::Transient`] | Recoverable glitch | Reassert configuration, back off, retry |
//! | [`ErrorKind::Fatal`] | Device is gone | Release the session, reconnect-wait |
//! | [`ErrorKind::Other`] | Unexpected failure | Counted toward consecutive errors |
//!
//! A transport error is fatal when it is typed as a disconnect or when its
//! message carries a "no such device" / "disconnected" signature. Every other
//! transport error is transient.

use nusb::transfer::TransferError;
use thiserror::Error;

/// Errors that can occur when communicating with a scale.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No device matching the vendor/product pair was enumerated.
    #[error("Scale not found (vendor {vendor_id:#06x}, product {product_id:#06x})")]
    DeviceNotFound {
        /// USB vendor ID searched for.
        vendor_id: u16,
        /// USB product ID searched for.
        product_id: u16,
    },

    /// Operation attempted without an open session.
    #[error("Not connected to scale")]
    NotConnected,

    /// Error from the USB stack (open, claim, descriptor access).
    #[error("USB error: {0}")]
    Usb(#[from] std::io::Error),

    /// A read transfer completed with an error.
    #[error("USB transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// The claimed interface exposes no IN endpoint.
    #[error("No IN endpoint on interface {interface}")]
    EndpointNotFound {
        /// Interface number that was searched.
        interface: u8,
    },

    /// The device stopped answering.
    #[error("Scale disconnected")]
    Disconnected,

    /// Transient errors persisted through the whole retry budget.
    #[error("Read failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Message of the last error seen.
        last: String,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Failure that does not come from the transport.
    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

/// How the acquisition worker should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No device present.
    NotFound,
    /// Recoverable glitch, worth a bounded retry.
    Transient,
    /// Device is no longer reachable.
    Fatal,
    /// Anything else.
    Other,
}

impl Error {
    /// Create a device not found error for a vendor/product pair.
    pub fn device_not_found(vendor_id: u16, product_id: u16) -> Self {
        Self::DeviceNotFound {
            vendor_id,
            product_id,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceNotFound { .. } => ErrorKind::NotFound,
            Error::NotConnected | Error::Disconnected | Error::RetriesExhausted { .. } => {
                ErrorKind::Fatal
            }
            Error::Transfer(TransferError::Disconnected) => ErrorKind::Fatal,
            Error::Transfer(_) | Error::Usb(_) => {
                if is_disconnect_signature(&self.to_string()) {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::Transient
                }
            }
            Error::EndpointNotFound { .. }
            | Error::InvalidConfig(_)
            | Error::Cancelled
            | Error::Unexpected(_) => ErrorKind::Other,
        }
    }

    /// Whether the error means the device is gone.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

/// Check a transport error message for a device-removal signature.
pub fn is_disconnect_signature(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("no such device") || message.contains("disconnected")
}

/// Result type alias using usbscale-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = Error::device_not_found(0x0922, 0x8003);
        assert_eq!(
            err.to_string(),
            "Scale not found (vendor 0x0922, product 0x8003)"
        );

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to scale");

        let err = Error::RetriesExhausted {
            attempts: 5,
            last: "pipe".to_string(),
        };
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn test_not_found_kind() {
        assert_eq!(
            Error::device_not_found(1, 2).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_typed_disconnect_is_fatal() {
        assert!(Error::Transfer(TransferError::Disconnected).is_fatal());
        assert!(Error::Disconnected.is_fatal());
        assert!(Error::NotConnected.is_fatal());
    }

    #[test]
    fn test_stall_is_transient() {
        assert_eq!(
            Error::Transfer(TransferError::Stall).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_io_no_such_device_is_fatal() {
        let err: Error = io::Error::other("No such device (os error 19)").into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_io_device_disconnected_is_fatal() {
        let err: Error = io::Error::other("Device disconnected").into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_io_other_is_transient() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "Operation timed out").into();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_retries_exhausted_is_fatal() {
        let err = Error::RetriesExhausted {
            attempts: 5,
            last: "stall".to_string(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unexpected_is_other() {
        assert_eq!(
            Error::Unexpected("boom".to_string()).kind(),
            ErrorKind::Other
        );
        assert_eq!(Error::invalid_config("x").kind(), ErrorKind::Other);
    }

    #[test]
    fn test_signature_is_case_insensitive() {
        assert!(is_disconnect_signature("LIBUSB_ERROR_NO_DEVICE: No Such Device"));
        assert!(is_disconnect_signature("device Disconnected"));
        assert!(!is_disconnect_signature("Pipe error"));
    }
}
