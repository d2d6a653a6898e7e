//! Platform-agnostic types for USB postal scales.
//!
//! This crate provides the data types shared by the acquisition core
//! (usbscale-core) and the HTTP service (usbscale-service).
//!
//! # Features
//!
//! - Weight samples decoded from raw HID report frames
//! - Device labels and the shared scale snapshot
//! - USB vendor/product identifiers
//! - Error types for frame parsing
//!
//! # Example
//!
//! ```
//! use usbscale_types::WeightReading;
//!
//! let reading = WeightReading::from_frame(&[3, 4, 2, 0, 44, 1]).unwrap();
//! assert_eq!(reading.grams, 300);
//! ```

pub mod error;
pub mod types;
pub mod usb;

pub use error::{ParseError, ParseResult};
pub use types::{
    ConnectionType, DeviceLabel, MIN_FRAME_BYTES, ScaleSnapshot, WEIGHT_OFFSET, WeightReading,
};
