//! Core types for scale data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseError;

/// Minimum number of bytes in a scale report frame.
pub const MIN_FRAME_BYTES: usize = 6;

/// Byte offset of the little-endian weight field within a frame.
pub const WEIGHT_OFFSET: usize = 4;

/// How the scale is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum ConnectionType {
    /// Nothing has been connected yet.
    #[default]
    Unknown,
    /// USB HID device.
    Usb,
}

impl ConnectionType {
    /// Label used on the HTTP surface.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Unknown => "Unknown",
            ConnectionType::Usb => "USB",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a connected scale.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceLabel {
    /// Transport the scale is attached through.
    pub connection: ConnectionType,
    /// Model name.
    pub name: String,
}

impl DeviceLabel {
    /// Create a label for a USB-attached scale.
    pub fn usb(name: impl Into<String>) -> Self {
        Self {
            connection: ConnectionType::Usb,
            name: name.into(),
        }
    }
}

impl Default for DeviceLabel {
    fn default() -> Self {
        Self {
            connection: ConnectionType::Unknown,
            name: "Unknown Scale".to_string(),
        }
    }
}

/// One decoded weight sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WeightReading {
    /// Weight in grams.
    pub grams: u16,
    /// When the frame was read.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub captured_at: OffsetDateTime,
}

impl WeightReading {
    /// Decode a weight sample from a raw report frame.
    ///
    /// The frame layout is fixed; only the weight field is used:
    /// - bytes 4-5: weight in grams (u16 LE)
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] if `data` contains fewer than
    /// [`MIN_FRAME_BYTES`] (6) bytes.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_frame(data: &[u8]) -> Result<Self, ParseError> {
        Self::from_frame_at(data, OffsetDateTime::now_utc())
    }

    /// Decode a frame with an explicit capture time.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] for frames shorter than
    /// [`MIN_FRAME_BYTES`].
    pub fn from_frame_at(data: &[u8], captured_at: OffsetDateTime) -> Result<Self, ParseError> {
        use bytes::Buf;

        if data.len() < MIN_FRAME_BYTES {
            return Err(ParseError::InsufficientBytes {
                expected: MIN_FRAME_BYTES,
                actual: data.len(),
            });
        }

        let mut buf = &data[WEIGHT_OFFSET..];
        let grams = buf.get_u16_le();

        Ok(WeightReading { grams, captured_at })
    }
}

impl fmt::Display for WeightReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} g", self.grams)
    }
}

/// Externally observable state of the scale.
///
/// A snapshot is always a complete copy; the weight, connection flag and
/// labels come from the same publication.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScaleSnapshot {
    /// Last successfully read weight in grams.
    pub weight_grams: u16,
    /// Whether a scale is currently connected.
    pub connected: bool,
    /// Transport of the last connected scale.
    pub device_type: ConnectionType,
    /// Model name of the last connected scale.
    pub device_name: String,
    /// Time of the last publication (None until the first one).
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub updated_at: Option<OffsetDateTime>,
}

impl Default for ScaleSnapshot {
    fn default() -> Self {
        let label = DeviceLabel::default();
        Self {
            weight_grams: 0,
            connected: false,
            device_type: label.connection,
            device_name: label.name,
            updated_at: None,
        }
    }
}

impl ScaleSnapshot {
    /// Apply a connection change, keeping the last weight.
    pub fn with_connection(mut self, connected: bool, label: Option<&DeviceLabel>) -> Self {
        self.connected = connected;
        if let Some(label) = label {
            self.device_type = label.connection;
            self.device_name = label.name.clone();
        }
        self.updated_at = Some(OffsetDateTime::now_utc());
        self
    }

    /// Apply a new weight reading.
    pub fn with_reading(mut self, reading: &WeightReading) -> Self {
        self.weight_grams = reading.grams;
        self.updated_at = Some(reading.captured_at);
        self
    }
}
