//! USB identifiers for supported scales.

/// Dymo vendor ID.
pub const DYMO_VENDOR_ID: u16 = 0x0922;

/// Dymo M5/M10 postal scale product ID.
pub const DYMO_M10_PRODUCT_ID: u16 = 0x8003;

/// Human-readable model name reported for the M5/M10.
pub const DYMO_M10_NAME: &str = "Dymo M5/M10";

/// Interface claimed on the scale (the HID interface).
pub const SCALE_INTERFACE: u8 = 0;
