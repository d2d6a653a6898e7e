//! Core USB library for Dymo postal scales.
//!
//! This crate talks to a USB HID scale and keeps a stable "current weight"
//! available to the rest of the program, even when the scale is unplugged,
//! absent at startup, or produces transient read errors.
//!
//! # Features
//!
//! - **Device link**: enumerate, claim and read the scale via `nusb`
//! - **Acquisition worker**: background read loop with bounded retries,
//!   liveness checks and a periodic reconnect search
//! - **Shared state**: a snapshot cell readers can copy at any time
//! - **Events**: typed weight, connection and error notifications
//! - **Mock scale**: scripted device for tests
//!
//! # Quick Start
//!
//! ```no_run
//! use usbscale_core::{
//!     AcquisitionOptions, AcquisitionWorker, EventDispatcher, ScaleState, UsbScale,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = ScaleState::new();
//!     let events = EventDispatcher::default();
//!
//!     let worker = AcquisitionWorker::spawn(
//!         UsbScale::new(),
//!         state.clone(),
//!         events,
//!         AcquisitionOptions::default(),
//!     )?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//!     let snapshot = state.read();
//!     println!("{} g (connected: {})", snapshot.weight_grams, snapshot.connected);
//!
//!     worker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod acquisition;
pub mod device;
pub mod error;
pub mod events;
pub mod mock;
pub mod state;
pub mod traits;

// Re-export types and usb modules from usbscale-types
pub use usbscale_types::types;
pub use usbscale_types::usb;

// Core exports
pub use acquisition::{
    AcquisitionHandle, AcquisitionOptions, AcquisitionPhase, AcquisitionWorker, MAX_ATTEMPTS,
    MAX_CONSECUTIVE_ERRORS,
};
pub use device::{ReadEndpoint, UsbScale};
pub use error::{Error, ErrorKind, Result};
pub use events::{DisconnectReason, EventDispatcher, EventReceiver, EventSender, ScaleEvent};
pub use mock::{MockRead, MockScale};
pub use state::ScaleState;
pub use traits::ScaleLink;

// Re-export from usbscale-types
pub use usbscale_types::{ConnectionType, DeviceLabel, ScaleSnapshot, WeightReading};
