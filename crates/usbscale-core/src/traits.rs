//! Trait abstractions for the scale device link.
//!
//! This module provides the [`ScaleLink`] trait that abstracts over the real
//! USB scale and the mock scale used in tests.

use std::time::Duration;

use async_trait::async_trait;

use usbscale_types::{DeviceLabel, WeightReading};

use crate::error::Result;

/// A session with exactly one scale.
///
/// The link has no concurrency of its own: the acquisition worker owns it
/// and calls one operation at a time. Implementations keep the invariant that
/// `is_connected() == true` implies an open transport handle, and release
/// the handle as soon as a read fails fatally.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use usbscale_core::{ScaleLink, Result};
///
/// async fn print_weight<L: ScaleLink>(link: &mut L) -> Result<()> {
///     link.find_and_connect().await?;
///     if let Some(reading) = link.read_one(Duration::from_secs(1)).await? {
///         println!("{} g", reading.grams);
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ScaleLink: Send + Sync {
    // --- Connection Management ---

    /// Find the scale and open a session.
    ///
    /// Calling this while connected re-validates the existing session and
    /// must not open a second handle.
    async fn find_and_connect(&mut self) -> Result<DeviceLabel>;

    /// Cheap check that detects a handle that went stale without an error.
    ///
    /// Does not change the session; callers act on the result.
    async fn is_alive(&self) -> bool;

    /// Release the transport handle. Idempotent.
    async fn disconnect(&mut self);

    /// Whether a session is open.
    fn is_connected(&self) -> bool;

    /// Label of the connected scale, if any.
    fn label(&self) -> Option<&DeviceLabel>;

    // --- Acquisition ---

    /// Read exactly one frame.
    ///
    /// Returns `Ok(None)` on timeout and for empty or short frames.
    async fn read_one(&mut self, timeout: Duration) -> Result<Option<WeightReading>>;

    /// Reassert the device configuration after a transient error.
    async fn reconfigure(&mut self) -> Result<()>;
}
