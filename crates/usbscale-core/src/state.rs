//! Shared scale state.
//!
//! [`ScaleState`] holds the latest [`ScaleSnapshot`]. The acquisition worker
//! is the single writer; HTTP handlers and other readers take full copies.
//! Every publication replaces the whole snapshot at once, so a reader never
//! observes a weight from one publication next to a connection flag from
//! another.

use std::sync::Arc;

use tokio::sync::watch;

use usbscale_types::{DeviceLabel, ScaleSnapshot, WeightReading};

/// Handle to the latest scale snapshot.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct ScaleState {
    tx: Arc<watch::Sender<ScaleSnapshot>>,
}

impl Default for ScaleState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScaleState {
    /// Create state holding the default snapshot (0 g, disconnected).
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ScaleSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Consistent copy of the current snapshot.
    pub fn read(&self) -> ScaleSnapshot {
        self.tx.borrow().clone()
    }

    /// Replace the whole snapshot.
    pub fn publish(&self, snapshot: ScaleSnapshot) {
        self.tx.send_replace(snapshot);
    }

    /// Derive the next snapshot from the current one.
    pub fn update(&self, f: impl FnOnce(ScaleSnapshot) -> ScaleSnapshot) {
        self.tx.send_modify(|current| {
            let next = f(std::mem::take(current));
            *current = next;
        });
    }

    /// Publish a connection change. Labels are only replaced when given.
    pub fn set_connected(&self, connected: bool, label: Option<&DeviceLabel>) {
        self.update(|s| s.with_connection(connected, label));
    }

    /// Publish a new weight.
    pub fn set_weight(&self, reading: &WeightReading) {
        self.update(|s| s.with_reading(reading));
    }

    /// Watch for publications.
    pub fn subscribe(&self) -> watch::Receiver<ScaleSnapshot> {
        self.tx.subscribe()
    }
}
