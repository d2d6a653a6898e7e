//! Scale event system for connection and weight notifications.
//!
//! This module provides an event-based system for receiving notifications
//! about scale connections, disconnections, weight updates and errors. The
//! acquisition worker is the only producer; the service's console reporter
//! and tests subscribe.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use usbscale_types::{DeviceLabel, WeightReading};

/// Events emitted by the acquisition worker.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ScaleEvent {
    /// A new weight was read.
    WeightUpdated { reading: WeightReading },
    /// The connection flag flipped.
    ConnectionChanged {
        connected: bool,
        label: Option<DeviceLabel>,
        reason: Option<DisconnectReason>,
    },
    /// Something went wrong; the message is meant for humans.
    ErrorOccurred { message: String },
}

impl ScaleEvent {
    /// Whether this is a connection change to the given state.
    pub fn is_connection(&self, state: bool) -> bool {
        matches!(self, ScaleEvent::ConnectionChanged { connected, .. } if *connected == state)
    }
}

/// Reason for disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The liveness check failed before a read.
    LivenessLost,
    /// Too many reads in a row returned nothing.
    EmptyReads,
    /// Transient errors used up the retry budget.
    RetriesExhausted,
    /// Reasserting the configuration after a transient error failed.
    ReconfigureFailed,
    /// The transport reported the device as gone.
    DeviceRemoved,
    /// Too many loop iterations in a row failed.
    RepeatedFailures,
    /// The worker was stopped.
    Stopped,
}

/// Sender for scale events.
pub type EventSender = broadcast::Sender<ScaleEvent>;

/// Receiver for scale events.
pub type EventReceiver = broadcast::Receiver<ScaleEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: ScaleEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
