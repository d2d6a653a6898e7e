//! Application state shared across handlers.
//!
//! Handlers only read: the scale snapshot comes from the acquisition
//! worker's [`ScaleState`], the API flag from the [`ApiServer`] lifecycle.
//!
//! [`ApiServer`]: crate::server::ApiServer

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use time::OffsetDateTime;
use tokio::sync::RwLock;

use usbscale_core::ScaleState;

use crate::config::Config;

/// Shared application state.
pub struct AppState {
    /// Latest scale snapshot, written by the acquisition worker.
    pub scale: ScaleState,
    /// Configuration (RwLock for runtime updates).
    pub config: RwLock<Config>,
    /// When the service started.
    pub started_at: OffsetDateTime,
    api_running: AtomicBool,
}

impl AppState {
    /// Create new application state.
    pub fn new(scale: ScaleState, config: Config) -> Arc<Self> {
        Arc::new(Self {
            scale,
            config: RwLock::new(config),
            started_at: OffsetDateTime::now_utc(),
            api_running: AtomicBool::new(false),
        })
    }

    /// Whether the HTTP listener is up.
    pub fn api_running(&self) -> bool {
        self.api_running.load(Ordering::SeqCst)
    }

    /// Record the HTTP listener state.
    pub fn set_api_running(&self, running: bool) {
        self.api_running.store(running, Ordering::SeqCst);
    }
}
