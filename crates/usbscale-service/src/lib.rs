//! Background scale reader and HTTP API for Dymo USB scales.
//!
//! This crate provides a service that:
//! - Keeps a connection to the scale and reconnects when it drops
//! - Holds the last weight and connection state in memory
//! - Exposes them over a read-only HTTP API
//!
//! # REST API Endpoints
//!
//! - `GET /` - HTML documentation page
//! - `GET /api/weight` - Last weight in grams
//! - `GET /api/status` - Connection and API status
//! - `GET /api/health` - Service health check
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/usbscale/settings.toml`:
//!
//! ```toml
//! [api]
//! host = "0.0.0.0"
//! port = 5000
//! autostart = true
//!
//! [application]
//! start_minimized = false
//! autostart_at_login = true
//! ```
//!
//! Missing keys take the defaults shown above, except `autostart_at_login`:
//! when it is absent the login registration is left as it is.

pub mod api;
pub mod config;
pub mod server;
pub mod state;

pub use config::{ApiConfig, ApplicationConfig, Config, ConfigError, ValidationError};
pub use server::{ApiServer, ServerError, app};
pub use state::AppState;
