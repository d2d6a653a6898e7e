//! HTTP listener lifecycle.
//!
//! [`ApiServer`] starts, stops and restarts the axum listener at runtime.
//! Stopping is best effort: the listener closes right away, and open
//! connections get [`STOP_GRACE`] to finish before the serve task is aborted.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api;
use crate::config::{ApiConfig, ConfigError};
use crate::state::AppState;

/// How long [`ApiServer::stop`] waits for in-flight connections.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("API server is already running on {0}")]
    AlreadyRunning(SocketAddr),
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Build the full application: routes, tracing, CORS and state.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Runtime-controllable HTTP listener.
pub struct ApiServer {
    state: Arc<AppState>,
    running: Option<RunningServer>,
    // Bumped on every start; only the current serve task may clear `api_running`
    generation: Arc<AtomicU64>,
}

impl ApiServer {
    /// Create a stopped server.
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            running: None,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind the configured address and serve in the background.
    ///
    /// Returns the bound address. On failure `api_running` stays false.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(server) = &self.running
            && !server.task.is_finished()
        {
            return Err(ServerError::AlreadyRunning(server.addr));
        }

        let api = self.state.config.read().await.api.clone();
        let addr = api
            .socket_addr()
            .ok_or_else(|| ServerError::InvalidAddress(api.host.clone()))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let state = Arc::clone(&self.state);
        let router = app(Arc::clone(&self.state));
        let generation = Arc::clone(&self.generation);
        let current = generation.fetch_add(1, Ordering::SeqCst) + 1;

        state.set_api_running(true);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!("API server error: {}", e);
            }
            if generation.load(Ordering::SeqCst) == current {
                state.set_api_running(false);
            }
        });

        info!("API server started on http://{}", local_addr);
        self.running = Some(RunningServer {
            addr: local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Whether the listener is serving.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|server| !server.task.is_finished())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|server| server.addr)
    }

    /// Stop accepting connections. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut server) = self.running.take() else {
            return;
        };

        server.shutdown.cancel();
        self.state.set_api_running(false);

        if timeout(STOP_GRACE, &mut server.task).await.is_err() {
            warn!(
                "API server did not drain within {:?}, aborting open connections",
                STOP_GRACE
            );
            server.task.abort();
        }
        info!("API server stopped");
    }

    /// Stop, apply a new API configuration, and start again.
    ///
    /// The new configuration is validated first; an invalid one is rejected
    /// without touching the running listener or the stored configuration.
    pub async fn restart(&mut self, api: ApiConfig) -> Result<SocketAddr, ServerError> {
        let errors = api.validate();
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors).into());
        }

        self.stop().await;
        self.state.config.write().await.api = api;
        self.start().await
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        if let Some(server) = &self.running {
            server.shutdown.cancel();
        }
    }
}
