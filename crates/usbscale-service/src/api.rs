//! REST API endpoints for the usbscale-service.
//!
//! Every endpoint is read-only. Each request takes its own copy of the scale
//! snapshot, so a response never mixes the weight of one publication with the
//! connection flag of another.
//!
//! # Endpoints
//!
//! - `GET /` - HTML documentation page
//! - `GET /api/weight` - Last weight in grams
//! - `GET /api/status` - Connection and API status
//! - `GET /api/health` - Service health check
//!
//! Unknown paths return a JSON error via [`AppError`].
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use usbscale_service::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, Uri},
    response::{Html, IntoResponse},
    routing::get,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api_docs))
        .route("/api/weight", get(get_weight))
        .route("/api/status", get(get_status))
        .route("/api/health", get(health))
        .fallback(not_found)
}

/// Weight response.
#[derive(Debug, Serialize)]
pub struct WeightResponse {
    /// Last weight in grams.
    pub weight: u16,
    /// Always `"g"`.
    pub unit: &'static str,
    /// Time of the request.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub connected: bool,
}

/// Latest weight endpoint.
///
/// The weight survives a disconnect; check `connected` to know whether it is
/// live.
async fn get_weight(State(state): State<Arc<AppState>>) -> Json<WeightResponse> {
    let snapshot = state.scale.read();
    Json(WeightResponse {
        weight: snapshot.weight_grams,
        unit: "g",
        timestamp: OffsetDateTime::now_utc(),
        connected: snapshot.connected,
    })
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub device_type: String,
    pub device_name: String,
    pub api_running: bool,
}

/// Scale and API status endpoint.
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.scale.read();
    Json(StatusResponse {
        connected: snapshot.connected,
        device_type: snapshot.device_type.as_str().to_string(),
        device_name: snapshot.device_name,
        api_running: state.api_running(),
    })
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub uptime_seconds: i64,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let now = OffsetDateTime::now_utc();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now,
        uptime_seconds: (now - state.started_at).whole_seconds(),
    })
}

/// HTML documentation page.
async fn api_docs() -> Html<&'static str> {
    Html(DOCS_HTML)
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}

/// API error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

const DOCS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Scale API</title>
    <style>
        body { font-family: Arial, sans-serif; max-width: 800px; margin: 0 auto; padding: 20px; }
        h1 { color: #0078d7; }
        h2 { color: #333; margin-top: 20px; }
        pre { background-color: #f5f5f5; padding: 10px; border-radius: 3px; }
        .endpoint { margin-bottom: 20px; border-bottom: 1px solid #eee; padding-bottom: 20px; }
    </style>
</head>
<body>
    <h1>Scale API</h1>
    <p>Read the USB scale with the following endpoints.</p>

    <div class="endpoint">
        <h2>GET /api/weight</h2>
        <p>Returns the last weight measured by the scale.</p>
        <p><strong>URL:</strong> <a href="/api/weight">/api/weight</a></p>
        <p><strong>Example response:</strong></p>
        <pre>{
  "weight": 245,
  "unit": "g",
  "timestamp": "2025-05-21T21:45:30.123456Z",
  "connected": true
}</pre>
    </div>

    <div class="endpoint">
        <h2>GET /api/status</h2>
        <p>Returns the state of the scale and of the API.</p>
        <p><strong>URL:</strong> <a href="/api/status">/api/status</a></p>
        <p><strong>Example response:</strong></p>
        <pre>{
  "connected": true,
  "device_type": "USB",
  "device_name": "Dymo M5/M10",
  "api_running": true
}</pre>
    </div>

    <div class="endpoint">
        <h2>GET /api/health</h2>
        <p>Service health check.</p>
        <p><strong>URL:</strong> <a href="/api/health">/api/health</a></p>
    </div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use usbscale_core::{DeviceLabel, ScaleState, WeightReading};

    use crate::config::Config;

    fn create_test_state() -> Arc<AppState> {
        AppState::new(ScaleState::new(), Config::default())
    }

    async fn get(state: &Arc<AppState>, uri: &str) -> axum::response::Response {
        router()
            .with_state(Arc::clone(state))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn frame(lo: u8, hi: u8) -> WeightReading {
        WeightReading::from_frame(&[0, 0, 0, 0, lo, hi]).unwrap()
    }

    #[tokio::test]
    async fn test_weight_before_any_read() {
        let state = create_test_state();
        let response = get(&state, "/api/weight").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["weight"], 0);
        assert_eq!(json["unit"], "g");
        assert_eq!(json["connected"], false);
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_weight_follows_publications() {
        let state = create_test_state();
        state
            .scale
            .set_connected(true, Some(&DeviceLabel::usb("Dymo M5/M10")));

        state.scale.set_weight(&frame(100, 0));
        let json = response_json(get(&state, "/api/weight").await).await;
        assert_eq!(json["weight"], 100);
        assert_eq!(json["connected"], true);

        state.scale.set_weight(&frame(44, 1));
        let json = response_json(get(&state, "/api/weight").await).await;
        assert_eq!(json["weight"], 300);
    }

    #[tokio::test]
    async fn test_weight_timestamp_is_rfc3339() {
        let state = create_test_state();
        let json = response_json(get(&state, "/api/weight").await).await;
        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(
            OffsetDateTime::parse(timestamp, &time::format_description::well_known::Rfc3339)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_status_disconnected_defaults() {
        let state = create_test_state();
        let response = get(&state, "/api/status").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["connected"], false);
        assert_eq!(json["device_type"], "Unknown");
        assert_eq!(json["device_name"], "Unknown Scale");
        assert_eq!(json["api_running"], false);
    }

    #[tokio::test]
    async fn test_status_connected() {
        let state = create_test_state();
        state
            .scale
            .set_connected(true, Some(&DeviceLabel::usb("Dymo M5/M10")));
        state.set_api_running(true);

        let json = response_json(get(&state, "/api/status").await).await;
        assert_eq!(json["connected"], true);
        assert_eq!(json["device_type"], "USB");
        assert_eq!(json["device_name"], "Dymo M5/M10");
        assert_eq!(json["api_running"], true);
    }

    #[tokio::test]
    async fn test_status_after_disconnect_keeps_labels() {
        let state = create_test_state();
        state
            .scale
            .set_connected(true, Some(&DeviceLabel::usb("Dymo M5/M10")));
        state.scale.set_weight(&frame(200, 0));
        state.scale.set_connected(false, None);

        let json = response_json(get(&state, "/api/status").await).await;
        assert_eq!(json["connected"], false);
        assert_eq!(json["device_name"], "Dymo M5/M10");

        let json = response_json(get(&state, "/api/weight").await).await;
        assert_eq!(json["weight"], 200);
        assert_eq!(json["connected"], false);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = create_test_state();
        let response = get(&state, "/api/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert!(json["timestamp"].is_string());
        assert!(json["uptime_seconds"].as_i64().unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_docs_page() {
        let state = create_test_state();
        let response = get(&state, "/").await;
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/html"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("/api/weight"));
        assert!(html.contains("/api/status"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = create_test_state();
        let response = get(&state, "/api/missing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("/api/missing"));
    }

    #[tokio::test]
    async fn test_post_is_rejected() {
        let state = create_test_state();
        let response = router()
            .with_state(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/weight")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_app_error_not_found() {
        let error = AppError::NotFound("test".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
