//! Health check endpoints
//!
//! Provides the service banner, health and readiness endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};

use super::AppState;

/// Service name reported at the root
pub const SERVICE_NAME: &str = "agpme-bbg-stream-playground";

/// Root banner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BannerResponse {
    pub name: String,
    pub status: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Health status ("healthy" or "unhealthy")
    pub status: String,
    /// Simulator version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Whether the change table comes from Postgres
    pub database_configured: bool,
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub ready: bool,
}

/// Build the health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(banner_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
}

/// GET / - Service banner
async fn banner_handler() -> impl IntoResponse {
    let response = BannerResponse {
        name: SERVICE_NAME.to_string(),
        status: "ok".to_string(),
    };
    (StatusCode::OK, Json(response))
}

/// GET /health - Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: crate::VERSION.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        database_configured: state.config.database_url.is_some(),
    };

    (StatusCode::OK, Json(response))
}

/// GET /ready - Readiness probe endpoint
async fn ready_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(ReadyResponse { ready: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::producer::StreamProducer;
    use crate::source::MemoryChangeSource;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        let config = Arc::new(SimulatorConfig::default());
        let producer = StreamProducer::new(
            Arc::new(MemoryChangeSource::new()),
            config.stream.clone(),
        );
        AppState::new(config, producer)
    }

    async fn get_json(uri: &str) -> serde_json::Value {
        let router = routes().with_state(create_test_state());
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_root_banner() {
        let body = get_json("/").await;
        assert_eq!(body["name"], SERVICE_NAME);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_health_endpoint_returns_json() {
        let body = get_json("/health").await;
        let health: HealthResponse = serde_json::from_value(body.clone()).unwrap();

        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, crate::VERSION);
        assert!(!health.database_configured);
        // camelCase on the wire
        assert!(body.get("uptimeSecs").is_some());
    }

    #[tokio::test]
    async fn test_ready_endpoint() {
        let body = get_json("/ready").await;
        assert_eq!(body["ready"], true);
    }
}
