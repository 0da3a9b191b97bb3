//! Route modules for the simulator
//!
//! - stream: the position subscription stream
//! - health: root, health and readiness endpoints

pub mod health;
pub mod stream;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::SimulatorConfig;
use crate::producer::StreamProducer;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Simulator configuration
    pub config: Arc<SimulatorConfig>,
    /// Stream producer over the configured change source
    pub producer: StreamProducer,
    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Arc<SimulatorConfig>, producer: StreamProducer) -> Self {
        Self {
            config,
            producer,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Error body returned by the simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub(crate) fn error_response(
    status: StatusCode,
    error: &str,
    message: impl Into<String>,
) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

/// Build the main application router by merging all route modules
pub fn build_router(config: Arc<SimulatorConfig>, producer: StreamProducer) -> Router {
    let state = AppState::new(config, producer);

    Router::new()
        .merge(health::routes())
        .merge(stream::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryChangeSource;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = Arc::new(SimulatorConfig::default());
        let producer = StreamProducer::new(
            Arc::new(MemoryChangeSource::new()),
            config.stream.clone(),
        );
        build_router(config, producer)
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stream_route_rejects_get() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/trading-solutions/positions/accounts/ACC1/subscriptions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/unknown/path")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
