//! Subscription control endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use playground_protocol::SubscriptionKey;
use serde::Deserialize;

use super::{error_response, AppState};

/// Subscription key as posted by operators
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequest {
    pub entity_type: String,
    pub entity_name: String,
}

impl KeyRequest {
    fn parse(&self) -> Result<SubscriptionKey, Response> {
        SubscriptionKey::parse(&self.entity_type, &self.entity_name).map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, "invalid_subscription", e.to_string())
        })
    }
}

/// Build the subscription routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/client/subscriptions", get(list_handler))
        .route(
            "/client/subscriptions/status/{entity_type}/{entity_name}",
            get(status_handler),
        )
        .route("/client/subscriptions/start", post(start_handler))
        .route("/client/subscriptions/stop", post(stop_handler))
        .route("/client/subscriptions/start-all", post(start_all_handler))
}

/// GET /client/subscriptions
async fn list_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

/// GET /client/subscriptions/status/{entity_type}/{entity_name}
async fn status_handler(
    State(state): State<AppState>,
    Path((entity_type, entity_name)): Path<(String, String)>,
) -> Response {
    let key = match SubscriptionKey::parse(&entity_type, &entity_name) {
        Ok(key) => key,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_subscription", e.to_string())
        }
    };

    match state.registry.get(&key).await {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("subscription {} is not running", key),
        ),
    }
}

/// POST /client/subscriptions/start
async fn start_handler(
    State(state): State<AppState>,
    Json(request): Json<KeyRequest>,
) -> Response {
    let key = match request.parse() {
        Ok(key) => key,
        Err(response) => return response,
    };
    let status = state.registry.start(key).await;
    (StatusCode::OK, Json(status)).into_response()
}

/// POST /client/subscriptions/stop
///
/// Answers a bare `true` or `false`.
async fn stop_handler(
    State(state): State<AppState>,
    Json(request): Json<KeyRequest>,
) -> Response {
    let key = match request.parse() {
        Ok(key) => key,
        Err(response) => return response,
    };
    let stopped = state.registry.stop(&key).await;
    (StatusCode::OK, Json(stopped)).into_response()
}

/// POST /client/subscriptions/start-all
async fn start_all_handler(State(state): State<AppState>) -> impl IntoResponse {
    let statuses = state.registry.start_all_configured().await;
    (StatusCode::ACCEPTED, Json(statuses))
}
