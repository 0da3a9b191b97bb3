//! Runtime settings and maintenance endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{error_response, AppState};

/// Body of the as-of date endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsOfDateBody {
    /// `YYYY-MM-DD`; null or blank means today
    pub as_of_date: Option<String>,
}

/// Build the settings routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/client/settings/as-of-date",
            get(get_as_of_date_handler).post(set_as_of_date_handler),
        )
        .route("/client/settings/column-map/refresh", post(refresh_column_map_handler))
        .route("/client/reset", post(reset_handler))
        .route("/client/config/targets", get(targets_handler))
}

fn as_of_body(date: Option<NaiveDate>) -> AsOfDateBody {
    AsOfDateBody {
        as_of_date: date.map(|d| d.format("%Y-%m-%d").to_string()),
    }
}

/// GET /client/settings/as-of-date
async fn get_as_of_date_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(as_of_body(state.registry.default_as_of_date().await))
}

/// POST /client/settings/as-of-date
async fn set_as_of_date_handler(
    State(state): State<AppState>,
    Json(body): Json<AsOfDateBody>,
) -> Response {
    let date = match body.as_of_date.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_as_of_date",
                    format!("'{}' is not a YYYY-MM-DD date: {}", text, e),
                )
            }
        },
    };

    state.registry.set_default_as_of_date(date).await;
    (StatusCode::OK, Json(as_of_body(date))).into_response()
}

/// POST /client/settings/column-map/refresh
async fn refresh_column_map_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.registry.loader().invalidate().await;
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// POST /client/reset
///
/// Truncates staging and merged tables. Running subscriptions keep running.
async fn reset_handler(State(state): State<AppState>) -> Response {
    match state.registry.loader().reset().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Reset failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "reset_failed", e.to_string())
        }
    }
}

/// GET /client/config/targets
async fn targets_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.targets().to_vec())
}
