//! Position subscription stream endpoint
//!
//! `POST /trading-solutions/positions/{entity_type}/{entity_name}/subscriptions`
//! answers with an unbounded body of concatenated JSON objects.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::{NaiveDate, Utc};
use playground_protocol::{
    SubscriptionKey, CORRELATION_HEADER, STREAM_CONTENT_TYPE, SUBSCRIPTION_ROUTE,
};
use serde::Deserialize;
use tokio_stream::StreamExt;

use super::{error_response, AppState};

/// Query string of the stream endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    /// As-of date, today (UTC) when absent
    pub as_of_date: Option<NaiveDate>,
    /// Fragmentation emulation, off when absent
    pub chunk: Option<bool>,
}

/// Build the stream routes
pub fn routes() -> Router<AppState> {
    Router::new().route(SUBSCRIPTION_ROUTE, post(subscribe_handler))
}

/// POST /trading-solutions/positions/{entity_type}/{entity_name}/subscriptions
async fn subscribe_handler(
    State(state): State<AppState>,
    Path((entity_type, entity_name)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let key = match SubscriptionKey::parse(&entity_type, &entity_name) {
        Ok(key) => key,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_subscription", e.to_string()),
    };
    let as_of_date = query
        .as_of_date
        .unwrap_or_else(|| Utc::now().date_naive());
    let chunk = query.chunk.unwrap_or(false);

    let opened = match state.producer.open(key.clone(), as_of_date, chunk).await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::error!(key = %key, as_of = %as_of_date, error = %e, "Snapshot read failed");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "source_unavailable",
                e.to_string(),
            );
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    match HeaderValue::from_str(&opened.correlation_id) {
        Ok(value) => {
            headers.insert(HeaderName::from_static("x-request-id"), value);
        }
        Err(_) => {
            tracing::warn!(
                correlation_id = %opened.correlation_id,
                "Correlation id is not a valid {} value; header omitted",
                CORRELATION_HEADER
            );
        }
    }

    let body = Body::from_stream(opened.body.map(Ok::<_, Infallible>));
    (StatusCode::OK, headers, body).into_response()
}
