//! Management API routes
//!
//! - subscriptions: start, stop, list and inspect subscriptions
//! - settings: default as-of date, column map refresh, table reset, targets
//! - health: service health

pub mod health;
pub mod settings;
pub mod subscriptions;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::ClientConfig;
use crate::registry::SubscriptionRegistry;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ClientConfig>,
    pub registry: SubscriptionRegistry,
    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Arc<ClientConfig>, registry: SubscriptionRegistry) -> Self {
        Self {
            config,
            registry,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Error body of the management API
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

/// Build the management router
pub fn build_router(config: Arc<ClientConfig>, registry: SubscriptionRegistry) -> Router {
    let state = AppState::new(config, registry);

    Router::new()
        .merge(health::routes())
        .merge(subscriptions::routes())
        .merge(settings::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::consumer::StreamConsumer;
    use crate::loader::InboundLoader;
    use crate::store::MemoryInboundStore;
    use playground_protocol::{EntityType, SubscriptionKey};

    /// Upstream that accepts connections and never answers, so started
    /// subscriptions stay registered until stopped.
    async fn silent_upstream() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}", addr)
    }

    pub async fn test_state() -> (AppState, MemoryInboundStore) {
        let store = MemoryInboundStore::with_columns(MemoryInboundStore::playground_columns());
        let loader = Arc::new(InboundLoader::new(Arc::new(store.clone())));
        let upstream = silent_upstream().await;
        let consumer = StreamConsumer::new(reqwest::Client::new(), &upstream, false, loader).unwrap();
        let targets = vec![
            SubscriptionKey::new(EntityType::Accounts, "ACC1"),
            SubscriptionKey::new(EntityType::Groups, "EMEA"),
        ];
        let registry = SubscriptionRegistry::new(consumer, targets.clone(), None);
        let config = ClientConfig {
            targets,
            ..Default::default()
        };
        (AppState::new(Arc::new(config), registry), store)
    }
}
