//! Subscription state and counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playground_protocol::SubscriptionKey;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriptionState {
    #[default]
    Starting,
    InitialPaint,
    Intraday,
    Stopped,
    Error,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Stopped | SubscriptionState::Error)
    }
}

/// Counters and timestamps of one subscription run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMetrics {
    /// Snapshot records received
    pub initial_paint_objects: u64,
    /// Incremental records loaded
    pub intraday_objects: u64,
    /// Heartbeats received, excluding the one ending the snapshot
    pub heartbeats: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub state: SubscriptionState,
    /// Session id taken from the stream response
    pub correlation_id: Option<String>,
}

impl SubscriptionMetrics {
    /// Fresh metrics for a run starting now.
    pub fn starting() -> Self {
        Self {
            started_at: Some(Utc::now()),
            state: SubscriptionState::Starting,
            ..Default::default()
        }
    }
}

/// Point-in-time view of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub key: SubscriptionKey,
    pub metrics: SubscriptionMetrics,
}

/// Write side of a subscription's metrics.
///
/// Held by the subscription task and its completion handler; readers
/// observe through the paired `watch::Receiver`.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    tx: Arc<watch::Sender<SubscriptionMetrics>>,
}

impl MetricsHandle {
    pub fn new(initial: SubscriptionMetrics) -> (Self, watch::Receiver<SubscriptionMetrics>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn update(&self, f: impl FnOnce(&mut SubscriptionMetrics)) {
        self.tx.send_modify(f);
    }

    pub fn snapshot(&self) -> SubscriptionMetrics {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> SubscriptionState {
        self.tx.borrow().state
    }

    pub fn set_state(&self, state: SubscriptionState) {
        self.update(|m| m.state = state);
    }

    /// Record a terminal state with its stop time.
    pub fn finish(&self, state: SubscriptionState, error: Option<String>) {
        self.update(|m| {
            m.state = state;
            m.stopped_at = Some(Utc::now());
            if error.is_some() {
                m.last_error = error;
            }
        });
    }
}
