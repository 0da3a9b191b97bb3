//! Registry of running subscriptions.
//!
//! At most one run per [`SubscriptionKey`]. Each run is a consumer task
//! paired with a supervisor task. The supervisor awaits the consumer,
//! which also catches panics. It then writes the terminal state and
//! removes the entry, but only if the entry still belongs to that run.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{NaiveDate, Utc};
use playground_protocol::SubscriptionKey;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::consumer::StreamConsumer;
use crate::error::ConsumerError;
use crate::loader::InboundLoader;
use crate::metrics::{MetricsHandle, SubscriptionMetrics, SubscriptionState, SubscriptionStatus};

struct Entry {
    run_id: Uuid,
    cancel: CancellationToken,
    metrics: watch::Receiver<SubscriptionMetrics>,
    supervisor: JoinHandle<()>,
}

impl Entry {
    fn status(&self, key: &SubscriptionKey) -> SubscriptionStatus {
        SubscriptionStatus {
            key: key.clone(),
            metrics: self.metrics.borrow().clone(),
        }
    }
}

struct RegistryInner {
    consumer: StreamConsumer,
    targets: Vec<SubscriptionKey>,
    default_as_of_date: RwLock<Option<NaiveDate>>,
    running: RwLock<HashMap<SubscriptionKey, Entry>>,
    shutdown: CancellationToken,
}

/// Manages the lifecycle of all subscriptions.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(
        consumer: StreamConsumer,
        targets: Vec<SubscriptionKey>,
        default_as_of_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                consumer,
                targets,
                default_as_of_date: RwLock::new(default_as_of_date),
                running: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Configured targets for [`start_all_configured`](Self::start_all_configured).
    pub fn targets(&self) -> &[SubscriptionKey] {
        &self.inner.targets
    }

    pub fn loader(&self) -> &Arc<InboundLoader> {
        self.inner.consumer.loader()
    }

    /// Configured default as-of date; `None` means today.
    pub async fn default_as_of_date(&self) -> Option<NaiveDate> {
        *self.inner.default_as_of_date.read().await
    }

    /// As-of date a subscription started now would use.
    pub async fn effective_as_of_date(&self) -> NaiveDate {
        self.default_as_of_date()
            .await
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Set the default as-of date for subscriptions started from now on.
    pub async fn set_default_as_of_date(&self, date: Option<NaiveDate>) {
        *self.inner.default_as_of_date.write().await = date;
        tracing::info!(as_of = ?date, "Default as-of date updated");
    }

    /// Start a subscription, or return the running one unchanged.
    pub async fn start(&self, key: SubscriptionKey) -> SubscriptionStatus {
        let as_of_date = self.effective_as_of_date().await;

        let mut running = self.inner.running.write().await;
        if let Some(entry) = running.get(&key) {
            tracing::debug!(key = %key, "Subscription already running");
            return entry.status(&key);
        }

        tracing::info!(key = %key, as_of = %as_of_date, "SUBSCRIPTION START requested");

        let run_id = Uuid::new_v4();
        let cancel = self.inner.shutdown.child_token();
        let (metrics, receiver) = MetricsHandle::new(SubscriptionMetrics::starting());
        let span = tracing::info_span!(
            "subscription",
            entity_type = %key.entity_type,
            entity_name = %key.entity_name,
        );

        let worker = {
            let consumer = self.inner.consumer.clone();
            let key = key.clone();
            let metrics = metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { consumer.run(key, as_of_date, &metrics, &cancel).await }
                    .instrument(span.clone()),
            )
        };
        let supervisor = tokio::spawn(
            supervise(Arc::downgrade(&self.inner), key.clone(), run_id, worker, metrics)
                .instrument(span),
        );

        let entry = Entry {
            run_id,
            cancel,
            metrics: receiver,
            supervisor,
        };
        let status = entry.status(&key);
        running.insert(key, entry);
        status
    }

    /// Cancel and forget a subscription. `false` if it was not running.
    pub async fn stop(&self, key: &SubscriptionKey) -> bool {
        let entry = self.inner.running.write().await.remove(key);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(key = %key, "SUBSCRIPTION STOP requested");
                true
            }
            None => false,
        }
    }

    /// Statuses of all running subscriptions.
    pub async fn list(&self) -> Vec<SubscriptionStatus> {
        let running = self.inner.running.read().await;
        let mut statuses: Vec<_> = running.iter().map(|(key, entry)| entry.status(key)).collect();
        statuses.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        statuses
    }

    pub async fn get(&self, key: &SubscriptionKey) -> Option<SubscriptionStatus> {
        self.inner
            .running
            .read()
            .await
            .get(key)
            .map(|entry| entry.status(key))
    }

    /// Start every configured target, one after another.
    pub async fn start_all_configured(&self) -> Vec<SubscriptionStatus> {
        let mut statuses = Vec::with_capacity(self.inner.targets.len());
        for key in &self.inner.targets {
            statuses.push(self.start(key.clone()).await);
        }
        tracing::info!(count = statuses.len(), "Configured subscriptions started");
        statuses
    }

    /// Cancel every subscription and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let entries: Vec<_> = self.inner.running.write().await.drain().collect();
        tracing::info!(count = entries.len(), "Stopping all subscriptions");

        for (key, entry) in entries {
            if let Err(e) = entry.supervisor.await {
                tracing::warn!(key = %key, error = %e, "Supervisor did not finish cleanly");
            }
        }
    }
}

async fn supervise(
    registry: Weak<RegistryInner>,
    key: SubscriptionKey,
    run_id: Uuid,
    worker: JoinHandle<Result<(), ConsumerError>>,
    metrics: MetricsHandle,
) {
    match worker.await {
        Ok(Ok(())) => {
            metrics.finish(SubscriptionState::Stopped, None);
            tracing::info!("SUBSCRIPTION STOPPED");
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "SUBSCRIPTION ERROR");
            metrics.finish(SubscriptionState::Error, Some(e.to_string()));
        }
        Err(e) if e.is_panic() => {
            tracing::error!("SUBSCRIPTION ERROR (task panicked)");
            metrics.finish(
                SubscriptionState::Error,
                Some("subscription task panicked".to_string()),
            );
        }
        Err(_) => {
            metrics.finish(SubscriptionState::Stopped, None);
            tracing::info!("SUBSCRIPTION STOPPED (task aborted)");
        }
    }

    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut running = registry.running.write().await;
    if running.get(&key).is_some_and(|entry| entry.run_id == run_id) {
        running.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryInboundStore;
    use playground_protocol::EntityType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn key(name: &str) -> SubscriptionKey {
        SubscriptionKey::new(EntityType::Accounts, name)
    }

    fn registry_for(base_url: &str, targets: Vec<SubscriptionKey>) -> SubscriptionRegistry {
        let loader = Arc::new(InboundLoader::new(Arc::new(MemoryInboundStore::with_columns(
            MemoryInboundStore::playground_columns(),
        ))));
        let consumer = StreamConsumer::new(reqwest::Client::new(), base_url, false, loader).unwrap();
        SubscriptionRegistry::new(consumer, targets, None)
    }

    /// Accepts connections, counts them and never answers.
    async fn silent_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        (format!("http://{}", addr), accepted)
    }

    /// Answers every request with `503 Service Unavailable`.
    async fn unavailable_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = axum::Router::new()
            .fallback(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE });
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{}", addr)
    }

    async fn wait_until_absent(registry: &SubscriptionRegistry, key: &SubscriptionKey) {
        for _ in 0..200 {
            if registry.get(key).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscription {} still registered", key);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (base_url, accepted) = silent_server().await;
        let registry = registry_for(&base_url, Vec::new());

        let first = registry.start(key("ACC1")).await;
        let second = registry.start(key("ACC1")).await;

        assert_eq!(first.metrics.started_at, second.metrics.started_at);
        assert_eq!(first.metrics.state, SubscriptionState::Starting);
        assert_eq!(registry.list().await.len(), 1);

        for _ in 0..200 {
            if accepted.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give a second task time to connect, if one had been spawned
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_success_status_finishes_in_error() {
        let registry = registry_for(&unavailable_server().await, Vec::new());
        let (metrics, mut receiver) = MetricsHandle::new(SubscriptionMetrics::starting());
        let worker = {
            let consumer = registry.inner.consumer.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                consumer
                    .run(
                        key("ACC1"),
                        NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                        &metrics,
                        &CancellationToken::new(),
                    )
                    .await
            })
        };

        supervise(Arc::downgrade(&registry.inner), key("ACC1"), Uuid::new_v4(), worker, metrics).await;

        let finished = receiver.borrow_and_update().clone();
        assert_eq!(finished.state, SubscriptionState::Error);
        assert_eq!(finished.last_error.as_deref(), Some("HTTP 503"));
        assert!(finished.stopped_at.is_some());
        assert!(finished.stopped_at >= finished.started_at);
    }

    #[tokio::test]
    async fn test_non_success_status_removes_entry() {
        let registry = registry_for(&unavailable_server().await, Vec::new());
        registry.start(key("ACC1")).await;

        wait_until_absent(&registry, &key("ACC1")).await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_removes_immediately() {
        let registry = registry_for(&silent_server().await.0, Vec::new());
        registry.start(key("ACC1")).await;

        assert!(registry.stop(&key("ACC1")).await);
        assert!(registry.list().await.is_empty());
        assert!(registry.get(&key("ACC1")).await.is_none());
        assert!(!registry.stop(&key("ACC1")).await);
        assert!(!registry.stop(&key("NEVER")).await);
    }

    #[tokio::test]
    async fn test_restart_after_stop_is_a_new_run() {
        let registry = registry_for(&silent_server().await.0, Vec::new());
        let first = registry.start(key("ACC1")).await;
        registry.stop(&key("ACC1")).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry.start(key("ACC1")).await;
        assert!(second.metrics.started_at > first.metrics.started_at);

        // The first run's supervisor must not remove the second run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get(&key("ACC1")).await.is_some());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_removes_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = registry_for(&format!("http://{}", addr), Vec::new());
        registry.start(key("ACC1")).await;

        wait_until_absent(&registry, &key("ACC1")).await;
    }

    #[tokio::test]
    async fn test_start_all_configured() {
        let targets = vec![key("ACC1"), SubscriptionKey::new(EntityType::Groups, "EMEA")];
        let registry = registry_for(&silent_server().await.0, targets);

        let statuses = registry.start_all_configured().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(registry.list().await.len(), 2);

        registry.shutdown().await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_default_as_of_date() {
        let registry = registry_for("http://localhost:6066", Vec::new());
        assert_eq!(registry.default_as_of_date().await, None);
        assert_eq!(registry.effective_as_of_date().await, Utc::now().date_naive());

        let date = NaiveDate::from_ymd_opt(2024, 1, 5);
        registry.set_default_as_of_date(date).await;
        assert_eq!(registry.default_as_of_date().await, date);
        assert_eq!(Some(registry.effective_as_of_date().await), date);
    }
}
