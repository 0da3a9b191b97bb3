//! Stream consumer: one subscription from connect to stop.
//!
//! [`StreamConsumer::run`] connects to the producer and hands the body to a
//! [`SessionDriver`], which owns the subscription state machine:
//!
//! - `InitialPaint`: data frames are buffered; the first heartbeat loads the
//!   whole batch (possibly empty) once and switches to `Intraday`. That
//!   heartbeat is control only and is not counted.
//! - `Intraday`: each data frame is loaded on arrival; heartbeats are
//!   counted.
//!
//! `Ok(())` means the run stopped cleanly (stream end, teardown or
//! cancellation). Any `Err` means the run ends in `Error`.

use std::ops::ControlFlow;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use futures::{Stream, StreamExt};
use playground_protocol::{
    subscription_segments, StreamFrame, SubscriptionKey, AS_OF_DATE_PARAM, CHUNK_PARAM,
    CORRELATION_HEADER,
};
use reqwest::header::ACCEPT;
use reqwest::Url;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConsumerError, LoadError};
use crate::loader::{InboundLoader, LoadSession};
use crate::metrics::{MetricsHandle, SubscriptionState};
use crate::reassembler::FrameReassembler;

/// Snapshot records between progress logs.
const SNAPSHOT_PROGRESS_EVERY: u64 = 50;

/// Incremental records between progress logs.
const INTRADAY_PROGRESS_EVERY: u64 = 100;

/// A failed body read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFailure {
    /// The connection was torn down; the run stops rather than fails
    pub teardown: bool,
    pub message: String,
}

impl ReadFailure {
    pub fn teardown(message: impl Into<String>) -> Self {
        Self {
            teardown: true,
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            teardown: false,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ReadFailure {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        if is_teardown(&err) {
            Self::teardown(message)
        } else {
            Self::fault(message)
        }
    }
}

fn is_teardown(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return false;
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }

    err.is_body()
}

/// Connects subscriptions to the producer.
#[derive(Clone)]
pub struct StreamConsumer {
    http: reqwest::Client,
    base_url: Url,
    chunk: bool,
    loader: Arc<InboundLoader>,
}

impl StreamConsumer {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        chunk: bool,
        loader: Arc<InboundLoader>,
    ) -> Result<Self, ConsumerError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ConsumerError::Url(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ConsumerError::Url(format!("{} cannot be a base URL", base_url)));
        }
        Ok(Self {
            http,
            base_url,
            chunk,
            loader,
        })
    }

    pub fn loader(&self) -> &Arc<InboundLoader> {
        &self.loader
    }

    /// Stream URL for a key and date.
    ///
    /// Each path segment is percent-encoded separately, so reserved
    /// characters in the entity name stay inside the name segment.
    pub fn stream_url(&self, key: &SubscriptionKey, as_of_date: NaiveDate) -> Result<Url, ConsumerError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| ConsumerError::Url(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(subscription_segments(key));
        url.query_pairs_mut()
            .append_pair(AS_OF_DATE_PARAM, &as_of_date.format("%Y-%m-%d").to_string())
            .append_pair(CHUNK_PARAM, if self.chunk { "true" } else { "false" });
        Ok(url)
    }

    /// Run one subscription until it stops or fails.
    pub async fn run(
        &self,
        key: SubscriptionKey,
        as_of_date: NaiveDate,
        metrics: &MetricsHandle,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        let url = self.stream_url(&key, as_of_date)?;
        tracing::info!(as_of = %as_of_date, chunk = self.chunk, "Subscription start");

        let request = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!("Subscription cancelled before connection");
                return Ok(());
            }
            result = request => result.map_err(ConsumerError::Connect)?,
        };

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), "Unexpected HTTP status, expected 200");
            return Err(ConsumerError::Status(status.as_u16()));
        }
        tracing::info!("Connected (headers received)");

        let correlation_id = match response
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            Some(id) => {
                tracing::info!(correlation_id = id, "Using producer correlation id");
                id.to_string()
            }
            None => {
                let id = Uuid::new_v4().simple().to_string();
                tracing::warn!(correlation_id = %id, "No {} header; generated a local id", CORRELATION_HEADER);
                id
            }
        };
        metrics.update(|m| m.correlation_id = Some(correlation_id.clone()));

        let session = LoadSession {
            key,
            as_of_date,
            correlation_id,
        };
        let body = response.bytes_stream().map(|item| item.map_err(ReadFailure::from));

        SessionDriver::new(&self.loader, session, metrics)
            .drive(body, cancel)
            .await
    }
}

/// Subscription state machine over one response body.
pub struct SessionDriver<'a> {
    loader: &'a InboundLoader,
    session: LoadSession,
    metrics: &'a MetricsHandle,
    state: SubscriptionState,
    snapshot: Vec<String>,
}

impl<'a> SessionDriver<'a> {
    pub fn new(loader: &'a InboundLoader, session: LoadSession, metrics: &'a MetricsHandle) -> Self {
        Self {
            loader,
            session,
            metrics,
            state: SubscriptionState::InitialPaint,
            snapshot: Vec::new(),
        }
    }

    /// Consume the body, processing frames strictly in order.
    pub async fn drive<S>(mut self, body: S, cancel: &CancellationToken) -> Result<(), ConsumerError>
    where
        S: Stream<Item = Result<Bytes, ReadFailure>>,
    {
        self.metrics.set_state(SubscriptionState::InitialPaint);
        let mut body = std::pin::pin!(body);
        let mut reassembler = FrameReassembler::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Subscription cancelled");
                    return Ok(());
                }
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(failure)) if failure.teardown => {
                    tracing::info!(reason = %failure.message, "Connection closed by producer");
                    return Ok(());
                }
                Some(Err(failure)) => {
                    tracing::error!(error = %failure.message, "Stream read failed");
                    return Err(ConsumerError::Read(failure.message));
                }
                None => {
                    tracing::info!("Stream ended");
                    return Ok(());
                }
            };

            reassembler.push(&chunk);
            while let Some(frame) = reassembler.next_frame() {
                if self.handle(frame, cancel).await?.is_break() {
                    tracing::info!("Subscription cancelled during load");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(
        &mut self,
        frame: StreamFrame,
        cancel: &CancellationToken,
    ) -> Result<ControlFlow<()>, ConsumerError> {
        self.metrics.update(|m| m.last_message_at = Some(Utc::now()));

        match (frame, self.state) {
            (StreamFrame::Heartbeat, SubscriptionState::InitialPaint) => {
                let batch = std::mem::take(&mut self.snapshot);
                tracing::info!(rows = batch.len(), "Snapshot end marker, loading initial batch");
                let loaded = self.loader.load_snapshot(&self.session, &batch);
                if cancellable(loaded, cancel).await?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }

                self.state = SubscriptionState::Intraday;
                self.metrics.set_state(SubscriptionState::Intraday);
                tracing::info!("InitialPaint complete, entering Intraday");
            }
            (StreamFrame::Heartbeat, _) => {
                self.metrics.update(|m| m.heartbeats += 1);
                tracing::debug!("Heartbeat received");
            }
            (StreamFrame::Data(text), SubscriptionState::InitialPaint) => {
                self.snapshot.push(text);
                let mut count = 0;
                self.metrics.update(|m| {
                    m.initial_paint_objects += 1;
                    count = m.initial_paint_objects;
                });
                if count % SNAPSHOT_PROGRESS_EVERY == 0 {
                    tracing::info!(count, "InitialPaint records received so far");
                }
            }
            (StreamFrame::Data(text), SubscriptionState::Intraday) => {
                let loaded = self.loader.load_increment(&self.session, &text);
                if cancellable(loaded, cancel).await?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }

                let mut count = 0;
                self.metrics.update(|m| {
                    m.intraday_objects += 1;
                    count = m.intraday_objects;
                });
                if count % INTRADAY_PROGRESS_EVERY == 0 {
                    tracing::info!(count, "Intraday records loaded so far");
                }
            }
            (StreamFrame::Data(_), state) => {
                tracing::debug!(?state, "Ignoring record");
            }
        }

        Ok(ControlFlow::Continue(()))
    }
}

/// Await a load unless the subscription is cancelled first.
async fn cancellable<T>(
    load: impl std::future::Future<Output = Result<T, LoadError>>,
    cancel: &CancellationToken,
) -> Result<ControlFlow<()>, ConsumerError> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(ControlFlow::Break(())),
        result = load => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Load failed");
            }
            result.map(|_| ControlFlow::Continue(())).map_err(ConsumerError::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SubscriptionMetrics;
    use crate::store::MemoryInboundStore;
    use playground_protocol::EntityType;

    fn session() -> LoadSession {
        LoadSession {
            key: SubscriptionKey::new(EntityType::Accounts, "ACC1"),
            as_of_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            correlation_id: "sess-1".to_string(),
        }
    }

    fn setup() -> (MemoryInboundStore, InboundLoader, MetricsHandle) {
        let store = MemoryInboundStore::with_columns(MemoryInboundStore::playground_columns());
        let loader = InboundLoader::new(Arc::new(store.clone()));
        let (metrics, _rx) = MetricsHandle::new(SubscriptionMetrics::starting());
        (store, loader, metrics)
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, ReadFailure>> {
        let items: Vec<_> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        futures::stream::iter(items)
    }

    #[tokio::test]
    async fn test_phase_transition_counts() {
        let (store, loader, metrics) = setup();
        let body = chunks(&[
            r#"{"ACCOUNT":"ACC1","N":1}{"ACCOUNT":"ACC1","N":2}"#,
            r#"{"ACCOUNT":"ACC1","N":3}{}"#,
            r#"{"ACCOUNT":"ACC1","N":4}{"ACCOUNT":"ACC2","#,
            r#""N":5}{}"#,
        ]);

        let result = SessionDriver::new(&loader, session(), &metrics)
            .drive(body, &CancellationToken::new())
            .await;
        assert!(result.is_ok());

        let m = metrics.snapshot();
        assert_eq!(m.initial_paint_objects, 3);
        assert_eq!(m.intraday_objects, 2);
        assert_eq!(m.heartbeats, 1);
        assert_eq!(m.state, SubscriptionState::Intraday);
        assert!(m.last_message_at.is_some());

        let merges = store.merges().await;
        assert_eq!(merges.len(), 3);
        assert!(!merges[0].is_intraday);
        assert_eq!(merges[2].account.as_deref(), Some("ACC2"));
        assert_eq!(store.rows().await.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_snapshot_loads_once_and_enters_intraday() {
        let (store, loader, metrics) = setup();
        let body = chunks(&["{}", "{}", "{}"]);

        SessionDriver::new(&loader, session(), &metrics)
            .drive(body, &CancellationToken::new())
            .await
            .unwrap();

        let m = metrics.snapshot();
        assert_eq!(m.initial_paint_objects, 0);
        assert_eq!(m.heartbeats, 2);
        assert_eq!(m.state, SubscriptionState::Intraday);
        assert_eq!(store.merges().await.len(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_ends_run_and_discards_rest() {
        let (store, loader, metrics) = setup();
        store.fail_after(2, "merge rejected").await;
        let body = chunks(&[
            r#"{"ACCOUNT":"ACC1"}{}"#,
            r#"{"ACCOUNT":"ACC1","N":1}"#,
            r#"{"ACCOUNT":"ACC1","N":2}{"ACCOUNT":"ACC1","N":3}{}"#,
        ]);

        let result = SessionDriver::new(&loader, session(), &metrics)
            .drive(body, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ConsumerError::Load(LoadError::Store(ref m))) if m == "merge rejected"
        ));
        let m = metrics.snapshot();
        assert_eq!(m.intraday_objects, 1);
        assert_eq!(m.heartbeats, 0);
        assert_eq!(store.merges().await.len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_is_clean_stop() {
        let (_store, loader, metrics) = setup();
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"{\"A\":1}{}")),
            Err(ReadFailure::teardown("connection reset")),
        ]);

        let result = SessionDriver::new(&loader, session(), &metrics)
            .drive(body, &CancellationToken::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_read_fault_is_error() {
        let (_store, loader, metrics) = setup();
        let body = futures::stream::iter(vec![Err(ReadFailure::fault("timed out"))]);

        let result = SessionDriver::new(&loader, session(), &metrics)
            .drive(body, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ConsumerError::Read(ref m)) if m == "timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_stream() {
        let (_store, loader, metrics) = setup();
        let cancel = CancellationToken::new();
        let body = chunks(&[r#"{"A":1}"#]).chain(futures::stream::pending());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = SessionDriver::new(&loader, session(), &metrics)
            .drive(body, &cancel)
            .await;
        assert!(result.is_ok());
        assert_eq!(metrics.snapshot().initial_paint_objects, 1);
    }

    #[test]
    fn test_stream_url() {
        let store = MemoryInboundStore::default();
        let loader = Arc::new(InboundLoader::new(Arc::new(store)));
        let consumer =
            StreamConsumer::new(reqwest::Client::new(), "http://localhost:6066", true, loader).unwrap();

        let url = consumer
            .stream_url(
                &SubscriptionKey::new(EntityType::Groups, "EMEA RATES"),
                NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:6066/trading-solutions/positions/groups/EMEA%20RATES/subscriptions?as_of_date=2024-01-05&chunk=true"
        );
    }

    /// Producer stand-in answering every request with `status`.
    async fn status_server(status: axum::http::StatusCode) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = axum::Router::new().fallback(move || async move { status });
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_run_rejects_non_success_status() {
        let base_url = status_server(axum::http::StatusCode::SERVICE_UNAVAILABLE).await;
        let (store, loader, metrics) = setup();
        let consumer =
            StreamConsumer::new(reqwest::Client::new(), &base_url, false, Arc::new(loader)).unwrap();

        let result = consumer
            .run(
                SubscriptionKey::new(EntityType::Accounts, "ACC1"),
                NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                &metrics,
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(err @ ConsumerError::Status(503)) => assert_eq!(err.to_string(), "HTTP 503"),
            other => panic!("expected HTTP 503, got {:?}", other),
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.state, SubscriptionState::Starting);
        assert!(snapshot.correlation_id.is_none());
        assert!(store.merges().await.is_empty());
    }

    #[test]
    fn test_stream_url_encodes_reserved_characters_in_name() {
        let loader = Arc::new(InboundLoader::new(Arc::new(MemoryInboundStore::default())));
        let consumer =
            StreamConsumer::new(reqwest::Client::new(), "http://localhost:6066", false, loader).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();

        let cases = [
            ("RATES#1", "RATES%231"),
            ("A?B", "A%3FB"),
            ("EQ/EMEA", "EQ%2FEMEA"),
            ("X%41", "X%2541"),
        ];
        for (name, encoded) in cases {
            let url = consumer
                .stream_url(&SubscriptionKey::new(EntityType::Groups, name), date)
                .unwrap();
            assert_eq!(
                url.path(),
                format!("/trading-solutions/positions/groups/{}/subscriptions", encoded),
                "{}",
                name
            );
            assert_eq!(url.query(), Some("as_of_date=2024-01-05&chunk=false"), "{}", name);
            assert_eq!(url.fragment(), None, "{}", name);

            let segments: Vec<_> = url.path_segments().unwrap().collect();
            assert_eq!(segments.len(), 5, "{}", name);
        }
    }

    #[test]
    fn test_stream_url_keeps_base_path_prefix() {
        let loader = Arc::new(InboundLoader::new(Arc::new(MemoryInboundStore::default())));
        let consumer =
            StreamConsumer::new(reqwest::Client::new(), "http://proxy:8080/feed/", false, loader).unwrap();

        let url = consumer
            .stream_url(
                &SubscriptionKey::new(EntityType::Accounts, "ACC1"),
                NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            )
            .unwrap();
        assert_eq!(url.path(), "/feed/trading-solutions/positions/accounts/ACC1/subscriptions");
    }

    #[test]
    fn test_invalid_base_url() {
        let loader = Arc::new(InboundLoader::new(Arc::new(MemoryInboundStore::default())));
        assert!(matches!(
            StreamConsumer::new(reqwest::Client::new(), "not a url", false, loader.clone()),
            Err(ConsumerError::Url(_))
        ));
        assert!(matches!(
            StreamConsumer::new(reqwest::Client::new(), "mailto:ops@example.com", false, loader),
            Err(ConsumerError::Url(_))
        ));
    }
}
