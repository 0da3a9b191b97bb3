//! Stream producer.
//!
//! Turns a change source into an unbounded body of concatenated JSON
//! objects for one subscriber connection:
//!
//! 1. snapshot rows as data frames, in cursor order
//! 2. a burst of `{}` heartbeats marking the end of the snapshot (a single
//!    one when the snapshot is empty)
//! 3. without a correlation id: heartbeats forever, no polling
//! 4. otherwise: poll for increments, heartbeat when there are none
//!
//! Each write is its own body chunk. A closed body (client gone) ends the
//! stream quietly at any phase.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use playground_protocol::{SubscriptionKey, HEARTBEAT};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::StreamTiming;
use crate::source::{ChangeSource, Snapshot, SourceError};

/// Payloads shorter than this are never fragmented.
pub const MIN_FRAGMENT_LEN: usize = 8;

/// Chunks buffered between the producer task and the HTTP body.
const BODY_CHANNEL_CAPACITY: usize = 64;

/// Byte offset at which a fragmented payload of `len` bytes is cut.
///
/// 70% of the length, clamped so both halves are non-empty. `None` for
/// payloads shorter than [`MIN_FRAGMENT_LEN`].
pub fn fragment_cut(len: usize) -> Option<usize> {
    if len < MIN_FRAGMENT_LEN {
        return None;
    }
    Some((len * 7 / 10).clamp(1, len - 1))
}

/// An opened stream: the session id for the response header and the body.
pub struct OpenedStream {
    pub correlation_id: String,
    pub body: ReceiverStream<Bytes>,
}

/// Produces subscriber streams from a change source.
#[derive(Clone)]
pub struct StreamProducer {
    source: Arc<dyn ChangeSource>,
    timing: StreamTiming,
}

impl StreamProducer {
    pub fn new(source: Arc<dyn ChangeSource>, timing: StreamTiming) -> Self {
        Self { source, timing }
    }

    pub fn timing(&self) -> &StreamTiming {
        &self.timing
    }

    /// Read the snapshot and start emitting.
    ///
    /// The snapshot is read before anything is returned so the caller can
    /// put the session's correlation id in the response header. Sessions
    /// without snapshot rows get a fresh id and stay heartbeat-only.
    pub async fn open(
        &self,
        key: SubscriptionKey,
        as_of_date: NaiveDate,
        chunk: bool,
    ) -> Result<OpenedStream, SourceError> {
        let snapshot = self.source.fetch_snapshot(&key, as_of_date).await?;
        let correlation_id = snapshot
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let span = tracing::info_span!(
            "stream",
            key = %key,
            as_of = %as_of_date,
            correlation_id = %correlation_id,
        );
        let session = StreamSession {
            writer: FrameWriter::new(tx, chunk, &self.timing),
            source: Arc::clone(&self.source),
            timing: self.timing.clone(),
            key,
            as_of_date,
        };

        tracing::info!(parent: &span, chunk, rows = snapshot.payloads.len(), "Stream start");
        tokio::spawn(session.run(snapshot).instrument(span));

        Ok(OpenedStream {
            correlation_id,
            body: ReceiverStream::new(rx),
        })
    }
}

/// Why an emitting session stopped.
#[derive(Debug)]
enum StreamEnd {
    ClientGone,
    Source(SourceError),
}

#[derive(Debug, PartialEq, Eq)]
struct ClientGone;

impl From<ClientGone> for StreamEnd {
    fn from(_: ClientGone) -> Self {
        StreamEnd::ClientGone
    }
}

impl From<SourceError> for StreamEnd {
    fn from(e: SourceError) -> Self {
        StreamEnd::Source(e)
    }
}

/// Writes frames into the response body.
struct FrameWriter {
    tx: mpsc::Sender<Bytes>,
    fragment: bool,
    fragment_probability: f64,
    fragment_delay: Duration,
}

impl FrameWriter {
    fn new(tx: mpsc::Sender<Bytes>, fragment: bool, timing: &StreamTiming) -> Self {
        Self {
            tx,
            fragment,
            fragment_probability: timing.fragment_probability,
            fragment_delay: timing.fragment_delay(),
        }
    }

    /// Write one data frame, possibly as two sub-writes.
    async fn write(&self, payload: &str) -> Result<(), ClientGone> {
        if payload.is_empty() {
            return Ok(());
        }

        match self.split_point(payload.len()) {
            Some(cut) => {
                let bytes = Bytes::copy_from_slice(payload.as_bytes());
                self.send(bytes.slice(..cut)).await?;
                self.pause(self.fragment_delay).await?;
                self.send(bytes.slice(cut..)).await
            }
            None => self.send(Bytes::copy_from_slice(payload.as_bytes())).await,
        }
    }

    async fn heartbeat(&self) -> Result<(), ClientGone> {
        self.send(Bytes::from_static(HEARTBEAT.as_bytes())).await
    }

    /// Sleep, returning early if the client goes away.
    async fn pause(&self, duration: Duration) -> Result<(), ClientGone> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.tx.closed() => Err(ClientGone),
        }
    }

    fn split_point(&self, len: usize) -> Option<usize> {
        let cut = fragment_cut(len).filter(|_| self.fragment)?;
        rand::thread_rng()
            .gen_bool(self.fragment_probability)
            .then_some(cut)
    }

    async fn send(&self, chunk: Bytes) -> Result<(), ClientGone> {
        self.tx.send(chunk).await.map_err(|_| ClientGone)
    }
}

/// One subscriber connection being served.
struct StreamSession {
    writer: FrameWriter,
    source: Arc<dyn ChangeSource>,
    timing: StreamTiming,
    key: SubscriptionKey,
    as_of_date: NaiveDate,
}

impl StreamSession {
    async fn run(self, snapshot: Snapshot) {
        match self.emit(snapshot).await {
            Ok(()) | Err(StreamEnd::ClientGone) => {
                tracing::info!("Stream end (client disconnected)");
            }
            Err(StreamEnd::Source(e)) => {
                tracing::error!(error = %e, "Increment read failed; closing stream");
            }
        }
    }

    async fn emit(&self, snapshot: Snapshot) -> Result<(), StreamEnd> {
        if snapshot.is_empty() {
            tracing::info!("Snapshot: 0 rows, sending keep-alive {{}}");
            self.writer.heartbeat().await?;
        } else {
            for payload in &snapshot.payloads {
                self.writer.write(payload).await?;
            }
            tracing::info!(
                rows = snapshot.payloads.len(),
                markers = self.timing.snapshot_end_heartbeats,
                "Snapshot complete, emitting end markers"
            );
            for _ in 0..self.timing.snapshot_end_heartbeats {
                self.writer.heartbeat().await?;
                self.writer.pause(self.timing.snapshot_end_delay()).await?;
            }
        }

        let Some(correlation_id) = snapshot.correlation_id else {
            tracing::info!("No correlation id from snapshot; heartbeats only until disconnect");
            loop {
                self.writer.heartbeat().await?;
                self.writer
                    .pause(self.timing.idle_heartbeat_interval())
                    .await?;
            }
        };

        let mut last_cursor = snapshot.last_cursor;
        tracing::info!(last_cursor, "Steady state, polling for increments");

        loop {
            let rows = self
                .source
                .fetch_increment(&self.key, self.as_of_date, &correlation_id, last_cursor)
                .await?;

            if rows.is_empty() {
                tracing::debug!("No increments, sending heartbeat");
                self.writer.heartbeat().await?;
                self.writer
                    .pause(self.timing.idle_heartbeat_interval())
                    .await?;
                continue;
            }

            tracing::info!(count = rows.len(), "Sending increments");
            for row in rows {
                if row.cursor <= last_cursor {
                    tracing::warn!(cursor = row.cursor, last_cursor, "Skipping non-increasing cursor");
                    continue;
                }
                last_cursor = row.cursor;
                self.writer.write(&row.payload).await?;
            }
            self.writer
                .pause(self.timing.increment_poll_interval())
                .await?;
        }
    }
}
