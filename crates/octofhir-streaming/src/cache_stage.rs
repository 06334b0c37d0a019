//! Stream cache integration: write-through on live runs, replay on hits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octofhir_cache::{CacheCursor, StreamCache, StreamCacheEntry};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::prepared::PreparedResource;
use crate::reporter::ErrorReporter;
use crate::source::ItemSource;
use crate::stage::Stage;

enum CacheCommand {
    Append(Value),
    Finish { complete: bool },
}

/// Handle on the background writer of a [`CacheWriteThrough`].
pub struct CacheWriteHandle(JoinHandle<()>);

impl CacheWriteHandle {
    /// Waits until every queued append has been applied.
    pub async fn wait(self) {
        if let Err(e) = self.0.await {
            tracing::warn!(error = %e, "Stream cache writer task failed");
        }
    }
}

/// Pass-through stage that appends every resource to a cache log.
///
/// Appends are queued to one background task, so they land in order and never
/// hold up the response. The task first claims the log; a run that loses the
/// claim to a concurrent writer is not cached. The queue is bounded by
/// `write_queue_capacity`: when it fills, the run stops caching and its log is
/// discarded. After a failed append the log is invalidated and the rest of the
/// run is not cached. A run that finishes normally gets an end marker; a
/// cancelled or failed run has its log invalidated.
pub struct CacheWriteThrough {
    tx: Option<mpsc::Sender<CacheCommand>>,
    token: CancellationToken,
}

impl CacheWriteThrough {
    pub fn new(
        cache: StreamCache,
        key: impl Into<String>,
        token: CancellationToken,
        reporter: Arc<dyn ErrorReporter>,
    ) -> (Self, CacheWriteHandle) {
        let key = key.into();
        let (tx, rx) = mpsc::channel(cache.config().write_queue_capacity);
        let handle = tokio::spawn(write_log(cache, key, rx, reporter));
        (
            Self {
                tx: Some(tx),
                token,
            },
            CacheWriteHandle(handle),
        )
    }

    fn send(&mut self, command: CacheCommand) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Stream cache write queue full, not caching this run");
                self.tx = None;
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Stream cache writer stopped early");
                self.tx = None;
            }
        }
    }
}

async fn write_log(
    cache: StreamCache,
    key: String,
    mut rx: mpsc::Receiver<CacheCommand>,
    reporter: Arc<dyn ErrorReporter>,
) {
    match cache.try_claim_writer(&key).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(key = %key, "Stream cache log has another writer, not caching this run");
            return;
        }
        Err(e) => {
            reporter.report("cache_write", &e);
            return;
        }
    }

    let mut failed = false;
    let mut finished = false;
    let mut written = 0usize;
    while let Some(command) = rx.recv().await {
        match command {
            CacheCommand::Append(_) if failed => {}
            CacheCommand::Append(payload) => match cache.try_write_entry(&key, &payload).await {
                Ok(_) => written += 1,
                Err(e) => {
                    reporter.report("cache_write", &e);
                    cache.invalidate(&key).await;
                    failed = true;
                }
            },
            CacheCommand::Finish { complete } => {
                finished = true;
                if failed {
                    break;
                }
                if !complete {
                    tracing::debug!(key = %key, written, "Discarding incomplete stream cache log");
                    cache.invalidate(&key).await;
                } else if let Err(e) = cache.write_end_marker(&key).await {
                    reporter.report("cache_write", &e);
                    cache.invalidate(&key).await;
                } else {
                    tracing::debug!(key = %key, written, "Stream cache log written");
                }
                break;
            }
        }
    }
    // The stage gave up on the queue before the run ended.
    if !finished && !failed {
        tracing::debug!(key = %key, written, "Discarding abandoned stream cache log");
        cache.invalidate(&key).await;
    }
    cache.release_writer(&key).await;
}

#[async_trait]
impl Stage for CacheWriteThrough {
    type In = PreparedResource;
    type Out = PreparedResource;

    async fn process(&mut self, item: PreparedResource) -> Vec<PreparedResource> {
        if self.token.is_cancelled() {
            return Vec::new();
        }
        self.send(CacheCommand::Append(item.body.clone()));
        vec![item]
    }

    async fn flush(&mut self) -> Vec<PreparedResource> {
        let complete = !self.token.is_cancelled();
        self.send(CacheCommand::Finish { complete });
        self.tx = None;
        Vec::new()
    }
}

/// Replays a cached log as a source of prepared resources.
///
/// Reads batches until the end marker. When the log has no marker yet and
/// nothing new is readable, waits up to `read_block` for the writer before
/// treating the log as finished.
pub struct CacheReplaySource {
    cache: StreamCache,
    key: String,
    cursor: CacheCursor,
    buffer: VecDeque<StreamCacheEntry>,
    done: bool,
    read_block: Duration,
    token: CancellationToken,
}

impl CacheReplaySource {
    pub fn new(cache: StreamCache, key: impl Into<String>, token: CancellationToken) -> Self {
        let read_block = cache.config().read_block();
        Self {
            cache,
            key: key.into(),
            cursor: CacheCursor::start(),
            buffer: VecDeque::new(),
            done: false,
            read_block,
            token,
        }
    }

    /// Resumes after a client-held cursor.
    pub fn with_cursor(mut self, cursor: CacheCursor) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> CacheCursor {
        self.cursor
    }
}

#[async_trait]
impl ItemSource for CacheReplaySource {
    type Item = PreparedResource;

    async fn pull(&mut self) -> Result<Option<PreparedResource>, PipelineError> {
        loop {
            if self.token.is_cancelled() {
                return Ok(None);
            }
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(PreparedResource::from_cached(entry.payload)));
            }
            if self.done {
                return Ok(None);
            }

            let batch = self.cache.read_entries(&self.key, &self.cursor).await?;
            self.cursor = batch.cursor;
            let got_entries = !batch.entries.is_empty();
            self.buffer.extend(batch.entries);
            if batch.complete {
                self.done = true;
                continue;
            }
            if got_entries || batch.has_more {
                continue;
            }

            let token = self.token.clone();
            let woke = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(None),
                woke = self.cache.wait_for_entries(&self.key, &self.cursor, self.read_block) => woke?,
            };
            if !woke {
                tracing::debug!(key = %self.key, "No end marker before read timeout, ending replay");
                self.done = true;
            }
        }
    }
}
