//! Drives one request: pulls from a source, pushes stage output to a sink.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::reporter::ErrorReporter;
use crate::source::ItemSource;
use crate::stage::Stage;
use crate::tracker::Tracker;

pub const STREAM_RUNS_TOTAL: &str = "stream_runs_total";
pub const STREAM_CHUNKS_TOTAL: &str = "stream_chunks_total";

/// The receiving end of the response closed.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("response sink closed")]
pub struct SinkClosed;

/// Where encoded chunks go. `send` may wait for backpressure.
#[async_trait]
pub trait ResponseSink: Send {
    /// # Errors
    ///
    /// Returns [`SinkClosed`] once the receiver is gone.
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;
}

/// Collects chunks in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub chunks: Vec<Bytes>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concatenated body, lossily decoded.
    pub fn body(&self) -> String {
        self.chunks
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk))
            .collect()
    }
}

#[async_trait]
impl ResponseSink for VecSink {
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.chunks.push(chunk);
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunCompletion {
    /// The source was exhausted.
    Finished,
    /// The token was raised, by the caller or by a closed sink.
    Cancelled,
    /// The source failed. Output already sent stays sent.
    SourceFailed(PipelineError),
}

impl RunCompletion {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::SourceFailed(_) => "source_failed",
        }
    }
}

/// Outcome of [`PipelineRunner::run`].
#[derive(Debug)]
pub struct RunReport {
    /// Ids of the resources emitted, in order.
    pub identifiers: Vec<String>,
    pub completion: RunCompletion,
    /// Chunks the sink accepted.
    pub chunks_sent: usize,
}

/// Runs one pipeline for one request.
///
/// Owns the request's [`Tracker`] and [`CancellationToken`]. Stages get
/// clones of both when they are built. Every stage is flushed exactly once.
/// Ids of items whose output never reached the sink are dropped from the
/// tracker.
/// A source failure is reported, raises the token so no closing framing is
/// written, and ends the run.
pub struct PipelineRunner {
    token: CancellationToken,
    tracker: Tracker,
    reporter: Arc<dyn ErrorReporter>,
    log_steps: bool,
}

impl PipelineRunner {
    pub fn new(token: CancellationToken, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            token,
            tracker: Tracker::new(),
            reporter,
            log_steps: false,
        }
    }

    pub fn with_step_logging(mut self, enabled: bool) -> Self {
        self.log_steps = enabled;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A handle on the run's tracker, for the identifier stage and metadata.
    pub fn tracker(&self) -> Tracker {
        self.tracker.clone()
    }

    pub async fn run<S, P, K>(self, mut source: S, mut pipeline: P, sink: &mut K) -> RunReport
    where
        S: ItemSource,
        P: Stage<In = S::Item, Out = Bytes>,
        K: ResponseSink + ?Sized,
    {
        let mut chunks_sent = 0usize;
        let completion = loop {
            if self.token.is_cancelled() {
                break RunCompletion::Cancelled;
            }
            match source.pull().await {
                Ok(Some(item)) => {
                    let tracked = self.tracker.len();
                    let chunks = pipeline.process(item).await;
                    if !self.push(sink, chunks, &mut chunks_sent).await {
                        self.tracker.truncate(tracked);
                        break RunCompletion::Cancelled;
                    }
                }
                Ok(None) if self.token.is_cancelled() => break RunCompletion::Cancelled,
                Ok(None) => break RunCompletion::Finished,
                Err(e) => {
                    self.reporter.report("source", &e);
                    self.token.cancel();
                    break RunCompletion::SourceFailed(e);
                }
            }
        };

        let tail = pipeline.flush().await;
        self.push(sink, tail, &mut chunks_sent).await;

        counter!(STREAM_RUNS_TOTAL, "completion" => completion.label()).increment(1);
        let identifiers = self.tracker.snapshot();
        tracing::debug!(
            completion = completion.label(),
            emitted = identifiers.len(),
            chunks_sent,
            "Pipeline run complete"
        );
        RunReport {
            identifiers,
            completion,
            chunks_sent,
        }
    }

    /// Pushes chunks until the token is raised. Returns `false` unless every
    /// chunk was delivered.
    async fn push<K>(&self, sink: &mut K, chunks: Vec<Bytes>, sent: &mut usize) -> bool
    where
        K: ResponseSink + ?Sized,
    {
        for chunk in chunks {
            if self.token.is_cancelled() {
                return false;
            }
            let len = chunk.len();
            if sink.send(chunk).await.is_err() {
                tracing::debug!("Response sink closed, cancelling run");
                self.token.cancel();
                return false;
            }
            *sent += 1;
            counter!(STREAM_CHUNKS_TOTAL).increment(1);
            if self.log_steps {
                tracing::info!(bytes = len, "Chunk written");
            } else {
                tracing::trace!(bytes = len, "Chunk written");
            }
        }
        true
    }
}
