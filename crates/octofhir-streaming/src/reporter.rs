//! Sink for non-fatal errors absorbed by the pipeline.

use std::error::Error;

use metrics::counter;

pub const STREAM_ERRORS_TOTAL: &str = "stream_errors_total";

/// Receives errors a stage recovered from (dropped records, inline error
/// entries, cache failures, source failures).
pub trait ErrorReporter: Send + Sync {
    fn report(&self, stage: &'static str, error: &(dyn Error + Send + Sync));
}

/// Logs at `error` and counts `stream_errors_total{stage}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, stage: &'static str, error: &(dyn Error + Send + Sync)) {
        tracing::error!(stage, error = %error, "Stream error");
        counter!(STREAM_ERRORS_TOTAL, "stage" => stage).increment(1);
    }
}
