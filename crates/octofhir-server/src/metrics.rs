//! Prometheus metrics for the streaming server.
//!
//! Cache and pipeline crates record through the `metrics` facade; this module
//! installs the recorder and renders `/metrics`.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const STREAM_RESPONSES_TOTAL: &str = "stream_responses_total";
    pub const STREAM_ITEMS_EMITTED_TOTAL: &str = "stream_items_emitted_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics is served by the app itself.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };
    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status_class" => status_class
    )
    .increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record a finished streamed response.
///
/// `source` is `live` or `cache`; `completion` is the run's outcome label.
pub fn record_stream_response(
    operation: &'static str,
    source: &'static str,
    completion: &'static str,
    emitted: usize,
) {
    counter!(
        names::STREAM_RESPONSES_TOTAL,
        "operation" => operation,
        "source" => source,
        "completion" => completion
    )
    .increment(1);
    counter!(names::STREAM_ITEMS_EMITTED_TOTAL, "operation" => operation)
        .increment(emitted as u64);
}
