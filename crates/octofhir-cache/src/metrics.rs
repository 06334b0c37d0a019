//! Cache counters. The server installs the Prometheus recorder; without one
//! these calls are no-ops.

use metrics::counter;

pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const STREAM_CACHE_ENTRIES_WRITTEN_TOTAL: &str = "stream_cache_entries_written_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
}

/// Record a cache hit for `cache` (`kv` or `stream`).
pub fn record_cache_hit(cache: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "cache" => cache).increment(1);
}

/// Record a cache miss for `cache`.
pub fn record_cache_miss(cache: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "cache" => cache).increment(1);
}

/// Record a swallowed backend error.
pub fn record_cache_error(operation: &'static str) {
    counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_stream_entry_written() {
    counter!(names::STREAM_CACHE_ENTRIES_WRITTEN_TOTAL).increment(1);
}

pub fn record_invalidation(count: usize) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL).increment(count as u64);
}
