//! Cache configuration sections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades to the in-process backend without it)
    /// Default: false
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connect and command timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Make one explicit reconnect attempt when a health check fails.
    /// Default: false, so transient network errors degrade instead of retrying.
    #[serde(default)]
    pub reconnect_on_failure: bool,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            timeout_ms: default_redis_timeout_ms(),
            reconnect_on_failure: false,
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Resumable stream cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCacheConfig {
    /// TTL set on a log when its first entry is written
    #[serde(default = "default_stream_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum entries returned by one read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a reader waits for new entries on a log without an end marker
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,

    /// Serve matching requests from the cache
    #[serde(default)]
    pub read_enabled: bool,

    /// Populate the cache from live runs
    #[serde(default)]
    pub write_enabled: bool,

    /// Appends a live run may queue ahead of the cache writer before the
    /// run stops caching
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
}

fn default_stream_ttl_secs() -> u64 {
    3600
}

fn default_batch_size() -> usize {
    100
}

fn default_read_block_ms() -> u64 {
    1000
}

fn default_write_queue_capacity() -> usize {
    1024
}

impl Default for StreamCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_stream_ttl_secs(),
            batch_size: default_batch_size(),
            read_block_ms: default_read_block_ms(),
            read_enabled: false,
            write_enabled: false,
            write_queue_capacity: default_write_queue_capacity(),
        }
    }
}

impl StreamCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("stream_cache.ttl_secs must be > 0".into());
        }
        if self.batch_size == 0 {
            return Err("stream_cache.batch_size must be > 0".into());
        }
        if self.write_queue_capacity == 0 {
            return Err("stream_cache.write_queue_capacity must be > 0".into());
        }
        Ok(())
    }
}
