//! Whole-payload cache with TTL.
//!
//! Backend errors are logged and treated as misses; nothing here fails a
//! request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::{Backend, ConnectionManager};
use crate::error::CacheResult;
use crate::metrics;

const CACHE_NAME: &str = "kv";

/// Get/set/delete of whole payloads on the shared connection.
#[derive(Clone)]
pub struct KeyValueCache {
    conn: Arc<ConnectionManager>,
    default_ttl: Duration,
}

impl KeyValueCache {
    pub fn new(conn: Arc<ConnectionManager>, default_ttl: Duration) -> Self {
        Self { conn, default_ttl }
    }

    /// Fetches raw bytes. Returns `None` on a miss or a backend error.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let result = match self.conn.backend() {
            Backend::Local(store) => Ok(store.get(key)),
            Backend::Redis(_) => self
                .conn
                .query::<Option<Vec<u8>>>(redis::cmd("GET").arg(key))
                .await
                .map(|data| data.map(Arc::new)),
        };

        match result {
            Ok(Some(data)) => {
                tracing::debug!(key = %key, "cache hit");
                metrics::record_cache_hit(CACHE_NAME);
                Some(data)
            }
            Ok(None) => {
                tracing::debug!(key = %key, "cache miss");
                metrics::record_cache_miss(CACHE_NAME);
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache GET error");
                metrics::record_cache_error("get");
                metrics::record_cache_miss(CACHE_NAME);
                None
            }
        }
    }

    /// Stores raw bytes with `ttl`, or the default TTL.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        if let Err(e) = self.try_set(key, value, ttl).await {
            tracing::warn!(key = %key, error = %e, "Cache SET error");
            metrics::record_cache_error("set");
        }
    }

    /// Like [`set`](Self::set) but reports backend errors.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn try_set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        match self.conn.backend() {
            Backend::Local(store) => {
                store.set(key, value, ttl);
                Ok(())
            }
            Backend::Redis(_) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                let _: () = self
                    .conn
                    .query(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis))
                    .await?;
                tracing::debug!(key = %key, ttl_ms = millis, "cache set");
                Ok(())
            }
        }
    }

    /// Deletes a key. Returns `true` if it existed.
    pub async fn delete(&self, key: &str) -> bool {
        let result = match self.conn.backend() {
            Backend::Local(store) => Ok(store.delete(key)),
            Backend::Redis(_) => self
                .conn
                .query::<u64>(redis::cmd("DEL").arg(key))
                .await
                .map(|n| n > 0),
        };
        match result {
            Ok(removed) => {
                tracing::debug!(key = %key, removed, "cache invalidated");
                removed
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache DEL error");
                metrics::record_cache_error("delete");
                false
            }
        }
    }

    /// Fetches and deserializes a JSON payload. A payload that fails to
    /// deserialize is deleted and reported as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.get(key).await?;
        match serde_json::from_slice::<T>(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to deserialize cached payload");
                self.delete(key).await;
                None
            }
        }
    }

    /// Serializes `value` as JSON and stores it.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_vec(value) {
            Ok(data) => self.set(key, data, ttl).await,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to serialize payload for cache");
            }
        }
    }
}
