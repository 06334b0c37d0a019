//! Resumable append-only cache of prepared resources, one log per key.
//!
//! On Redis each log is a stream: entries are appended with `XADD` and read
//! with exclusive `XRANGE`, so a reader resumes from the last id it saw.
//! Delivery is at-least-once: a reader whose cursor was lost re-reads entries
//! and must treat them as overwrites.
//!
//! A live run that finishes normally appends an end marker. Readers stop on
//! the marker; without one they wait a bounded time for new entries.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::config::StreamCacheConfig;
use crate::connection::{Backend, ConnectionManager};
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use crate::local::RawEntry;
use crate::metrics;
use crate::sequence::{CacheCursor, SequenceId};

/// Field holding the serialized resource of a regular entry.
pub const PAYLOAD_FIELD: &str = "resource";
/// Field marking the end of a completely written log.
pub const END_MARKER_FIELD: &str = "eof";
/// Prefix of the key a writer holds while it fills a log.
pub const WRITER_LOCK_PREFIX: &str = "lock:";

const CACHE_NAME: &str = "stream";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One cached resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamCacheEntry {
    pub sequence_id: SequenceId,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
}

impl StreamCacheEntry {
    fn from_raw(raw: &RawEntry) -> CacheResult<Option<Self>> {
        if raw.field(END_MARKER_FIELD).is_some() {
            return Ok(None);
        }
        let payload = raw.field(PAYLOAD_FIELD).ok_or_else(|| {
            CacheError::MalformedReply(format!("entry {} has no {PAYLOAD_FIELD} field", raw.id))
        })?;
        Ok(Some(Self {
            sequence_id: raw.id,
            payload: serde_json::from_str(payload)?,
            written_at: written_at(raw.id),
        }))
    }
}

/// Ids carry their append time in milliseconds.
fn written_at(id: SequenceId) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(id.millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Result of one read call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBatch {
    /// Entries after the request cursor, oldest first. Never contains the end marker.
    pub entries: Vec<StreamCacheEntry>,
    /// More entries exist beyond the last one returned.
    pub has_more: bool,
    /// Cursor to pass to the next read.
    pub cursor: CacheCursor,
    /// The end marker was reached; the log will not grow.
    pub complete: bool,
}

/// Log introspection for admin tooling.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMetadata {
    /// Number of cached resources, excluding the end marker.
    pub length: usize,
    pub first_entry: Option<StreamCacheEntry>,
    pub last_entry: Option<StreamCacheEntry>,
    /// Remaining lifetime, if the log expires.
    pub ttl_secs: Option<u64>,
    pub complete: bool,
}

/// Resumable per-key logs on the shared connection.
#[derive(Clone)]
pub struct StreamCache {
    conn: Arc<ConnectionManager>,
    config: StreamCacheConfig,
}

impl StreamCache {
    pub fn new(conn: Arc<ConnectionManager>, config: StreamCacheConfig) -> Self {
        Self { conn, config }
    }

    pub fn config(&self) -> &StreamCacheConfig {
        &self.config
    }

    /// Existence check used for the hit/miss decision. Errors count as a miss.
    pub async fn has_cached_stream(&self, key: &str) -> bool {
        match self.exists(key).await {
            Ok(true) => {
                metrics::record_cache_hit(CACHE_NAME);
                true
            }
            Ok(false) => {
                metrics::record_cache_miss(CACHE_NAME);
                false
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Stream cache EXISTS error");
                metrics::record_cache_error("exists");
                metrics::record_cache_miss(CACHE_NAME);
                false
            }
        }
    }

    /// Appends one resource. Failures are logged and swallowed.
    pub async fn write_entry(&self, key: &str, payload: &Value) {
        if let Err(e) = self.try_write_entry(key, payload).await {
            tracing::warn!(key = %key, error = %e, "Stream cache write failed");
            metrics::record_cache_error("append");
        }
    }

    /// Appends one resource and returns its sequence id. The first write to a
    /// fresh key sets the log TTL.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn try_write_entry(&self, key: &str, payload: &Value) -> CacheResult<SequenceId> {
        let json = serde_json::to_string(payload)?;
        let id = self.append(key, PAYLOAD_FIELD, json).await?;
        metrics::record_stream_entry_written();
        tracing::trace!(key = %key, sequence_id = %id, "Stream cache entry written");
        Ok(id)
    }

    /// Appends the end marker, closing the log for readers.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn write_end_marker(&self, key: &str) -> CacheResult<SequenceId> {
        let id = self.append(key, END_MARKER_FIELD, "1".to_string()).await?;
        tracing::debug!(key = %key, sequence_id = %id, "Stream cache log completed");
        Ok(id)
    }

    async fn append(&self, key: &str, field: &str, value: String) -> CacheResult<SequenceId> {
        match self.conn.backend() {
            Backend::Local(store) => {
                Ok(store.append(key, vec![(field.to_string(), value)], self.config.ttl()))
            }
            Backend::Redis(_) => {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .cmd("XADD")
                    .arg(key)
                    .arg("*")
                    .arg(field)
                    .arg(value)
                    .cmd("EXPIRE")
                    .arg(key)
                    .arg(self.config.ttl_secs)
                    .arg("NX")
                    .ignore();
                let (id,): (String,) = self.conn.query_pipeline(&pipe).await?;
                id.parse()
            }
        }
    }

    /// Claims the right to fill the log at `key`.
    ///
    /// Returns `false` if another writer holds the claim or the log already
    /// exists. A claim lapses after the log TTL if it is never released.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn try_claim_writer(&self, key: &str) -> CacheResult<bool> {
        let lock = writer_lock(key);
        let ttl = self.config.ttl();
        let claimed = match self.conn.backend() {
            Backend::Local(store) => store.set_if_absent(&lock, b"1".to_vec(), ttl),
            Backend::Redis(_) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                let reply: Option<String> = self
                    .conn
                    .query(redis::cmd("SET").arg(&lock).arg(1).arg("NX").arg("PX").arg(millis))
                    .await?;
                reply.is_some()
            }
        };
        if !claimed {
            return Ok(false);
        }
        if self.exists(key).await? {
            self.release_writer(key).await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Releases a claim taken with [`try_claim_writer`](Self::try_claim_writer).
    pub async fn release_writer(&self, key: &str) {
        let lock = writer_lock(key);
        let result = match self.conn.backend() {
            Backend::Local(store) => {
                store.delete(&lock);
                Ok(())
            }
            Backend::Redis(_) => self.conn.query::<u64>(redis::cmd("DEL").arg(&lock)).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "Stream cache writer release failed");
            metrics::record_cache_error("release");
        }
    }

    /// Reads entries after `cursor`, up to the configured batch size.
    ///
    /// `has_more` compares the last entry in the log against the last entry
    /// returned. Callers loop with the returned cursor until it is `false`.
    ///
    /// # Errors
    ///
    /// Returns any backend error, or `CacheError::MissingLog` if the log does
    /// not exist. A log can be invalidated mid-read; callers treat that as a miss.
    pub async fn read_entries(&self, key: &str, cursor: &CacheCursor) -> CacheResult<ReadBatch> {
        let raw = self
            .range_after(key, cursor.last_seen, self.config.batch_size)
            .await?
            .ok_or_else(|| CacheError::MissingLog(key.to_string()))?;

        let Some(last_returned) = raw.last().map(|entry| entry.id) else {
            return Ok(ReadBatch {
                entries: Vec::new(),
                has_more: false,
                cursor: *cursor,
                complete: false,
            });
        };

        let mut entries = Vec::with_capacity(raw.len());
        let mut complete = false;
        for entry in &raw {
            match StreamCacheEntry::from_raw(entry)? {
                Some(entry) => entries.push(entry),
                None => {
                    complete = true;
                    break;
                }
            }
        }

        let has_more = if complete {
            false
        } else {
            self.last_raw(key, 1)
                .await?
                .first()
                .is_some_and(|last| last.id > last_returned)
        };

        Ok(ReadBatch {
            entries,
            has_more,
            cursor: CacheCursor::after(last_returned),
            complete,
        })
    }

    /// Waits up to `timeout` for an entry newer than `cursor`.
    ///
    /// Returns `false` on timeout or if the log disappeared. Redis is polled
    /// rather than blocked on, since the connection is shared.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn wait_for_entries(
        &self,
        key: &str,
        cursor: &CacheCursor,
        timeout: Duration,
    ) -> CacheResult<bool> {
        match self.conn.backend() {
            Backend::Local(store) => Ok(store.wait_for_append(key, cursor.last_seen, timeout).await),
            Backend::Redis(_) => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    match self.last_raw(key, 1).await?.first() {
                        Some(last) if last.id > cursor.last_seen => return Ok(true),
                        Some(_) => {}
                        None => return Ok(false),
                    }
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
                }
            }
        }
    }

    /// Deletes a log. Failures are logged and swallowed.
    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.try_invalidate(key).await {
            tracing::warn!(key = %key, error = %e, "Stream cache invalidation failed");
            metrics::record_cache_error("invalidate");
        }
    }

    /// Deletes any key. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn try_invalidate(&self, key: &str) -> CacheResult<bool> {
        let removed = match self.conn.backend() {
            Backend::Local(store) => store.delete(key),
            Backend::Redis(_) => self.conn.query::<u64>(redis::cmd("DEL").arg(key)).await? > 0,
        };
        if removed {
            metrics::record_invalidation(1);
            tracing::debug!(key = %key, "Stream cache log invalidated");
        }
        Ok(removed)
    }

    /// Length, first and last entries, and TTL of a log. `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn metadata(&self, key: &str) -> CacheResult<Option<StreamMetadata>> {
        let (raw_len, ttl) = match self.conn.backend() {
            Backend::Local(store) => match store.stream_len(key) {
                Some(len) => (len, store.ttl(key)),
                None => return Ok(None),
            },
            Backend::Redis(_) => {
                if !self.exists(key).await? {
                    return Ok(None);
                }
                let len: usize = self.conn.query(redis::cmd("XLEN").arg(key)).await?;
                let ttl: i64 = self.conn.query(redis::cmd("TTL").arg(key)).await?;
                let ttl = u64::try_from(ttl).ok().map(Duration::from_secs);
                (len, ttl)
            }
        };

        let first = self.range_after(key, SequenceId::ZERO, 1).await?.unwrap_or_default();
        let last = self.last_raw(key, 2).await?;
        let complete = last
            .first()
            .is_some_and(|entry| entry.field(END_MARKER_FIELD).is_some());

        let first_entry = match first.first() {
            Some(raw) => StreamCacheEntry::from_raw(raw)?,
            None => None,
        };
        let mut last_entry = None;
        for raw in &last {
            if let Some(entry) = StreamCacheEntry::from_raw(raw)? {
                last_entry = Some(entry);
                break;
            }
        }

        Ok(Some(StreamMetadata {
            length: raw_len - usize::from(complete),
            first_entry,
            last_entry,
            ttl_secs: ttl.map(|d| d.as_secs()),
            complete,
        }))
    }

    /// Keys of either cache starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn list_keys(&self, prefix: &str) -> CacheResult<Vec<String>> {
        match self.conn.backend() {
            Backend::Local(store) => Ok(store.keys(prefix)),
            Backend::Redis(_) => {
                let pattern = format!("{}*", escape_glob(prefix));
                let mut cursor: u64 = 0;
                let mut keys = Vec::new();
                loop {
                    let (next, batch): (u64, Vec<String>) = self
                        .conn
                        .query(
                            redis::cmd("SCAN")
                                .arg(cursor)
                                .arg("MATCH")
                                .arg(&pattern)
                                .arg("COUNT")
                                .arg(100),
                        )
                        .await?;
                    keys.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                keys.sort();
                keys.dedup();
                Ok(keys)
            }
        }
    }

    /// Deletes every key in `keys`, returning how many existed.
    pub async fn invalidate_many<K: AsRef<str>>(&self, keys: &[K]) -> usize {
        let mut removed = 0;
        for key in keys {
            match self.try_invalidate(key.as_ref()).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %key.as_ref(), error = %e, "Cache invalidation failed");
                    metrics::record_cache_error("invalidate");
                }
            }
        }
        removed
    }

    /// Deletes every cache key derived from one resource: its whole-bundle
    /// keys and every per-query log whose parameters name its id.
    ///
    /// # Errors
    ///
    /// Returns any backend error raised while listing keys.
    pub async fn invalidate_resource(&self, resource_type: &str, id: &str) -> CacheResult<usize> {
        let mut keys = self
            .list_keys(&CacheKey::scoped_prefix(resource_type, id))
            .await?;
        keys.extend(
            self.list_keys(&CacheKey::everything_prefix(resource_type))
                .await?
                .into_iter()
                .filter(|key| CacheKey::has_id_param(key, id)),
        );
        let removed = self.invalidate_many(&keys).await;
        tracing::info!(
            resource_type = %resource_type,
            id = %id,
            removed,
            "Invalidated cache entries for resource"
        );
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        match self.conn.backend() {
            Backend::Local(store) => Ok(store.exists(key)),
            Backend::Redis(_) => {
                let n: u64 = self.conn.query(redis::cmd("EXISTS").arg(key)).await?;
                Ok(n > 0)
            }
        }
    }

    /// Raw entries strictly after `after`. `None` if the log does not exist.
    async fn range_after(
        &self,
        key: &str,
        after: SequenceId,
        count: usize,
    ) -> CacheResult<Option<Vec<RawEntry>>> {
        match self.conn.backend() {
            Backend::Local(store) => Ok(store.range_after(key, after, count)),
            Backend::Redis(_) => {
                let start = if after == SequenceId::ZERO {
                    "-".to_string()
                } else {
                    format!("({after}")
                };
                let reply: Vec<(String, Vec<String>)> = self
                    .conn
                    .query(
                        redis::cmd("XRANGE")
                            .arg(key)
                            .arg(start)
                            .arg("+")
                            .arg("COUNT")
                            .arg(count),
                    )
                    .await?;
                if reply.is_empty() && !self.exists(key).await? {
                    return Ok(None);
                }
                reply.into_iter().map(parse_entry).collect::<CacheResult<Vec<_>>>().map(Some)
            }
        }
    }

    /// The newest `count` raw entries, newest first.
    async fn last_raw(&self, key: &str, count: usize) -> CacheResult<Vec<RawEntry>> {
        match self.conn.backend() {
            Backend::Local(store) => Ok(store.last_entries(key, count)),
            Backend::Redis(_) => {
                let reply: Vec<(String, Vec<String>)> = self
                    .conn
                    .query(
                        redis::cmd("XREVRANGE")
                            .arg(key)
                            .arg("+")
                            .arg("-")
                            .arg("COUNT")
                            .arg(count),
                    )
                    .await?;
                reply.into_iter().map(parse_entry).collect()
            }
        }
    }
}

fn writer_lock(key: &str) -> String {
    format!("{WRITER_LOCK_PREFIX}{key}")
}

fn parse_entry((id, flat): (String, Vec<String>)) -> CacheResult<RawEntry> {
    if flat.len() % 2 != 0 {
        return Err(CacheError::MalformedReply(format!(
            "entry {id} has an odd number of field values"
        )));
    }
    let mut fields = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        fields.push((field, value));
    }
    Ok(RawEntry {
        id: id.parse()?,
        fields,
    })
}

/// Escapes Redis glob metacharacters; scope-bearing keys contain `*`.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_with_batch(batch_size: usize) -> StreamCache {
        StreamCache::new(
            Arc::new(ConnectionManager::local()),
            StreamCacheConfig {
                batch_size,
                read_block_ms: 50,
                ..StreamCacheConfig::default()
            },
        )
    }

    fn resource(i: usize) -> Value {
        json!({"resourceType": "Observation", "id": format!("o{i}")})
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(
            escape_glob("Patient:1::Scopes:access/*.*"),
            "Patient:1::Scopes:access/\\*.\\*"
        );
    }

    #[test]
    fn test_parse_entry() {
        let raw = parse_entry((
            "10-2".to_string(),
            vec!["resource".to_string(), "{}".to_string()],
        ))
        .unwrap();
        assert_eq!(raw.id, SequenceId::new(10, 2));
        assert_eq!(raw.field("resource"), Some("{}"));
        assert!(parse_entry(("1-0".to_string(), vec!["x".to_string()])).is_err());
    }

    #[tokio::test]
    async fn test_five_writes_then_read() {
        let cache = cache_with_batch(10);
        assert!(!cache.has_cached_stream("k").await);
        for i in 0..5 {
            cache.write_entry("k", &resource(i)).await;
        }
        assert!(cache.has_cached_stream("k").await);

        let first = cache.read_entries("k", &CacheCursor::start()).await.unwrap();
        assert_eq!(first.entries.len(), 5);
        assert!(!first.has_more);
        assert_eq!(first.entries[4].payload, resource(4));

        let second = cache.read_entries("k", &first.cursor).await.unwrap();
        assert!(second.entries.is_empty());
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn test_batches_report_has_more() {
        let cache = cache_with_batch(2);
        for i in 0..5 {
            cache.write_entry("k", &resource(i)).await;
        }
        let mut cursor = CacheCursor::start();
        let mut sizes = Vec::new();
        loop {
            let batch = cache.read_entries("k", &cursor).await.unwrap();
            sizes.push(batch.entries.len());
            cursor = batch.cursor;
            if !batch.has_more {
                break;
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_end_marker_is_consumed() {
        let cache = cache_with_batch(10);
        cache.write_entry("k", &resource(1)).await;
        cache.write_end_marker("k").await.unwrap();

        let batch = cache.read_entries("k", &CacheCursor::start()).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert!(batch.complete);
        assert!(!batch.has_more);

        let meta = cache.metadata("k").await.unwrap().unwrap();
        assert_eq!(meta.length, 1);
        assert!(meta.complete);
        assert_eq!(meta.last_entry.unwrap().payload, resource(1));
        assert!(meta.ttl_secs.is_some_and(|ttl| ttl <= 3600));
    }

    #[tokio::test]
    async fn test_missing_log_is_an_error_and_metadata_none() {
        let cache = cache_with_batch(10);
        assert!(cache.read_entries("nope", &CacheCursor::start()).await.is_err());
        assert!(cache.metadata("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_resource() {
        let cache = cache_with_batch(10);
        let scoped = CacheKey::scoped("Patient", "p1", ["user/*.read"], "Summary");
        let everything = CacheKey::everything("Patient", &[("id", "p1")]);
        let other = CacheKey::everything("Patient", &[("id", "p2")]);
        for key in [&scoped, &everything, &other] {
            cache.write_entry(key.as_str(), &resource(0)).await;
        }

        let removed = cache.invalidate_resource("Patient", "p1").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.list_keys("").await.unwrap(), vec![other.into_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_many_counts_existing() {
        let cache = cache_with_batch(10);
        cache.write_entry("a", &resource(0)).await;
        cache.write_entry("b", &resource(0)).await;
        assert_eq!(cache.invalidate_many(&["a", "b", "c"]).await, 2);
    }

    #[tokio::test]
    async fn test_one_writer_per_log() {
        let cache = cache_with_batch(10);
        assert!(cache.try_claim_writer("k").await.unwrap());
        assert!(!cache.try_claim_writer("k").await.unwrap());

        cache.write_entry("k", &resource(0)).await;
        cache.release_writer("k").await;
        // A log that already exists is never claimed again.
        assert!(!cache.try_claim_writer("k").await.unwrap());

        cache.invalidate("k").await;
        assert!(cache.try_claim_writer("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_entries_times_out_without_writer() {
        let cache = cache_with_batch(10);
        let id = cache.try_write_entry("k", &resource(0)).await.unwrap();
        let woke = cache
            .wait_for_entries("k", &CacheCursor::after(id), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!woke);
    }
}
