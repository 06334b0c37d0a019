//! In-process cache backend used when Redis is disabled.
//!
//! Mirrors the Redis data model: plain keys with a TTL, and append-only logs
//! whose TTL is fixed when the first entry is written.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::sequence::{SequenceId, now_millis};

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` to allow cheap cloning on cache hits.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// One log entry as the backend stores it: an id and its field/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub id: SequenceId,
    pub fields: Vec<(String, String)>,
}

impl RawEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct LocalStreamLog {
    entries: Vec<RawEntry>,
    created_at: Instant,
    ttl: Duration,
}

impl LocalStreamLog {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            created_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }

    fn last_id(&self) -> SequenceId {
        self.entries
            .last()
            .map_or(SequenceId::ZERO, |entry| entry.id)
    }
}

/// Local key-value map plus append-only logs.
#[derive(Debug, Default)]
pub struct LocalStore {
    kv: DashMap<String, CachedEntry>,
    streams: DashMap<String, LocalStreamLog>,
    appended: Notify,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.kv.remove_if(key, |_, entry| entry.is_expired());
        self.kv.get(key).map(|entry| Arc::clone(&entry.data))
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.kv.insert(key.to_string(), CachedEntry::new(value, ttl));
    }

    /// Stores `value` only if `key` holds no live entry. Returns `true` if it did.
    pub fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        self.kv.remove_if(key, |_, entry| entry.is_expired());
        match self.kv.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(CachedEntry::new(value, ttl));
                true
            }
        }
    }

    /// Appends an entry and returns its id. A fresh log gets `ttl`.
    pub(crate) fn append(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> SequenceId {
        self.streams.remove_if(key, |_, log| log.is_expired());
        let id = {
            let mut log = self
                .streams
                .entry(key.to_string())
                .or_insert_with(|| LocalStreamLog::new(ttl));
            let id = SequenceId::next_after(log.last_id(), now_millis());
            log.entries.push(RawEntry { id, fields });
            id
        };
        self.appended.notify_waiters();
        id
    }

    /// Entries with id strictly greater than `after`, oldest first.
    /// Returns `None` if the log does not exist.
    pub(crate) fn range_after(
        &self,
        key: &str,
        after: SequenceId,
        count: usize,
    ) -> Option<Vec<RawEntry>> {
        self.streams.remove_if(key, |_, log| log.is_expired());
        let log = self.streams.get(key)?;
        let start = log.entries.partition_point(|entry| entry.id <= after);
        Some(log.entries[start..].iter().take(count).cloned().collect())
    }

    /// The newest `count` entries, newest first.
    pub(crate) fn last_entries(&self, key: &str, count: usize) -> Vec<RawEntry> {
        self.streams.remove_if(key, |_, log| log.is_expired());
        self.streams
            .get(key)
            .map(|log| log.entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn stream_len(&self, key: &str) -> Option<usize> {
        self.streams.remove_if(key, |_, log| log.is_expired());
        self.streams.get(key).map(|log| log.entries.len())
    }

    /// Remaining lifetime of a key, if it exists.
    pub(crate) fn ttl(&self, key: &str) -> Option<Duration> {
        if let Some(log) = self.streams.get(key) {
            return log.ttl.checked_sub(log.created_at.elapsed());
        }
        self.kv
            .get(key)
            .and_then(|entry| entry.ttl.checked_sub(entry.cached_at.elapsed()))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.streams.remove_if(key, |_, log| log.is_expired());
        self.kv.remove_if(key, |_, entry| entry.is_expired());
        self.streams.contains_key(key) || self.kv.contains_key(key)
    }

    /// Deletes a key of either kind. Returns `true` if something was removed.
    pub fn delete(&self, key: &str) -> bool {
        let removed_stream = self.streams.remove(key).is_some();
        let removed_kv = self.kv.remove(key).is_some();
        if removed_stream {
            self.appended.notify_waiters();
        }
        removed_stream || removed_kv
    }

    /// Live keys of either kind starting with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .streams
            .iter()
            .filter(|e| !e.value().is_expired() && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .chain(
                self.kv
                    .iter()
                    .filter(|e| !e.value().is_expired() && e.key().starts_with(prefix))
                    .map(|e| e.key().clone()),
            )
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Waits until the log holds an entry newer than `after`.
    ///
    /// Returns `false` on timeout or if the log disappears.
    pub(crate) async fn wait_for_append(
        &self,
        key: &str,
        after: SequenceId,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.streams.get(key).map(|log| log.last_id()) {
                Some(last) if last > after => return true,
                Some(_) => {}
                None => return false,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &str) -> Vec<(String, String)> {
        vec![("resource".to_string(), v.to_string())]
    }

    #[test]
    fn test_kv_expiry() {
        let store = LocalStore::new();
        store.set("a", b"1".to_vec(), Duration::from_secs(60));
        store.set("b", b"2".to_vec(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(store.get("a").as_deref(), Some(&b"1".to_vec()));
        assert!(store.get("b").is_none());
    }

    #[test]
    fn test_append_ids_increase() {
        let store = LocalStore::new();
        let ttl = Duration::from_secs(60);
        let a = store.append("log", fields("1"), ttl);
        let b = store.append("log", fields("2"), ttl);
        let c = store.append("log", fields("3"), ttl);
        assert!(a < b && b < c);

        let after_a = store.range_after("log", a, 10).unwrap();
        assert_eq!(after_a.len(), 2);
        assert_eq!(after_a[0].field("resource"), Some("2"));
        assert_eq!(store.last_entries("log", 1)[0].id, c);
        assert!(store.range_after("missing", SequenceId::ZERO, 10).is_none());
    }

    #[test]
    fn test_set_if_absent() {
        let store = LocalStore::new();
        assert!(store.set_if_absent("lock", b"1".to_vec(), Duration::from_secs(60)));
        assert!(!store.set_if_absent("lock", b"2".to_vec(), Duration::from_secs(60)));
        assert_eq!(store.get("lock").as_deref(), Some(&b"1".to_vec()));
        assert!(store.delete("lock"));
        assert!(store.set_if_absent("lock", b"3".to_vec(), Duration::from_secs(60)));
    }

    #[test]
    fn test_keys_and_delete() {
        let store = LocalStore::new();
        store.append("fhir:everything:Patient:id=1", fields("x"), Duration::from_secs(60));
        store.set("Patient:1::Scopes:::Read", b"{}".to_vec(), Duration::from_secs(60));
        store.set("Observation:1::Scopes:::Read", b"{}".to_vec(), Duration::from_secs(60));

        assert_eq!(store.keys("Patient:").len(), 1);
        assert_eq!(store.keys("").len(), 3);
        assert!(store.delete("fhir:everything:Patient:id=1"));
        assert!(!store.delete("fhir:everything:Patient:id=1"));
        assert!(!store.exists("fhir:everything:Patient:id=1"));
    }

    #[tokio::test]
    async fn test_wait_for_append_wakes_on_write() {
        let store = Arc::new(LocalStore::new());
        let first = store.append("log", fields("1"), Duration::from_secs(60));

        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("log", fields("2"), Duration::from_secs(60));
        });

        assert!(
            store
                .wait_for_append("log", first, Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_append_times_out() {
        let store = LocalStore::new();
        let first = store.append("log", fields("1"), Duration::from_secs(60));
        assert!(
            !store
                .wait_for_append("log", first, Duration::from_millis(20))
                .await
        );
    }
}
