//! Stream cache behaviour against the in-process backend.

use std::sync::Arc;
use std::time::Duration;

use octofhir_cache::{
    CacheCursor, CacheKey, ConnectionManager, KeyValueCache, StreamCache, StreamCacheConfig,
};
use serde_json::{Value, json};

fn stream_cache(batch_size: usize) -> StreamCache {
    StreamCache::new(
        Arc::new(ConnectionManager::local()),
        StreamCacheConfig {
            batch_size,
            ..StreamCacheConfig::default()
        },
    )
}

fn observation(i: usize) -> Value {
    json!({"resourceType": "Observation", "id": format!("o{i}"), "status": "final"})
}

async fn read_all(cache: &StreamCache, key: &str, mut cursor: CacheCursor) -> Vec<Value> {
    let mut out = Vec::new();
    loop {
        let batch = cache.read_entries(key, &cursor).await.unwrap();
        out.extend(batch.entries.into_iter().map(|e| e.payload));
        cursor = batch.cursor;
        if !batch.has_more {
            return out;
        }
    }
}

#[tokio::test]
async fn split_read_matches_single_pass() {
    let cache = stream_cache(3);
    let key = CacheKey::everything("Patient", &[("id", "p1")]);
    for i in 0..10 {
        cache.write_entry(key.as_str(), &observation(i)).await;
    }

    let single = read_all(&cache, key.as_str(), CacheCursor::start()).await;
    assert_eq!(single.len(), 10);

    for split in 1..10 {
        // First pass stops after `split` entries, second resumes from there.
        let mut head = Vec::new();
        let mut cursor = CacheCursor::start();
        while head.len() < split {
            let batch = cache.read_entries(key.as_str(), &cursor).await.unwrap();
            for entry in batch.entries {
                if head.len() == split {
                    break;
                }
                cursor = CacheCursor::after(entry.sequence_id);
                head.push(entry.payload);
            }
        }
        let tail = read_all(&cache, key.as_str(), cursor).await;
        head.extend(tail);
        assert_eq!(head, single, "split at {split}");
    }
}

#[tokio::test]
async fn reader_resumes_while_writer_appends() {
    let cache = stream_cache(100);
    let key = "fhir:everything:Patient:id=p2";
    cache.write_entry(key, &observation(0)).await;

    let first = cache.read_entries(key, &CacheCursor::start()).await.unwrap();
    assert_eq!(first.entries.len(), 1);

    let writer = cache.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_entry(key, &observation(1)).await;
        writer.write_end_marker(key).await.unwrap();
    });

    assert!(
        cache
            .wait_for_entries(key, &first.cursor, Duration::from_secs(5))
            .await
            .unwrap()
    );
    handle.await.unwrap();

    let rest = cache.read_entries(key, &first.cursor).await.unwrap();
    assert_eq!(rest.entries.len(), 1);
    assert_eq!(rest.entries[0].payload, observation(1));
    assert!(rest.complete);
}

#[tokio::test]
async fn invalidated_log_reads_as_missing() {
    let cache = stream_cache(100);
    let key = "Patient:p3::Scopes:user/*.read::Summary";
    cache.write_entry(key, &observation(0)).await;
    cache.invalidate(key).await;
    assert!(!cache.has_cached_stream(key).await);
    assert!(cache.read_entries(key, &CacheCursor::start()).await.is_err());
}

#[tokio::test]
async fn kv_and_stream_share_one_connection() {
    let conn = Arc::new(ConnectionManager::local());
    let kv = KeyValueCache::new(Arc::clone(&conn), Duration::from_secs(60));
    let streams = StreamCache::new(Arc::clone(&conn), StreamCacheConfig::default());

    let read_key = CacheKey::scoped("Patient", "p4", ["user/*.read"], "Read");
    kv.set_json(read_key.as_str(), &json!({"id": "p4"}), None).await;
    streams
        .write_entry(
            CacheKey::scoped("Patient", "p4", ["user/*.read"], "Summary").as_str(),
            &observation(0),
        )
        .await;

    let keys = streams.list_keys("Patient:p4::").await.unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(streams.invalidate_resource("Patient", "p4").await.unwrap(), 2);
    assert!(kv.get(read_key.as_str()).await.is_none());
}
