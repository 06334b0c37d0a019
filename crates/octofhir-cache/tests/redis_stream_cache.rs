//! Stream and key-value cache against a real Redis.
//!
//! These tests start Redis with testcontainers and need Docker:
//! `cargo test -p octofhir-cache -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use octofhir_cache::{
    CacheCursor, CacheKey, ConnectionManager, KeyValueCache, RedisConfig, StreamCache,
    StreamCacheConfig,
};
use serde_json::json;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            // EXPIRE ... NX needs Redis 7
            let container = Redis::default()
                .with_tag("7.2")
                .start()
                .await
                .expect("start redis container");
            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, format!("redis://127.0.0.1:{host_port}"))
        })
        .await;
    url.clone()
}

async fn manager() -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        ..RedisConfig::default()
    })
    .expect("redis client");
    manager.connect().await.expect("connect");
    Arc::new(manager)
}

fn config(batch_size: usize) -> StreamCacheConfig {
    StreamCacheConfig {
        batch_size,
        ..StreamCacheConfig::default()
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_connect_is_idempotent_and_healthy() {
    let manager = manager().await;
    manager.connect().await.unwrap();
    assert!(manager.health_check().await);
    assert_eq!(manager.mode(), "redis");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_five_writes_then_read() {
    let cache = StreamCache::new(manager().await, config(10));
    let key = "fhir:everything:Patient:id=redis-five";
    cache.invalidate(key).await;

    for i in 0..5 {
        cache
            .write_entry(key, &json!({"resourceType": "Observation", "id": i.to_string()}))
            .await;
    }

    let first = cache.read_entries(key, &CacheCursor::start()).await.unwrap();
    assert_eq!(first.entries.len(), 5);
    assert!(!first.has_more);

    let second = cache.read_entries(key, &first.cursor).await.unwrap();
    assert!(second.entries.is_empty());
    assert!(!second.has_more);

    let meta = cache.metadata(key).await.unwrap().unwrap();
    assert_eq!(meta.length, 5);
    assert!(meta.ttl_secs.is_some_and(|ttl| ttl > 0 && ttl <= 3600));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_batched_reads_and_end_marker() {
    let cache = StreamCache::new(manager().await, config(2));
    let key = "fhir:everything:Patient:id=redis-batch";
    cache.invalidate(key).await;

    for i in 0..3 {
        cache.write_entry(key, &json!({"id": i})).await;
    }
    cache.write_end_marker(key).await.unwrap();

    let first = cache.read_entries(key, &CacheCursor::start()).await.unwrap();
    assert_eq!(first.entries.len(), 2);
    assert!(first.has_more);

    let second = cache.read_entries(key, &first.cursor).await.unwrap();
    assert_eq!(second.entries.len(), 1);
    assert!(second.complete);
    assert!(!second.has_more);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scope_keys_listed_and_invalidated() {
    let conn = manager().await;
    let cache = StreamCache::new(Arc::clone(&conn), config(10));
    let kv = KeyValueCache::new(conn, Duration::from_secs(60));

    let summary = CacheKey::scoped("Patient", "redis-p1", ["access/*.*", "user/*.read"], "Summary");
    let read = CacheKey::scoped("Patient", "redis-p1", ["access/*.*", "user/*.read"], "Read");
    cache.write_entry(summary.as_str(), &json!({"id": "redis-p1"})).await;
    kv.set(read.as_str(), b"{}".to_vec(), None).await;

    let keys = cache
        .list_keys(&CacheKey::scoped_prefix("Patient", "redis-p1"))
        .await
        .unwrap();
    assert_eq!(keys.len(), 2);

    assert_eq!(
        cache.invalidate_resource("Patient", "redis-p1").await.unwrap(),
        2
    );
    assert!(!cache.has_cached_stream(summary.as_str()).await);
    assert!(kv.get(read.as_str()).await.is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_kv_ttl() {
    let kv = KeyValueCache::new(manager().await, Duration::from_secs(60));
    kv.set("redis-kv-ttl", b"v".to_vec(), Some(Duration::from_millis(100)))
        .await;
    assert!(kv.get("redis-kv-ttl").await.is_some());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(kv.get("redis-kv-ttl").await.is_none());
}
