//! # octofhir-cache
//!
//! Cache layer for streamed FHIR responses.
//!
//! - [`ConnectionManager`]: the one process-wide backend connection (Redis, or
//!   an in-process store when Redis is disabled)
//! - [`KeyValueCache`]: whole-payload get/set/delete with TTL
//! - [`StreamCache`]: resumable append-only logs of prepared resources
//! - [`CacheKey`]: deterministic key builders shared with admin tooling
//!
//! ## Graceful Degradation
//!
//! Cache errors never reach the client. Reads degrade to misses and writes to
//! no-ops, logged at `warn` and counted in `cache_errors_total`.

mod config;
mod connection;
mod error;
mod key;
mod kv;
mod local;
pub mod metrics;
mod sequence;
mod stream;

pub use config::{RedisConfig, StreamCacheConfig};
pub use connection::ConnectionManager;
pub use error::{CacheError, CacheResult};
pub use key::{CacheKey, EVERYTHING_PREFIX, parse_scopes};
pub use kv::KeyValueCache;
pub use local::{CachedEntry, LocalStore};
pub use sequence::{CacheCursor, SequenceId};
pub use stream::{
    END_MARKER_FIELD, PAYLOAD_FIELD, ReadBatch, StreamCache, StreamCacheEntry, StreamMetadata,
    WRITER_LOCK_PREFIX,
};
