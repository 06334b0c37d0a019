use std::sync::Arc;

use octofhir_cache::{ConnectionManager, KeyValueCache, StreamCache};
use octofhir_storage::{DynCursorProvider, InMemoryStore};
use octofhir_streaming::{AccessPredicate, ErrorReporter, ScopeAccessPredicate, TracingErrorReporter};

use crate::config::AppConfig;

/// Shared per-process state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: DynCursorProvider,
    pub connection: Arc<ConnectionManager>,
    pub kv_cache: KeyValueCache,
    pub stream_cache: StreamCache,
    pub predicate: Arc<dyn AccessPredicate>,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl AppState {
    /// Wires the caches onto one connection manager and the default scope predicate.
    pub fn new(
        config: AppConfig,
        storage: DynCursorProvider,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        let kv_cache = KeyValueCache::new(connection.clone(), config.stream_cache.ttl());
        let stream_cache = StreamCache::new(connection.clone(), config.stream_cache.clone());
        let predicate = Arc::new(ScopeAccessPredicate::new(
            config.streaming.access_tag_system.clone(),
        ));
        Self {
            config: Arc::new(config),
            storage,
            connection,
            kv_cache,
            stream_cache,
            predicate,
            reporter: Arc::new(TracingErrorReporter),
        }
    }

    /// State over an empty in-memory store and the in-process cache backend.
    pub fn local(config: AppConfig) -> (Self, InMemoryStore) {
        let store = InMemoryStore::new();
        let state = Self::new(
            config,
            Arc::new(store.clone()),
            Arc::new(ConnectionManager::local()),
        );
        (state, store)
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn AccessPredicate>) -> Self {
        self.predicate = predicate;
        self
    }
}
