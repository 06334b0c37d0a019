//! In-memory record store.
//!
//! Records live in a `BTreeMap` keyed by `(resourceType, id)`, so every cursor
//! yields them in that order.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::traits::{CursorProvider, ResourceCursor, VecCursor};
use crate::types::{StoredResource, StreamQuery};

type StorageKey = (String, String);

/// In-memory storage backend implementing [`CursorProvider`].
///
/// Supports `id` lists, `_count` and Patient-style compartments: a record is
/// in compartment `Patient/123` if its `subject` or `patient` reference points
/// there, and the compartment owner itself is included.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<BTreeMap<StorageKey, StoredResource>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if the body lacks `resourceType` or `id`.
    pub async fn upsert(&self, resource: Value) -> Result<StoredResource, StorageError> {
        let stored = StoredResource::from_json(resource)?;
        let key = (stored.resource_type.clone(), stored.id.clone());
        self.data.write().await.insert(key, stored.clone());
        Ok(stored)
    }

    /// Removes a record, returning `true` if it existed.
    pub async fn remove(&self, resource_type: &str, id: &str) -> bool {
        self.data
            .write()
            .await
            .remove(&(resource_type.to_string(), id.to_string()))
            .is_some()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    /// Loads newline-delimited JSON records, skipping blank lines.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` naming the line that failed to parse.
    pub async fn load_ndjson(&self, text: &str) -> Result<usize, StorageError> {
        let mut loaded = 0;
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).map_err(|e| {
                StorageError::invalid_resource(format!("line {}: {e}", index + 1))
            })?;
            self.upsert(value).await?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Loads an NDJSON seed file.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Internal` if the file cannot be read, or any
    /// error from [`load_ndjson`](Self::load_ndjson).
    pub async fn load_ndjson_file(&self, path: impl AsRef<Path>) -> Result<usize, StorageError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            StorageError::internal(format!("failed to read {}: {e}", path.display()))
        })?;
        let loaded = self.load_ndjson(&text).await?;
        tracing::info!(path = %path.display(), loaded, "Seeded in-memory store");
        Ok(loaded)
    }

    fn matches(query: &StreamQuery, record: &StoredResource) -> bool {
        if let Some(compartment) = &query.compartment {
            let owner = record.resource_type == compartment.resource_type
                && record.id == compartment.id;
            let reference = compartment.reference();
            let linked = ["subject", "patient"].iter().any(|field| {
                record
                    .resource
                    .get(*field)
                    .and_then(|r| r.get("reference"))
                    .and_then(Value::as_str)
                    == Some(reference.as_str())
            });
            if !(owner || linked) {
                return false;
            }
        } else if record.resource_type != query.resource_type {
            return false;
        }

        if let Some(after) = &query.after_id {
            if record.id.as_str() <= after.as_str() {
                return false;
            }
        }
        query.ids.is_empty() || query.ids.iter().any(|id| *id == record.id)
    }
}

#[async_trait]
impl CursorProvider for InMemoryStore {
    async fn open_cursor(
        &self,
        query: &StreamQuery,
    ) -> Result<Box<dyn ResourceCursor>, StorageError> {
        let guard = self.data.read().await;
        let limit = query.count.unwrap_or(usize::MAX);
        let items: Vec<StoredResource> = guard
            .values()
            .filter(|record| Self::matches(query, record))
            .take(limit)
            .cloned()
            .collect();
        tracing::debug!(
            resource_type = %query.resource_type,
            matched = items.len(),
            "Opened in-memory cursor"
        );
        Ok(Box::new(VecCursor::new(items)))
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned())
    }
}
