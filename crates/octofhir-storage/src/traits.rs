//! Cursor traits the streaming pipeline consumes.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{StoredResource, StreamQuery};

/// A pull-based cursor over stored records.
///
/// A cursor is owned by one pipeline run and yields each record exactly once,
/// in backend order. Implementations may suspend on I/O in either method.
///
/// # Example
///
/// ```ignore
/// while cursor.has_next().await? {
///     if let Some(record) = cursor.next().await? {
///         // ...
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceCursor: Send {
    /// Returns `true` if another record is available.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConnectionError` if the store became unreachable.
    async fn has_next(&mut self) -> Result<bool, StorageError>;

    /// Returns the next record, or `None` once the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConnectionError` if the store became unreachable
    /// mid-iteration.
    async fn next(&mut self) -> Result<Option<StoredResource>, StorageError>;
}

#[async_trait]
impl<C: ResourceCursor + ?Sized> ResourceCursor for Box<C> {
    async fn has_next(&mut self) -> Result<bool, StorageError> {
        (**self).has_next().await
    }

    async fn next(&mut self) -> Result<Option<StoredResource>, StorageError> {
        (**self).next().await
    }
}

/// Opens cursors for queries and reads single records.
///
/// Implementations must be thread-safe (`Send + Sync`); one provider is shared
/// by every request in the process.
#[async_trait]
pub trait CursorProvider: Send + Sync {
    /// Opens a cursor over every record matching `query`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidQuery` for queries the backend cannot plan.
    /// Returns an error for infrastructure issues.
    async fn open_cursor(
        &self,
        query: &StreamQuery,
    ) -> Result<Box<dyn ResourceCursor>, StorageError>;

    /// Reads a resource by type and ID.
    ///
    /// Returns `None` if the resource does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues, not for missing resources.
    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError>;
}

/// A cursor over records already materialised in memory.
///
/// An optional injected failure lets tests simulate a store that drops
/// mid-iteration.
#[derive(Debug, Default)]
pub struct VecCursor {
    items: VecDeque<StoredResource>,
    fail_after: Option<(usize, StorageError)>,
    yielded: usize,
}

impl VecCursor {
    #[must_use]
    pub fn new(items: Vec<StoredResource>) -> Self {
        Self {
            items: items.into(),
            fail_after: None,
            yielded: 0,
        }
    }

    /// Makes the cursor fail with `error` after `count` records were yielded.
    #[must_use]
    pub fn failing_after(mut self, count: usize, error: StorageError) -> Self {
        self.fail_after = Some((count, error));
        self
    }

    fn check_failure(&self) -> Result<(), StorageError> {
        match &self.fail_after {
            Some((count, error)) if self.yielded >= *count => Err(error.clone()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceCursor for VecCursor {
    async fn has_next(&mut self) -> Result<bool, StorageError> {
        self.check_failure()?;
        Ok(!self.items.is_empty())
    }

    async fn next(&mut self) -> Result<Option<StoredResource>, StorageError> {
        self.check_failure()?;
        let item = self.items.pop_front();
        if item.is_some() {
            self.yielded += 1;
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> StoredResource {
        StoredResource::new(id, "1", "Patient", json!({"resourceType": "Patient", "id": id}))
    }

    #[tokio::test]
    async fn test_vec_cursor_yields_in_order() {
        let mut cursor = VecCursor::new(vec![record("a"), record("b")]);
        let mut seen = Vec::new();
        while cursor.has_next().await.unwrap() {
            seen.push(cursor.next().await.unwrap().unwrap().id);
        }
        assert_eq!(seen, vec!["a", "b"]);
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vec_cursor_injected_failure() {
        let mut cursor = VecCursor::new(vec![record("a"), record("b")])
            .failing_after(1, StorageError::connection_error("gone"));
        assert!(cursor.next().await.unwrap().is_some());
        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, StorageError::ConnectionError { .. }));
    }
}
