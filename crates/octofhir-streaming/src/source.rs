//! Pull-based item sources.

use async_trait::async_trait;
use octofhir_storage::{ResourceCursor, StoredResource};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Something the runner pulls items from, one at a time.
#[async_trait]
pub trait ItemSource: Send {
    type Item: Send + 'static;

    /// Returns the next item, or `None` when exhausted or cancelled.
    ///
    /// # Errors
    ///
    /// Any error ends the run.
    async fn pull(&mut self) -> Result<Option<Self::Item>, PipelineError>;
}

/// Wraps a storage cursor as a cancellable source of raw records.
///
/// Cancellation is observed before each pull and while waiting on the cursor;
/// either way the source reports exhaustion instead of an error.
pub struct SourceIterator<C> {
    cursor: C,
    token: CancellationToken,
}

impl<C: ResourceCursor> SourceIterator<C> {
    pub fn new(cursor: C, token: CancellationToken) -> Self {
        Self { cursor, token }
    }

    async fn next_record(&mut self) -> Result<Option<StoredResource>, PipelineError> {
        if !self.cursor.has_next().await? {
            return Ok(None);
        }
        Ok(self.cursor.next().await?)
    }
}

#[async_trait]
impl<C: ResourceCursor> ItemSource for SourceIterator<C> {
    type Item = StoredResource;

    async fn pull(&mut self) -> Result<Option<StoredResource>, PipelineError> {
        if self.token.is_cancelled() {
            return Ok(None);
        }
        let token = self.token.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(None),
            next = self.next_record() => next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_storage::{StorageError, VecCursor};
    use serde_json::json;

    fn records(n: usize) -> Vec<StoredResource> {
        (0..n)
            .map(|i| {
                let id = format!("p{i}");
                StoredResource::new(&id, "1", "Patient", json!({"resourceType": "Patient", "id": id}))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_yields_until_exhausted() {
        let mut source = SourceIterator::new(VecCursor::new(records(2)), CancellationToken::new());
        assert_eq!(source.pull().await.unwrap().unwrap().id, "p0");
        assert_eq!(source.pull().await.unwrap().unwrap().id, "p1");
        assert!(source.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_source_is_exhausted() {
        let token = CancellationToken::new();
        let mut source = SourceIterator::new(VecCursor::new(records(3)), token.clone());
        assert!(source.pull().await.unwrap().is_some());
        token.cancel();
        assert!(source.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_failure_is_a_source_error() {
        let cursor =
            VecCursor::new(records(3)).failing_after(1, StorageError::connection_error("lost"));
        let mut source = SourceIterator::new(cursor, CancellationToken::new());
        assert!(source.pull().await.unwrap().is_some());
        assert!(matches!(
            source.pull().await,
            Err(PipelineError::Source(StorageError::ConnectionError { .. }))
        ));
    }
}
