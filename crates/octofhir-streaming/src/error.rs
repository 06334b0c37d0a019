use octofhir_cache::CacheError;
use octofhir_storage::StorageError;

/// Errors that end a pipeline run early.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The primary store failed mid-iteration.
    #[error("source read failed: {0}")]
    Source(#[from] StorageError),

    /// A cached replay could not be read.
    #[error("cache replay failed: {0}")]
    Replay(#[from] CacheError),
}

/// A single item could not be converted to its wire form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot serialize {id}: {reason}")]
pub struct SerializationError {
    pub id: String,
    pub reason: String,
}

impl SerializationError {
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Internal failure of the access filter. The record is dropped.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("enrichment failed for {reference}: {message}")]
    Enrichment { reference: String, message: String },
}
