//! # octofhir-storage
//!
//! Storage collaborator contracts for the OctoFHIR streaming pipeline.
//!
//! The pipeline never plans queries itself. It asks a [`CursorProvider`] for a
//! [`ResourceCursor`] and pulls [`StoredResource`] records from it one at a
//! time. [`InMemoryStore`] is the backend used by the server binary and tests.
//!
//! ## Example
//!
//! ```ignore
//! use octofhir_storage::{CursorProvider, InMemoryStore, StreamQuery};
//!
//! let store = InMemoryStore::new();
//! let mut cursor = store.open_cursor(&StreamQuery::new("Patient")).await?;
//! while let Some(record) = cursor.next().await? {
//!     println!("{}", record.reference());
//! }
//! ```

mod error;
mod memory;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use memory::InMemoryStore;
pub use traits::{CursorProvider, ResourceCursor, VecCursor};
pub use types::{Compartment, StoredResource, StreamQuery};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared cursor provider.
pub type DynCursorProvider = std::sync::Arc<dyn CursorProvider>;
