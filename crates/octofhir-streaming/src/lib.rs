//! # octofhir-streaming
//!
//! Turns a storage cursor into a streamed HTTP body.
//!
//! ```text
//! source -> ResourceAccessFilter -> [CacheWriteThrough] -> IdentifierTracker -> Encoder -> sink
//! ```
//!
//! The pipeline is pull-driven and strictly ordered. One
//! [`CancellationToken`](tokio_util::sync::CancellationToken) is shared by
//! every stage; once raised, stages return nothing and the runner writes
//! nothing further. Per-item serialization failures become inline
//! `OperationOutcome` entries; only a source failure ends a run early.
//!
//! On a cache hit, [`CacheReplaySource`] replaces the storage source and the
//! write-through stage is left out.

mod cache_stage;
pub mod encoder;
mod error;
mod filter;
mod prepared;
mod reporter;
mod runner;
mod source;
mod stage;
mod tracker;

pub use cache_stage::{CacheReplaySource, CacheWriteHandle, CacheWriteThrough};
pub use encoder::{
    ArrayEncoder, BundleEncoder, BundleLink, BundleMeta, Encoder, EncoderState, MetadataFactory,
    NdjsonEncoder, WireFormat, inline_error,
};
pub use error::{FilterError, PipelineError, SerializationError};
pub use filter::{
    AccessPredicate, AllowAll, DEFAULT_ACCESS_TAG_SYSTEM, Enricher, NoEnrichment, RequestIdentity,
    ResourceAccessFilter, ScopeAccessPredicate, parse_elements, project_elements,
};
pub use prepared::PreparedResource;
pub use reporter::{ErrorReporter, STREAM_ERRORS_TOTAL, TracingErrorReporter};
pub use runner::{PipelineRunner, ResponseSink, RunCompletion, RunReport, SinkClosed, VecSink};
pub use source::{ItemSource, SourceIterator};
pub use stage::{Chain, Stage, StageExt};
pub use tracker::{IdentifierTracker, Tracker};
