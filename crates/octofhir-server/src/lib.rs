//! # octofhir-server
//!
//! HTTP surface for the streaming pipeline: content negotiation, the
//! response sink, the cache hit/miss decision, admin cache endpoints,
//! configuration, logging and metrics.

pub mod admin;
pub mod api;
pub mod config;
pub mod fhir;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod sink;
pub mod state;

pub use api::{ApiError, OperationOutcome};
pub use config::{AppConfig, LoggingConfig, ServerConfig, StorageConfig, StreamingConfig};
pub use observability::init_tracing;
pub use server::{OctofhirServer, ServerBuilder, build_app, build_state};
pub use sink::ChannelSink;
pub use state::AppState;
