//! Wire encoders: FHIR Bundle, bare JSON array, and NDJSON.
//!
//! Every encoder walks `BeforeFirst -> Streaming -> Closed`. Opening framing
//! goes out with the first chunk, so a run cancelled before any item leaves
//! an empty body. An item that cannot be serialized is replaced, in place,
//! by one inline `OperationOutcome`.
//!
//! After cancellation encoders emit nothing more, closing framing included.

mod array;
mod bundle;
mod ndjson;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::prepared::PreparedResource;
use crate::reporter::ErrorReporter;
use crate::stage::Stage;

pub use array::ArrayEncoder;
pub use bundle::{BundleEncoder, BundleLink, BundleMeta, MetadataFactory};
pub use ndjson::NdjsonEncoder;

pub const FHIR_JSON: &str = "application/fhir+json";
pub const FHIR_NDJSON: &str = "application/fhir+ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    BeforeFirst,
    Streaming,
    Closed,
}

/// Output format of a streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Bundle,
    Array,
    Ndjson,
}

impl WireFormat {
    /// Picks the format for a request. `_format` wins over `Accept`; NDJSON
    /// media types select NDJSON, anything else is JSON, as a Bundle when
    /// `_bundle` was given or bundles are the default.
    pub fn negotiate(
        format_param: Option<&str>,
        accept: Option<&str>,
        bundle_param: bool,
        default_bundle: bool,
    ) -> Self {
        let requested = format_param.or(accept).unwrap_or(FHIR_JSON);
        let is_ndjson = requested.split(',').any(|media| {
            let media = media.split(';').next().unwrap_or_default().trim();
            matches!(
                media,
                "application/fhir+ndjson" | "application/ndjson" | "application/x-ndjson" | "ndjson"
            )
        });
        if is_ndjson {
            Self::Ndjson
        } else if bundle_param || default_bundle {
            Self::Bundle
        } else {
            Self::Array
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Bundle | Self::Array => FHIR_JSON,
            Self::Ndjson => FHIR_NDJSON,
        }
    }
}

/// The inline entry that replaces an item which failed to serialize.
pub fn inline_error(id: &str) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "error",
            "code": "exception",
            "diagnostics": format!("Error occurred while streaming response for chunk: {id}")
        }]
    })
}

/// Serializes an item, substituting and reporting an inline error on failure.
pub(crate) fn encode_item(item: &PreparedResource, reporter: &dyn ErrorReporter) -> String {
    item.to_wire_json().unwrap_or_else(|e| {
        reporter.report("encoder", &e);
        inline_error(&item.id).to_string()
    })
}

/// One of the three encoders, chosen at request time.
pub enum Encoder {
    Bundle(BundleEncoder<BundleMeta>),
    Array(ArrayEncoder),
    Ndjson(NdjsonEncoder),
}

impl Encoder {
    pub fn new(
        format: WireFormat,
        token: CancellationToken,
        reporter: Arc<dyn ErrorReporter>,
        metadata: MetadataFactory<BundleMeta>,
    ) -> Self {
        match format {
            WireFormat::Bundle => Self::Bundle(BundleEncoder::new(token, reporter, metadata)),
            WireFormat::Array => Self::Array(ArrayEncoder::new(token, reporter)),
            WireFormat::Ndjson => Self::Ndjson(NdjsonEncoder::new(token, reporter)),
        }
    }
}

#[async_trait]
impl Stage for Encoder {
    type In = PreparedResource;
    type Out = Bytes;

    async fn process(&mut self, item: PreparedResource) -> Vec<Bytes> {
        match self {
            Self::Bundle(e) => e.process(item).await,
            Self::Array(e) => e.process(item).await,
            Self::Ndjson(e) => e.process(item).await,
        }
    }

    async fn flush(&mut self) -> Vec<Bytes> {
        match self {
            Self::Bundle(e) => e.flush().await,
            Self::Array(e) => e.flush().await,
            Self::Ndjson(e) => e.flush().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(
            WireFormat::negotiate(None, Some("application/fhir+ndjson"), false, true),
            WireFormat::Ndjson
        );
        assert_eq!(
            WireFormat::negotiate(Some("application/fhir+json"), Some("application/fhir+ndjson"), false, false),
            WireFormat::Array
        );
        assert_eq!(
            WireFormat::negotiate(None, Some("application/json; charset=utf-8"), true, false),
            WireFormat::Bundle
        );
        assert_eq!(WireFormat::negotiate(None, None, false, true), WireFormat::Bundle);
        assert_eq!(WireFormat::negotiate(Some("ndjson"), None, true, true), WireFormat::Ndjson);
        assert_eq!(WireFormat::Ndjson.content_type(), FHIR_NDJSON);
    }

    #[test]
    fn test_inline_error_names_item() {
        let outcome = inline_error("obs-7");
        assert_eq!(outcome["resourceType"], "OperationOutcome");
        assert_eq!(
            outcome["issue"][0]["diagnostics"],
            "Error occurred while streaming response for chunk: obs-7"
        );
    }
}
