use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

use super::{EncoderState, encode_item, inline_error};
use crate::error::SerializationError;
use crate::prepared::PreparedResource;
use crate::reporter::ErrorReporter;
use crate::stage::Stage;

const PREFIX: &str = r#"{"entry":["#;

/// Builds the trailing Bundle members from the last emitted id and the
/// current time in milliseconds.
pub type MetadataFactory<M> = Box<dyn FnMut(Option<&str>, i64) -> M + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

/// Bundle members that follow `entry`. `resourceType` is serialized last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleMeta {
    #[serde(rename = "type")]
    pub bundle_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<BundleLink>,
    #[serde(rename = "resourceType")]
    resource_type: &'static str,
}

impl BundleMeta {
    pub fn new(bundle_type: impl Into<String>) -> Self {
        Self {
            bundle_type: bundle_type.into(),
            total: None,
            timestamp: None,
            link: Vec::new(),
            resource_type: "Bundle",
        }
    }

    /// A `searchset` tail with `total` and an RFC 3339 `timestamp`.
    pub fn searchset(total: usize, now_millis: i64) -> Self {
        let timestamp = OffsetDateTime::from_unix_timestamp_nanos(i128::from(now_millis) * 1_000_000)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok());
        Self {
            total: Some(total),
            timestamp,
            ..Self::new("searchset")
        }
    }

    pub fn with_link(mut self, relation: impl Into<String>, url: impl Into<String>) -> Self {
        self.link.push(BundleLink {
            relation: relation.into(),
            url: url.into(),
        });
        self
    }
}

/// Serializes metadata as the members to splice after `entry`: the object
/// without its leading `{`.
fn metadata_members<M: Serialize>(meta: &M) -> Result<String, SerializationError> {
    let json = serde_json::to_string(meta)
        .map_err(|e| SerializationError::new("bundle", e.to_string()))?;
    json.strip_prefix('{')
        .map(String::from)
        .ok_or_else(|| SerializationError::new("bundle", "bundle metadata is not an object"))
}

/// Streams `{"entry":[{"resource":...},...],<metadata>}`.
pub struct BundleEncoder<M> {
    state: EncoderState,
    last_emitted: Option<String>,
    metadata: MetadataFactory<M>,
    token: CancellationToken,
    reporter: Arc<dyn ErrorReporter>,
}

impl<M: Serialize> BundleEncoder<M> {
    pub fn new(
        token: CancellationToken,
        reporter: Arc<dyn ErrorReporter>,
        metadata: MetadataFactory<M>,
    ) -> Self {
        Self {
            state: EncoderState::BeforeFirst,
            last_emitted: None,
            metadata,
            token,
            reporter,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    fn closing(&mut self, had_entries: bool) -> String {
        let now_millis = i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
            .unwrap_or_default();
        let meta = (self.metadata)(self.last_emitted.as_deref(), now_millis);
        match metadata_members(&meta) {
            Ok(members) if members == "}" => "]}".to_string(),
            Ok(members) => format!("],{members}"),
            Err(e) => {
                self.reporter.report("encoder", &e);
                let sep = if had_entries { "," } else { "" };
                format!(r#"{sep}{{"resource":{}}}]}}"#, inline_error("bundle"))
            }
        }
    }
}

#[async_trait]
impl<M: Serialize + Send + 'static> Stage for BundleEncoder<M> {
    type In = PreparedResource;
    type Out = Bytes;

    async fn process(&mut self, item: PreparedResource) -> Vec<Bytes> {
        if self.token.is_cancelled() || self.state == EncoderState::Closed {
            return Vec::new();
        }
        // An item replaced by an inline error still holds its place in paging.
        let json = encode_item(&item, self.reporter.as_ref());
        self.last_emitted = Some(item.id);
        let lead = match self.state {
            EncoderState::BeforeFirst => PREFIX,
            _ => ",",
        };
        self.state = EncoderState::Streaming;
        vec![Bytes::from(format!(r#"{lead}{{"resource":{json}}}"#))]
    }

    async fn flush(&mut self) -> Vec<Bytes> {
        let previous = std::mem::replace(&mut self.state, EncoderState::Closed);
        if self.token.is_cancelled() {
            return Vec::new();
        }
        match previous {
            EncoderState::BeforeFirst => {
                let closing = self.closing(false);
                vec![Bytes::from(format!("{PREFIX}{closing}"))]
            }
            EncoderState::Streaming => vec![Bytes::from(self.closing(true))],
            EncoderState::Closed => Vec::new(),
        }
    }
}
