use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{EncoderState, encode_item};
use crate::prepared::PreparedResource;
use crate::reporter::ErrorReporter;
use crate::stage::Stage;

/// One JSON value per line. No framing, so flush emits nothing.
pub struct NdjsonEncoder {
    state: EncoderState,
    token: CancellationToken,
    reporter: Arc<dyn ErrorReporter>,
}

impl NdjsonEncoder {
    pub fn new(token: CancellationToken, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            state: EncoderState::BeforeFirst,
            token,
            reporter,
        }
    }
}

#[async_trait]
impl Stage for NdjsonEncoder {
    type In = PreparedResource;
    type Out = Bytes;

    async fn process(&mut self, item: PreparedResource) -> Vec<Bytes> {
        if self.token.is_cancelled() || self.state == EncoderState::Closed {
            return Vec::new();
        }
        self.state = EncoderState::Streaming;
        let mut json = encode_item(&item, self.reporter.as_ref());
        json.push('\n');
        vec![Bytes::from(json)]
    }

    async fn flush(&mut self) -> Vec<Bytes> {
        self.state = EncoderState::Closed;
        Vec::new()
    }
}
