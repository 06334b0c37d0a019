use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{EncoderState, encode_item};
use crate::prepared::PreparedResource;
use crate::reporter::ErrorReporter;
use crate::stage::Stage;

/// Bare JSON array: `[item,item,...]`.
pub struct ArrayEncoder {
    state: EncoderState,
    token: CancellationToken,
    reporter: Arc<dyn ErrorReporter>,
}

impl ArrayEncoder {
    pub fn new(token: CancellationToken, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            state: EncoderState::BeforeFirst,
            token,
            reporter,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }
}

#[async_trait]
impl Stage for ArrayEncoder {
    type In = PreparedResource;
    type Out = Bytes;

    async fn process(&mut self, item: PreparedResource) -> Vec<Bytes> {
        if self.token.is_cancelled() || self.state == EncoderState::Closed {
            return Vec::new();
        }
        let json = encode_item(&item, self.reporter.as_ref());
        let lead = match self.state {
            EncoderState::BeforeFirst => "[",
            _ => ",",
        };
        self.state = EncoderState::Streaming;
        vec![Bytes::from(format!("{lead}{json}"))]
    }

    async fn flush(&mut self) -> Vec<Bytes> {
        let previous = std::mem::replace(&mut self.state, EncoderState::Closed);
        if self.token.is_cancelled() {
            return Vec::new();
        }
        match previous {
            EncoderState::BeforeFirst => vec![Bytes::from_static(b"[]")],
            EncoderState::Streaming => vec![Bytes::from_static(b"]")],
            EncoderState::Closed => Vec::new(),
        }
    }
}
