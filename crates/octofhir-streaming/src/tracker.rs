//! Identifiers of the resources a run actually emitted.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::prepared::PreparedResource;
use crate::stage::Stage;

/// Ordered, append-only list of emitted ids. Cloning shares the list.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    ids: Arc<Mutex<Vec<String>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, id: String) {
        self.ids.lock().push(id);
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Forgets ids recorded after the first `len`, for output that never
    /// reached the sink.
    pub(crate) fn truncate(&self, len: usize) {
        self.ids.lock().truncate(len);
    }

    pub fn last(&self) -> Option<String> {
        self.ids.lock().last().cloned()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.ids.lock().clone()
    }
}

/// Pass-through stage that records each resource id in the [`Tracker`].
///
/// After cancellation it drops items without recording them.
pub struct IdentifierTracker {
    tracker: Tracker,
    token: CancellationToken,
}

impl IdentifierTracker {
    pub fn new(tracker: Tracker, token: CancellationToken) -> Self {
        Self { tracker, token }
    }
}

#[async_trait]
impl Stage for IdentifierTracker {
    type In = PreparedResource;
    type Out = PreparedResource;

    async fn process(&mut self, item: PreparedResource) -> Vec<PreparedResource> {
        if self.token.is_cancelled() {
            return Vec::new();
        }
        self.tracker.push(item.id.clone());
        vec![item]
    }

    async fn flush(&mut self) -> Vec<PreparedResource> {
        Vec::new()
    }
}
