//! Response sink backed by the HTTP body channel.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use octofhir_streaming::{ResponseSink, SinkClosed};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Pushes chunks into a bounded channel drained by the response body.
///
/// A full channel suspends the pipeline until the client reads. A dropped body
/// (client gone) closes the channel.
pub struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
}

impl ChannelSink {
    /// Creates a sink and the streaming body it feeds.
    pub fn channel(capacity: usize) -> (Self, Body) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, Body::from_stream(ReceiverStream::new(rx)))
    }

    /// Raises `token` as soon as the body is dropped, even while the pipeline
    /// is waiting on its source. The watch ends when the guard is dropped.
    pub fn watch_disconnect(&self, token: CancellationToken) -> DropGuard {
        let stop = CancellationToken::new();
        let guard = stop.clone().drop_guard();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("Client disconnected, cancelling stream");
                    token.cancel();
                }
                _ = stop.cancelled() => {}
            }
        });
        guard
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dropped_body_closes_sink_and_cancels() {
        let (mut sink, body) = ChannelSink::channel(4);
        let token = CancellationToken::new();
        let _watch = sink.watch_disconnect(token.clone());

        assert!(sink.send(Bytes::from_static(b"[")).await.is_ok());
        drop(body);

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(sink.send(Bytes::from_static(b"]")).await.is_err());
    }

    #[tokio::test]
    async fn test_body_ends_when_sink_and_watch_drop() {
        let (mut sink, body) = ChannelSink::channel(4);
        let watch = sink.watch_disconnect(CancellationToken::new());
        sink.send(Bytes::from_static(b"[]")).await.unwrap();
        drop(sink);
        drop(watch);

        let collected = tokio::time::timeout(
            Duration::from_secs(1),
            axum::body::to_bytes(body, usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&collected[..], b"[]");
    }
}
