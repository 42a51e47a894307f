//! In-memory transport over a tokio broadcast channel
//!
//! Useful for tests and for wiring in-process producers to feed consumers
//! without an external broker. Reconnection semantics are real: a lagged
//! receiver surfaces as a retriable connection loss, and the replacement
//! connection resumes at the channel tail (intervening events are lost,
//! like any broker without replay).

use crate::error::{FeedError, Result};
use crate::transport::{Connection, Connector, FailureClass, Received};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Connector backed by an in-process broadcast channel
///
/// Holds a receiver template; every `connect` resubscribes at the current
/// channel tail. When all senders are dropped the feed completes cleanly.
pub struct MemoryConnector<T> {
    template: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> MemoryConnector<T> {
    /// Create a channel and a connector attached to it
    ///
    /// Returns the sender for publishing alongside the connector.
    /// `capacity` bounds the broadcast ring; slow feeds lag and reconnect
    /// rather than block the sender.
    pub fn channel(capacity: usize) -> (broadcast::Sender<T>, Self) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (tx, Self { template: rx })
    }

    /// Attach to an existing broadcast channel
    pub fn from_receiver(template: broadcast::Receiver<T>) -> Self {
        Self { template }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Connector for MemoryConnector<T> {
    type Event = T;
    type Conn = MemoryConnection<T>;

    async fn connect(&mut self) -> Result<Self::Conn> {
        Ok(MemoryConnection {
            stream: BroadcastStream::new(self.template.resubscribe()),
        })
    }

    fn decode(&self, frame: T) -> Result<Option<T>> {
        Ok(Some(frame))
    }

    fn classify(&self, error: &FeedError) -> FailureClass {
        classify(error)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// One subscription to the broadcast channel
pub struct MemoryConnection<T> {
    stream: BroadcastStream<T>,
}

#[async_trait]
impl<T: Clone + Send + 'static> Connection for MemoryConnection<T> {
    type Frame = T;

    async fn recv(&mut self) -> Result<Received<T>> {
        match self.stream.next().await {
            Some(Ok(value)) => Ok(Received::Frame(value)),
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                Err(FeedError::ConnectionLost {
                    transport: "memory".to_string(),
                    reason: format!("receiver lagged behind by {} events", skipped),
                })
            }
            None => Err(FeedError::StreamClosed {
                transport: "memory".to_string(),
                reason: "all senders dropped".to_string(),
            }),
        }
    }
}

/// Failure classification for the in-memory transport
///
/// Lag is retriable (resubscribing skips to the tail); a closed channel
/// means the producer hung up on purpose, so the feed completes.
pub fn classify(error: &FeedError) -> FailureClass {
    match error {
        FeedError::ConnectionLost { .. } => FailureClass::Retriable,
        FeedError::StreamClosed { .. } => FailureClass::Cancelled,
        _ => FailureClass::Fatal,
    }
}
