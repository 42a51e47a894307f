//! Transport traits — the core abstraction for feed backends
//!
//! All feed backends (Kubernetes, NATS, Pulsar, Redis, WebSocket,
//! in-memory) implement `Connector` to provide a uniform API for
//! establishing connections, decoding frames, and classifying failures.
//! The feed driver in [`crate::source`] owns the reconnect loop; a
//! transport only has to say how to connect once and what its errors mean.

use crate::error::{FeedError, Result};
use async_trait::async_trait;

pub mod memory;

#[cfg(feature = "kubernetes")]
pub mod kubernetes;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "pulsar")]
pub mod pulsar;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "websocket")]
pub mod websocket;

/// What a single receive produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<F> {
    /// A raw frame to hand to the decoder
    Frame(F),
    /// The poll returned without data (blocking-read timeout, keepalive)
    ///
    /// Distinct from a decoded-to-nothing frame: `Idle` means the
    /// transport had nothing to offer, and the driver waits briefly
    /// before polling again.
    Idle,
}

/// How a failure should be handled by the feed driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Replace the connection under the backoff policy
    Retriable,
    /// Terminate the feed with the error
    Fatal,
    /// Terminate the feed cleanly, without an error
    ///
    /// Used when a transport observes an intentional shutdown, for
    /// example the in-process producer dropping its sender.
    Cancelled,
}

/// A live connection to an external event stream
///
/// One connection maps to one subscription, watch, or socket. The driver
/// pulls it with `recv` until it fails or the watchdog declares it dead,
/// then closes it and asks the [`Connector`] for a replacement.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Raw frame type produced by this transport
    type Frame: Send;

    /// Receive the next frame
    ///
    /// Must be cancel-safe: the driver races this future against its
    /// shutdown signal and the watchdog deadline, and may drop it
    /// mid-flight without losing transport state.
    async fn recv(&mut self) -> Result<Received<Self::Frame>>;

    /// Whether the transport still considers this connection usable
    ///
    /// Polled by the watchdog when the connection has been silent for a
    /// full interval. Default implementation reports live; transports
    /// with a native liveness signal should override this.
    fn is_live(&self) -> bool {
        true
    }

    /// Release transport resources
    ///
    /// Called exactly once by the driver before the connection is
    /// discarded. Default implementation relies on drop.
    async fn close(&mut self) {}
}

/// Factory and policy bundle for one feed backend
///
/// The connector is invoked for the initial connection and for every
/// replacement. It also owns the two pure decisions the driver delegates:
/// turning raw frames into events and classifying failures.
#[async_trait]
pub trait Connector: Send + 'static {
    /// Decoded event type delivered to consumers
    type Event: Send + 'static;

    /// Connection type produced by this connector
    type Conn: Connection;

    /// Establish a fresh connection
    ///
    /// A failure on the very first call terminates the feed as a
    /// construction error; failures during reconnection go through
    /// `classify` like any other.
    async fn connect(&mut self) -> Result<Self::Conn>;

    /// Decode a raw frame into an event
    ///
    /// `Ok(None)` skips the frame (bookmarks, heartbeats, empty
    /// payloads). Errors terminate the feed: a frame the decoder cannot
    /// understand will not become understandable by reconnecting.
    fn decode(&self, frame: <Self::Conn as Connection>::Frame) -> Result<Option<Self::Event>>;

    /// Classify a transport failure
    ///
    /// Pure function of the error; the driver consults it to decide
    /// between reconnecting and terminating.
    fn classify(&self, error: &FeedError) -> FailureClass;

    /// Transport name (e.g., "kubernetes", "memory", "redis")
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_idle_is_not_a_frame() {
        let received: Received<String> = Received::Idle;
        assert_ne!(received, Received::Frame("data".to_string()));
    }

    #[test]
    fn test_failure_class_is_copy() {
        let class = FailureClass::Retriable;
        let copied = class;
        assert_eq!(class, copied);
    }
}
