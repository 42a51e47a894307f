//! # a3s-feed
//!
//! Resilient, self-healing event feeds over external streams for the A3S
//! ecosystem.
//!
//! ## Overview
//!
//! `a3s-feed` turns a flaky external event stream (a Kubernetes watch, a
//! broker subscription, a WebSocket) into a feed that stays up: transport
//! failures are classified, retriable ones trigger replacement
//! connections under exponential backoff, silently dead connections are
//! detected by a watchdog, and a bounded output buffer with a
//! configurable overflow policy keeps a slow consumer from ever blocking
//! the feed.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_feed::{Feed, FeedConfig};
//! use a3s_feed::transport::memory::MemoryConnector;
//!
//! # async fn example() -> a3s_feed::Result<()> {
//! // Create an in-memory feed; the sender publishes into it
//! let (tx, connector) = MemoryConnector::channel(64);
//! let mut feed = Feed::spawn(connector, FeedConfig::default());
//!
//! tx.send("deploy started".to_string()).ok();
//!
//! while let Some(event) = feed.next().await? {
//!     println!("[epoch {}] {}", event.epoch, event.payload);
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **memory** — in-process broadcast channel for testing and local wiring
//! - **kubernetes** — resource watch via the Kubernetes API (feature `kubernetes`)
//! - **nats** — NATS JetStream pull consumer (feature `nats`)
//! - **pulsar** — Apache Pulsar subscription (feature `pulsar`)
//! - **redis** — Redis Streams blocking reads (feature `redis`)
//! - **websocket** — JSON frames over WebSocket (feature `websocket`)
//!
//! ## Architecture
//!
//! - **Connector** trait — connection factory plus the two pure decisions:
//!   frame decoding and failure classification
//! - **Connection** trait — one live subscription, watch, or socket
//! - **Feed** — consumer handle over a single driver task that owns the
//!   reconnect state machine
//! - **FeedEvent** — envelope carrying the payload, its connection epoch,
//!   and the local receive time

pub mod backoff;
pub mod emitter;
pub mod error;
pub mod source;
pub mod transport;
pub mod types;
pub mod watchdog;

// Re-export core types
pub use backoff::{BackoffConfig, BackoffState};
pub use emitter::{bounded, BoundedEmitter, BoundedReceiver, EmitError, EmitOutcome, OverflowPolicy};
pub use error::{FeedError, Result};
pub use source::{Feed, FeedConfig};
pub use transport::{Connection, Connector, FailureClass, Received};
pub use types::{FeedEvent, FeedState, FeedStats};
pub use watchdog::Watchdog;

// Re-export transports for convenience
pub use transport::memory::MemoryConnector;

#[cfg(feature = "kubernetes")]
pub use transport::kubernetes::{KubeConnector, KubeWatchConfig, ResourceAction, ResourceEvent};
#[cfg(feature = "nats")]
pub use transport::nats::{NatsConnector, NatsDeliverPolicy, NatsFeedConfig};
#[cfg(feature = "pulsar")]
pub use transport::pulsar::{PulsarConnector, PulsarFeedConfig};
#[cfg(feature = "redis")]
pub use transport::redis::{RedisStreamConfig, RedisStreamConnector};
#[cfg(feature = "websocket")]
pub use transport::websocket::{WebSocketConnector, WsFrame};
