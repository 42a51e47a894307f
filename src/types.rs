//! Core types for the a3s-feed system
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event delivered by a feed, wrapped with delivery context
///
/// The payload is whatever the transport decoder produced; the envelope
/// records which connection epoch it arrived on and when it was received
/// locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent<T> {
    /// Decoded event payload
    pub payload: T,

    /// Connection epoch this event arrived on
    ///
    /// Starts at 1 for the initial connection and increments on every
    /// replacement connection. Consumers that care about ordering across
    /// reconnects can detect gaps by watching this value change.
    pub epoch: u64,

    /// Local receive time (UTC)
    pub received_at: DateTime<Utc>,
}

impl<T> FeedEvent<T> {
    /// Wrap a payload with the current receive time
    pub fn new(payload: T, epoch: u64) -> Self {
        Self {
            payload,
            epoch,
            received_at: Utc::now(),
        }
    }
}

/// Lifecycle state of a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum FeedState {
    /// Spawned but not yet connected
    Idle = 0,
    /// A connection is established and being pulled
    Connected = 1,
    /// Waiting out a backoff delay or re-running the connection factory
    Reconnecting = 2,
    /// Terminated with an error
    Failed = 3,
    /// Terminated cleanly (cancellation or end of stream)
    Completed = 4,
}

impl FeedState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => FeedState::Connected,
            2 => FeedState::Reconnecting,
            3 => FeedState::Failed,
            4 => FeedState::Completed,
            _ => FeedState::Idle,
        }
    }

    /// Whether the feed has terminated (no more events will arrive)
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedState::Failed | FeedState::Completed)
    }
}

/// Point-in-time counters for a running feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    /// Current lifecycle state
    pub state: FeedState,

    /// Events queued for the consumer
    pub emitted: u64,

    /// Events discarded by the overflow policy
    pub dropped: u64,

    /// Replacement connections established after classified failures
    pub reconnects: u64,

    /// Replacement connections forced by the watchdog
    pub watchdog_reconnects: u64,
}
