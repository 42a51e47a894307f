//! Error types for a3s-feed

use thiserror::Error;

/// Errors that can occur while running a feed
///
/// Transport implementations fold their vendor errors into these variants;
/// the per-transport failure classifier then decides whether the feed
/// reconnects or terminates. Cancellation is never an error — a cancelled
/// feed completes its stream cleanly.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The very first connection attempt failed. Construction failures are
    /// treated as configuration errors and are not retried.
    #[error("Failed to establish initial connection via '{transport}': {reason}")]
    Construction {
        transport: String,
        reason: String,
    },

    /// Transport-level receive failure (socket reset, broker unreachable)
    #[error("Connection lost on '{transport}': {reason}")]
    ConnectionLost {
        transport: String,
        reason: String,
    },

    /// The remote end closed the stream or watch without a transport error
    #[error("Stream closed on '{transport}': {reason}")]
    StreamClosed {
        transport: String,
        reason: String,
    },

    /// Protocol violation reported by the transport
    #[error("Protocol error on '{transport}': {reason}")]
    Protocol {
        transport: String,
        reason: String,
    },

    /// A received frame could not be decoded. Decode failures always
    /// terminate the feed.
    #[error("Failed to decode frame from '{transport}': {reason}")]
    Decode {
        transport: String,
        reason: String,
    },

    /// Subscription setup failure raised while (re)connecting
    #[error("Failed to subscribe via '{transport}': {reason}")]
    Subscribe {
        transport: String,
        reason: String,
    },

    /// The optional reconnect attempt budget was exhausted
    #[error("Gave up reconnecting via '{transport}' after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        transport: String,
        attempts: u32,
        last_error: String,
    },

    /// The output buffer overflowed under the fail-on-overflow policy
    #[error("Feed output buffer full (capacity {capacity})")]
    Overflow {
        capacity: usize,
    },
}

impl FeedError {
    /// The transport that raised this error, if any
    pub fn transport(&self) -> Option<&str> {
        match self {
            FeedError::Construction { transport, .. }
            | FeedError::ConnectionLost { transport, .. }
            | FeedError::StreamClosed { transport, .. }
            | FeedError::Protocol { transport, .. }
            | FeedError::Decode { transport, .. }
            | FeedError::Subscribe { transport, .. }
            | FeedError::ReconnectExhausted { transport, .. } => Some(transport),
            FeedError::Overflow { .. } => None,
        }
    }
}

/// Result type alias for feed operations
pub type Result<T> = std::result::Result<T, FeedError>;
