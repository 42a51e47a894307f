//! Redis Streams transport — blocking XREAD cursor
//!
//! Each connection is a multiplexed Redis connection issuing `XREAD
//! BLOCK` against one stream key. The last-delivered entry id is shared
//! between the connector and its connections, so a replacement
//! connection resumes exactly where the previous one stopped; entries
//! read but not yet drained when a connection dies are re-read
//! (replay-from-offset, so re-delivery is possible).

use crate::error::{FeedError, Result};
use crate::transport::{Connection, Connector, FailureClass, Received};
use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Redis stream feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStreamConfig {
    /// Redis connection URL
    pub url: String,

    /// Stream key to read
    pub stream: String,

    /// Entry field holding the JSON payload
    pub payload_field: String,

    /// Where to start reading: `"$"` for new entries only, `"0"` for
    /// the full stream, or a concrete entry id
    pub start_id: String,

    /// `XREAD BLOCK` timeout in milliseconds
    ///
    /// A block that expires without entries is an idle poll, not a
    /// failure. Keep this below the feed's watchdog interval.
    pub block_ms: u64,

    /// Maximum entries fetched per read
    pub batch_size: usize,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            stream: "events".to_string(),
            payload_field: "payload".to_string(),
            start_id: "$".to_string(),
            block_ms: 5_000,
            batch_size: 64,
        }
    }
}

/// One raw stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Option<Vec<u8>>,
}

/// Connector backed by a Redis stream cursor
pub struct RedisStreamConnector<T> {
    config: RedisStreamConfig,
    client: Option<redis::Client>,
    // last delivered entry id, shared with live connections so
    // reconnects resume at the cursor
    cursor: Arc<Mutex<String>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RedisStreamConnector<T> {
    pub fn new(config: RedisStreamConfig) -> Self {
        let cursor = Arc::new(Mutex::new(config.start_id.clone()));
        Self {
            config,
            client: None,
            cursor,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Connector for RedisStreamConnector<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Event = T;
    type Conn = RedisStreamConnection;

    async fn connect(&mut self) -> Result<Self::Conn> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let client =
                    redis::Client::open(self.config.url.as_str()).map_err(|e| {
                        FeedError::ConnectionLost {
                            transport: "redis".to_string(),
                            reason: format!("{}: {}", self.config.url, e),
                        }
                    })?;
                self.client = Some(client.clone());
                client
            }
        };

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| FeedError::ConnectionLost {
                transport: "redis".to_string(),
                reason: format!("{}: {}", self.config.url, e),
            })?;

        // "$" only means "new entries" at the moment the cursor is
        // created; resolve it once so reconnects do not skip ahead
        if lock_cursor(&self.cursor).as_str() == "$" {
            *lock_cursor(&self.cursor) = "0-0".to_string();
            let mut probe = conn.clone();
            let last: Option<String> = last_entry_id(&mut probe, &self.config.stream).await?;
            if let Some(id) = last {
                *lock_cursor(&self.cursor) = id;
            }
        }

        tracing::info!(
            stream = %self.config.stream,
            cursor = %lock_cursor(&self.cursor),
            "Redis stream read established"
        );

        Ok(RedisStreamConnection {
            conn,
            stream: self.config.stream.clone(),
            payload_field: self.config.payload_field.clone(),
            cursor: Arc::clone(&self.cursor),
            block_ms: self.config.block_ms,
            batch_size: self.config.batch_size.max(1),
            pending: VecDeque::new(),
        })
    }

    fn decode(&self, frame: StreamEntry) -> Result<Option<T>> {
        let payload = match frame.payload {
            // entries without the payload field belong to someone else
            None => return Ok(None),
            Some(bytes) if bytes.is_empty() => return Ok(None),
            Some(bytes) => bytes,
        };
        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| FeedError::Decode {
                transport: "redis".to_string(),
                reason: format!("entry {}: {}", frame.id, e),
            })
    }

    fn classify(&self, error: &FeedError) -> FailureClass {
        classify(error)
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// One multiplexed connection reading the stream
pub struct RedisStreamConnection {
    conn: redis::aio::MultiplexedConnection,
    stream: String,
    payload_field: String,
    cursor: Arc<Mutex<String>>,
    block_ms: u64,
    batch_size: usize,
    pending: VecDeque<StreamEntry>,
}

#[async_trait]
impl Connection for RedisStreamConnection {
    type Frame = StreamEntry;

    async fn recv(&mut self) -> Result<Received<StreamEntry>> {
        if let Some(entry) = self.pending.pop_front() {
            *lock_cursor(&self.cursor) = entry.id.clone();
            return Ok(Received::Frame(entry));
        }

        let cursor = lock_cursor(&self.cursor).clone();
        let options = StreamReadOptions::default()
            .block(self.block_ms as usize)
            .count(self.batch_size);
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[self.stream.as_str()], &[cursor.as_str()], &options)
            .await
            .map_err(fold_error)?;

        for key in reply.keys {
            for entry in key.ids {
                let payload = match entry.map.get(&self.payload_field) {
                    Some(value) => Some(redis::from_redis_value(value).map_err(fold_error)?),
                    None => None,
                };
                self.pending.push_back(StreamEntry {
                    id: entry.id,
                    payload,
                });
            }
        }

        match self.pending.pop_front() {
            Some(entry) => {
                *lock_cursor(&self.cursor) = entry.id.clone();
                Ok(Received::Frame(entry))
            }
            // the block expired with nothing to read
            None => Ok(Received::Idle),
        }
    }
}

/// Failure classification for the Redis transport
///
/// Connection failures surface after the client's own retry layer gives
/// up and are still retriable at the feed level; decode failures are
/// not.
pub fn classify(error: &FeedError) -> FailureClass {
    match error {
        FeedError::ConnectionLost { .. }
        | FeedError::StreamClosed { .. }
        | FeedError::Subscribe { .. } => FailureClass::Retriable,
        _ => FailureClass::Fatal,
    }
}

fn fold_error(err: redis::RedisError) -> FeedError {
    if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
        FeedError::ConnectionLost {
            transport: "redis".to_string(),
            reason: err.to_string(),
        }
    } else {
        FeedError::Protocol {
            transport: "redis".to_string(),
            reason: err.to_string(),
        }
    }
}

async fn last_entry_id(
    conn: &mut redis::aio::MultiplexedConnection,
    stream: &str,
) -> Result<Option<String>> {
    let reply: redis::streams::StreamRangeReply = conn
        .xrevrange_count(stream, "+", "-", 1)
        .await
        .map_err(fold_error)?;
    Ok(reply.ids.into_iter().next().map(|entry| entry.id))
}

fn lock_cursor(cursor: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Order {
        id: u64,
    }

    fn connector() -> RedisStreamConnector<Order> {
        RedisStreamConnector::new(RedisStreamConfig::default())
    }

    #[test]
    fn test_decode_entry_json() {
        let decoded = connector()
            .decode(StreamEntry {
                id: "1-0".to_string(),
                payload: Some(br#"{"id": 12}"#.to_vec()),
            })
            .unwrap();
        assert_eq!(decoded, Some(Order { id: 12 }));
    }

    #[test]
    fn test_decode_missing_field_is_skipped() {
        let decoded = connector()
            .decode(StreamEntry {
                id: "1-0".to_string(),
                payload: None,
            })
            .unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_decode_invalid_json_names_the_entry() {
        let err = connector()
            .decode(StreamEntry {
                id: "7-3".to_string(),
                payload: Some(b"nope".to_vec()),
            })
            .unwrap_err();
        assert!(matches!(err, FeedError::Decode { .. }));
        assert!(err.to_string().contains("7-3"));
    }

    #[test]
    fn test_cursor_starts_at_configured_id() {
        let connector = RedisStreamConnector::<Order>::new(RedisStreamConfig {
            start_id: "42-0".to_string(),
            ..Default::default()
        });
        assert_eq!(*lock_cursor(&connector.cursor), "42-0");
    }

    #[test]
    fn test_classify_table() {
        let retriable = FeedError::ConnectionLost {
            transport: "redis".to_string(),
            reason: "broken pipe".to_string(),
        };
        assert_eq!(classify(&retriable), FailureClass::Retriable);

        let fatal = FeedError::Decode {
            transport: "redis".to_string(),
            reason: "bad entry".to_string(),
        };
        assert_eq!(classify(&fatal), FailureClass::Fatal);
    }
}
