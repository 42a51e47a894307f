//! WebSocket transport — JSON frames over a socket feed
//!
//! Each connection is one WebSocket. Text and binary frames decode as
//! JSON; control frames are idle polls. A close frame or a dropped
//! socket is a retriable stream-closed condition, so the feed redials
//! under backoff rather than terminating.

use crate::error::{FeedError, Result};
use crate::transport::{Connection, Connector, FailureClass, Received};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// A data-bearing WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Bytes),
}

impl WsFrame {
    fn as_bytes(&self) -> &[u8] {
        match self {
            WsFrame::Text(text) => text.as_bytes(),
            WsFrame::Binary(bytes) => bytes,
        }
    }
}

/// Connector that redials one WebSocket endpoint
pub struct WebSocketConnector<T> {
    url: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> WebSocketConnector<T> {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Connector for WebSocketConnector<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Event = T;
    type Conn = WebSocketConnection;

    async fn connect(&mut self) -> Result<Self::Conn> {
        let (socket, response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| FeedError::ConnectionLost {
                    transport: "websocket".to_string(),
                    reason: format!("{}: {}", self.url, e),
                })?;

        tracing::info!(url = %self.url, status = %response.status(), "WebSocket connected");

        Ok(WebSocketConnection {
            url: self.url.clone(),
            socket,
            ended: false,
        })
    }

    fn decode(&self, frame: WsFrame) -> Result<Option<T>> {
        let payload = frame.as_bytes();
        if payload.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| FeedError::Decode {
                transport: "websocket".to_string(),
                reason: e.to_string(),
            })
    }

    fn classify(&self, error: &FeedError) -> FailureClass {
        classify(error)
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

/// One open socket
pub struct WebSocketConnection {
    url: String,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ended: bool,
}

#[async_trait]
impl Connection for WebSocketConnection {
    type Frame = WsFrame;

    async fn recv(&mut self) -> Result<Received<WsFrame>> {
        match self.socket.next().await {
            Some(Ok(Message::Text(text))) => Ok(Received::Frame(WsFrame::Text(text))),
            Some(Ok(Message::Binary(data))) => {
                Ok(Received::Frame(WsFrame::Binary(Bytes::from(data))))
            }
            // tungstenite queues the pong reply internally; nothing to do
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                Ok(Received::Idle)
            }
            Some(Ok(Message::Close(frame))) => {
                self.ended = true;
                Err(FeedError::StreamClosed {
                    transport: "websocket".to_string(),
                    reason: match frame {
                        Some(frame) => format!("close frame: {} {}", frame.code, frame.reason),
                        None => "close frame".to_string(),
                    },
                })
            }
            Some(Err(err)) => {
                self.ended = true;
                Err(FeedError::ConnectionLost {
                    transport: "websocket".to_string(),
                    reason: format!("{}: {}", self.url, err),
                })
            }
            None => {
                self.ended = true;
                Err(FeedError::StreamClosed {
                    transport: "websocket".to_string(),
                    reason: "socket stream ended".to_string(),
                })
            }
        }
    }

    fn is_live(&self) -> bool {
        !self.ended
    }

    async fn close(&mut self) {
        if !self.ended {
            if let Err(err) = self.socket.close(None).await {
                tracing::debug!(url = %self.url, error = %err, "WebSocket close failed");
            }
        }
    }
}

/// Failure classification for the WebSocket transport
///
/// Dropped or closed sockets are retriable (the endpoint redials);
/// protocol violations and undecodable frames are not.
pub fn classify(error: &FeedError) -> FailureClass {
    match error {
        FeedError::ConnectionLost { .. } | FeedError::StreamClosed { .. } => {
            FailureClass::Retriable
        }
        _ => FailureClass::Fatal,
    }
}
