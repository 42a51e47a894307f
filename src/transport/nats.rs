//! NATS JetStream transport — pull consumer over a named stream
//!
//! Each connection is a fresh pull consumer on the configured stream.
//! Messages are acknowledged as they are received; the feed offers
//! per-connection at-most-once delivery, with JetStream redelivering
//! anything unacknowledged to the replacement consumer after a reconnect.

use crate::error::{FeedError, Result};
use crate::transport::{Connection, Connector, FailureClass, Received};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;

/// Where a new consumer starts reading from the stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatsDeliverPolicy {
    /// Deliver all available messages
    All,
    /// Deliver starting from the last message
    Last,
    /// Deliver only messages published after the consumer is created
    #[default]
    New,
}

/// NATS feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsFeedConfig {
    /// NATS server URL
    pub url: String,

    /// JetStream stream to read from (must already exist)
    pub stream: String,

    /// Subject filter within the stream
    pub filter_subject: String,

    /// Durable consumer name
    ///
    /// `None` creates an ephemeral consumer per connection; a durable
    /// name lets replacement connections resume at the stored cursor.
    pub durable_name: Option<String>,

    /// Where to start reading
    pub deliver: NatsDeliverPolicy,

    /// Authentication token
    pub token: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for NatsFeedConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: "EVENTS".to_string(),
            filter_subject: ">".to_string(),
            durable_name: None,
            deliver: NatsDeliverPolicy::New,
            token: None,
            connect_timeout_secs: 10,
        }
    }
}

/// Connector backed by a NATS JetStream pull consumer
///
/// The NATS client is established once and reused across reconnects (it
/// multiplexes at the socket level); each `connect` creates a fresh
/// consumer and message stream.
pub struct NatsConnector<T> {
    config: NatsFeedConfig,
    handles: Option<(async_nats::Client, jetstream::Context)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NatsConnector<T> {
    pub fn new(config: NatsFeedConfig) -> Self {
        Self {
            config,
            handles: None,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Connector for NatsConnector<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Event = T;
    type Conn = NatsFeedConnection;

    async fn connect(&mut self) -> Result<Self::Conn> {
        let (client, jetstream) = match &self.handles {
            Some(pair) => pair.clone(),
            None => {
                let client = build_connect_options(&self.config)
                    .connect(&self.config.url)
                    .await
                    .map_err(|e| FeedError::ConnectionLost {
                        transport: "nats".to_string(),
                        reason: format!("{}: {}", self.config.url, e),
                    })?;
                tracing::info!(url = %self.config.url, "Connected to NATS");
                let jetstream = jetstream::new(client.clone());
                self.handles = Some((client.clone(), jetstream.clone()));
                (client, jetstream)
            }
        };

        let stream = jetstream
            .get_stream(&self.config.stream)
            .await
            .map_err(|e| FeedError::Subscribe {
                transport: "nats".to_string(),
                reason: format!("failed to get stream '{}': {}", self.config.stream, e),
            })?;

        let consumer_config = build_consumer_config(&self.config);
        let consumer = match &self.config.durable_name {
            Some(name) => stream
                .get_or_create_consumer(name.as_str(), consumer_config)
                .await
                .map_err(|e| FeedError::Subscribe {
                    transport: "nats".to_string(),
                    reason: format!("failed to create durable consumer '{}': {}", name, e),
                })?,
            None => stream
                .create_consumer(consumer_config)
                .await
                .map_err(|e| FeedError::Subscribe {
                    transport: "nats".to_string(),
                    reason: format!("failed to create ephemeral consumer: {}", e),
                })?,
        };

        let messages = consumer
            .messages()
            .await
            .map_err(|e| FeedError::Subscribe {
                transport: "nats".to_string(),
                reason: format!("failed to open message stream: {}", e),
            })?;

        tracing::info!(
            stream = %self.config.stream,
            filter = %self.config.filter_subject,
            durable = ?self.config.durable_name,
            "NATS subscription ready"
        );

        Ok(NatsFeedConnection {
            client,
            messages,
            ended: false,
        })
    }

    fn decode(&self, frame: jetstream::Message) -> Result<Option<T>> {
        decode_payload(&frame.payload)
    }

    fn classify(&self, error: &FeedError) -> FailureClass {
        classify(error)
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// One pull consumer's message stream
pub struct NatsFeedConnection {
    client: async_nats::Client,
    messages: jetstream::consumer::pull::Stream,
    ended: bool,
}

#[async_trait]
impl Connection for NatsFeedConnection {
    type Frame = jetstream::Message;

    async fn recv(&mut self) -> Result<Received<jetstream::Message>> {
        match self.messages.next().await {
            Some(Ok(msg)) => {
                if let Err(err) = msg.ack().await {
                    tracing::warn!(error = %err, "Failed to ack message");
                }
                Ok(Received::Frame(msg))
            }
            Some(Err(err)) => Err(FeedError::ConnectionLost {
                transport: "nats".to_string(),
                reason: err.to_string(),
            }),
            None => {
                self.ended = true;
                Err(FeedError::StreamClosed {
                    transport: "nats".to_string(),
                    reason: "message stream ended".to_string(),
                })
            }
        }
    }

    fn is_live(&self) -> bool {
        !self.ended
            && self.client.connection_state() == async_nats::connection::State::Connected
    }
}

/// Failure classification for the NATS transport
///
/// Connection and subscription failures are retriable (the broker or the
/// stream may be mid-restart); protocol and decode failures are not.
pub fn classify(error: &FeedError) -> FailureClass {
    match error {
        FeedError::ConnectionLost { .. }
        | FeedError::StreamClosed { .. }
        | FeedError::Subscribe { .. } => FailureClass::Retriable,
        _ => FailureClass::Fatal,
    }
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<Option<T>> {
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(payload)
        .map(Some)
        .map_err(|e| FeedError::Decode {
            transport: "nats".to_string(),
            reason: e.to_string(),
        })
}

/// Build a JetStream pull consumer config for the feed
fn build_consumer_config(config: &NatsFeedConfig) -> jetstream::consumer::pull::Config {
    let deliver_policy = match config.deliver {
        NatsDeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        NatsDeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
        NatsDeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
    };

    jetstream::consumer::pull::Config {
        durable_name: config.durable_name.clone(),
        filter_subject: config.filter_subject.clone(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy,
        ..Default::default()
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsFeedConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}
