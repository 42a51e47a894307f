//! Apache Pulsar transport — exclusive topic consumer
//!
//! Each connection is a fresh exclusive consumer on the configured
//! topic. Messages are acknowledged as they are received, so delivery is
//! at-most-once per connection; the broker redelivers anything
//! unacknowledged to the replacement consumer after a reconnect.

use crate::error::{FeedError, Result};
use crate::transport::{Connection, Connector, FailureClass, Received};
use async_trait::async_trait;
use futures::TryStreamExt;
use pulsar::{Consumer, ConsumerOptions, Pulsar, SubType, TokioExecutor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Pulsar feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsarFeedConfig {
    /// Broker service URL
    pub url: String,

    /// Topic to consume
    pub topic: String,

    /// Subscription name
    ///
    /// Replacement consumers rejoin the same subscription, so the broker
    /// resumes delivery at the subscription cursor.
    pub subscription: String,

    /// Consumer name reported to the broker
    pub consumer_name: Option<String>,
}

impl Default for PulsarFeedConfig {
    fn default() -> Self {
        Self {
            url: "pulsar://localhost:6650".to_string(),
            topic: "events".to_string(),
            subscription: "a3s-feed".to_string(),
            consumer_name: None,
        }
    }
}

/// Connector backed by an exclusive Pulsar consumer
///
/// The Pulsar client is established once and reused across reconnects
/// (it multiplexes broker connections internally); each `connect`
/// creates a fresh consumer on the subscription.
pub struct PulsarConnector<T> {
    config: PulsarFeedConfig,
    client: Option<Pulsar<TokioExecutor>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PulsarConnector<T> {
    pub fn new(config: PulsarFeedConfig) -> Self {
        Self {
            config,
            client: None,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Connector for PulsarConnector<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Event = T;
    type Conn = PulsarFeedConnection;

    async fn connect(&mut self) -> Result<Self::Conn> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let client = Pulsar::builder(self.config.url.as_str(), TokioExecutor)
                    .build()
                    .await
                    .map_err(|e| FeedError::ConnectionLost {
                        transport: "pulsar".to_string(),
                        reason: format!("{}: {}", self.config.url, e),
                    })?;
                tracing::info!(url = %self.config.url, "Connected to Pulsar");
                self.client = Some(client.clone());
                client
            }
        };

        let mut builder = client
            .consumer()
            .with_topic(self.config.topic.as_str())
            .with_subscription(self.config.subscription.as_str())
            .with_subscription_type(SubType::Exclusive)
            .with_options(ConsumerOptions::default());
        if let Some(ref name) = self.config.consumer_name {
            builder = builder.with_consumer_name(name.as_str());
        }

        let consumer = builder
            .build::<Vec<u8>>()
            .await
            .map_err(|e| FeedError::Subscribe {
                transport: "pulsar".to_string(),
                reason: format!(
                    "failed to subscribe to '{}' as '{}': {}",
                    self.config.topic, self.config.subscription, e
                ),
            })?;

        tracing::info!(
            topic = %self.config.topic,
            subscription = %self.config.subscription,
            "Pulsar subscription ready"
        );

        Ok(PulsarFeedConnection { consumer })
    }

    fn decode(&self, frame: Vec<u8>) -> Result<Option<T>> {
        decode_payload(&frame)
    }

    fn classify(&self, error: &FeedError) -> FailureClass {
        classify(error)
    }

    fn name(&self) -> &str {
        "pulsar"
    }
}

/// One exclusive consumer on the subscription
pub struct PulsarFeedConnection {
    consumer: Consumer<Vec<u8>, TokioExecutor>,
}

#[async_trait]
impl Connection for PulsarFeedConnection {
    type Frame = Vec<u8>;

    async fn recv(&mut self) -> Result<Received<Vec<u8>>> {
        match self.consumer.try_next().await {
            Ok(Some(msg)) => {
                let payload = msg.payload.data.clone();
                if let Err(err) = self.consumer.ack(&msg).await {
                    tracing::warn!(error = %err, "Failed to ack Pulsar message");
                }
                Ok(Received::Frame(payload))
            }
            Ok(None) => Err(FeedError::StreamClosed {
                transport: "pulsar".to_string(),
                reason: "consumer stream ended".to_string(),
            }),
            Err(err) => Err(fold_error(err)),
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.consumer.close().await {
            tracing::debug!(error = %err, "Pulsar consumer close failed");
        }
    }
}

/// Failure classification for the Pulsar transport
///
/// Connection-level failures and subscription setup failures are
/// retriable; protocol and decode errors are not.
pub fn classify(error: &FeedError) -> FailureClass {
    match error {
        FeedError::ConnectionLost { .. }
        | FeedError::StreamClosed { .. }
        | FeedError::Subscribe { .. } => FailureClass::Retriable,
        _ => FailureClass::Fatal,
    }
}

fn fold_error(err: pulsar::Error) -> FeedError {
    match err {
        pulsar::Error::Connection(e) => FeedError::ConnectionLost {
            transport: "pulsar".to_string(),
            reason: e.to_string(),
        },
        pulsar::Error::ServiceDiscovery(e) => FeedError::ConnectionLost {
            transport: "pulsar".to_string(),
            reason: e.to_string(),
        },
        other => FeedError::Protocol {
            transport: "pulsar".to_string(),
            reason: other.to_string(),
        },
    }
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<Option<T>> {
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(payload)
        .map(Some)
        .map_err(|e| FeedError::Decode {
            transport: "pulsar".to_string(),
            reason: e.to_string(),
        })
}
