//! NATS JetStream integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available.

#![cfg(feature = "nats")]

use a3s_feed::transport::nats::{NatsConnector, NatsDeliverPolicy, NatsFeedConfig};
use a3s_feed::{Feed, FeedConfig, FeedState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MarketTick {
    symbol: String,
    rate: f64,
}

/// Connect to the local server and provision a test stream, or return
/// None if NATS is unavailable.
async fn try_jetstream(suffix: &str) -> Option<(async_nats::Client, String, String)> {
    let client = match async_nats::connect("nats://127.0.0.1:4222").await {
        Ok(client) => client,
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            return None;
        }
    };

    let stream = format!("FEED_TEST_{}", suffix.to_uppercase());
    let subject = format!("feed.test.{}", suffix);
    let jetstream = async_nats::jetstream::new(client.clone());
    jetstream
        .get_or_create_stream(async_nats::jetstream::stream::Config {
            name: stream.clone(),
            subjects: vec![subject.clone()],
            storage: async_nats::jetstream::stream::StorageType::Memory,
            max_age: Duration::from_secs(60),
            ..Default::default()
        })
        .await
        .ok()?;

    Some((client, stream, subject))
}

macro_rules! jetstream_or_skip {
    ($suffix:expr) => {
        match try_jetstream($suffix).await {
            Some(parts) => parts,
            None => return,
        }
    };
}

#[tokio::test]
async fn test_nats_feed_delivers_published_events() {
    let (client, stream, subject) = jetstream_or_skip!("delivery");

    let connector: NatsConnector<MarketTick> = NatsConnector::new(NatsFeedConfig {
        url: "nats://127.0.0.1:4222".to_string(),
        stream,
        filter_subject: subject.clone(),
        deliver: NatsDeliverPolicy::All,
        ..Default::default()
    });
    let mut feed = Feed::spawn(connector, FeedConfig::default());
    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for n in 1..=3 {
        let tick = MarketTick {
            symbol: "USD/CNY".to_string(),
            rate: 7.35 + n as f64 * 0.01,
        };
        client
            .publish(subject.clone(), serde_json::to_vec(&tick).unwrap().into())
            .await
            .unwrap();
    }

    for n in 1..=3 {
        let event = timeout(Duration::from_secs(5), feed.next())
            .await
            .expect("timed out waiting for event")
            .unwrap()
            .unwrap();
        assert_eq!(event.payload.symbol, "USD/CNY");
        assert!((event.payload.rate - (7.35 + n as f64 * 0.01)).abs() < 1e-9);
    }
    feed.stop().await;
}

#[tokio::test]
async fn test_nats_durable_consumer_resumes_after_restart() {
    let (client, stream, subject) = jetstream_or_skip!("durable");

    let config = NatsFeedConfig {
        url: "nats://127.0.0.1:4222".to_string(),
        stream,
        filter_subject: subject.clone(),
        durable_name: Some("feed-durable-test".to_string()),
        deliver: NatsDeliverPolicy::All,
        ..Default::default()
    };

    let mut feed = Feed::spawn(
        NatsConnector::<MarketTick>::new(config.clone()),
        FeedConfig::default(),
    );
    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let tick = MarketTick {
        symbol: "EUR/USD".to_string(),
        rate: 1.08,
    };
    client
        .publish(subject.clone(), serde_json::to_vec(&tick).unwrap().into())
        .await
        .unwrap();
    let event = timeout(Duration::from_secs(5), feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.payload, tick);
    feed.stop().await;

    // a second feed on the same durable name picks up where the first
    // one stopped instead of replaying
    let second = MarketTick {
        symbol: "EUR/USD".to_string(),
        rate: 1.09,
    };
    client
        .publish(subject.clone(), serde_json::to_vec(&second).unwrap().into())
        .await
        .unwrap();

    let mut feed = Feed::spawn(
        NatsConnector::<MarketTick>::new(config),
        FeedConfig::default(),
    );
    let event = timeout(Duration::from_secs(5), feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.payload, second);
    feed.stop().await;
}
