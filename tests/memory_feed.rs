//! In-memory transport integration tests
//!
//! End-to-end feed lifecycle over the broadcast transport: delivery
//! order, lag-induced reconnection, clean completion when the producer
//! hangs up, stats, and the stream adapter.

use a3s_feed::transport::memory::MemoryConnector;
use a3s_feed::{BackoffConfig, Feed, FeedConfig, FeedState};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

fn fast_config() -> FeedConfig {
    FeedConfig {
        backoff: BackoffConfig::fixed(10),
        ..Default::default()
    }
}

async fn next_payload<T: Send + 'static>(feed: &mut Feed<T>) -> Option<T> {
    timeout(Duration::from_secs(2), feed.next())
        .await
        .expect("timed out waiting for event")
        .unwrap()
        .map(|event| event.payload)
}

// ─── Delivery ────────────────────────────────────────────────────

#[tokio::test]
async fn test_delivers_published_events_in_order() {
    let (tx, connector) = MemoryConnector::channel(64);
    let mut feed = Feed::spawn(connector, fast_config());

    // wait for the subscription before publishing
    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    for n in 1..=10 {
        tx.send(n).unwrap();
    }
    for expected in 1..=10 {
        assert_eq!(next_payload(&mut feed).await, Some(expected));
    }
    feed.stop().await;
}

#[tokio::test]
async fn test_events_carry_envelope_context() {
    let (tx, connector) = MemoryConnector::channel(8);
    let mut feed = Feed::spawn(connector, fast_config());

    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let before = chrono::Utc::now();
    tx.send("deploy finished".to_string()).unwrap();

    let event = timeout(Duration::from_secs(2), feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.payload, "deploy finished");
    assert_eq!(event.epoch, 1);
    assert!(event.received_at >= before);
    feed.stop().await;
}

// ─── Reconnection ────────────────────────────────────────────────

#[tokio::test]
async fn test_lagged_consumer_reconnects_and_resumes() {
    // a tiny broadcast ring forces a lag error once the feed falls
    // behind; the replacement subscription resumes at the tail
    let (tx, connector) = MemoryConnector::channel(2);
    let mut feed = Feed::spawn(connector, fast_config());

    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // flood well past the ring capacity before the driver can drain
    for n in 0..200 {
        tx.send(n).unwrap();
    }

    // keep a slow trickle coming so the recovered feed has something
    // to deliver
    let producer = tokio::spawn(async move {
        for n in 1000..1010 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if tx.send(n).is_err() {
                break;
            }
        }
        tx
    });

    // the feed must keep delivering despite the lag in between
    let mut seen = Vec::new();
    for _ in 0..5 {
        if let Some(n) = next_payload(&mut feed).await {
            seen.push(n);
        }
    }
    assert_eq!(seen.len(), 5);
    // order is preserved across the gap
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted);

    let tx = producer.await.unwrap();
    feed.stop().await;
    drop(tx);
}

// ─── Completion ──────────────────────────────────────────────────

#[tokio::test]
async fn test_producer_hangup_completes_the_feed() {
    let (tx, connector) = MemoryConnector::channel(8);
    let mut feed = Feed::spawn(connector, fast_config());

    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tx.send(41).unwrap();
    tx.send(42).unwrap();
    drop(tx);

    assert_eq!(next_payload(&mut feed).await, Some(41));
    assert_eq!(next_payload(&mut feed).await, Some(42));
    // a closed channel is a cancellation, not a failure
    assert_eq!(next_payload(&mut feed).await, None);
    assert_eq!(feed.state(), FeedState::Completed);
}

#[tokio::test]
async fn test_stats_reflect_delivery() {
    let (tx, connector) = MemoryConnector::channel(16);
    let mut feed = Feed::spawn(connector, fast_config());

    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for n in 0..4 {
        tx.send(n).unwrap();
    }
    for _ in 0..4 {
        next_payload(&mut feed).await.unwrap();
    }

    let stats = feed.stats();
    assert_eq!(stats.state, FeedState::Connected);
    assert_eq!(stats.emitted, 4);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.reconnects, 0);
    feed.stop().await;
}

#[tokio::test]
async fn test_feed_id_is_unique() {
    let (_tx1, c1) = MemoryConnector::<u32>::channel(4);
    let (_tx2, c2) = MemoryConnector::<u32>::channel(4);
    let feed1 = Feed::spawn(c1, fast_config());
    let feed2 = Feed::spawn(c2, fast_config());

    assert!(feed1.id().starts_with("feed-"));
    assert_ne!(feed1.id(), feed2.id());
}

// ─── Stream adapter ──────────────────────────────────────────────

#[tokio::test]
async fn test_into_stream_yields_events_then_ends() {
    let (tx, connector) = MemoryConnector::channel(8);
    let feed = Feed::spawn(connector, fast_config());

    while feed.state() != FeedState::Connected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tx.send("a".to_string()).unwrap();
    tx.send("b".to_string()).unwrap();
    drop(tx);

    let events: Vec<_> = feed
        .into_stream()
        .map(|item| item.unwrap().payload)
        .collect()
        .await;
    assert_eq!(events, vec!["a".to_string(), "b".to_string()]);
}
