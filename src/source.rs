//! Resilient feed driver
//!
//! [`Feed::spawn`] starts a background task that owns one connection at a
//! time, pulls it for frames, and survives transport failures: classified
//! retriable errors trigger replacement connections under exponential
//! backoff, silently dead connections are replaced by the watchdog, and
//! fatal errors terminate the feed. Decoded events reach the consumer
//! through a bounded buffer that never blocks the driver.
//!
//! The driver is a single task; the connection, the watchdog deadline,
//! and the stop signal all race inside one `select!`, so no two
//! activities ever touch the connection concurrently.

use crate::backoff::{BackoffConfig, BackoffState};
use crate::emitter::{
    bounded, BoundedEmitter, BoundedReceiver, EmitError, EmitOutcome, OverflowPolicy,
};
use crate::error::{FeedError, Result};
use crate::transport::{Connection, Connector, FailureClass, Received};
use crate::types::{FeedEvent, FeedState, FeedStats};
use crate::watchdog::Watchdog;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Feed behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Output buffer capacity (clamped to at least 1)
    pub capacity: usize,

    /// What to do with new events when the output buffer is full
    pub overflow: OverflowPolicy,

    /// Reconnect backoff policy
    pub backoff: BackoffConfig,

    /// Watchdog probe interval in seconds (clamped to at least 1)
    ///
    /// A connection that yields nothing for a full interval is probed
    /// for liveness and replaced if the transport reports it dead.
    pub watchdog_interval_secs: u64,

    /// Pause after an empty poll before polling again (milliseconds)
    ///
    /// Only relevant for pull-style transports that report
    /// [`Received::Idle`].
    pub idle_delay_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::default(),
            backoff: BackoffConfig::default(),
            watchdog_interval_secs: 30,
            idle_delay_ms: 250,
        }
    }
}

/// Counters shared between the driver task and the `Feed` handle
#[derive(Default)]
struct SharedStats {
    state: AtomicU8,
    reconnects: AtomicU64,
    watchdog_reconnects: AtomicU64,
}

impl SharedStats {
    fn set_state(&self, state: FeedState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> FeedState {
        FeedState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Consumer handle for a running feed
///
/// Created by [`Feed::spawn`]. Events are read with [`Feed::next`] or by
/// converting the handle into a `Stream`. Dropping the handle signals the
/// driver to stop; [`Feed::stop`] does the same but waits for the driver
/// to finish.
pub struct Feed<T> {
    id: String,
    rx: BoundedReceiver<FeedEvent<T>>,
    stop_tx: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
    stats: Arc<SharedStats>,
}

impl<T: Send + 'static> Feed<T> {
    /// Spawn a feed over the given connector
    pub fn spawn<C>(connector: C, config: FeedConfig) -> Self
    where
        C: Connector<Event = T>,
    {
        let id = format!("feed-{}", uuid::Uuid::new_v4());
        let (emitter, rx) = bounded(config.capacity, config.overflow);
        let (stop_tx, stop_rx) = oneshot::channel();
        let stats = Arc::new(SharedStats::default());

        let driver = tokio::spawn(drive(
            connector,
            config,
            emitter,
            stop_rx,
            Arc::clone(&stats),
            id.clone(),
        ));

        Self {
            id,
            rx,
            stop_tx: Some(stop_tx),
            driver: Some(driver),
            stats,
        }
    }

    /// Receive the next event
    ///
    /// Returns `Ok(Some(event))` while the feed is running, `Ok(None)`
    /// once it has completed, and the terminal error exactly once if it
    /// failed. Events queued before termination are always delivered
    /// first.
    pub async fn next(&mut self) -> Result<Option<FeedEvent<T>>> {
        self.rx.recv().await
    }

    /// Convert the handle into a `Stream` of events
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<FeedEvent<T>>> {
        futures::stream::unfold(self, |mut feed| async move {
            match feed.next().await {
                Ok(Some(event)) => Some((Ok(event), feed)),
                Ok(None) => None,
                Err(err) => Some((Err(err), feed)),
            }
        })
    }

    /// Unique feed identifier (feed-<uuid>)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> FeedState {
        self.stats.state()
    }

    /// Point-in-time counters
    pub fn stats(&self) -> FeedStats {
        FeedStats {
            state: self.stats.state(),
            emitted: self.rx.emitted(),
            dropped: self.rx.dropped(),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            watchdog_reconnects: self.stats.watchdog_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop the feed and wait for the driver task to finish
    ///
    /// Idempotent. The driver reacts at its next suspension point, even
    /// mid-backoff. Events already queued remain readable via
    /// [`Feed::next`], which then reports clean completion.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.await {
                tracing::warn!(feed = %self.id, error = %err, "Feed driver task failed");
            }
        }
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
            tracing::debug!(feed = %self.id, "Feed handle dropped; driver signalled to stop");
        }
    }
}

/// What the main select resolved to
enum Step<F> {
    Stop,
    Tick,
    Received(Result<Received<F>>),
}

/// Outcome of a reconnect sequence
enum Reconnect<C> {
    Installed(C),
    Stopped,
    Terminal(FeedError),
}

async fn drive<C>(
    mut connector: C,
    config: FeedConfig,
    emitter: BoundedEmitter<FeedEvent<C::Event>>,
    mut stop_rx: oneshot::Receiver<()>,
    stats: Arc<SharedStats>,
    id: String,
) where
    C: Connector,
{
    let transport = connector.name().to_string();

    let first = tokio::select! {
        biased;
        _ = &mut stop_rx => {
            stats.set_state(FeedState::Completed);
            emitter.complete();
            return;
        }
        result = connector.connect() => result,
    };
    let mut conn = match first {
        Ok(conn) => conn,
        Err(err) => {
            let err = FeedError::Construction {
                transport: transport.clone(),
                reason: err.to_string(),
            };
            tracing::error!(feed = %id, transport = %transport, error = %err, "Initial connection failed");
            stats.set_state(FeedState::Failed);
            emitter.fail(err);
            return;
        }
    };
    let mut epoch: u64 = 1;
    stats.set_state(FeedState::Connected);
    tracing::info!(feed = %id, transport = %transport, epoch, "Connection established");

    let mut backoff = BackoffState::new(config.backoff.clone());
    let mut watchdog = Watchdog::new(Duration::from_secs(config.watchdog_interval_secs.max(1)));
    let idle_delay = Duration::from_millis(config.idle_delay_ms);

    loop {
        let step = tokio::select! {
            biased;
            _ = &mut stop_rx => Step::Stop,
            result = tokio::time::timeout_at(watchdog.deadline(), conn.recv()) => match result {
                Ok(received) => Step::Received(received),
                Err(_) => Step::Tick,
            },
        };

        match step {
            Step::Stop => {
                conn.close().await;
                stats.set_state(FeedState::Completed);
                emitter.complete();
                tracing::info!(feed = %id, transport = %transport, "Feed stopped");
                return;
            }

            Step::Tick => {
                watchdog.re_arm();
                if conn.is_live() {
                    continue;
                }
                stats.watchdog_reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(feed = %id, transport = %transport, epoch, "Connection silent and not live; replacing");
                conn.close().await;
                stats.set_state(FeedState::Reconnecting);
                // watchdog replacement connects immediately; backoff only
                // applies if that attempt fails with a retriable error
                let outcome = reconnect(
                    &mut connector,
                    &mut backoff,
                    &mut stop_rx,
                    "connection went silent".to_string(),
                    &transport,
                    &id,
                    true,
                )
                .await;
                match outcome {
                    Reconnect::Installed(fresh) => {
                        conn = fresh;
                        epoch += 1;
                        watchdog.re_arm();
                        stats.set_state(FeedState::Connected);
                        tracing::info!(feed = %id, transport = %transport, epoch, "Connection established");
                    }
                    Reconnect::Stopped => {
                        stats.set_state(FeedState::Completed);
                        emitter.complete();
                        tracing::info!(feed = %id, transport = %transport, "Feed stopped");
                        return;
                    }
                    Reconnect::Terminal(err) => {
                        tracing::error!(feed = %id, transport = %transport, error = %err, "Feed failed");
                        stats.set_state(FeedState::Failed);
                        emitter.fail(err);
                        return;
                    }
                }
            }

            Step::Received(Ok(Received::Frame(frame))) => match connector.decode(frame) {
                Ok(Some(payload)) => {
                    backoff.reset();
                    match emitter.emit(FeedEvent::new(payload, epoch)) {
                        Ok(EmitOutcome::Queued) => {}
                        Ok(EmitOutcome::DroppedOldest) => {
                            tracing::debug!(feed = %id, "Output buffer full; dropped oldest event");
                        }
                        Ok(EmitOutcome::DroppedNewest) => {
                            tracing::debug!(feed = %id, "Output buffer full; dropped incoming event");
                        }
                        Err(EmitError::Overflow { capacity }) => {
                            conn.close().await;
                            let err = FeedError::Overflow { capacity };
                            tracing::error!(feed = %id, transport = %transport, error = %err, "Feed failed");
                            stats.set_state(FeedState::Failed);
                            emitter.fail(err);
                            return;
                        }
                        Err(EmitError::Disconnected) => {
                            tracing::debug!(feed = %id, "Consumer dropped; stopping feed");
                            conn.close().await;
                            stats.set_state(FeedState::Completed);
                            emitter.complete();
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    conn.close().await;
                    tracing::error!(feed = %id, transport = %transport, epoch, error = %err, "Frame decode failed");
                    stats.set_state(FeedState::Failed);
                    emitter.fail(err);
                    return;
                }
            },

            Step::Received(Ok(Received::Idle)) => {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        conn.close().await;
                        stats.set_state(FeedState::Completed);
                        emitter.complete();
                        tracing::info!(feed = %id, transport = %transport, "Feed stopped");
                        return;
                    }
                    _ = tokio::time::sleep(idle_delay) => {}
                }
            }

            Step::Received(Err(err)) => match connector.classify(&err) {
                FailureClass::Retriable => {
                    tracing::warn!(feed = %id, transport = %transport, epoch, error = %err, "Transport failure; reconnecting");
                    conn.close().await;
                    stats.set_state(FeedState::Reconnecting);
                    let outcome = reconnect(
                        &mut connector,
                        &mut backoff,
                        &mut stop_rx,
                        err.to_string(),
                        &transport,
                        &id,
                        false,
                    )
                    .await;
                    match outcome {
                        Reconnect::Installed(fresh) => {
                            conn = fresh;
                            epoch += 1;
                            stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            watchdog.re_arm();
                            stats.set_state(FeedState::Connected);
                            tracing::info!(feed = %id, transport = %transport, epoch, "Connection established");
                        }
                        Reconnect::Stopped => {
                            stats.set_state(FeedState::Completed);
                            emitter.complete();
                            tracing::info!(feed = %id, transport = %transport, "Feed stopped");
                            return;
                        }
                        Reconnect::Terminal(err) => {
                            tracing::error!(feed = %id, transport = %transport, error = %err, "Feed failed");
                            stats.set_state(FeedState::Failed);
                            emitter.fail(err);
                            return;
                        }
                    }
                }
                FailureClass::Fatal => {
                    conn.close().await;
                    tracing::error!(feed = %id, transport = %transport, epoch, error = %err, "Fatal transport failure");
                    stats.set_state(FeedState::Failed);
                    emitter.fail(err);
                    return;
                }
                FailureClass::Cancelled => {
                    conn.close().await;
                    tracing::info!(feed = %id, transport = %transport, epoch, "Transport reported end of stream; completing feed");
                    stats.set_state(FeedState::Completed);
                    emitter.complete();
                    return;
                }
            },
        }
    }
}

/// Run the reconnect sequence until a connection is installed or the
/// feed must terminate
///
/// With `immediate` the first attempt skips the backoff delay and the
/// attempt budget; any failure after that goes through the normal
/// classified path.
async fn reconnect<C>(
    connector: &mut C,
    backoff: &mut BackoffState,
    stop_rx: &mut oneshot::Receiver<()>,
    trigger: String,
    transport: &str,
    id: &str,
    mut immediate: bool,
) -> Reconnect<C::Conn>
where
    C: Connector,
{
    let mut last_error = trigger;
    loop {
        if !immediate {
            if backoff.exhausted() {
                return Reconnect::Terminal(FeedError::ReconnectExhausted {
                    transport: transport.to_string(),
                    attempts: backoff.attempts(),
                    last_error,
                });
            }
            let delay = backoff.next_delay();
            tracing::info!(
                feed = %id,
                transport = %transport,
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "Backing off before reconnect"
            );
            tokio::select! {
                biased;
                _ = &mut *stop_rx => return Reconnect::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        immediate = false;

        let result = tokio::select! {
            biased;
            _ = &mut *stop_rx => return Reconnect::Stopped,
            result = connector.connect() => result,
        };
        match result {
            Ok(conn) => return Reconnect::Installed(conn),
            Err(err) => match connector.classify(&err) {
                FailureClass::Retriable => {
                    tracing::warn!(feed = %id, transport = %transport, error = %err, "Reconnect attempt failed");
                    last_error = err.to_string();
                }
                FailureClass::Fatal => return Reconnect::Terminal(err),
                FailureClass::Cancelled => return Reconnect::Stopped,
            },
        }
    }
}
