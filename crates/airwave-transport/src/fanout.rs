//! Broadcast fan-out to live connections.
//!
//! Every registered connection gets a bounded outbox and a writer task that
//! owns the connection. Broadcasting only pushes into outboxes and never
//! waits on a socket, so one stalled listener cannot hold up the rest: a
//! full outbox, a failed write or a write that overruns its deadline drops
//! that connection and nobody else notices.

use crate::traits::{Connection, ConnectionId, TransportError};
use airwave_core::{Event, EventBus, EventHandler, HandlerError, SubscriptionId};
use airwave_protocol::ServerFrame;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Fan-out configuration.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Frames queued per connection before it counts as a slow consumer.
    pub outbox_capacity: usize,
    /// Deadline for a single write.
    pub send_timeout: Duration,
    /// Maximum number of live connections.
    pub max_connections: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_connections: 10_000,
        }
    }
}

struct Outbox {
    tx: mpsc::Sender<Arc<ServerFrame>>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    stale: AtomicU64,
    slow_consumers: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    connections: DashMap<ConnectionId, Outbox>,
    /// Slots claimed against `max_connections`, reserved before insertion.
    live: AtomicUsize,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    counters: Counters,
    config: FanoutConfig,
}

/// Delivers frames to every live connection.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Create a broadcaster with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(FanoutConfig::default())
    }

    /// Create a broadcaster with custom configuration.
    #[must_use]
    pub fn with_config(config: FanoutConfig) -> Self {
        info!("Creating broadcaster with config: {:?}", config);
        Self {
            inner: Arc::new(Inner {
                connections: DashMap::new(),
                live: AtomicUsize::new(0),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                counters: Counters::default(),
                config,
            }),
        }
    }

    /// Subscribe to every event kind on `bus` and forward each event as a frame.
    pub fn attach(&self, bus: &EventBus) -> SubscriptionId {
        bus.subscribe_all(Arc::new(BroadcastHandler {
            broadcaster: self.clone(),
        }))
    }

    /// Take ownership of a connection and start its writer.
    ///
    /// `greeting` is queued before the connection becomes visible to
    /// broadcasts, so it is always the first frame written. The connection
    /// limit is exact: concurrent registrations race for slots, not for the
    /// map length.
    ///
    /// # Errors
    ///
    /// Fails after shutdown or when the connection limit is reached.
    pub fn register<C: Connection>(
        &self,
        conn: C,
        greeting: Option<ServerFrame>,
    ) -> Result<ConnectionId, TransportError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        let max = inner.config.max_connections;
        if inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(TransportError::LimitReached(max));
        }

        let id = conn.id().clone();
        let (tx, rx) = mpsc::channel(inner.config.outbox_capacity.max(1));
        if let Some(frame) = greeting {
            if tx.try_send(Arc::new(frame)).is_err() {
                inner.live.fetch_sub(1, Ordering::AcqRel);
                return Err(TransportError::SlowConsumer);
            }
        }

        let cancel = inner.shutdown.child_token();
        match inner.connections.entry(id.clone()) {
            Entry::Occupied(_) => {
                inner.live.fetch_sub(1, Ordering::AcqRel);
                return Err(TransportError::SendFailed(format!(
                    "duplicate connection id {id}"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Outbox {
                    tx,
                    cancel: cancel.clone(),
                });
            }
        }
        inner
            .tasks
            .spawn(write_loop(conn, rx, cancel, Arc::clone(inner)));

        debug!(connection = %id, total = inner.connections.len(), "Connection registered");
        Ok(id)
    }

    /// Queue a frame for every live connection.
    ///
    /// Returns the number of outboxes that accepted it.
    pub fn broadcast(&self, frame: ServerFrame) -> usize {
        let frame = Arc::new(frame);
        let targets: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.tx.clone()))
            .collect();

        let mut accepted = 0;
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&frame)) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    self.inner
                        .counters
                        .slow_consumers
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(connection = %id, "Outbox full, dropping slow consumer");
                    self.disconnect(&id);
                }
                Err(TrySendError::Closed(_)) => {
                    self.disconnect(&id);
                }
            }
        }

        trace!(frame = frame.frame_type(), recipients = accepted, "Broadcast");
        accepted
    }

    /// Queue a frame for one connection.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the connection is gone, `SlowConsumer` if its
    /// outbox is full (the connection is dropped in that case).
    pub fn send_to(&self, id: &ConnectionId, frame: ServerFrame) -> Result<(), TransportError> {
        let tx = self
            .inner
            .connections
            .get(id)
            .map(|outbox| outbox.tx.clone())
            .ok_or(TransportError::ConnectionClosed)?;

        match tx.try_send(Arc::new(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.inner
                    .counters
                    .slow_consumers
                    .fetch_add(1, Ordering::Relaxed);
                self.disconnect(id);
                Err(TransportError::SlowConsumer)
            }
            Err(TrySendError::Closed(_)) => {
                self.disconnect(id);
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    /// Drop a connection. Its writer closes the socket.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        match self.inner.release(id) {
            Some(outbox) => {
                outbox.cancel.cancel();
                debug!(connection = %id, "Connection dropped");
                true
            }
            None => false,
        }
    }

    /// Whether a connection is live.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.connections.contains_key(id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Get fan-out statistics.
    #[must_use]
    pub fn stats(&self) -> FanoutStats {
        let counters = &self.inner.counters;
        FanoutStats {
            connections: self.inner.connections.len(),
            delivered: counters.delivered.load(Ordering::Relaxed),
            stale: counters.stale.load(Ordering::Relaxed),
            slow_consumers: counters.slow_consumers.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop every writer and wait up to `grace` for them to close their
    /// connections.
    ///
    /// Returns `true` if all writers finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.connections.retain(|_, _| {
            inner.live.fetch_sub(1, Ordering::AcqRel);
            false
        });
        inner.tasks.close();

        let drained = tokio::time::timeout(grace, inner.tasks.wait())
            .await
            .is_ok();
        if drained {
            info!("Broadcaster drained");
        } else {
            warn!(abandoned = inner.tasks.len(), "Broadcaster shutdown grace elapsed");
        }
        drained
    }
}

impl Inner {
    fn release(&self, id: &ConnectionId) -> Option<Outbox> {
        let (_, outbox) = self.connections.remove(id)?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        Some(outbox)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_loop<C: Connection>(
    mut conn: C,
    mut rx: mpsc::Receiver<Arc<ServerFrame>>,
    cancel: CancellationToken,
    inner: Arc<Inner>,
) {
    let id = conn.id().clone();
    let deadline = inner.config.send_timeout;
    let mut last_seq = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Bus dispatch is unordered; never let a listener go back in time.
        if let Some(seq) = frame.seq() {
            if seq < last_seq {
                inner.counters.stale.fetch_add(1, Ordering::Relaxed);
                trace!(connection = %id, seq, last_seq, "Discarding stale frame");
                continue;
            }
            last_seq = seq;
        }

        match tokio::time::timeout(deadline, conn.send(&frame)).await {
            Ok(Ok(())) => {
                inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(connection = %id, error = %e, "Delivery failed");
                break;
            }
            Err(_) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = %id,
                    timeout_ms = deadline.as_millis() as u64,
                    "Delivery timed out"
                );
                break;
            }
        }
    }

    inner.release(&id);
    if let Ok(Err(e)) = tokio::time::timeout(deadline, conn.close()).await {
        debug!(connection = %id, error = %e, "Close failed");
    }
    debug!(connection = %id, "Writer stopped");
}

/// Forwards bus events to a [`Broadcaster`].
struct BroadcastHandler {
    broadcaster: Broadcaster,
}

#[async_trait]
impl EventHandler for BroadcastHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        self.broadcaster.broadcast(event.to_frame());
        Ok(())
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}

/// Fan-out statistics.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    /// Live connections.
    pub connections: usize,
    /// Frames written.
    pub delivered: u64,
    /// Frames skipped because a newer state was already written.
    pub stale: u64,
    /// Connections dropped for a full outbox.
    pub slow_consumers: u64,
    /// Writes that failed or timed out.
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwave_core::{EventKind, EventPayload};
    use airwave_protocol::{Emote, QueueUpdatePayload, ReactionPayload};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Ok,
        Fail,
        Stall,
    }

    /// A connection that records what it is sent.
    struct MockConnection {
        id: ConnectionId,
        mode: Mode,
        sent: Arc<Mutex<Vec<ServerFrame>>>,
        closed: Arc<AtomicBool>,
    }

    struct Tap {
        sent: Arc<Mutex<Vec<ServerFrame>>>,
        closed: Arc<AtomicBool>,
    }

    impl Tap {
        fn frames(&self) -> Vec<ServerFrame> {
            self.sent.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn mock(mode: Mode) -> (MockConnection, Tap) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let conn = MockConnection {
            id: ConnectionId::generate(),
            mode,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (conn, Tap { sent, closed })
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn id(&self) -> &ConnectionId {
            &self.id
        }

        async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
            match self.mode {
                Mode::Ok => {
                    self.sent.lock().unwrap().push(frame.clone());
                    Ok(())
                }
                Mode::Fail => Err(TransportError::SendFailed("broken pipe".into())),
                Mode::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue_update(seq: u64) -> ServerFrame {
        ServerFrame::QueueUpdate(QueueUpdatePayload {
            seq,
            queue: vec![],
            current_index: 0,
        })
    }

    fn reaction() -> ServerFrame {
        ServerFrame::UserReaction(ReactionPayload {
            user_id: "u1".into(),
            emote: Emote::Wow,
            timestamp: 1,
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn config() -> FanoutConfig {
        FanoutConfig {
            outbox_capacity: 8,
            send_timeout: Duration::from_millis(200),
            max_connections: 16,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let broadcaster = Broadcaster::with_config(config());
        let (a, tap_a) = mock(Mode::Ok);
        let (b, tap_b) = mock(Mode::Ok);
        broadcaster.register(a, None).unwrap();
        broadcaster.register(b, None).unwrap();

        assert_eq!(broadcaster.broadcast(reaction()), 2);
        settle().await;

        assert_eq!(tap_a.frames(), vec![reaction()]);
        assert_eq!(tap_b.frames(), vec![reaction()]);
        assert_eq!(broadcaster.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_greeting_is_written_first() {
        let broadcaster = Broadcaster::with_config(config());
        let (conn, tap) = mock(Mode::Ok);
        broadcaster
            .register(conn, Some(ServerFrame::pong(Some(7))))
            .unwrap();
        broadcaster.broadcast(reaction());
        settle().await;

        assert_eq!(tap.frames(), vec![ServerFrame::pong(Some(7)), reaction()]);
    }

    #[tokio::test]
    async fn test_stale_frames_are_discarded() {
        let broadcaster = Broadcaster::with_config(config());
        let (conn, tap) = mock(Mode::Ok);
        broadcaster.register(conn, None).unwrap();

        broadcaster.broadcast(queue_update(5));
        broadcaster.broadcast(queue_update(3));
        broadcaster.broadcast(reaction());
        broadcaster.broadcast(queue_update(5));
        broadcaster.broadcast(queue_update(6));
        settle().await;

        let seqs: Vec<_> = tap.frames().iter().map(ServerFrame::seq).collect();
        assert_eq!(seqs, [Some(5), None, Some(5), Some(6)]);
        assert_eq!(broadcaster.stats().stale, 1);
    }

    #[tokio::test]
    async fn test_failing_connection_is_removed() {
        let broadcaster = Broadcaster::with_config(config());
        let (good, good_tap) = mock(Mode::Ok);
        let (bad, bad_tap) = mock(Mode::Fail);
        broadcaster.register(good, None).unwrap();
        let bad_id = broadcaster.register(bad, None).unwrap();

        broadcaster.broadcast(reaction());
        settle().await;

        assert!(!broadcaster.contains(&bad_id));
        assert!(bad_tap.is_closed());
        assert_eq!(broadcaster.connection_count(), 1);

        broadcaster.broadcast(reaction());
        settle().await;
        assert_eq!(good_tap.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connection_times_out() {
        let broadcaster = Broadcaster::with_config(config());
        let (good, good_tap) = mock(Mode::Ok);
        let (stalled, stalled_tap) = mock(Mode::Stall);
        broadcaster.register(good, None).unwrap();
        let stalled_id = broadcaster.register(stalled, None).unwrap();

        broadcaster.broadcast(reaction());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!broadcaster.contains(&stalled_id));
        assert!(stalled_tap.is_closed());
        assert_eq!(good_tap.frames().len(), 1);
        assert_eq!(broadcaster.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_is_dropped_when_outbox_fills() {
        let broadcaster = Broadcaster::with_config(FanoutConfig {
            outbox_capacity: 2,
            send_timeout: Duration::from_secs(3600),
            max_connections: 16,
        });
        let (good, good_tap) = mock(Mode::Ok);
        let (stalled, _stalled_tap) = mock(Mode::Stall);
        broadcaster.register(good, None).unwrap();
        let stalled_id = broadcaster.register(stalled, None).unwrap();

        for _ in 0..5 {
            broadcaster.broadcast(reaction());
            tokio::task::yield_now().await;
        }

        assert!(!broadcaster.contains(&stalled_id));
        assert_eq!(broadcaster.stats().slow_consumers, 1);

        broadcaster.broadcast(reaction());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(good_tap.frames().len(), 6);
    }

    #[tokio::test]
    async fn test_send_to_targets_one_connection() {
        let broadcaster = Broadcaster::with_config(config());
        let (a, tap_a) = mock(Mode::Ok);
        let (b, tap_b) = mock(Mode::Ok);
        let a_id = broadcaster.register(a, None).unwrap();
        broadcaster.register(b, None).unwrap();

        broadcaster.send_to(&a_id, ServerFrame::ack(1)).unwrap();
        settle().await;

        assert_eq!(tap_a.frames(), vec![ServerFrame::ack(1)]);
        assert!(tap_b.frames().is_empty());

        assert!(broadcaster.disconnect(&a_id));
        assert!(matches!(
            broadcaster.send_to(&a_id, ServerFrame::ack(2)),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let broadcaster = Broadcaster::with_config(FanoutConfig {
            max_connections: 1,
            ..config()
        });
        broadcaster.register(mock(Mode::Ok).0, None).unwrap();
        assert!(matches!(
            broadcaster.register(mock(Mode::Ok).0, None),
            Err(TransportError::LimitReached(1))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_respect_limit() {
        let broadcaster = Broadcaster::with_config(FanoutConfig {
            max_connections: 8,
            ..config()
        });

        let attempts: Vec<_> = (0..64)
            .map(|_| {
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move { broadcaster.register(mock(Mode::Ok).0, None).is_ok() })
            })
            .collect();

        let mut accepted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 8);
        assert_eq!(broadcaster.connection_count(), 8);
    }

    #[tokio::test]
    async fn test_disconnect_frees_a_slot() {
        let broadcaster = Broadcaster::with_config(FanoutConfig {
            max_connections: 1,
            ..config()
        });
        let id = broadcaster.register(mock(Mode::Ok).0, None).unwrap();
        assert!(broadcaster.disconnect(&id));
        settle().await;

        broadcaster.register(mock(Mode::Ok).0, None).unwrap();
        assert_eq!(broadcaster.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_attach_forwards_bus_events() {
        let bus = EventBus::new();
        let broadcaster = Broadcaster::with_config(config());
        broadcaster.attach(&bus);
        assert_eq!(bus.handler_count(EventKind::UserReaction), 1);

        let (conn, tap) = mock(Mode::Ok);
        broadcaster.register(conn, None).unwrap();

        let payload = ReactionPayload {
            user_id: "u9".into(),
            emote: Emote::Party,
            timestamp: 3,
        };
        bus.publish(Event::new(EventPayload::UserReaction(payload.clone()), 3));
        bus.idle().await;
        settle().await;

        assert_eq!(tap.frames(), vec![ServerFrame::UserReaction(payload)]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let broadcaster = Broadcaster::with_config(config());
        let (conn, tap) = mock(Mode::Ok);
        broadcaster.register(conn, None).unwrap();

        assert!(broadcaster.shutdown(Duration::from_secs(1)).await);
        assert!(tap.is_closed());
        assert_eq!(broadcaster.connection_count(), 0);
        assert!(matches!(
            broadcaster.register(mock(Mode::Ok).0, None),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
