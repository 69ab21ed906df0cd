//! In-process event bus.
//!
//! The bus routes [`Event`]s to handlers registered under the event's
//! [`EventKind`]. Publishing never blocks: every handler invocation is an
//! independent task on a bounded task set, with its own deadline and its own
//! panic boundary. A failing handler is logged and counted, nothing more.
//!
//! A dispatch takes its slot before its task is spawned. When every slot is
//! taken the dispatch is dropped and counted, so a stalled handler costs at
//! most `max_in_flight` tasks.
//!
//! There is no ordering guarantee between two dispatches, not even for the
//! same handler. Handlers that care about order compare the `seq` carried
//! by state snapshots.

use crate::error::HandlerError;
use crate::event::{Event, EventKind};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Identifies one `subscribe` call.
pub type SubscriptionId = u64;

/// Something that reacts to events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// An [`EventHandler`] backed by an async closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a named handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        (self.f)(event).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum number of handler invocations alive at once, queued or running.
    pub max_in_flight: usize,
    /// Deadline for a single handler invocation.
    pub dispatch_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            dispatch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
}

/// The event bus.
pub struct EventBus {
    /// Handler lists per kind. Lists are replaced, never mutated in place,
    /// so a publish works on the list as it was when the publish started.
    handlers: DashMap<EventKind, Arc<Vec<Registration>>>,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
    limit: usize,
    idle: Arc<Notify>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    config: BusConfig,
}

impl EventBus {
    /// Create a new bus with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a new bus with custom configuration.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        info!("Creating event bus with config: {:?}", config);
        let limit = config.max_in_flight.max(1);
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            idle: Arc::new(Notify::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            config,
        }
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.register(kind, Registration { id, handler });
        id
    }

    /// Register `handler` for every event kind under a single subscription.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        for kind in EventKind::ALL {
            self.register(
                kind,
                Registration {
                    id,
                    handler: Arc::clone(&handler),
                },
            );
        }
        id
    }

    fn register(&self, kind: EventKind, registration: Registration) {
        let mut entry = self.handlers.entry(kind).or_default();
        let mut list = Vec::with_capacity(entry.len() + 1);
        list.extend(entry.iter().cloned());
        debug!(
            event = %kind,
            handler = registration.handler.name(),
            subscription = registration.id,
            "Handler subscribed"
        );
        list.push(registration);
        *entry = Arc::new(list);
    }

    /// Remove a subscription.
    ///
    /// Returns `true` if anything was removed. Dispatches already scheduled
    /// for this handler still run.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.handlers.iter_mut() {
            if entry.iter().any(|r| r.id == id) {
                let list: Vec<_> = entry.iter().filter(|r| r.id != id).cloned().collect();
                *entry = Arc::new(list);
                removed = true;
            }
        }
        if removed {
            debug!(subscription = id, "Handler unsubscribed");
        }
        removed
    }

    /// Publish an event.
    ///
    /// Returns the number of handler invocations scheduled. Invocations that
    /// find the bus saturated are dropped and not counted here. Must be
    /// called from within a Tokio runtime.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();

        if self.shutdown.is_cancelled() {
            warn!(event = %kind, "Publish after bus shutdown dropped");
            return 0;
        }

        let handlers = match self.handlers.get(&kind) {
            Some(entry) if !entry.is_empty() => Arc::clone(entry.value()),
            _ => {
                trace!(event = %kind, "No handlers");
                return 0;
            }
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);

        let mut scheduled = 0;
        for registration in handlers.iter() {
            if self.dispatch(&registration.handler, &event) {
                scheduled += 1;
            }
        }

        trace!(event = %kind, handlers = handlers.len(), scheduled, "Published event");
        scheduled
    }

    fn dispatch(&self, handler: &Arc<dyn EventHandler>, event: &Arc<Event>) -> bool {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = %event.kind(),
                    handler = handler.name(),
                    max_in_flight = self.limit,
                    "Bus saturated, dispatch dropped"
                );
                return false;
            }
            Err(TryAcquireError::Closed) => return false,
        };

        let handler = Arc::clone(handler);
        let event = Arc::clone(event);
        let permits = Arc::clone(&self.permits);
        let idle = Arc::clone(&self.idle);
        let counters = Arc::clone(&self.counters);
        let deadline = self.config.dispatch_timeout;
        let limit = self.limit;
        counters.dispatched.fetch_add(1, Ordering::Relaxed);

        self.tasks.spawn(async move {
            let kind = event.kind();
            let invocation = AssertUnwindSafe(handler.handle(event)).catch_unwind();

            match tokio::time::timeout(deadline, invocation).await {
                Ok(Ok(Ok(()))) => {
                    trace!(event = %kind, handler = handler.name(), "Handler finished");
                }
                Ok(Ok(Err(e))) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(event = %kind, handler = handler.name(), error = %e, "Handler failed");
                }
                Ok(Err(panic)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        event = %kind,
                        handler = handler.name(),
                        panic = panic_message(panic.as_ref()),
                        "Handler panicked"
                    );
                }
                Err(_) => {
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event = %kind,
                        handler = handler.name(),
                        timeout_ms = deadline.as_millis() as u64,
                        "Handler timed out"
                    );
                }
            }

            drop(permit);
            if permits.available_permits() == limit {
                idle.notify_waiters();
            }
        });
        true
    }

    fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|e| e.len()).unwrap_or(0)
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            handler_count: self.handlers.iter().map(|e| e.len()).sum(),
            published: self.counters.published.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    /// Wait until every dispatch scheduled so far has finished.
    pub async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting publishes and wait up to `grace` for in-flight dispatches.
    ///
    /// Returns `true` if everything finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tasks.close();

        let drained = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        if drained {
            info!("Event bus drained");
        } else {
            warn!(abandoned = self.in_flight(), "Event bus shutdown grace elapsed");
        }
        drained
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Bus statistics.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    /// Registered handlers, counted once per kind.
    pub handler_count: usize,
    /// Events that had at least one handler.
    pub published: u64,
    /// Handler invocations started.
    pub dispatched: u64,
    /// Invocations that returned an error or panicked.
    pub failed: u64,
    /// Invocations that overran the dispatch deadline.
    pub timed_out: u64,
    /// Invocations skipped because `max_in_flight` was reached.
    pub dropped: u64,
    /// Dispatches not yet finished.
    pub in_flight: usize,
}
