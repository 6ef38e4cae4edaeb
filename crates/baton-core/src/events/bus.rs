//! Bounded, in-process publish/subscribe.
//!
//! One background task drains the channel in publish order. For each event it
//! runs every handler subscribed to the event's tag; see [`DispatchMode`] for
//! whether it waits for them. Delivery is at-most-once: events still queued
//! when the bus shuts down are dropped and counted.

use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use futures::{future::join_all, FutureExt};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DispatchMode, EventEnvelope, EventHandler, EventType, SubscriptionId};
use crate::{config::EventBusConfig, Error, Result};

type Queued = Arc<EventEnvelope>;

/// Counters and gauges returned by [`EventBus::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStats {
    pub published: u64,
    /// Events taken off the channel and dispatched, with or without handlers.
    pub processed: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed_handlers: u64,
    /// Events discarded at shutdown without being processed.
    pub dropped: u64,
    pub subscriptions: usize,
    pub queued: usize,
}

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    failed_handlers: AtomicU64,
    dropped: AtomicU64,
}

/// State shared between the bus handle and its processing loop.
struct Shared {
    config: EventBusConfig,
    handlers: RwLock<HashMap<EventType, Vec<Subscription>>>,
    /// Most recent first.
    history: RwLock<VecDeque<Queued>>,
    counters: Counters,
    next_subscription: AtomicU64,
}

struct BusInner {
    shared: Arc<Shared>,
    sender: mpsc::Sender<Queued>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Async event bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.shared.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create the channel and spawn the processing loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: EventBusConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            config,
            handlers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(config.history_size)),
            counters: Counters::default(),
            next_subscription: AtomicU64::new(1),
        });

        let worker = tokio::spawn(run_loop(Arc::clone(&shared), receiver, shutdown_rx));
        info!(
            capacity = config.channel_capacity,
            mode = %config.dispatch_mode,
            "Event bus started"
        );

        Self {
            inner: Arc::new(BusInner {
                shared,
                sender,
                shutdown_tx,
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an event, waiting for channel space if the bus is saturated.
    ///
    /// # Errors
    ///
    /// Returns `EventBusClosed` once [`shutdown`](Self::shutdown) has begun.
    pub async fn publish(&self, event: impl Into<EventEnvelope>) -> Result<Uuid> {
        self.enqueue(Arc::new(event.into())).await
    }

    /// Enqueue from a background task and return immediately.
    ///
    /// The id is returned before the event is queued. A bus that closes in
    /// between drops the event with a warning.
    pub fn publish_sync(&self, event: impl Into<EventEnvelope>) -> Result<Uuid> {
        if self.is_closed() {
            return Err(Error::EventBusClosed);
        }
        let event = Arc::new(event.into());
        let id = event.id;
        let bus = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.enqueue(event).await {
                warn!(event_id = %id, "Background publish failed: {e}");
            }
        });
        Ok(id)
    }

    async fn enqueue(&self, event: Queued) -> Result<Uuid> {
        if self.is_closed() {
            return Err(Error::EventBusClosed);
        }
        let id = event.id;
        let event_type = event.event_type();

        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| Error::EventBusClosed)?;

        // Count and record before the worker can see the event; the history
        // lock keeps history order equal to queue order.
        let shared = &self.inner.shared;
        {
            let mut history = shared.history.write().await;
            shared.counters.published.fetch_add(1, Ordering::Relaxed);
            history.push_front(Arc::clone(&event));
            history.truncate(shared.config.history_size);
            permit.send(event);
        }

        debug!(event_id = %id, %event_type, "Event published");
        Ok(id)
    }

    /// Register a handler for one event tag.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: impl EventHandler + 'static,
    ) -> SubscriptionId {
        let shared = &self.inner.shared;
        let id = SubscriptionId(shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        shared
            .handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        debug!(subscription = %id, %event_type, "Handler subscribed");
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.shared.handlers.write().await;
        for subscriptions in handlers.values_mut() {
            if let Some(pos) = subscriptions.iter().position(|s| s.id == id) {
                subscriptions.remove(pos);
                return true;
            }
        }
        false
    }

    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .shared
            .handlers
            .read()
            .await
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    pub async fn stats(&self) -> EventBusStats {
        let shared = &self.inner.shared;
        let subscriptions = shared.handlers.read().await.values().map(Vec::len).sum();
        EventBusStats {
            published: shared.counters.published.load(Ordering::Relaxed),
            processed: shared.counters.processed.load(Ordering::Relaxed),
            failed_handlers: shared.counters.failed_handlers.load(Ordering::Relaxed),
            dropped: shared.counters.dropped.load(Ordering::Relaxed),
            subscriptions,
            queued: self.queued(),
        }
    }

    /// Up to `limit` retained events, most recent first.
    pub async fn history(&self, limit: usize) -> Vec<EventEnvelope> {
        self.inner
            .shared
            .history
            .read()
            .await
            .iter()
            .take(limit)
            .map(|event| EventEnvelope::clone(event))
            .collect()
    }

    /// Look up a retained event by id.
    pub async fn get_event(&self, id: Uuid) -> Option<EventEnvelope> {
        self.inner
            .shared
            .history
            .read()
            .await
            .iter()
            .find(|event| event.id == id)
            .map(|event| EventEnvelope::clone(event))
    }

    pub async fn clear_history(&self) {
        self.inner.shared.history.write().await.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting events and stop the loop.
    ///
    /// The event in flight gets up to `shutdown_grace` to finish; after that
    /// the loop is aborted and its handlers abandoned. Queued events are
    /// dropped. Calling this twice is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down event bus");
        let _ = self.inner.shutdown_tx.send(());

        let Some(mut worker) = self.inner.worker.lock().await.take() else {
            return;
        };

        let grace = self.inner.shared.config.shutdown_grace();
        if tokio::time::timeout(grace, &mut worker).await.is_err() {
            let abandoned = self.queued() as u64;
            worker.abort();
            self.inner
                .shared
                .counters
                .dropped
                .fetch_add(abandoned, Ordering::Relaxed);
            warn!(
                grace_ms = self.inner.shared.config.shutdown_grace_ms,
                dropped = abandoned,
                "Event bus shutdown timed out, aborting in-flight handlers"
            );
        } else {
            info!("Event bus stopped");
        }
    }

    fn queued(&self) -> usize {
        let sender = &self.inner.sender;
        sender.max_capacity().saturating_sub(sender.capacity())
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut receiver: mpsc::Receiver<Queued>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            next = receiver.recv() => match next {
                Some(event) => shared.dispatch(event).await,
                None => break,
            },
        }
    }

    receiver.close();
    let mut dropped = 0_u64;
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        shared.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        warn!(dropped, "Dropped queued events at shutdown");
    }
}

impl Shared {
    async fn dispatch(self: &Arc<Self>, event: Queued) {
        let event_type = event.event_type();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .get(&event_type)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        match self.config.dispatch_mode {
            DispatchMode::AwaitAll => {
                let outcomes = join_all(handlers.iter().map(|handler| {
                    AssertUnwindSafe(handler.handle(Arc::clone(&event))).catch_unwind()
                }))
                .await;
                for outcome in outcomes {
                    self.record_outcome(&event, outcome);
                }
            }
            DispatchMode::Detached => {
                for handler in handlers {
                    let shared = Arc::clone(self);
                    let event = Arc::clone(&event);
                    tokio::spawn(async move {
                        let outcome = AssertUnwindSafe(handler.handle(Arc::clone(&event)))
                            .catch_unwind()
                            .await;
                        shared.record_outcome(&event, outcome);
                    });
                }
            }
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, event: &EventEnvelope, outcome: std::thread::Result<anyhow::Result<()>>) {
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "handler panicked".to_string(),
        };
        self.counters.failed_handlers.fetch_add(1, Ordering::Relaxed);
        warn!(
            event_id = %event.id,
            event_type = %event.event_type(),
            "Event handler failed: {failure}"
        );
    }
}
