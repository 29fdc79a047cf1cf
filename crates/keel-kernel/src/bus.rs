use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

use keel_core::{Event, KernelError, Result, StateSnapshot, WILDCARD};
use keel_plugin::CommandRegistry;
use keel_store::EventLog;

use crate::aggregate::Aggregates;
use crate::recovery::RecoveryManager;

const WATCH_CAPACITY: usize = 256;

/// Opaque token returned by [`EventBus::subscribe`]; redeem it with
/// [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What an async subscriber gets alongside the event: the post-apply
/// state snapshot, the command table, and a capability to publish
/// follow-up events.
pub struct HandlerContext {
    pub snapshot: StateSnapshot,
    pub commands: Arc<CommandRegistry>,
    pub publisher: EventPublisher,
}

/// An async event subscriber. Returned events are republished through
/// the full pipeline.
pub type Subscriber =
    Arc<dyn Fn(Event, HandlerContext) -> BoxFuture<'static, Result<Vec<Event>>> + Send + Sync>;

struct Subscription {
    label: String,
    kind: String,
    subscriber: Subscriber,
}

/// The event pipeline: persist, then apply to projections, then notify
/// watchers and fan out to async subscribers. Persistence comes first —
/// if the log rejects a batch, no projection moves and no subscriber
/// runs. Subscribers execute on their own tasks under the recovery
/// manager, so a panicking or erroring subscriber never stalls the bus
/// or its sibling subscribers.
pub struct EventBus {
    store: Arc<dyn EventLog>,
    aggregates: Aggregates,
    commands: Arc<CommandRegistry>,
    recovery: Arc<RecoveryManager>,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_sub: AtomicU64,
    watch: broadcast::Sender<Event>,
    // Serializes append+apply so projections observe log order.
    apply_lock: Mutex<()>,
}

impl EventBus {
    pub fn new(
        store: Arc<dyn EventLog>,
        aggregates: Aggregates,
        commands: Arc<CommandRegistry>,
        recovery: Arc<RecoveryManager>,
    ) -> Arc<Self> {
        let (watch, _) = broadcast::channel(WATCH_CAPACITY);
        Arc::new(Self {
            store,
            aggregates,
            commands,
            recovery,
            subscriptions: RwLock::new(HashMap::new()),
            next_sub: AtomicU64::new(1),
            watch,
            apply_lock: Mutex::new(()),
        })
    }

    /// Persist a batch, fold it into projections, and fan it out. The
    /// append and apply happen synchronously before this returns; the
    /// subscriber dispatch is spawned.
    pub fn publish(self: &Arc<Self>, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        {
            let _guard = self.apply_lock.lock();
            self.store.append(events)?;
            for event in events {
                self.aggregates.apply(event)?;
            }
        }
        for event in events {
            debug!(kind = event.kind(), "event published");
            let _ = self.watch.send(event.clone());
            self.dispatch(event);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, event: &Event) {
        let snapshot = self.aggregates.snapshot();
        let subscriptions = self.subscriptions.read();
        for sub in subscriptions.values() {
            if sub.kind != WILDCARD && sub.kind != event.kind() {
                continue;
            }
            let ctx = HandlerContext {
                snapshot: snapshot.clone(),
                commands: Arc::clone(&self.commands),
                publisher: self.publisher(),
            };
            let fut = (sub.subscriber)(event.clone(), ctx);
            let label = format!("subscriber:{}/{}", sub.label, event.kind());
            let recovery = Arc::clone(&self.recovery);
            let bus = Arc::downgrade(self);
            tokio::spawn(async move {
                if let Some(events) = recovery.run_isolated(&label, fut).await {
                    if events.is_empty() {
                        return;
                    }
                    if let Some(bus) = bus.upgrade() {
                        if let Err(e) = bus.publish(&events) {
                            recovery.record_failure(&label, &e.to_string());
                        }
                    }
                }
            });
        }
    }

    /// Subscribe to an event kind (or [`WILDCARD`]). The label attributes
    /// recovery log lines to this subscriber.
    pub fn subscribe(&self, label: &str, kind: &str, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_sub.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().insert(
            id,
            Subscription {
                label: label.to_string(),
                kind: kind.to_string(),
                subscriber,
            },
        );
        debug!(label, kind, ?id, "subscriber attached");
        id
    }

    /// Remove a subscription. Returns false for an unknown or already
    /// removed token.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.write().remove(&id).is_some()
    }

    /// A broadcast receiver observing every published event. Lossy under
    /// sustained backpressure, meant for UIs and tests.
    pub fn watch(&self) -> broadcast::Receiver<Event> {
        self.watch.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.aggregates.snapshot()
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    /// A publish capability holding only a weak reference, safe to hand
    /// to subscribers and plugins.
    pub fn publisher(self: &Arc<Self>) -> EventPublisher {
        EventPublisher {
            bus: Arc::downgrade(self),
        }
    }

    /// Rebuild projections from the persisted log. No subscribers or
    /// watchers fire; replay is pure state reconstruction. Returns the
    /// number of events applied.
    pub fn replay(&self) -> Result<usize> {
        let _guard = self.apply_lock.lock();
        let events = self.store.events()?;
        for event in &events {
            self.aggregates.apply(event)?;
        }
        debug!(count = events.len(), "replayed event log");
        Ok(events.len())
    }
}

/// The injected publish capability. Holds the bus weakly, so a retained
/// publisher never keeps a torn-down kernel alive.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Weak<EventBus>,
}

impl EventPublisher {
    pub fn publish(&self, events: &[Event]) -> Result<()> {
        let bus = self.bus.upgrade().ok_or(KernelError::BusClosed)?;
        bus.publish(events)
    }
}
