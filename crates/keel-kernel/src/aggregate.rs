use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use keel_core::{Event, KernelError, Result, StateSnapshot};

/// A projection over the event stream. State is derived purely from
/// `apply_event`, so replaying the same log always reproduces the same
/// state.
pub trait Aggregate: Send + Sync {
    /// Projection id — the key under which `state()` appears in snapshots.
    fn id(&self) -> &str;

    /// Fold one event into the projection. Return
    /// [`KernelError::UnhandledEvent`] for kinds this projection does not
    /// track; the pipeline skips those without failing.
    fn apply_event(&mut self, event: &Event) -> Result<()>;

    /// Current state as a JSON value.
    fn state(&self) -> Value;
}

/// The set of registered projections the bus applies events to.
#[derive(Default, Clone)]
pub struct Aggregates {
    list: Arc<RwLock<Vec<Arc<RwLock<dyn Aggregate>>>>>,
}

impl Aggregates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, aggregate: Arc<RwLock<dyn Aggregate>>) {
        debug!(projection = aggregate.read().id(), "projection registered");
        self.list.write().push(aggregate);
    }

    /// Apply one event to every projection. An `UnhandledEvent` from a
    /// projection is skipped; any other error aborts the apply.
    pub fn apply(&self, event: &Event) -> Result<()> {
        for aggregate in self.list.read().iter() {
            let mut aggregate = aggregate.write();
            match aggregate.apply_event(event) {
                Ok(()) => {}
                Err(KernelError::UnhandledEvent { projection, kind }) => {
                    debug!(%projection, %kind, "projection skipped event");
                }
                Err(e) => {
                    warn!(projection = aggregate.id(), kind = event.kind(), error = %e,
                        "projection failed to apply event");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// A read-only snapshot of every projection's state.
    pub fn snapshot(&self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        for aggregate in self.list.read().iter() {
            let aggregate = aggregate.read();
            snapshot
                .projections
                .insert(aggregate.id().to_string(), aggregate.state());
        }
        snapshot
    }
}

/// Snapshot key of [`AppProjection`].
pub const APP_PROJECTION: &str = "app";

/// Oldest turns are dropped past this many history entries.
const HISTORY_LIMIT: usize = 50;

/// Kernel-level bookkeeping projection: per-kind event counts, the last
/// event seen, and the conversation history (user requests and their
/// completions, in arrival order). Handles every kind.
#[derive(Default)]
pub struct AppProjection {
    counts: std::collections::BTreeMap<String, u64>,
    total: u64,
    last_kind: Option<String>,
    history: std::collections::VecDeque<Value>,
}

impl AppProjection {
    pub fn new() -> Self {
        Self::default()
    }

    fn remember(&mut self, role: &str, text: &str) {
        self.history
            .push_back(serde_json::json!({ "role": role, "text": text }));
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

impl Aggregate for AppProjection {
    fn id(&self) -> &str {
        APP_PROJECTION
    }

    fn apply_event(&mut self, event: &Event) -> Result<()> {
        let kind = event.kind().to_string();
        *self.counts.entry(kind.clone()).or_insert(0) += 1;
        self.total += 1;
        self.last_kind = Some(kind);
        match event {
            Event::UserRequestReceived { text, .. } => self.remember("user", text),
            Event::RequestCompleted { text, .. } => self.remember("assistant", text),
            _ => {}
        }
        Ok(())
    }

    fn state(&self) -> Value {
        serde_json::json!({
            "counts": self.counts,
            "total": self.total,
            "last_kind": self.last_kind,
            "history": self.history,
        })
    }
}
