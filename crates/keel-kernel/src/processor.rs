use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use keel_core::{Event, KernelError, Result, StateSnapshot, WILDCARD};
use keel_plugin::CommandRegistry;

use crate::bus::EventBus;

/// A synchronous event handler run inline by the processor. Unlike bus
/// subscribers these complete before `execute_command` returns, so their
/// derived events are already persisted and applied when the caller sees
/// the command output.
pub type SyncEventHandler = Arc<dyn Fn(&Event, &StateSnapshot) -> Result<Vec<Event>> + Send + Sync>;

// Cap on event derivation depth; a handler loop beyond this is a bug.
const MAX_DEPTH: usize = 32;

/// The synchronous command path: validate input against the command's
/// schema, run its handler, and drive the produced events through the
/// pipeline — recursively, since a sync handler may derive further
/// events.
pub struct CommandProcessor {
    bus: Arc<EventBus>,
    commands: Arc<CommandRegistry>,
    sync_handlers: RwLock<Vec<(String, SyncEventHandler)>>,
}

impl CommandProcessor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        let commands = Arc::clone(bus.commands());
        Self {
            bus,
            commands,
            sync_handlers: RwLock::new(Vec::new()),
        }
    }

    /// Attach a synchronous handler for an event kind (or [`WILDCARD`]).
    pub fn on_event(&self, kind: &str, handler: SyncEventHandler) {
        self.sync_handlers.write().push((kind.to_string(), handler));
    }

    /// Execute a named command. Unknown names and schema violations fail
    /// before the handler runs; nothing is persisted in either case.
    pub fn execute_command(&self, name: &str, input: Value) -> Result<Value> {
        let entry = self
            .commands
            .get(name)
            .ok_or_else(|| KernelError::UnknownCommand(name.to_string()))?;

        entry
            .spec
            .schema
            .validate(&input)
            .map_err(|reason| KernelError::InvalidInput {
                command: name.to_string(),
                reason,
            })?;

        debug!(command = name, plugin = %entry.plugin, "executing command");
        let snapshot = self.bus.snapshot();
        let outcome = (entry.spec.handler)(input, &snapshot)?;
        self.process_events(outcome.events)?;
        Ok(outcome.output)
    }

    /// Publish events and run sync handlers over them, recursing into any
    /// derived events. Each event is fully persisted and applied before
    /// its handlers see it.
    pub fn process_events(&self, events: Vec<Event>) -> Result<()> {
        self.process_at_depth(events, 0)
    }

    fn process_at_depth(&self, events: Vec<Event>, depth: usize) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(KernelError::Other(anyhow::anyhow!(
                "event derivation exceeded depth {MAX_DEPTH}; handler cycle suspected"
            )));
        }
        for event in events {
            self.bus.publish(std::slice::from_ref(&event))?;
            let snapshot = self.bus.snapshot();
            let mut derived = Vec::new();
            for (kind, handler) in self.sync_handlers.read().iter() {
                if kind == WILDCARD || kind == event.kind() {
                    derived.extend(handler(&event, &snapshot)?);
                }
            }
            if !derived.is_empty() {
                self.process_at_depth(derived, depth + 1)?;
            }
        }
        Ok(())
    }
}
