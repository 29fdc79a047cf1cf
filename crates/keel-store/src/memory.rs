use parking_lot::RwLock;

use keel_core::{Event, Result};

use crate::EventLog;

/// In-memory event log for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventLog for MemoryLog {
    fn append(&self, events: &[Event]) -> Result<()> {
        self.events.write().extend_from_slice(events);
        Ok(())
    }

    fn events(&self) -> Result<Vec<Event>> {
        Ok(self.events.read().clone())
    }
}
