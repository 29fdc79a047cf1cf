//! # keel-store
//!
//! Append-only event log backends. The kernel only sees the [`EventLog`]
//! trait; whether events land in memory or a SQLite table is a deployment
//! choice.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLog;
pub use sqlite::SqliteLog;

use keel_core::{Event, Result};

/// The system of record. Implementations must preserve insertion order:
/// [`EventLog::events`] reproduces exactly the sequence previously
/// appended, including across process restarts for durable backends.
pub trait EventLog: Send + Sync {
    /// Append events to the log. All-or-nothing: on error nothing is
    /// considered persisted.
    fn append(&self, events: &[Event]) -> Result<()>;

    /// Every event ever appended, in insertion order. Durable backends
    /// read through to storage so a fresh process observes the full
    /// sequence.
    fn events(&self) -> Result<Vec<Event>>;
}
