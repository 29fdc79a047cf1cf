use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use keel_core::{Event, EventRegistry, KernelError, Result};

use crate::EventLog;

/// SQLite-backed event log. Events are stored as `(kind, payload)` rows;
/// decoding goes through the [`EventRegistry`], so a row whose kind was
/// never registered fails the whole read with `UnknownEventType` rather
/// than yielding a partial sequence.
pub struct SqliteLog {
    db: Mutex<Connection>,
    registry: Arc<EventRegistry>,
}

impl SqliteLog {
    /// Open or create the event log database at the given path.
    pub fn open(path: &Path, registry: Arc<EventRegistry>) -> Result<Self> {
        info!(?path, "opening event log");

        let conn = Connection::open(path).map_err(|e| KernelError::Store(e.to_string()))?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| KernelError::Store(e.to_string()))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            ",
        )
        .map_err(|e| KernelError::Store(e.to_string()))?;

        Ok(Self {
            db: Mutex::new(conn),
            registry,
        })
    }

    /// In-memory SQLite database, useful in tests.
    pub fn open_in_memory(registry: Arc<EventRegistry>) -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| KernelError::Store(e.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| KernelError::Store(e.to_string()))?;
        Ok(Self {
            db: Mutex::new(conn),
            registry,
        })
    }
}

impl EventLog for SqliteLog {
    fn append(&self, events: &[Event]) -> Result<()> {
        let mut db = self.db.lock();
        let tx = db
            .transaction()
            .map_err(|e| KernelError::Store(e.to_string()))?;
        for event in events {
            let (kind, payload) = event.encode()?;
            tx.execute(
                "INSERT INTO events (kind, payload, recorded_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    kind,
                    payload.to_string(),
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| KernelError::Store(e.to_string()))?;
        }
        tx.commit().map_err(|e| KernelError::Store(e.to_string()))?;
        Ok(())
    }

    fn events(&self) -> Result<Vec<Event>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT kind, payload FROM events ORDER BY seq ASC")
            .map_err(|e| KernelError::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| KernelError::Store(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            let (kind, payload) = row.map_err(|e| KernelError::Store(e.to_string()))?;
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            events.push(self.registry.decode(&kind, payload)?);
        }
        Ok(events)
    }
}
