use std::sync::Arc;

use keel_core::{Event, EventRegistry};
use keel_store::{EventLog, SqliteLog};

fn sequence() -> Vec<Event> {
    vec![
        Event::UserRequestReceived {
            request_id: "r1".into(),
            text: "hi".into(),
        },
        Event::AgentCallDecided {
            request_id: "r1".into(),
            agent: "files".into(),
            task: "list".into(),
        },
        Event::ToolCallCompleted {
            request_id: "r1".into(),
            call_id: "c0".into(),
            output: serde_json::json!(["a.txt"]),
        },
        Event::RequestCompleted {
            request_id: "r1".into(),
            text: "done".into(),
            is_error: false,
        },
    ]
}

#[test]
fn sequence_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.db");
    let registry = Arc::new(EventRegistry::with_kernel_events());

    {
        let log = SqliteLog::open(&path, Arc::clone(&registry)).unwrap();
        log.append(&sequence()).unwrap();
    }

    // A fresh handle must reproduce exactly the appended sequence.
    let reopened = SqliteLog::open(&path, registry).unwrap();
    assert_eq!(reopened.events().unwrap(), sequence());
}

#[test]
fn appends_from_separate_calls_interleave_in_call_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.db");
    let registry = Arc::new(EventRegistry::with_kernel_events());
    let log = SqliteLog::open(&path, registry).unwrap();

    for event in sequence() {
        log.append(std::slice::from_ref(&event)).unwrap();
    }
    assert_eq!(log.events().unwrap(), sequence());
}
