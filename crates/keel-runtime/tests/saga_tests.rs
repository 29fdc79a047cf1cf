use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use keel_core::{CommandOutcome, CommandSpec, Event, FieldKind, InputSchema, KernelError};
use keel_kernel::{Aggregates, AppProjection, EventBus, RecoveryManager};
use keel_llm::MockClient;
use keel_plugin::{AgentDescriptor, AgentProfile, CommandRegistry};
use keel_runtime::{Orchestrator, RequestProjection, RequestStatus};
use keel_store::MemoryLog;

fn file_commands() -> Arc<CommandRegistry> {
    let commands = Arc::new(CommandRegistry::new());
    commands.register(
        "files",
        CommandSpec::new(
            "list_files",
            "list files in a directory",
            InputSchema::new()
                .field("path", FieldKind::String, "directory to list")
                .require("path"),
            Arc::new(|_input, _state| Ok(CommandOutcome::text("a.txt b.txt"))),
        ),
    );
    commands.register(
        "files",
        CommandSpec::new(
            "read_file",
            "read one file",
            InputSchema::new()
                .field("path", FieldKind::String, "file to read")
                .require("path"),
            Arc::new(|_input, _state| Ok(CommandOutcome::text("hello from a.txt"))),
        ),
    );
    commands.register(
        "files",
        CommandSpec::new(
            "broken_tool",
            "always fails",
            InputSchema::new(),
            Arc::new(|_input, _state| {
                Err(KernelError::Plugin {
                    plugin: "files".into(),
                    reason: "backend unavailable".into(),
                })
            }),
        ),
    );
    commands
}

fn researcher() -> AgentDescriptor {
    AgentDescriptor {
        name: "researcher".into(),
        description: "Delegate work to the 'researcher' agent".into(),
        profile: AgentProfile {
            system_prompt: "You research things using the file tools.".into(),
            model: "gpt-4o-mini".into(),
        },
        command_names: vec!["list_files".into(), "read_file".into(), "broken_tool".into()],
    }
}

fn harness(mock: MockClient) -> (Arc<EventBus>, broadcast::Receiver<Event>) {
    harness_with_agents(mock, vec![researcher()])
}

fn harness_with_agents(
    mock: MockClient,
    agents: Vec<AgentDescriptor>,
) -> (Arc<EventBus>, broadcast::Receiver<Event>) {
    let aggregates = Aggregates::new();
    aggregates.register(Arc::new(RwLock::new(RequestProjection::new())));
    aggregates.register(Arc::new(RwLock::new(AppProjection::new())));
    let bus = EventBus::new(
        Arc::new(MemoryLog::new()),
        aggregates,
        file_commands(),
        Arc::new(RecoveryManager::new(Duration::from_secs(3600), 3)),
    );
    let watch = bus.watch();

    let orchestrator = Orchestrator::new(Arc::new(mock), agents, "gpt-4o");
    orchestrator.attach(&bus);
    // Keep the orchestrator alive through its subscriber closures.
    (bus, watch)
}

fn request(id: &str, text: &str) -> Event {
    Event::UserRequestReceived {
        request_id: id.into(),
        text: text.into(),
    }
}

async fn collect_until_completed(watch: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("timed out waiting for request_completed")
            .expect("watch channel closed");
        let done = matches!(event, Event::RequestCompleted { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

fn kinds(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.kind()).collect()
}

// ── Scenario: happy path ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn request_is_delegated_executed_and_summarized() {
    let mock = MockClient::new()
        .with_tool_call("researcher", serde_json::json!({ "task": "inspect the files" }))
        .with_tool_calls(vec![
            ("list_files", serde_json::json!({ "path": "." })),
            ("read_file", serde_json::json!({ "path": "a.txt" })),
        ])
        .with_reply("The directory holds a.txt, which greets you.");
    let (bus, mut watch) = harness(mock);

    bus.publish(&[request("r1", "what's in my files?")]).unwrap();
    let events = collect_until_completed(&mut watch).await;

    match events.last().unwrap() {
        Event::RequestCompleted { text, is_error, .. } => {
            assert!(!*is_error);
            assert_eq!(text, "The directory holds a.txt, which greets you.");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }

    // Both placements land before any resolution.
    let seen = kinds(&events);
    let last_placement = seen
        .iter()
        .rposition(|k| *k == "tool_call_request_placed")
        .unwrap();
    let first_resolution = seen
        .iter()
        .position(|k| *k == "tool_call_completed")
        .unwrap();
    assert!(last_placement < first_resolution);
    assert_eq!(
        seen.iter()
            .filter(|k| **k == "tool_call_request_placed")
            .count(),
        2
    );

    let state = RequestProjection::state_of(&bus.snapshot(), "r1").unwrap();
    assert_eq!(state.status, RequestStatus::Completed);
    assert!(state.pending.is_empty());
    assert_eq!(state.results.len(), 2);
}

// ── Scenario: degraded completion on tool failure ──────────────

#[tokio::test(flavor = "multi_thread")]
async fn failed_tool_calls_yield_a_degraded_completion() {
    let mock = MockClient::new()
        .with_tool_call("researcher", serde_json::json!({ "task": "poke around" }))
        .with_tool_calls(vec![
            ("list_files", serde_json::json!({ "path": "." })),
            ("missing_cmd", serde_json::json!({})),
            ("broken_tool", serde_json::json!({})),
        ]);
    let (bus, mut watch) = harness(mock);

    bus.publish(&[request("r2", "poke around")]).unwrap();
    let events = collect_until_completed(&mut watch).await;

    match events.last().unwrap() {
        Event::RequestCompleted { text, is_error, .. } => {
            assert!(*is_error);
            assert!(text.contains("no plugin found for command missing_cmd"));
            assert!(text.contains("backend unavailable"));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }

    let state = RequestProjection::state_of(&bus.snapshot(), "r2").unwrap();
    assert_eq!(state.status, RequestStatus::Failed);
    assert!(state.pending.is_empty());
    // The successful call's output is still recorded.
    assert!(state
        .results
        .values()
        .any(|r| r.command == "list_files" && r.output.is_some()));
}

// ── Scenario: direct answer ────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn router_may_answer_without_delegating() {
    let mock = MockClient::new().with_reply("The answer is 42.");
    let (bus, mut watch) = harness(mock);

    bus.publish(&[request("r3", "what is the answer?")]).unwrap();
    let events = collect_until_completed(&mut watch).await;

    assert!(!kinds(&events).contains(&"agent_call_decided"));
    match events.last().unwrap() {
        Event::RequestCompleted { text, is_error, .. } => {
            assert!(!*is_error);
            assert_eq!(text, "The answer is 42.");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

// ── Scenario: no agents loaded ─────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn with_no_agents_the_router_answers_directly() {
    let mock = MockClient::new().with_reply("Nothing is plugged in, but 2 + 2 is 4.");
    let recorded = mock.recorded_requests();
    let (bus, mut watch) = harness_with_agents(mock, vec![]);

    bus.publish(&[request("r7", "what is 2 + 2?")]).unwrap();
    let events = collect_until_completed(&mut watch).await;

    assert!(!kinds(&events).contains(&"agent_call_decided"));
    assert!(!kinds(&events).contains(&"tool_call_request_placed"));
    match events.last().unwrap() {
        Event::RequestCompleted { text, is_error, .. } => {
            assert!(!*is_error);
            assert_eq!(text, "Nothing is plugged in, but 2 + 2 is 4.");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }

    // The routing turn offered no delegation tools at all.
    let recorded = recorded.lock();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].tools.is_empty());

    let state = RequestProjection::state_of(&bus.snapshot(), "r7").unwrap();
    assert_eq!(state.status, RequestStatus::Completed);
    assert!(state.pending.is_empty());
}

// ── Scenario: multi-turn context ───────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn routing_turn_carries_the_prior_conversation() {
    let mock = MockClient::new()
        .with_reply("Nice to meet you, Ada.")
        .with_reply("Your name is Ada.");
    let recorded = mock.recorded_requests();
    let (bus, mut watch) = harness(mock);

    bus.publish(&[request("r8", "my name is Ada")]).unwrap();
    collect_until_completed(&mut watch).await;
    bus.publish(&[request("r9", "what is my name?")]).unwrap();
    let events = collect_until_completed(&mut watch).await;

    match events.last().unwrap() {
        Event::RequestCompleted { text, .. } => assert_eq!(text, "Your name is Ada."),
        other => panic!("unexpected terminal event {other:?}"),
    }

    // The second routing turn replays the whole first exchange before
    // the new question.
    let recorded = recorded.lock();
    assert_eq!(recorded.len(), 2);
    let texts: Vec<&str> = recorded[1]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(
        texts,
        vec![
            "my name is Ada",
            "Nice to meet you, Ada.",
            "what is my name?"
        ]
    );
}

// ── Scenario: unknown agent ────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn delegating_to_an_unknown_agent_fails_the_request() {
    let mock =
        MockClient::new().with_tool_call("ghost", serde_json::json!({ "task": "haunt things" }));
    let (bus, mut watch) = harness(mock);

    bus.publish(&[request("r4", "do spooky work")]).unwrap();
    let events = collect_until_completed(&mut watch).await;

    match events.last().unwrap() {
        Event::RequestCompleted { text, is_error, .. } => {
            assert!(*is_error);
            assert!(text.contains("ghost"));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    let state = RequestProjection::state_of(&bus.snapshot(), "r4").unwrap();
    assert_eq!(state.status, RequestStatus::Failed);
}

// ── Scenario: exactly-once finalization ────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn completion_is_published_exactly_once() {
    let mock = MockClient::new()
        .with_tool_call("researcher", serde_json::json!({ "task": "sweep" }))
        .with_tool_calls(vec![
            ("list_files", serde_json::json!({ "path": "a" })),
            ("list_files", serde_json::json!({ "path": "b" })),
            ("list_files", serde_json::json!({ "path": "c" })),
        ])
        .with_reply("All three directories listed.");
    let (bus, mut watch) = harness(mock);

    bus.publish(&[request("r5", "sweep everything")]).unwrap();
    let events = collect_until_completed(&mut watch).await;
    assert_eq!(
        kinds(&events)
            .iter()
            .filter(|k| **k == "request_completed")
            .count(),
        1
    );

    // Nothing else terminal trickles in afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = watch.try_recv() {
        assert!(!matches!(event, Event::RequestCompleted { .. }));
    }

    let state = RequestProjection::state_of(&bus.snapshot(), "r5").unwrap();
    assert_eq!(state.status, RequestStatus::Completed);
    assert_eq!(state.results.len(), 3);
}

// ── LLM failure during routing ─────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn router_llm_failure_terminates_the_request() {
    let mock = MockClient::new().with_error("HTTP 500: provider down");
    let (bus, mut watch) = harness(mock);

    bus.publish(&[request("r6", "anything")]).unwrap();
    let events = collect_until_completed(&mut watch).await;

    match events.last().unwrap() {
        Event::RequestCompleted { is_error, text, .. } => {
            assert!(*is_error);
            assert!(text.contains("provider down"));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}
