use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use keel_core::{Event, KernelError, Result, StateSnapshot};
use keel_kernel::Aggregate;

/// Lifecycle of one user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Received,
    AgentExecuting,
    ToolCallsPending,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// Recorded outcome of one tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutcomeRecord {
    pub command: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Everything the saga knows about one request: delegation, the pending
/// set of in-flight tool calls, collected outcomes, and the terminal
/// response. Derived purely from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestState {
    pub request_id: String,
    pub text: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    /// Tool-call ids placed but not yet completed or failed.
    #[serde(default)]
    pub pending: BTreeSet<String>,
    /// Outcomes keyed by tool-call id.
    #[serde(default)]
    pub results: BTreeMap<String, ToolOutcomeRecord>,
    pub status: RequestStatus,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl RequestState {
    fn new(request_id: String, text: String) -> Self {
        Self {
            request_id,
            text,
            agent: None,
            task: None,
            pending: BTreeSet::new(),
            results: BTreeMap::new(),
            status: RequestStatus::Received,
            response: None,
            is_error: false,
        }
    }

    /// True once any recorded tool outcome carries an error.
    pub fn has_failures(&self) -> bool {
        self.results.values().any(|r| r.error.is_some())
    }
}

/// Projection tracking every request's saga state under projection id
/// `"requests"`.
///
/// Terminal requests are frozen: completion is first-wins, and stray
/// tool-call events arriving after the terminal event are dropped rather
/// than reopening the request.
#[derive(Default)]
pub struct RequestProjection {
    requests: BTreeMap<String, RequestState>,
}

pub const REQUESTS_PROJECTION: &str = "requests";

impl RequestProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one request's state out of a snapshot.
    pub fn state_of(snapshot: &StateSnapshot, request_id: &str) -> Option<RequestState> {
        let value = snapshot.get(REQUESTS_PROJECTION)?.get(request_id)?;
        serde_json::from_value(value.clone()).ok()
    }

    fn entry_mut(&mut self, request_id: &str) -> Option<&mut RequestState> {
        let state = self.requests.get_mut(request_id)?;
        if state.status.is_terminal() {
            debug!(request_id, "ignoring event for terminal request");
            return None;
        }
        Some(state)
    }
}

impl Aggregate for RequestProjection {
    fn id(&self) -> &str {
        REQUESTS_PROJECTION
    }

    fn apply_event(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::UserRequestReceived { request_id, text } => {
                // Re-delivery of the same request id never resets state.
                self.requests
                    .entry(request_id.clone())
                    .or_insert_with(|| RequestState::new(request_id.clone(), text.clone()));
            }
            Event::AgentCallDecided {
                request_id,
                agent,
                task,
            } => {
                if let Some(state) = self.entry_mut(request_id) {
                    state.agent = Some(agent.clone());
                    state.task = Some(task.clone());
                    state.status = RequestStatus::AgentExecuting;
                }
            }
            Event::ToolCallRequestPlaced {
                request_id,
                call_id,
                command,
                ..
            } => {
                if let Some(state) = self.entry_mut(request_id) {
                    state.pending.insert(call_id.clone());
                    state.results.insert(
                        call_id.clone(),
                        ToolOutcomeRecord {
                            command: command.clone(),
                            output: None,
                            error: None,
                        },
                    );
                    state.status = RequestStatus::ToolCallsPending;
                }
            }
            Event::ToolCallCompleted {
                request_id,
                call_id,
                output,
            } => {
                if let Some(state) = self.entry_mut(request_id) {
                    state.pending.remove(call_id);
                    state.results.entry(call_id.clone()).or_default().output =
                        Some(output.clone());
                }
            }
            Event::ToolCallFailed {
                request_id,
                call_id,
                error,
            } => {
                if let Some(state) = self.entry_mut(request_id) {
                    state.pending.remove(call_id);
                    state.results.entry(call_id.clone()).or_default().error =
                        Some(error.clone());
                }
            }
            Event::RequestCompleted {
                request_id,
                text,
                is_error,
            } => {
                if let Some(state) = self.entry_mut(request_id) {
                    state.response = Some(text.clone());
                    state.is_error = *is_error;
                    state.status = if *is_error {
                        RequestStatus::Failed
                    } else {
                        RequestStatus::Completed
                    };
                }
            }
            other => {
                return Err(KernelError::UnhandledEvent {
                    projection: REQUESTS_PROJECTION.into(),
                    kind: other.kind().to_string(),
                })
            }
        }
        Ok(())
    }

    fn state(&self) -> Value {
        serde_json::to_value(&self.requests).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed(call_id: &str) -> Event {
        Event::ToolCallRequestPlaced {
            request_id: "r1".into(),
            call_id: call_id.into(),
            command: "list_files".into(),
            arguments: serde_json::json!({}),
        }
    }

    fn projection_after(events: &[Event]) -> RequestProjection {
        let mut projection = RequestProjection::new();
        for event in events {
            let _ = projection.apply_event(event);
        }
        projection
    }

    #[test]
    fn pending_set_tracks_placements_and_resolutions() {
        let projection = projection_after(&[
            Event::UserRequestReceived {
                request_id: "r1".into(),
                text: "go".into(),
            },
            placed("c1"),
            placed("c2"),
            Event::ToolCallCompleted {
                request_id: "r1".into(),
                call_id: "c1".into(),
                output: serde_json::json!("ok"),
            },
        ]);

        let state = projection.requests.get("r1").unwrap();
        assert_eq!(state.pending.len(), 1);
        assert!(state.pending.contains("c2"));
        assert_eq!(state.status, RequestStatus::ToolCallsPending);
        assert!(!state.has_failures());
    }

    #[test]
    fn completion_is_first_wins() {
        let projection = projection_after(&[
            Event::UserRequestReceived {
                request_id: "r1".into(),
                text: "go".into(),
            },
            Event::RequestCompleted {
                request_id: "r1".into(),
                text: "first".into(),
                is_error: false,
            },
            Event::RequestCompleted {
                request_id: "r1".into(),
                text: "second".into(),
                is_error: true,
            },
        ]);

        let state = projection.requests.get("r1").unwrap();
        assert_eq!(state.response.as_deref(), Some("first"));
        assert_eq!(state.status, RequestStatus::Completed);
    }

    #[test]
    fn terminal_requests_ignore_stray_tool_events() {
        let projection = projection_after(&[
            Event::UserRequestReceived {
                request_id: "r1".into(),
                text: "go".into(),
            },
            Event::RequestCompleted {
                request_id: "r1".into(),
                text: "done".into(),
                is_error: false,
            },
            placed("late"),
        ]);

        let state = projection.requests.get("r1").unwrap();
        assert!(state.pending.is_empty());
        assert_eq!(state.status, RequestStatus::Completed);
    }

    #[test]
    fn failures_flip_the_failure_flag() {
        let projection = projection_after(&[
            Event::UserRequestReceived {
                request_id: "r1".into(),
                text: "go".into(),
            },
            placed("c1"),
            Event::ToolCallFailed {
                request_id: "r1".into(),
                call_id: "c1".into(),
                error: "no plugin found for command list_files".into(),
            },
        ]);

        let state = projection.requests.get("r1").unwrap();
        assert!(state.pending.is_empty());
        assert!(state.has_failures());
    }

    #[test]
    fn unrelated_kinds_are_unhandled() {
        let mut projection = RequestProjection::new();
        let err = projection
            .apply_event(&Event::PluginLoaded {
                plugin: "files".into(),
                kind: "system".into(),
            })
            .unwrap_err();
        assert!(matches!(err, KernelError::UnhandledEvent { .. }));
    }
}
