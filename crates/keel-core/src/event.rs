use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{KernelError, Result};

/// Subscription key matching every event kind.
pub const WILDCARD: &str = "*";

/// Events flowing through the kernel — immutable, named, serializable
/// facts. The event log is the system of record; state changes only by
/// applying events.
///
/// The alphabet is a closed enum. Plugin-defined or legacy payloads ride
/// in [`Event::Custom`], the one migration fallback for kinds the kernel
/// does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    // ── Request lifecycle ──────────────────────────────────────
    UserRequestReceived {
        request_id: String,
        text: String,
    },
    AgentCallDecided {
        request_id: String,
        agent: String,
        task: String,
    },
    ToolCallRequestPlaced {
        request_id: String,
        call_id: String,
        command: String,
        arguments: Value,
    },
    ToolCallCompleted {
        request_id: String,
        call_id: String,
        output: Value,
    },
    ToolCallFailed {
        request_id: String,
        call_id: String,
        error: String,
    },
    RequestCompleted {
        request_id: String,
        text: String,
        is_error: bool,
    },

    // ── Plugin lifecycle ───────────────────────────────────────
    PluginLoaded {
        plugin: String,
        kind: String,
    },

    // ── Migration fallback ─────────────────────────────────────
    Custom {
        kind: String,
        payload: Value,
    },
}

/// Every kernel-owned event kind, in declaration order.
pub const KERNEL_EVENT_KINDS: &[&str] = &[
    "user_request_received",
    "agent_call_decided",
    "tool_call_request_placed",
    "tool_call_completed",
    "tool_call_failed",
    "request_completed",
    "plugin_loaded",
];

impl Event {
    /// The discriminant string for this event.
    pub fn kind(&self) -> &str {
        match self {
            Event::UserRequestReceived { .. } => "user_request_received",
            Event::AgentCallDecided { .. } => "agent_call_decided",
            Event::ToolCallRequestPlaced { .. } => "tool_call_request_placed",
            Event::ToolCallCompleted { .. } => "tool_call_completed",
            Event::ToolCallFailed { .. } => "tool_call_failed",
            Event::RequestCompleted { .. } => "request_completed",
            Event::PluginLoaded { .. } => "plugin_loaded",
            Event::Custom { kind, .. } => kind,
        }
    }

    /// The request this event belongs to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Event::UserRequestReceived { request_id, .. }
            | Event::AgentCallDecided { request_id, .. }
            | Event::ToolCallRequestPlaced { request_id, .. }
            | Event::ToolCallCompleted { request_id, .. }
            | Event::ToolCallFailed { request_id, .. }
            | Event::RequestCompleted { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Split into a `(kind, payload)` pair for storage. The inverse is
    /// [`EventRegistry::decode`].
    pub fn encode(&self) -> Result<(String, Value)> {
        if let Event::Custom { kind, payload } = self {
            return Ok((kind.clone(), payload.clone()));
        }
        let tagged = serde_json::to_value(self)?;
        let payload = tagged.get("payload").cloned().unwrap_or(Value::Null);
        Ok((self.kind().to_string(), payload))
    }
}

/// Constructor for one event kind: payload in, event out.
pub type Decoder = Arc<dyn Fn(Value) -> Result<Event> + Send + Sync>;

/// Process-wide mapping from event-kind name to a constructor used for
/// deserialization. Every kind consumed by the kernel must be registered
/// before decoding is attempted; an unregistered kind is a distinct
/// [`KernelError::UnknownEventType`].
pub struct EventRegistry {
    decoders: RwLock<HashMap<String, Decoder>>,
}

impl EventRegistry {
    /// An empty registry. Most callers want [`EventRegistry::with_kernel_events`].
    pub fn new() -> Self {
        Self {
            decoders: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with every kernel-owned event kind.
    pub fn with_kernel_events() -> Self {
        let registry = Self::new();
        for kind in KERNEL_EVENT_KINDS {
            let kind_owned = kind.to_string();
            registry.register(
                kind,
                Arc::new(move |payload| {
                    let tagged = serde_json::json!({ "kind": kind_owned, "payload": payload });
                    Ok(serde_json::from_value::<Event>(tagged)?)
                }),
            );
        }
        registry
    }

    /// Register a constructor for a kind. Later registrations replace
    /// earlier ones for the same kind.
    pub fn register(&self, kind: &str, decoder: Decoder) {
        self.decoders.write().insert(kind.to_string(), decoder);
    }

    /// Register a plugin-defined kind that decodes into [`Event::Custom`].
    pub fn register_custom(&self, kind: &str) {
        let kind_owned = kind.to_string();
        self.register(
            kind,
            Arc::new(move |payload| {
                Ok(Event::Custom {
                    kind: kind_owned.clone(),
                    payload,
                })
            }),
        );
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.read().contains_key(kind)
    }

    /// Reconstruct an event from its stored `(kind, payload)` pair.
    pub fn decode(&self, kind: &str, payload: Value) -> Result<Event> {
        let decoder = self
            .decoders
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| KernelError::UnknownEventType(kind.to_string()))?;
        decoder(payload)
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::with_kernel_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_serde_tag() {
        let event = Event::UserRequestReceived {
            request_id: "r1".into(),
            text: "hi".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], event.kind());
    }

    #[test]
    fn encode_decode_round_trip() {
        let registry = EventRegistry::with_kernel_events();
        let event = Event::ToolCallRequestPlaced {
            request_id: "r1".into(),
            call_id: "c0".into(),
            command: "list_files".into(),
            arguments: serde_json::json!({ "path": "/tmp" }),
        };
        let (kind, payload) = event.encode().unwrap();
        assert_eq!(kind, "tool_call_request_placed");
        let decoded = registry.decode(&kind, payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_kind_is_distinct_error() {
        let registry = EventRegistry::with_kernel_events();
        let err = registry
            .decode("never_registered", Value::Null)
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownEventType(k) if k == "never_registered"));
    }

    #[test]
    fn custom_kind_round_trip() {
        let registry = EventRegistry::with_kernel_events();
        registry.register_custom("cache_invalidated");
        let event = Event::Custom {
            kind: "cache_invalidated".into(),
            payload: serde_json::json!({ "keys": 3 }),
        };
        let (kind, payload) = event.encode().unwrap();
        assert_eq!(kind, "cache_invalidated");
        assert_eq!(registry.decode(&kind, payload).unwrap(), event);
    }
}
