use std::sync::Arc;

use keel_core::{CommandSpec, Event, Result, StateSnapshot};

/// Capability class of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Internal capability; never exposed to the LLM as a delegate.
    System,
    /// LLM-callable delegate with its own prompt, model, and tools.
    Agent,
}

impl PluginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginKind::System => "system",
            PluginKind::Agent => "agent",
        }
    }
}

/// Prompt and model an Agent plugin runs under when the orchestrator
/// delegates to it. Opaque strings to the kernel.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub system_prompt: String,
    pub model: String,
}

/// A reactive handler a plugin attaches to an event kind. Runs inside a
/// recovery-isolated bus task; returned events are republished.
pub type PluginEventHandler =
    Arc<dyn Fn(&Event, &StateSnapshot) -> Result<Vec<Event>> + Send + Sync>;

/// The command/event surface the kernel consumes from a capability
/// provider.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PluginKind;

    /// Commands this plugin exposes, each with its input schema.
    fn commands(&self) -> Vec<CommandSpec>;

    /// Event-kind subscriptions this plugin wants on the bus.
    fn event_handlers(&self) -> Vec<(String, PluginEventHandler)> {
        vec![]
    }

    /// Present for Agent-kind plugins only.
    fn agent_profile(&self) -> Option<AgentProfile> {
        None
    }
}
