use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use keel_core::{ChatMessage, Result};

/// A callable tool as advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    /// Human-readable description for the LLM.
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// A request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier; opaque to the kernel.
    pub model: String,
    /// Conversation history.
    pub messages: Vec<ChatMessage>,
    /// Available tools. May be empty (plain chat).
    pub tools: Vec<ToolDef>,
    /// System prompt, separate from messages.
    pub system: Option<String>,
    /// The request this call serves, for log correlation.
    pub request_id: String,
}

/// A tool invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The complete outcome of one chat call. Streaming is a provider detail;
/// the orchestrator only ever sees the finished pair.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
}

impl ChatOutcome {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Trait implemented by each LLM provider adapter.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Human-readable provider name, e.g. "openai", "mock".
    fn name(&self) -> &str;

    /// Run one chat call to completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome>;

    /// Check if this provider is healthy / reachable.
    async fn health_check(&self) -> Result<()>;
}
