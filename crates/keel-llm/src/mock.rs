//! Mock LLM client for deterministic testing.
//!
//! Returns pre-configured replies without making any HTTP calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::client::{ChatOutcome, ChatRequest, LlmClient, ToolInvocation};
use keel_core::{KernelError, Result};

/// A pre-configured reply from the mock client.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    /// If set, the client returns this error instead.
    pub error: Option<String>,
}

impl MockReply {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// A mock LLM client that pops replies off a queue and records every
/// request it receives for assertions.
///
/// # Example
/// ```
/// use keel_llm::MockClient;
/// let client = MockClient::new().with_reply("Hello, world!");
/// ```
pub struct MockClient {
    replies: Mutex<Vec<MockReply>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(vec![]),
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Queue a plain text reply.
    pub fn with_reply(self, content: &str) -> Self {
        self.replies.lock().push(MockReply::text(content));
        self
    }

    /// Queue a reply containing one tool invocation.
    pub fn with_tool_call(self, name: &str, arguments: serde_json::Value) -> Self {
        self.replies.lock().push(MockReply {
            tool_calls: vec![ToolInvocation {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                name: name.to_string(),
                arguments,
            }],
            ..Default::default()
        });
        self
    }

    /// Queue a reply containing several tool invocations at once.
    pub fn with_tool_calls(self, calls: Vec<(&str, serde_json::Value)>) -> Self {
        self.replies.lock().push(MockReply {
            tool_calls: calls
                .into_iter()
                .map(|(name, arguments)| ToolInvocation {
                    id: format!("call_{}", uuid::Uuid::new_v4()),
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
            ..Default::default()
        });
        self
    }

    /// Queue an error reply.
    pub fn with_error(self, message: &str) -> Self {
        self.replies.lock().push(MockReply::error(message));
        self
    }

    /// Queue a fully custom reply.
    pub fn with_mock_reply(self, reply: MockReply) -> Self {
        self.replies.lock().push(reply);
        self
    }

    /// All requests made to this client so far.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<ChatRequest>>> {
        Arc::clone(&self.requests)
    }

    fn next_reply(&self) -> MockReply {
        let mut replies = self.replies.lock();
        if replies.is_empty() {
            MockReply::text("(mock: no more queued replies)")
        } else {
            replies.remove(0)
        }
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome> {
        self.requests.lock().push(request.clone());
        let reply = self.next_reply();

        if let Some(error) = reply.error {
            return Err(KernelError::LlmProvider(error));
        }

        Ok(ChatOutcome {
            content: reply.content,
            tool_calls: reply.tool_calls,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ChatMessage;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test".into(),
            messages: vec![ChatMessage::user("hello")],
            tools: vec![],
            system: None,
            request_id: "r1".into(),
        }
    }

    #[tokio::test]
    async fn text_reply() {
        let client = MockClient::new().with_reply("Hello!");
        let outcome = client.chat(&request()).await.unwrap();
        assert_eq!(outcome.content, "Hello!");
        assert!(!outcome.has_tool_calls());
    }

    #[tokio::test]
    async fn tool_call_reply() {
        let client =
            MockClient::new().with_tool_call("list_files", serde_json::json!({ "path": "." }));
        let outcome = client.chat(&request()).await.unwrap();
        assert!(outcome.has_tool_calls());
        assert_eq!(outcome.tool_calls[0].name, "list_files");
    }

    #[tokio::test]
    async fn error_reply() {
        let client = MockClient::new().with_error("HTTP 429: rate limited");
        assert!(client.chat(&request()).await.is_err());
    }

    #[tokio::test]
    async fn replies_pop_in_order() {
        let client = MockClient::new().with_reply("first").with_reply("second");
        assert_eq!(client.chat(&request()).await.unwrap().content, "first");
        assert_eq!(client.chat(&request()).await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn records_requests() {
        let client = MockClient::new().with_reply("ok");
        let _ = client.chat(&request()).await;
        let recorded = client.recorded_requests();
        let recorded = recorded.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].request_id, "r1");
    }
}
