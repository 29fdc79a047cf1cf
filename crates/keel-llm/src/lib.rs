//! # keel-llm
//!
//! The LLM boundary of the kernel. The orchestrator treats inference as an
//! opaque RPC: messages and tool definitions in, text and tool invocations
//! out. Providers live behind [`LlmClient`]; tests use [`MockClient`].

pub mod client;
pub mod mock;
pub mod openai;

pub use client::{ChatOutcome, ChatRequest, LlmClient, ToolDef, ToolInvocation};
pub use mock::{MockClient, MockReply};
pub use openai::OpenAiClient;
