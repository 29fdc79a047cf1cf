use thiserror::Error;

/// Unified error type for the entire Keel kernel.
#[derive(Error, Debug)]
pub enum KernelError {
    // ── Registry errors ────────────────────────────────────────
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unhandled event type: {projection}: {kind}")]
    UnhandledEvent { projection: String, kind: String },

    // ── Validation errors ──────────────────────────────────────
    #[error("invalid command input: {command}: {reason}")]
    InvalidInput { command: String, reason: String },

    // ── Infrastructure errors ──────────────────────────────────
    #[error("event log error: {0}")]
    Store(String),

    #[error("event bus is gone")]
    BusClosed,

    // ── LLM errors ─────────────────────────────────────────────
    #[error("llm provider error: {0}")]
    LlmProvider(String),

    // ── Plugin errors ──────────────────────────────────────────
    #[error("plugin error: {plugin}: {reason}")]
    Plugin { plugin: String, reason: String },

    #[error("plugin build failed: {plugin}: {reason}")]
    PluginBuild { plugin: String, reason: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
