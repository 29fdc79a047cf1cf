//! # keel-config
//!
//! Configuration for the Keel kernel: the `keel.toml` schema, a loader
//! with environment-variable overrides, and startup validation that
//! warns on suspicious values and fails on unusable ones.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ConfigWarning, KeelConfig, KernelConfig, LlmConfig, LoggingConfig, PluginsConfig,
    RecoveryConfig, WarningSeverity,
};
