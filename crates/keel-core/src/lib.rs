//! # keel-core
//!
//! Core types and traits for the Keel event-sourced kernel. This crate
//! defines the shared vocabulary used by every other crate in the
//! workspace: the event alphabet, the command contract, and the unified
//! error type.

pub mod command;
pub mod error;
pub mod event;
pub mod message;

pub use command::{
    CommandHandler, CommandOutcome, CommandSpec, FieldKind, InputSchema, StateSnapshot,
};
pub use error::{KernelError, Result};
pub use event::{Event, EventRegistry, WILDCARD};
pub use message::{ChatMessage, Role};
