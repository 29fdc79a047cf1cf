//! # keel-runtime
//!
//! The request saga on top of the kernel: routing a user request to an
//! agent, fanning out the agent's tool calls, and finalizing exactly once
//! when every call has resolved. State lives in the [`RequestProjection`];
//! the [`Orchestrator`] only reacts to events and publishes new ones.

pub mod orchestrator;
pub mod requests;

pub use orchestrator::Orchestrator;
pub use requests::{
    RequestProjection, RequestState, RequestStatus, ToolOutcomeRecord, REQUESTS_PROJECTION,
};
