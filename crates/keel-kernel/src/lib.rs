//! # keel-kernel
//!
//! The event-sourced kernel: an append-only log drives projections, a
//! synchronous command path, and an async pub/sub bus. Events are the
//! only way state changes; replaying the log reconstructs every
//! projection deterministically.
//!
//! The pipeline per published batch is persist → apply → notify:
//! persistence failures abort before any projection or subscriber sees
//! the batch, and subscribers run on isolated tasks supervised by the
//! [`recovery::RecoveryManager`].

pub mod aggregate;
pub mod bus;
pub mod processor;
pub mod recovery;

pub use aggregate::{Aggregate, Aggregates, AppProjection, APP_PROJECTION};
pub use bus::{EventBus, EventPublisher, HandlerContext, Subscriber, SubscriptionId};
pub use keel_core::WILDCARD;
pub use processor::{CommandProcessor, SyncEventHandler};
pub use recovery::{FailureHandler, RecoveredFailure, RecoveryManager};
