//! # keel-plugin
//!
//! Capability providers ("plugins") extend the kernel with commands and
//! event handlers. This crate defines the plugin contract, the
//! first-registration-wins command registry, and the discover → build →
//! load cycle with its mtime-keyed build cache.

pub mod contract;
pub mod loader;
pub mod manifest;
pub mod registry;

pub use contract::{AgentProfile, Plugin, PluginEventHandler, PluginKind};
pub use loader::{
    build, discover, is_stale, PluginFactory, PluginHost, PluginLoader, PluginUnit, StaticHost,
    ARTIFACT_EXT,
};
pub use manifest::PluginManifest;
pub use registry::{AgentDescriptor, CommandEntry, CommandRegistry, MergedSurface, PluginRegistry};
