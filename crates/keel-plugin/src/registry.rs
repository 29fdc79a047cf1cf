use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use keel_core::CommandSpec;

use crate::contract::{AgentProfile, Plugin, PluginEventHandler};

/// A registered command plus the plugin that owns it.
#[derive(Clone)]
pub struct CommandEntry {
    pub spec: CommandSpec,
    pub plugin: String,
}

/// Process-wide command table. Registration is first-wins: a later plugin
/// exposing an already-registered command name is logged and ignored,
/// never an error.
#[derive(Default)]
pub struct CommandRegistry {
    entries: RwLock<HashMap<String, CommandEntry>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command for a plugin. Returns false on a name collision
    /// (the existing registration stands).
    pub fn register(&self, plugin: &str, spec: CommandSpec) -> bool {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&spec.name) {
            warn!(
                command = %spec.name,
                kept = %existing.plugin,
                ignored = %plugin,
                "command name collision, first registration wins"
            );
            return false;
        }
        entries.insert(
            spec.name.clone(),
            CommandEntry {
                spec,
                plugin: plugin.to_string(),
            },
        );
        true
    }

    pub fn get(&self, name: &str) -> Option<CommandEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Commands owned by one plugin, sorted by name.
    pub fn owned_by(&self, plugin: &str) -> Vec<CommandEntry> {
        let mut owned: Vec<CommandEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| e.plugin == plugin)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        owned
    }
}

/// An Agent plugin as seen by the orchestrator: its delegation profile
/// plus the names of the commands it brought.
#[derive(Clone)]
pub struct AgentDescriptor {
    pub name: String,
    pub description: String,
    pub profile: AgentProfile,
    pub command_names: Vec<String>,
}

/// The merged surface of all loaded plugins.
pub struct MergedSurface {
    pub commands: Arc<CommandRegistry>,
    /// `(plugin, event kind, handler)` subscriptions to wire onto the bus.
    pub subscriptions: Vec<(String, String, PluginEventHandler)>,
    pub agents: Vec<AgentDescriptor>,
}

/// Holds every loaded plugin and produces the merged command/handler
/// surface the kernel consumes.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        info!(plugin = plugin.name(), kind = plugin.kind().as_str(), "plugin registered");
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Merge every plugin's surface. Commands collide first-wins; event
    /// handler subscriptions are append-only.
    pub fn merge(&self) -> MergedSurface {
        let commands = Arc::new(CommandRegistry::new());
        let mut subscriptions = Vec::new();
        let mut agents = Vec::new();

        for plugin in &self.plugins {
            let mut command_names = Vec::new();
            for spec in plugin.commands() {
                let name = spec.name.clone();
                if commands.register(plugin.name(), spec) {
                    command_names.push(name);
                }
            }
            for (kind, handler) in plugin.event_handlers() {
                subscriptions.push((plugin.name().to_string(), kind, handler));
            }
            if let Some(profile) = plugin.agent_profile() {
                agents.push(AgentDescriptor {
                    name: plugin.name().to_string(),
                    description: format!(
                        "Delegate work to the '{}' agent",
                        plugin.name()
                    ),
                    profile,
                    command_names,
                });
            }
        }

        MergedSurface {
            commands,
            subscriptions,
            agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{CommandOutcome, InputSchema};

    struct FakePlugin {
        name: &'static str,
        command: &'static str,
        reply: &'static str,
    }

    impl Plugin for FakePlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> crate::PluginKind {
            crate::PluginKind::System
        }

        fn commands(&self) -> Vec<CommandSpec> {
            let reply = self.reply;
            vec![CommandSpec::new(
                self.command,
                "test command",
                InputSchema::new(),
                Arc::new(move |_input, _state| Ok(CommandOutcome::text(reply))),
            )]
        }
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(FakePlugin {
            name: "alpha",
            command: "List",
            reply: "from alpha",
        }));
        registry.add(Arc::new(FakePlugin {
            name: "beta",
            command: "List",
            reply: "from beta",
        }));

        let surface = registry.merge();
        let entry = surface.commands.get("List").unwrap();
        assert_eq!(entry.plugin, "alpha");

        let outcome = (entry.spec.handler)(serde_json::json!({}), &Default::default()).unwrap();
        assert_eq!(outcome.output, "from alpha");
    }

    #[test]
    fn owned_by_filters_per_plugin() {
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(FakePlugin {
            name: "alpha",
            command: "one",
            reply: "1",
        }));
        registry.add(Arc::new(FakePlugin {
            name: "beta",
            command: "two",
            reply: "2",
        }));

        let surface = registry.merge();
        let owned = surface.commands.owned_by("beta");
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].spec.name, "two");
    }
}
