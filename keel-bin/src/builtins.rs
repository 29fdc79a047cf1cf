//! Built-in plugins shipped with the binary: a file-browsing agent and a
//! kernel status command. External units in the plugin directory extend
//! this set.

use std::sync::Arc;

use keel_core::{CommandOutcome, CommandSpec, FieldKind, InputSchema};
use keel_plugin::{AgentProfile, Plugin, PluginKind};

/// Agent plugin that can inspect the local filesystem.
pub struct AssistantPlugin {
    model: String,
}

impl AssistantPlugin {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

impl Plugin for AssistantPlugin {
    fn name(&self) -> &str {
        "assistant"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Agent
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new(
                "list_files",
                "List the entries of a directory",
                InputSchema::new()
                    .field("path", FieldKind::String, "directory to list")
                    .require("path"),
                Arc::new(|input, _state| {
                    let path = input["path"].as_str().unwrap_or(".");
                    let mut names = Vec::new();
                    for entry in std::fs::read_dir(path)? {
                        names.push(entry?.file_name().to_string_lossy().to_string());
                    }
                    names.sort();
                    Ok(CommandOutcome {
                        events: vec![],
                        output: serde_json::json!(names),
                    })
                }),
            ),
            CommandSpec::new(
                "read_file",
                "Read a file as UTF-8 text",
                InputSchema::new()
                    .field("path", FieldKind::String, "file to read")
                    .require("path"),
                Arc::new(|input, _state| {
                    let path = input["path"].as_str().unwrap_or_default();
                    let content = std::fs::read_to_string(path)?;
                    Ok(CommandOutcome::text(content))
                }),
            ),
        ]
    }

    fn agent_profile(&self) -> Option<AgentProfile> {
        Some(AgentProfile {
            system_prompt: "You are a careful assistant. Use the file tools to \
                            answer questions about the local filesystem."
                .into(),
            model: self.model.clone(),
        })
    }
}

/// System plugin exposing kernel introspection.
pub struct KernelPlugin;

impl Plugin for KernelPlugin {
    fn name(&self) -> &str {
        "kernel"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::System
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new(
                "status",
                "Event counts and request states from the projections",
                InputSchema::new(),
                Arc::new(|_input, state| {
                    Ok(CommandOutcome {
                        events: vec![],
                        output: serde_json::json!({
                            "app": state.get("app"),
                            "requests": state.get("requests"),
                        }),
                    })
                }),
            ),
            CommandSpec::new(
                "echo",
                "Return the given text unchanged",
                InputSchema::new()
                    .field("text", FieldKind::String, "text to echo")
                    .require("text"),
                Arc::new(|input, _state| {
                    Ok(CommandOutcome::text(
                        input["text"].as_str().unwrap_or_default(),
                    ))
                }),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_reads_real_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "hi").unwrap();

        let plugin = AssistantPlugin::new("gpt-4o");
        let commands = plugin.commands();
        let list = commands.iter().find(|c| c.name == "list_files").unwrap();
        let output = (list.handler)(
            serde_json::json!({ "path": dir.path() }),
            &Default::default(),
        )
        .unwrap()
        .output;
        assert_eq!(output, serde_json::json!(["note.txt"]));

        let read = commands.iter().find(|c| c.name == "read_file").unwrap();
        let output = (read.handler)(
            serde_json::json!({ "path": dir.path().join("note.txt") }),
            &Default::default(),
        )
        .unwrap()
        .output;
        assert_eq!(output, "hi");
    }

    #[test]
    fn assistant_is_an_agent_with_a_profile() {
        let plugin = AssistantPlugin::new("gpt-4o-mini");
        assert_eq!(plugin.kind(), PluginKind::Agent);
        assert_eq!(plugin.agent_profile().unwrap().model, "gpt-4o-mini");
    }
}
