use serde::{Deserialize, Serialize};

use keel_core::{KernelError, Result};

/// Plugin manifest — loaded from `plugin.toml` at the root of a plugin
/// unit directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub agent: Option<AgentSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// "system" or "agent".
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Symbol/factory name resolved by the host. Defaults to the unit name.
    #[serde(default)]
    pub entrypoint: Option<String>,
}

fn default_kind() -> String {
    "system".into()
}

/// How to produce the loadable artifact from the unit's sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSection {
    /// Toolchain invocation, argv style. Empty = use the host default.
    #[serde(default)]
    pub command: Vec<String>,
}

/// Delegation profile for agent-kind plugins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub system_prompt: String,
    pub model: String,
}

impl PluginManifest {
    /// Parse from TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| KernelError::Plugin {
            plugin: "unknown".into(),
            reason: format!("failed to parse plugin.toml: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let manifest = PluginManifest::from_toml(
            r#"
[plugin]
name = "files"
version = "0.1.0"
"#,
        )
        .unwrap();
        assert_eq!(manifest.plugin.name, "files");
        assert_eq!(manifest.plugin.kind, "system");
        assert!(manifest.build.command.is_empty());
    }

    #[test]
    fn parses_agent_section() {
        let manifest = PluginManifest::from_toml(
            r#"
[plugin]
name = "researcher"
version = "0.1.0"
kind = "agent"

[agent]
system_prompt = "You research things."
model = "gpt-4o"

[build]
command = ["cargo", "build", "--release"]
"#,
        )
        .unwrap();
        assert_eq!(manifest.plugin.kind, "agent");
        assert_eq!(manifest.agent.unwrap().model, "gpt-4o");
        assert_eq!(manifest.build.command[0], "cargo");
    }
}
