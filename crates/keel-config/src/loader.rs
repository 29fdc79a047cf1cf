use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use keel_core::{KernelError, Result};

use crate::schema::KeelConfig;

/// Loads the Keel configuration from disk with environment overrides.
pub struct ConfigLoader {
    config: Arc<RwLock<KeelConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > KEEL_CONFIG env > ~/.keel/keel.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("KEEL_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keel")
            .join("keel.toml")
    }

    /// Load the config from disk, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<KeelConfig>(&raw).map_err(|e| {
                KernelError::Config(format!("failed to parse {}: {}", config_path.display(), e))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            KeelConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        // Log warnings, fail on hard errors.
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(KernelError::Config(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> KeelConfig {
        self.config.read().clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (KEEL_MODEL, KEEL_LOG_LEVEL, etc.)
    fn apply_env_overrides(mut config: KeelConfig) -> KeelConfig {
        if let Ok(v) = std::env::var("KEEL_MODEL") {
            config.kernel.model = v;
        }
        if let Ok(v) = std::env::var("KEEL_EVENT_LOG") {
            config.kernel.event_log = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KEEL_PLUGIN_DIR") {
            config.plugins.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KEEL_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("KEEL_LLM_BASE_URL") {
            config.llm.base_url = Some(v);
        }
        // API key: env var fills in when the config file doesn't set it,
        // so the file takes priority.
        if config.llm.api_key.is_none() {
            if let Ok(v) = std::env::var("OPENAI_API_KEY") {
                config.llm.api_key = Some(v);
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins() {
        let p = ConfigLoader::resolve_path(Some(Path::new("/tmp/custom.toml")));
        assert_eq!(p, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::load(Some(Path::new("/nonexistent/keel.toml"))).unwrap();
        let config = loader.get();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.recovery.window_secs, 60);
    }

    #[test]
    fn parses_partial_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(
            &path,
            r#"
[kernel]
model = "gpt-4o-mini"

[recovery]
threshold = 5
"#,
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        let config = loader.get();
        assert_eq!(config.kernel.model, "gpt-4o-mini");
        assert_eq!(config.recovery.threshold, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.recovery.window_secs, 60);
        assert!(config.plugins.autobuild);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, "kernel = 12").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }
}
