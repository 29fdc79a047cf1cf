use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration — maps to `keel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub kernel: KernelConfig,
    pub llm: LlmConfig,
    pub plugins: PluginsConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

// ── Kernel ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Default model for the orchestrator's own LLM turns.
    pub model: String,
    /// Path to the SQLite event log. "memory" keeps events in-process only.
    pub event_log: PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            event_log: PathBuf::from("events.db"),
        }
    }
}

// ── LLM ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "openai" or "mock".
    pub provider: String,
    /// Override for OpenAI-compatible endpoints (Ollama, vLLM, proxies).
    pub base_url: Option<String>,
    /// API key. Can also come from the OPENAI_API_KEY environment
    /// variable; the config file takes priority.
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            base_url: None,
            api_key: None,
        }
    }
}

// ── Plugins ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned for plugin units.
    pub dir: PathBuf,
    /// Rebuild stale artifacts at startup.
    pub autobuild: bool,
    /// Default build invocation for units whose manifest has no [build].
    pub build_command: Vec<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            autobuild: true,
            build_command: vec![
                "cargo".into(),
                "build".into(),
                "--release".into(),
                "--target".into(),
                "wasm32-wasip1".into(),
            ],
        }
    }
}

// ── Recovery ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Width of a recurrence-counting time bucket, in seconds.
    pub window_secs: u64,
    /// Occurrences within one bucket that trigger a repeated-failure warning.
    pub threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            threshold: 3,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({h})")?;
        }
        Ok(())
    }
}

impl KeelConfig {
    /// Validate the config. Returns warnings to log, or `Err` with all
    /// hard errors joined.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        if self.kernel.model.is_empty() {
            warnings.push(ConfigWarning {
                field: "kernel.model".into(),
                message: "model is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("set to e.g. 'gpt-4o'".into()),
            });
        }

        let valid_providers = ["openai", "mock"];
        if !valid_providers.contains(&self.llm.provider.as_str()) {
            warnings.push(ConfigWarning {
                field: "llm.provider".into(),
                message: format!("unknown provider '{}'", self.llm.provider),
                severity: WarningSeverity::Error,
                hint: Some(format!("valid values: {}", valid_providers.join(", "))),
            });
        }

        if self.llm.provider == "openai" && self.llm.api_key.is_none() && self.llm.base_url.is_none()
        {
            warnings.push(ConfigWarning {
                field: "llm.api_key".into(),
                message: "no API key configured for the openai provider".into(),
                severity: WarningSeverity::Warning,
                hint: Some("set llm.api_key or the OPENAI_API_KEY environment variable".into()),
            });
        }

        if self.recovery.window_secs == 0 {
            warnings.push(ConfigWarning {
                field: "recovery.window_secs".into(),
                message: "window_secs is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("recurrence buckets need a nonzero width, e.g. 60".into()),
            });
        }

        if self.recovery.threshold == 0 {
            warnings.push(ConfigWarning {
                field: "recovery.threshold".into(),
                message: "threshold is 0 — every failure would warn as repeated".into(),
                severity: WarningSeverity::Warning,
                hint: Some("a threshold of 3 is typical".into()),
            });
        }

        if self.plugins.autobuild && self.plugins.build_command.is_empty() {
            warnings.push(ConfigWarning {
                field: "plugins.build_command".into(),
                message: "autobuild is on but no default build command is set".into(),
                severity: WarningSeverity::Warning,
                hint: Some("units without their own [build] section will be skipped".into()),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("valid values: {}", valid_levels.join(", "))),
            });
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("valid values: {}", valid_formats.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("configuration errors:\n  - {}", errors.join("\n  - ")));
        }

        Ok(warnings)
    }
}
