use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use keel_core::{KernelError, Result};

use crate::contract::Plugin;
use crate::manifest::PluginManifest;
use crate::registry::PluginRegistry;

/// Extension of the loadable artifact a build produces.
pub const ARTIFACT_EXT: &str = ".wasm";

/// One capability-provider unit: a directory with a `plugin.toml`.
#[derive(Debug, Clone)]
pub struct PluginUnit {
    /// `basename(dir)` — also the artifact stem.
    pub name: String,
    pub dir: PathBuf,
    pub manifest: PluginManifest,
}

impl PluginUnit {
    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(format!("{}{ARTIFACT_EXT}", self.name))
    }

    /// The factory symbol the host resolves for this unit.
    pub fn entrypoint(&self) -> &str {
        self.manifest
            .plugin
            .entrypoint
            .as_deref()
            .unwrap_or(&self.name)
    }
}

/// Find plugin units under a root directory: one per subdirectory that
/// contains a recognized `plugin.toml`. Directories with a malformed
/// manifest are skipped with a warning.
pub fn discover(root: &Path) -> Result<Vec<PluginUnit>> {
    let mut units = Vec::new();

    if !root.exists() {
        info!(?root, "plugin directory does not exist, skipping discovery");
        return Ok(units);
    }

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let manifest_path = dir.join("plugin.toml");
        if !manifest_path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&manifest_path)?;
        match PluginManifest::from_toml(&raw) {
            Ok(manifest) => {
                let name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                units.push(PluginUnit {
                    name,
                    dir,
                    manifest,
                });
            }
            Err(e) => {
                warn!(path = ?manifest_path, error = %e, "skipping unit with bad manifest");
            }
        }
    }

    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(units)
}

/// True if the unit must be (re)built: the artifact is absent, or any
/// source file's mtime exceeds the artifact's mtime. The artifact itself
/// and `target/` build dirs are not sources.
pub fn is_stale(unit: &PluginUnit) -> Result<bool> {
    let artifact = unit.artifact_path();
    let artifact_mtime = match std::fs::metadata(&artifact) {
        Ok(meta) => meta.modified()?,
        Err(_) => return Ok(true),
    };

    for entry in WalkDir::new(&unit.dir)
        .into_iter()
        .filter_entry(|e| e.file_name() != "target")
    {
        let entry = entry.map_err(|e| KernelError::Plugin {
            plugin: unit.name.clone(),
            reason: format!("walking sources: {e}"),
        })?;
        if !entry.file_type().is_file() || entry.path() == artifact {
            continue;
        }
        let mtime = entry
            .metadata()
            .map_err(|e| KernelError::Plugin {
                plugin: unit.name.clone(),
                reason: format!("reading mtime: {e}"),
            })?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if mtime > artifact_mtime {
            debug!(unit = %unit.name, source = ?entry.path(), "source newer than artifact");
            return Ok(true);
        }
    }
    Ok(false)
}

/// Build a unit's artifact by invoking the external toolchain: the
/// manifest's `[build] command` if present, otherwise the supplied
/// default. The command runs with the unit directory as cwd.
pub fn build(unit: &PluginUnit, default_command: &[String]) -> Result<()> {
    let argv = if unit.manifest.build.command.is_empty() {
        default_command
    } else {
        &unit.manifest.build.command
    };
    let (program, args) = argv.split_first().ok_or_else(|| KernelError::PluginBuild {
        plugin: unit.name.clone(),
        reason: "no build command configured".into(),
    })?;

    info!(unit = %unit.name, command = ?argv, "building plugin");

    let output = Command::new(program)
        .args(args)
        .current_dir(&unit.dir)
        .output()
        .map_err(|e| KernelError::PluginBuild {
            plugin: unit.name.clone(),
            reason: format!("failed to spawn '{program}': {e}"),
        })?;

    if !output.status.success() {
        return Err(KernelError::PluginBuild {
            plugin: unit.name.clone(),
            reason: format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Resolves a unit's entrypoint to a live [`Plugin`] instance. The shipped
/// implementation is [`StaticHost`]; out-of-process hosts speaking the
/// same command/event protocol can implement this too.
pub trait PluginHost: Send + Sync {
    fn load(&self, unit: &PluginUnit) -> Result<Arc<dyn Plugin>>;
}

/// Factory producing a plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// A host backed by a static factory table keyed by entrypoint name.
#[derive(Default)]
pub struct StaticHost {
    factories: HashMap<String, PluginFactory>,
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, entrypoint: &str, factory: PluginFactory) -> Self {
        self.factories.insert(entrypoint.to_string(), factory);
        self
    }

    pub fn register(&mut self, entrypoint: &str, factory: PluginFactory) {
        self.factories.insert(entrypoint.to_string(), factory);
    }
}

impl PluginHost for StaticHost {
    fn load(&self, unit: &PluginUnit) -> Result<Arc<dyn Plugin>> {
        let factory = self
            .factories
            .get(unit.entrypoint())
            .ok_or_else(|| KernelError::Plugin {
                plugin: unit.name.clone(),
                reason: format!("no factory registered for entrypoint '{}'", unit.entrypoint()),
            })?;
        Ok(factory())
    }
}

/// Runs the full discover → (build if stale) → load cycle. A unit that
/// fails to build or load is skipped and reported; loading continues for
/// the rest (partial availability over all-or-nothing).
pub struct PluginLoader {
    host: Arc<dyn PluginHost>,
    default_build_command: Vec<String>,
    /// Skip the build step entirely (artifacts managed externally).
    pub autobuild: bool,
}

impl PluginLoader {
    pub fn new(host: Arc<dyn PluginHost>, default_build_command: Vec<String>) -> Self {
        Self {
            host,
            default_build_command,
            autobuild: true,
        }
    }

    /// Load every unit under `root` into the registry. Returns the names
    /// of the units that loaded.
    pub fn load_all(&self, root: &Path, registry: &mut PluginRegistry) -> Result<Vec<String>> {
        let mut loaded = Vec::new();

        for unit in discover(root)? {
            if self.autobuild {
                match is_stale(&unit) {
                    Ok(true) => {
                        if let Err(e) = build(&unit, &self.default_build_command) {
                            warn!(unit = %unit.name, error = %e, "build failed, skipping unit");
                            continue;
                        }
                    }
                    Ok(false) => {
                        debug!(unit = %unit.name, "artifact up to date, skipping build");
                    }
                    Err(e) => {
                        warn!(unit = %unit.name, error = %e, "staleness check failed, skipping unit");
                        continue;
                    }
                }
            }

            match self.host.load(&unit) {
                Ok(plugin) => {
                    info!(unit = %unit.name, plugin = plugin.name(), "plugin loaded");
                    registry.add(plugin);
                    loaded.push(unit.name);
                }
                Err(e) => {
                    warn!(unit = %unit.name, error = %e, "load failed, skipping unit");
                }
            }
        }

        Ok(loaded)
    }
}
