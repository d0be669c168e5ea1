//! Plugin registry and discovery.
//!
//! Discovery scans the configured plugin roots for directories carrying a
//! `plugin.json`, parses each manifest, and materializes one [`PluginRecord`]
//! per plugin id. No plugin code is loaded here. Re-running discovery
//! replaces manifests wholesale when plugin files changed and drops records
//! whose directory disappeared.
//!
//! Roots are scanned in order (built-in, shared, workspace-scoped); a later
//! root shadows an earlier one for the same plugin id, so a workspace can
//! override a shared plugin with its own copy.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config;
use crate::manifest::{PackageSpec, PluginManifest};

/// Life-cycle state of a discovered plugin. Transitions happen only along
/// the edges accepted by [`PluginState::can_transition_to`], and only on the
/// control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Validated,
    RequirementsInstalling,
    Enabled,
    Loading,
    Running,
    Stopping,
    Unloaded,
    Disabled,
    Error,
}

impl PluginState {
    /// Legal state-machine edges. `Error` is reachable from the transitional
    /// states; retrying from `Error` re-enters at `Validated` after the
    /// enable sequence re-runs validation.
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Discovered, Validated)
                | (Validated, RequirementsInstalling)
                | (RequirementsInstalling, Enabled)
                | (RequirementsInstalling, Error)
                | (Enabled, Loading)
                | (Enabled, Disabled)
                | (Loading, Running)
                | (Loading, Error)
                | (Running, Stopping)
                | (Stopping, Unloaded)
                | (Stopping, Error)
                | (Unloaded, Loading)
                | (Unloaded, Disabled)
                | (Disabled, Enabled)
                | (Disabled, Validated)
                | (Error, Validated)
        )
    }

    /// States in which the plugin's code is live in the host process.
    pub fn is_loaded(self) -> bool {
        matches!(self, PluginState::Running)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Discovered => "discovered",
            PluginState::Validated => "validated",
            PluginState::RequirementsInstalling => "installing",
            PluginState::Enabled => "enabled",
            PluginState::Loading => "loading",
            PluginState::Running => "running",
            PluginState::Stopping => "stopping",
            PluginState::Unloaded => "unloaded",
            PluginState::Disabled => "disabled",
            PluginState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Which root a plugin was discovered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginRootKind {
    Builtin,
    Shared,
    Workspace,
}

impl fmt::Display for PluginRootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginRootKind::Builtin => write!(f, "builtin"),
            PluginRootKind::Shared => write!(f, "shared"),
            PluginRootKind::Workspace => write!(f, "workspace"),
        }
    }
}

/// One directory scanned for plugins.
#[derive(Debug, Clone)]
pub struct PluginRoot {
    pub kind: PluginRootKind,
    pub path: PathBuf,
}

/// Mutable runtime entity for one discovered plugin.
#[derive(Debug)]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub plugin_dir: PathBuf,
    pub root: PluginRootKind,
    pub state: PluginState,
    /// Last captured error; retrievable until the next enable attempt
    /// overwrites it.
    pub last_error: Option<String>,
    /// Non-fatal findings (conflicts, typosquat warnings) from the last
    /// enable attempt.
    pub warnings: Vec<String>,
    /// Hash of the manifest file as currently discovered.
    pub manifest_hash: String,
    /// Hash of the manifest at the last successfully committed install.
    pub installed_manifest_hash: Option<String>,
}

impl PluginRecord {
    /// The plugin's private dependency directory.
    pub fn lib_dir(&self) -> PathBuf {
        self.plugin_dir.join(config::PLUGIN_LIB_DIR)
    }

    /// Whether the manifest changed since the last committed install.
    /// True when no install ever committed.
    pub fn manifest_changed_since_install(&self) -> bool {
        self.installed_manifest_hash.as_deref() != Some(self.manifest_hash.as_str())
    }
}

/// What one discovery pass changed.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub total: usize,
}

/// Holds metadata and current life-cycle state for every discovered plugin,
/// without loading any code.
pub struct PluginRegistry {
    roots: Vec<PluginRoot>,
    records: HashMap<String, PluginRecord>,
}

impl PluginRegistry {
    pub fn new(roots: Vec<PluginRoot>) -> Self {
        Self {
            roots,
            records: HashMap::new(),
        }
    }

    /// Registry over the standard roots: built-in, shared, and the given
    /// workspace's plugin directory.
    pub fn with_standard_roots(workspace: &str) -> Result<Self> {
        let builtin = match std::env::var("LUMEN_BUILTIN_PLUGIN_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_exe()?
                .parent()
                .map(|p| p.join("plugins"))
                .unwrap_or_else(|| PathBuf::from("plugins")),
        };

        Ok(Self::new(vec![
            PluginRoot {
                kind: PluginRootKind::Builtin,
                path: builtin,
            },
            PluginRoot {
                kind: PluginRootKind::Shared,
                path: crate::paths::shared_plugins_dir()?,
            },
            PluginRoot {
                kind: PluginRootKind::Workspace,
                path: crate::paths::workspace_plugins_dir(workspace)?,
            },
        ]))
    }

    /// Point the workspace-scoped root at a different workspace. Callers run
    /// discovery again afterwards.
    pub fn set_workspace_root(&mut self, path: PathBuf) {
        if let Some(root) = self
            .roots
            .iter_mut()
            .find(|r| r.kind == PluginRootKind::Workspace)
        {
            root.path = path;
        } else {
            self.roots.push(PluginRoot {
                kind: PluginRootKind::Workspace,
                path,
            });
        }
    }

    /// Scan all roots and reconcile the record map. Existing records keep
    /// their state unless the manifest changed, in which case they drop back
    /// to `Discovered` for re-validation.
    pub fn discover(&mut self) -> Result<DiscoveryReport> {
        let mut found: HashMap<String, (PluginManifest, PathBuf, PluginRootKind, String)> =
            HashMap::new();

        for root in &self.roots {
            if !root.path.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&root.path)?.flatten() {
                let dir = entry.path();
                if !dir.is_dir() {
                    continue;
                }
                let manifest_path = dir.join(config::PLUGIN_MANIFEST);
                if !manifest_path.is_file() {
                    continue;
                }

                let manifest = match PluginManifest::load(&manifest_path) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("skipping {}: {:#}", dir.display(), e);
                        continue;
                    }
                };
                let hash = PluginManifest::content_hash(&manifest_path)?;

                if let Some((_, prev_dir, prev_kind, _)) = found.insert(
                    manifest.id.clone(),
                    (manifest, dir.clone(), root.kind, hash),
                ) {
                    log::debug!(
                        "{} root shadows {} copy of plugin at {}",
                        root.kind,
                        prev_kind,
                        prev_dir.display()
                    );
                }
            }
        }

        let mut report = DiscoveryReport::default();

        let stale: Vec<String> = self
            .records
            .keys()
            .filter(|id| !found.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            log::debug!("plugin '{}' directory disappeared, dropping record", id);
            self.records.remove(&id);
            report.removed.push(id);
        }

        for (id, (manifest, dir, kind, hash)) in found {
            match self.records.get_mut(&id) {
                Some(record) => {
                    if record.manifest_hash != hash {
                        log::debug!("manifest changed for '{}', re-validation required", id);
                        record.manifest = manifest;
                        record.manifest_hash = hash;
                        if matches!(record.state, PluginState::Discovered | PluginState::Validated)
                        {
                            record.state = PluginState::Discovered;
                        }
                    } else {
                        record.manifest = manifest;
                    }
                    record.plugin_dir = dir;
                    record.root = kind;
                }
                None => {
                    self.records.insert(
                        id.clone(),
                        PluginRecord {
                            manifest,
                            plugin_dir: dir,
                            root: kind,
                            state: PluginState::Discovered,
                            last_error: None,
                            warnings: Vec::new(),
                            manifest_hash: hash,
                            installed_manifest_hash: None,
                        },
                    );
                    report.added.push(id);
                }
            }
        }

        report.added.sort();
        report.removed.sort();
        report.total = self.records.len();
        log::debug!(
            "discovery: {} plugin(s), {} added, {} removed",
            report.total,
            report.added.len(),
            report.removed.len()
        );
        Ok(report)
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginRecord> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// All records, sorted by plugin id for stable listings.
    pub fn records(&self) -> Vec<&PluginRecord> {
        let mut records: Vec<&PluginRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        records
    }

    /// Ids of plugins currently in the given state.
    pub fn ids_in_state(&self, state: PluginState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Declared requirements of every plugin with a committed install,
    /// excluding `exclude`. Input to conflict detection.
    pub fn installed_requirements(&self, exclude: &str) -> HashMap<String, Vec<PackageSpec>> {
        self.records
            .iter()
            .filter(|(id, r)| id.as_str() != exclude && r.installed_manifest_hash.is_some())
            .filter_map(|(id, r)| r.manifest.package_specs().ok().map(|s| (id.clone(), s)))
            .collect()
    }
}

/// Write a minimal valid plugin directory, for tests and demos.
pub fn write_plugin_dir(root: &Path, id: &str, requirements: &[&str]) -> Result<PathBuf> {
    let dir = root.join(id);
    fs::create_dir_all(&dir)?;
    let manifest = serde_json::json!({
        "id": id,
        "name": id,
        "version": "1.0.0",
        "entry_point": format!("{}::create", id),
        "requirements": { "python": requirements },
    });
    fs::write(
        dir.join(config::PLUGIN_MANIFEST),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    Ok(dir)
}
