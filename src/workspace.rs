//! Workspace configuration persistence.
//!
//! A workspace is a named, isolated context with its own enabled-plugin set
//! and per-plugin settings, persisted as one JSON file per workspace under
//! `~/.lumen/workspaces/`. The config is loaded when a workspace becomes
//! active and saved on every enable/disable while it is active. The switch
//! algorithm itself (unload all, then start the target set) lives on the
//! lifecycle manager, which is the only state mutator.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Default workspace name used before any explicit switch.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Persisted record of one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub enabled_plugins: BTreeSet<String>,

    /// Opaque per-plugin settings, handed to plugins at initialization.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub plugin_settings: HashMap<String, serde_json::Value>,
}

impl WorkspaceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            enabled_plugins: BTreeSet::new(),
            plugin_settings: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read workspace config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse workspace config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("failed to write workspace config {}", path.display()))?;
        Ok(())
    }
}

/// Persists and restores, per workspace, which plugins are enabled.
pub struct WorkspaceBinding {
    dir: PathBuf,
    active: WorkspaceConfig,
}

impl WorkspaceBinding {
    /// Open a binding over a workspace directory, activating `name`
    /// (created empty if it has no config yet).
    pub fn open(dir: PathBuf, name: &str) -> Result<Self> {
        let mut binding = Self {
            dir,
            active: WorkspaceConfig::new(name),
        };
        binding.activate(name)?;
        Ok(binding)
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// The directory holding workspace configs and workspace plugin roots.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn active(&self) -> &WorkspaceConfig {
        &self.active
    }

    /// Load (or create) the named workspace and make it the active one.
    pub fn activate(&mut self, name: &str) -> Result<&WorkspaceConfig> {
        let path = self.config_path(name);
        self.active = if path.exists() {
            WorkspaceConfig::load(&path)?
        } else {
            log::debug!("creating workspace '{}'", name);
            let config = WorkspaceConfig::new(name);
            config.save_to(&path)?;
            config
        };
        Ok(&self.active)
    }

    /// Write the active workspace config back to disk.
    pub fn persist(&self) -> Result<()> {
        self.active.save_to(&self.config_path(&self.active.name))
    }

    /// Add a plugin to the active workspace's enabled set and persist.
    pub fn enable_plugin(&mut self, id: &str) -> Result<()> {
        if self.active.enabled_plugins.insert(id.to_string()) {
            self.persist()?;
        }
        Ok(())
    }

    /// Remove a plugin from the active workspace's enabled set and persist.
    pub fn disable_plugin(&mut self, id: &str) -> Result<()> {
        if self.active.enabled_plugins.remove(id) {
            self.persist()?;
        }
        Ok(())
    }

    /// Drop ids from the enabled set that discovery no longer knows,
    /// persisting if anything changed. Returns the pruned ids.
    pub fn prune_unknown(&mut self, known: impl Fn(&str) -> bool) -> Result<Vec<String>> {
        let unknown: Vec<String> = self
            .active
            .enabled_plugins
            .iter()
            .filter(|id| !known(id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            for id in &unknown {
                self.active.enabled_plugins.remove(id);
            }
            self.persist()?;
        }
        Ok(unknown)
    }

    /// Names of all workspaces with a config on disk.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(vec![]);
        }
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(String::from)
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        Ok(names)
    }
}
