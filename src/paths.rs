//! Common path utilities for the LUMEN directory structure.
//!
//! Centralizes all `.lumen` directory path construction to avoid
//! duplicating `dirs::home_dir().ok_or_else(...)?.join(".lumen/...")` everywhere.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

/// Get the user's home directory or return an error.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| anyhow!("could not find home directory"))
}

/// Get `~/.lumen` — the global LUMEN config directory.
pub fn lumen_dir() -> Result<PathBuf> {
    let dir = home_dir()?.join(".lumen");
    log::debug!("lumen dir: {:?}", dir);
    Ok(dir)
}

/// Get `~/.lumen/plugins` — the shared plugin root.
pub fn shared_plugins_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".lumen/plugins"))
}

/// Get `~/.lumen/workspaces` — where workspace configs live.
pub fn workspaces_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".lumen/workspaces"))
}

/// Get the config file path for a named workspace.
pub fn workspace_config_path(name: &str) -> Result<PathBuf> {
    Ok(workspaces_dir()?.join(format!("{}.json", name)))
}

/// Get the workspace-scoped plugin root for a named workspace.
pub fn workspace_plugins_dir(name: &str) -> Result<PathBuf> {
    Ok(workspaces_dir()?.join(name).join("plugins"))
}

/// Get `~/.lumen/install_log.jsonl` — the completed-transaction journal.
pub fn install_log_path() -> Result<PathBuf> {
    Ok(lumen_dir()?.join(crate::config::INSTALL_LOG))
}
