//! Centralized configuration for lumen_manager.
//!
//! All infrastructure URLs and tunable defaults live here. Each can be
//! overridden by environment variables, enabling self-hosted registries and
//! offline use. Environment values are read once at subsystem startup.

use std::time::Duration;

/// Default LUMEN package registry API URL.
/// Override with `LUMEN_REGISTRY_URL` environment variable.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.lumen-platform.io";

/// Per-package install timeout in seconds.
/// Override with `LUMEN_INSTALL_TIMEOUT_SECS` environment variable.
pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 300;

/// Critical install failure ratio. A transaction whose failure ratio strictly
/// exceeds this value is rolled back in full.
/// Override with `LUMEN_CRITICAL_FAILURE_RATIO` environment variable.
pub const DEFAULT_CRITICAL_FAILURE_RATIO: f64 = 0.5;

/// Heuristic per-package size estimate for the pre-install disk check.
pub const ESTIMATED_PACKAGE_BYTES: u64 = 15 * 1024 * 1024;

// === File Name Constants ===

/// Plugin manifest file name, one per plugin directory.
pub const PLUGIN_MANIFEST: &str = "plugin.json";

/// Private dependency directory inside a plugin directory.
pub const PLUGIN_LIB_DIR: &str = "lib";

/// Prefix for the timestamped backup sibling of a plugin's lib directory.
pub const LIB_BACKUP_PREFIX: &str = "lib_backup_";

/// Completed-transaction journal file name under `~/.lumen`.
pub const INSTALL_LOG: &str = "install_log.jsonl";

/// Get the registry URL from env var or default.
pub fn registry_url() -> String {
    std::env::var("LUMEN_REGISTRY_URL").unwrap_or_else(|_| DEFAULT_REGISTRY_URL.to_string())
}

/// Get the per-package install timeout from env var or default.
pub fn install_timeout() -> Duration {
    let secs = std::env::var("LUMEN_INSTALL_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_INSTALL_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Get the critical failure ratio from env var or default.
/// Values outside (0, 1] fall back to the default.
pub fn critical_failure_ratio() -> f64 {
    std::env::var("LUMEN_CRITICAL_FAILURE_RATIO")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|r| *r > 0.0 && *r <= 1.0)
        .unwrap_or(DEFAULT_CRITICAL_FAILURE_RATIO)
}
