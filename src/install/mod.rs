//! Isolated per-plugin dependency installation with atomic rollback.
//!
//! Every plugin owns a private `lib/` directory; installs never write outside
//! the plugin's own tree. An install is one [`InstallTransaction`]: back up
//! the existing `lib/` if present, fetch each declared package under a hard
//! per-package timeout, then decide by failure ratio whether to commit
//! (discard the backup, report which packages failed) or roll back (restore
//! the backup byte-for-byte). Rollback is also attempted on any unhandled
//! error mid-install; a rollback that itself fails is reported as a distinct,
//! higher-severity outcome since manual recovery is then required.
//!
//! Installer work runs on a background worker thread per transaction
//! ([`spawn_install`]); progress and completion are marshaled back to the
//! control thread over an mpsc channel as [`InstallerMessage`]s.

mod fetch;
mod helpers;

#[cfg(test)]
mod tests;

pub use fetch::{FetchedPackage, PackageFetcher, PackageMetadata, RegistryPackageFetcher};
pub use helpers::{available_disk_space, dir_content_hash};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config;
use crate::manifest::PackageSpec;

/// Tunable installer parameters, read once at subsystem startup.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Hard timeout for each individual package install.
    pub per_package_timeout: Duration,
    /// Roll the whole transaction back when `failures / total` strictly
    /// exceeds this ratio.
    pub critical_failure_ratio: f64,
    /// Heuristic per-package size for the pre-install disk check.
    pub estimated_package_bytes: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            per_package_timeout: config::install_timeout(),
            critical_failure_ratio: config::critical_failure_ratio(),
            estimated_package_bytes: config::ESTIMATED_PACKAGE_BYTES,
        }
    }
}

/// Where a transaction ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    InProgress,
    Committed,
    RolledBack,
}

/// Outcome of one package within a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInstallResult {
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub duration_ms: u64,
}

impl PackageInstallResult {
    fn succeeded(fetched: FetchedPackage, elapsed: Duration) -> Self {
        Self {
            name: fetched.name,
            success: true,
            error: None,
            version: fetched.version,
            checksum: Some(fetched.checksum),
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    fn failed(name: &str, error: &str, elapsed: Duration) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            error: Some(error.to_string()),
            version: None,
            checksum: None,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// A package refused before any fetch (security block). Counts toward
    /// the failure ratio like any other failed package.
    pub fn refused(name: &str, reason: &str) -> Self {
        Self::failed(name, reason, Duration::ZERO)
    }
}

/// One isolated-install attempt. The unit of atomicity: either the surviving
/// packages are present and the backup is discarded, or the plugin's private
/// directory is restored exactly to its pre-transaction content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallTransaction {
    pub plugin_id: String,
    /// Set only if a prior install existed and was backed up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub results: Vec<PackageInstallResult>,
    pub started_at: DateTime<Utc>,
    pub status: TransactionStatus,
}

impl InstallTransaction {
    fn begin(plugin_id: &str, backup_path: Option<PathBuf>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            backup_path,
            results: Vec::new(),
            started_at: Utc::now(),
            status: TransactionStatus::InProgress,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    /// Names of every failed package.
    pub fn failed_packages(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Append this transaction as one JSON line to the install journal.
    pub fn archive(&self, journal: &Path) -> Result<()> {
        if let Some(parent) = journal.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal)
            .with_context(|| format!("failed to open install journal {}", journal.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Terminal result of an install attempt.
#[derive(Debug)]
pub enum InstallOutcome {
    /// Backup discarded; any failed packages are listed in the transaction.
    Committed { transaction: InstallTransaction },
    /// Critical failure or aborted mid-install; private directory restored.
    RolledBack {
        transaction: InstallTransaction,
        reason: String,
    },
    /// The rollback itself failed; manual recovery is required.
    RollbackFailed {
        transaction: InstallTransaction,
        reason: String,
        rollback_error: String,
    },
}

impl InstallOutcome {
    pub fn transaction(&self) -> &InstallTransaction {
        match self {
            InstallOutcome::Committed { transaction }
            | InstallOutcome::RolledBack { transaction, .. }
            | InstallOutcome::RollbackFailed { transaction, .. } => transaction,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, InstallOutcome::Committed { .. })
    }
}

/// Message from an install worker to the control thread.
#[derive(Debug)]
pub enum InstallerMessage {
    Progress {
        plugin_id: String,
        percent: u8,
        message: String,
    },
    Finished {
        plugin_id: String,
        outcome: Result<InstallOutcome>,
    },
}

/// Performs dependency installs into plugin-private directories.
pub struct IsolatedInstaller {
    fetcher: Arc<dyn PackageFetcher>,
    config: InstallerConfig,
}

impl IsolatedInstaller {
    pub fn new(fetcher: Arc<dyn PackageFetcher>, config: InstallerConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Run one install transaction synchronously. `refused` entries are
    /// packages the security screen already rejected: they are recorded as
    /// failures without any fetch but still count toward the failure ratio.
    /// `progress` receives `(percent, message)` after each package completes
    /// or fails. Setting `cancel` forces every remaining package to failed
    /// and proceeds immediately to rollback evaluation.
    ///
    /// Errors are returned only for pre-transaction aborts (insufficient disk
    /// space, backup failure); once the transaction is under way every path
    /// ends in an [`InstallOutcome`].
    pub fn install(
        &self,
        plugin_id: &str,
        plugin_dir: &Path,
        specs: &[PackageSpec],
        refused: &[PackageInstallResult],
        progress: &mut dyn FnMut(u8, &str),
        cancel: &AtomicBool,
    ) -> Result<InstallOutcome> {
        let lib = plugin_dir.join(config::PLUGIN_LIB_DIR);

        // Disk estimate first, before touching the filesystem.
        let needed = (specs.len() as u64).saturating_mul(self.config.estimated_package_bytes);
        if let Some(available) = helpers::available_disk_space(plugin_dir) {
            if available < needed {
                bail!(
                    "insufficient disk space for '{}': need ~{} MiB, {} MiB available",
                    plugin_id,
                    needed / (1024 * 1024),
                    available / (1024 * 1024)
                );
            }
        }

        // Back up an existing private directory before any mutation.
        let pre_hash = if lib.exists() {
            Some(helpers::dir_content_hash(&lib)?)
        } else {
            None
        };
        let backup_path = if lib.exists() {
            let backup = plugin_dir.join(format!(
                "{}{}",
                config::LIB_BACKUP_PREFIX,
                Utc::now().format("%Y%m%d_%H%M%S")
            ));
            progress(0, "backing up existing dependencies");
            helpers::copy_dir_all(&lib, &backup)
                .with_context(|| format!("failed to back up {}", lib.display()))?;
            Some(backup)
        } else {
            None
        };

        let mut txn = InstallTransaction::begin(plugin_id, backup_path);
        txn.results.extend_from_slice(refused);

        let run = (|| -> Result<()> {
            fs::create_dir_all(&lib)?;
            self.run_packages(&mut txn, &lib, specs, refused.len(), progress, cancel)
        })();

        // Any unhandled error mid-install: roll back before reporting.
        if let Err(e) = run {
            return Ok(self.roll_back(txn, &lib, pre_hash.as_deref(), format!("install aborted: {:#}", e)));
        }

        let total = txn.results.len();
        let failures = txn.failed_count();
        let ratio = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        };

        if ratio > self.config.critical_failure_ratio {
            let reason = format!(
                "{} of {} packages failed (ratio {:.2} exceeds {:.2})",
                failures, total, ratio, self.config.critical_failure_ratio
            );
            return Ok(self.roll_back(txn, &lib, pre_hash.as_deref(), reason));
        }

        if let Some(backup) = &txn.backup_path {
            if let Err(e) = fs::remove_dir_all(backup) {
                log::warn!("failed to remove backup {}: {}", backup.display(), e);
            }
        }
        txn.status = TransactionStatus::Committed;
        log::debug!(
            "committed install for '{}': {} package(s), {} failed",
            plugin_id,
            total,
            failures
        );
        Ok(InstallOutcome::Committed { transaction: txn })
    }

    fn run_packages(
        &self,
        txn: &mut InstallTransaction,
        lib: &Path,
        specs: &[PackageSpec],
        refused_count: usize,
        progress: &mut dyn FnMut(u8, &str),
        cancel: &AtomicBool,
    ) -> Result<()> {
        let total = refused_count + specs.len();

        for (idx, spec) in specs.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                log::warn!("install for '{}' cancelled by user", txn.plugin_id);
                for remaining in &specs[idx..] {
                    txn.results.push(PackageInstallResult::failed(
                        &remaining.name,
                        "cancelled by user",
                        Duration::ZERO,
                    ));
                }
                progress(100, "installation cancelled");
                return Ok(());
            }

            let started = Instant::now();
            let result = match self.fetch_with_timeout(&txn.plugin_id, spec, lib)? {
                Ok(fetched) => PackageInstallResult::succeeded(fetched, started.elapsed()),
                Err(error) => {
                    log::warn!("package '{}' failed: {}", spec.name, error);
                    PackageInstallResult::failed(&spec.name, &error, started.elapsed())
                }
            };

            let percent = (((refused_count + idx + 1) * 100) / total) as u8;
            let message = if result.success {
                format!("installed {}", result.name)
            } else {
                format!("{} failed", result.name)
            };
            txn.results.push(result);
            progress(percent, &message);
        }

        Ok(())
    }

    /// Fetch one package into staging, then move it into `lib/` if it
    /// arrived within the timeout. The outer error is a host-side fault that
    /// aborts the transaction; the inner error is a per-package failure
    /// recorded in the transaction.
    fn fetch_with_timeout(
        &self,
        plugin_id: &str,
        spec: &PackageSpec,
        lib: &Path,
    ) -> Result<std::result::Result<FetchedPackage, String>> {
        let staging = std::env::temp_dir().join(format!("lumen_pkg_{}_{}", plugin_id, spec.name));
        let _ = fs::remove_dir_all(&staging);
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create staging dir for '{}'", spec.name))?;

        let (tx, rx) = mpsc::channel();
        let fetcher = Arc::clone(&self.fetcher);
        let spec_clone = spec.clone();
        let staging_clone = staging.clone();
        thread::Builder::new()
            .name(format!("fetch-{}", spec.name))
            .spawn(move || {
                let _ = tx.send(fetcher.fetch(&spec_clone, &staging_clone));
            })?;

        match rx.recv_timeout(self.config.per_package_timeout) {
            Ok(Ok(fetched)) => {
                let target = lib.join(&spec.name);
                if target.exists() {
                    fs::remove_dir_all(&target)?;
                }
                helpers::copy_dir_all(&staging, &target)?;
                let _ = fs::remove_dir_all(&staging);
                Ok(Ok(fetched))
            }
            Ok(Err(e)) => {
                let _ = fs::remove_dir_all(&staging);
                Ok(Err(format!("{:#}", e)))
            }
            // The fetch thread may still be writing, but only into its own
            // staging directory; lib/ is untouched on this path.
            Err(_) => Ok(Err(format!(
                "timed out after {}s",
                self.config.per_package_timeout.as_secs()
            ))),
        }
    }

    fn roll_back(
        &self,
        mut txn: InstallTransaction,
        lib: &Path,
        pre_hash: Option<&str>,
        reason: String,
    ) -> InstallOutcome {
        log::warn!("rolling back install for '{}': {}", txn.plugin_id, reason);
        match self.restore_backup(&txn, lib, pre_hash) {
            Ok(()) => {
                txn.status = TransactionStatus::RolledBack;
                InstallOutcome::RolledBack {
                    transaction: txn,
                    reason,
                }
            }
            Err(e) => InstallOutcome::RollbackFailed {
                transaction: txn,
                reason,
                rollback_error: format!("{:#}", e),
            },
        }
    }

    fn restore_backup(
        &self,
        txn: &InstallTransaction,
        lib: &Path,
        pre_hash: Option<&str>,
    ) -> Result<()> {
        if lib.exists() {
            fs::remove_dir_all(lib).context("failed to remove partially-installed directory")?;
        }

        let Some(backup) = &txn.backup_path else {
            // No prior install existed; restoring to absent is the rollback.
            return Ok(());
        };

        helpers::copy_dir_all(backup, lib).context("failed to restore backup")?;

        if let Some(expected) = pre_hash {
            let restored = helpers::dir_content_hash(lib)?;
            if restored != expected {
                bail!(
                    "restored directory does not match pre-transaction state ({} != {})",
                    restored,
                    expected
                );
            }
        }

        let _ = fs::remove_dir_all(backup);
        Ok(())
    }
}

/// Run an install on a dedicated worker thread, streaming progress and the
/// final outcome back over `tx`.
pub fn spawn_install(
    installer: Arc<IsolatedInstaller>,
    plugin_id: String,
    plugin_dir: PathBuf,
    specs: Vec<PackageSpec>,
    refused: Vec<PackageInstallResult>,
    tx: Sender<InstallerMessage>,
    cancel: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let progress_tx = tx.clone();
        let pid = plugin_id.clone();
        let mut progress = move |percent: u8, message: &str| {
            let _ = progress_tx.send(InstallerMessage::Progress {
                plugin_id: pid.clone(),
                percent,
                message: message.to_string(),
            });
        };

        let outcome =
            installer.install(&plugin_id, &plugin_dir, &specs, &refused, &mut progress, &cancel);
        let _ = tx.send(InstallerMessage::Finished { plugin_id, outcome });
    })
}
