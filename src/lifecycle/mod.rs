//! Plugin lifecycle orchestration.
//!
//! The [`LifecycleManager`] drives each plugin through its state machine —
//! validate, screen, install, load, run, unload — invoking the validator,
//! security checker, conflict detector, and isolated installer in order and
//! emitting life-cycle events. It is the only place plugin state is mutated,
//! and every error is captured at this boundary: nothing propagates uncaught
//! into the host. Install work runs on a background worker per transaction;
//! this manager is the single reader of the worker's message channel.
//!
//! Plugins are loaded through an explicit ABI rather than reflection: each
//! manifest names an `entry_point` that must be registered in the host's
//! [`FactoryRegistry`] at process start. The host never inspects plugin
//! internals beyond the [`PluginHandle`] contract.

#[cfg(test)]
mod tests;

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use thiserror::Error;

use crate::conflict::detect_conflicts;
use crate::events::{EventBus, LifecycleEvent, SubscriptionHandle};
use crate::install::{
    spawn_install, InstallOutcome, InstallerMessage, IsolatedInstaller, PackageInstallResult,
};
use crate::manifest::ManifestValidator;
use crate::registry::{DiscoveryReport, PluginRegistry, PluginState};
use crate::security::SecurityPolicy;
use crate::workspace::{WorkspaceBinding, WorkspaceConfig};

/// Errors captured at the lifecycle boundary. Each is recorded on the
/// plugin's record and emitted as a `PluginError` event; none escapes into
/// the host uncaught.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("manifest validation failed for '{id}': {details}")]
    Validation { id: String, details: String },

    #[error("security policy blocked requirements for '{id}': {details}")]
    SecurityBlock { id: String, details: String },

    #[error("install aborted for '{id}': {details}")]
    InstallAborted { id: String, details: String },

    #[error("critical install failure for '{id}': {details}")]
    CriticalInstall { id: String, details: String },

    #[error("rollback failed for '{id}', manual recovery required: {details}")]
    RollbackFailure { id: String, details: String },

    #[error("initialization failed for '{id}': {details}")]
    Initialization { id: String, details: String },

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("an install is already in flight for '{0}'")]
    InstallInFlight(String),

    #[error("illegal state transition for '{id}': {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("a workspace switch is in progress")]
    SwitchInProgress,

    #[error("workspace persistence failed: {0}")]
    Persistence(String),

    #[error("plugin discovery failed: {0}")]
    Discovery(String),
}

/// Context handed to a plugin during initialization. Subscriptions made
/// through it are tagged with the plugin's id and revoked on unload.
pub struct PluginContext<'a> {
    id: &'a str,
    events: &'a mut EventBus,
    settings: Option<&'a serde_json::Value>,
}

impl<'a> PluginContext<'a> {
    pub fn plugin_id(&self) -> &str {
        self.id
    }

    /// The active workspace's settings blob for this plugin, if any.
    pub fn settings(&self) -> Option<&serde_json::Value> {
        self.settings
    }

    /// Subscribe to life-cycle events on behalf of this plugin.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&LifecycleEvent) + Send + 'static,
    {
        self.events.subscribe_owned(self.id, callback)
    }
}

/// The fixed lifecycle contract every plugin implements.
pub trait PluginHandle: Send {
    /// Called on the `Loading` transition. An error here triggers immediate
    /// cleanup and moves the plugin to `Error`; it is never left
    /// half-initialized.
    fn initialize(&mut self, ctx: &mut PluginContext<'_>) -> Result<()>;

    /// Called on the `Stopping` transition.
    fn shutdown(&mut self);
}

type PluginFactory = Box<dyn Fn() -> Box<dyn PluginHandle> + Send + Sync>;

/// Registry of plugin entry points, populated at process start. Resolving a
/// manifest's `entry_point` here replaces any reflection-based loading.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl FactoryRegistry {
    pub fn register<F>(&mut self, entry_point: &str, factory: F)
    where
        F: Fn() -> Box<dyn PluginHandle> + Send + Sync + 'static,
    {
        self.factories
            .insert(entry_point.to_string(), Box::new(factory));
    }

    pub fn create(&self, entry_point: &str) -> Option<Box<dyn PluginHandle>> {
        self.factories.get(entry_point).map(|f| f())
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories.contains_key(entry_point)
    }
}

/// What a workspace switch did.
#[derive(Debug, Default)]
pub struct SwitchReport {
    pub workspace: String,
    pub unloaded: Vec<String>,
    pub started: Vec<String>,
    /// Enabled ids with no discovered plugin, skipped with a warning.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Drives plugins through their state machine. Owns the registry, event bus,
/// factory registry, and workspace binding; passed by reference wherever
/// lifecycle access is needed — there are no ambient globals.
pub struct LifecycleManager {
    registry: PluginRegistry,
    events: EventBus,
    factories: FactoryRegistry,
    installer: Arc<IsolatedInstaller>,
    security: SecurityPolicy,
    binding: WorkspaceBinding,
    loaded: HashMap<String, Box<dyn PluginHandle>>,
    /// Plugin ids with an install transaction in flight (mutual exclusion).
    in_flight: HashSet<String>,
    install_cancel: HashMap<String, Arc<AtomicBool>>,
    journal: Option<PathBuf>,
    switching: bool,
}

impl LifecycleManager {
    pub fn new(
        registry: PluginRegistry,
        installer: Arc<IsolatedInstaller>,
        security: SecurityPolicy,
        binding: WorkspaceBinding,
    ) -> Self {
        Self {
            registry,
            events: EventBus::new(),
            factories: FactoryRegistry::default(),
            installer,
            security,
            binding,
            loaded: HashMap::new(),
            in_flight: HashSet::new(),
            install_cancel: HashMap::new(),
            journal: None,
            switching: false,
        }
    }

    /// Archive completed transactions to this journal file.
    pub fn with_journal(mut self, path: PathBuf) -> Self {
        self.journal = Some(path);
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn workspace(&self) -> &WorkspaceConfig {
        self.binding.active()
    }

    pub fn workspaces(&self) -> Result<Vec<String>> {
        self.binding.list()
    }

    pub fn register_factory<F>(&mut self, entry_point: &str, factory: F)
    where
        F: Fn() -> Box<dyn PluginHandle> + Send + Sync + 'static,
    {
        self.factories.register(entry_point, factory);
    }

    /// Run discovery over all roots and prune workspace config entries whose
    /// plugin directory disappeared.
    pub fn discover(&mut self) -> Result<DiscoveryReport, LifecycleError> {
        let report = self
            .registry
            .discover()
            .map_err(|e| LifecycleError::Discovery(format!("{:#}", e)))?;

        let registry = &self.registry;
        let pruned = self
            .binding
            .prune_unknown(|id| registry.contains(id))
            .map_err(|e| LifecycleError::Persistence(format!("{:#}", e)))?;
        for id in pruned {
            log::warn!(
                "workspace '{}' enabled unknown plugin '{}', removed",
                self.binding.active().name,
                id
            );
        }
        Ok(report)
    }

    /// Request cancellation of an in-flight install. Remaining packages are
    /// forced to failed and the transaction proceeds to rollback evaluation.
    pub fn cancel_install(&self, id: &str) {
        if let Some(flag) = self.install_cancel.get(id) {
            log::warn!("cancelling install for '{}'", id);
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn state_of(&self, id: &str) -> Result<PluginState, LifecycleError> {
        self.registry
            .get(id)
            .map(|r| r.state)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    fn transition(&mut self, id: &str, next: PluginState) -> Result<(), LifecycleError> {
        let record = self
            .registry
            .get_mut(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let from = record.state;
        if !from.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                id: id.to_string(),
                from,
                to: next,
            });
        }
        log::debug!("plugin '{}': {} -> {}", id, from, next);
        record.state = next;
        Ok(())
    }

    /// Record an error, move the plugin to `Error`, and emit the event.
    fn fail(&mut self, id: &str, details: &str) {
        if let Some(record) = self.registry.get_mut(id) {
            record.last_error = Some(details.to_string());
            let from = record.state;
            if from.can_transition_to(PluginState::Error) {
                log::debug!("plugin '{}': {} -> error", id, from);
                record.state = PluginState::Error;
            }
        }
        self.events.emit(&LifecycleEvent::PluginError {
            id: id.to_string(),
            message: details.to_string(),
        });
    }

    /// Validate a plugin's manifest. On success a `Discovered` plugin moves
    /// to `Validated`; on failure it stays where it is with `last_error` set
    /// and is not selectable for enabling.
    pub fn validate(&mut self, id: &str) -> Result<(), LifecycleError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let result = ManifestValidator::validate(&record.manifest);

        if result.ok {
            if record.state == PluginState::Discovered {
                self.transition(id, PluginState::Validated)?;
            }
            return Ok(());
        }

        let details = result.errors.join("; ");
        if let Some(record) = self.registry.get_mut(id) {
            record.last_error = Some(details.clone());
        }
        self.events.emit(&LifecycleEvent::PluginError {
            id: id.to_string(),
            message: details.clone(),
        });
        Err(LifecycleError::Validation {
            id: id.to_string(),
            details,
        })
    }

    /// Re-run validation as part of an enable sequence, entering `Validated`
    /// from `Discovered`, `Error` (retry), or `Disabled` (manifest changed).
    fn ensure_validated(&mut self, id: &str) -> Result<(), LifecycleError> {
        let state = self.state_of(id)?;
        if state == PluginState::Validated {
            return Ok(());
        }

        let record = self
            .registry
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let result = ManifestValidator::validate(&record.manifest);
        if !result.ok {
            let details = result.errors.join("; ");
            if let Some(record) = self.registry.get_mut(id) {
                record.last_error = Some(details.clone());
            }
            self.events.emit(&LifecycleEvent::PluginError {
                id: id.to_string(),
                message: details.clone(),
            });
            return Err(LifecycleError::Validation {
                id: id.to_string(),
                details,
            });
        }

        self.transition(id, PluginState::Validated)
    }

    /// Enable a plugin: validate, screen requirements, detect conflicts, and
    /// install its isolated dependency set. Enabling an already enabled or
    /// running plugin is a no-op that starts no new transaction. Re-enabling
    /// a `Disabled` plugin skips validation and installation unless the
    /// manifest changed since the last committed install.
    pub fn enable(&mut self, id: &str) -> Result<(), LifecycleError> {
        if self.switching {
            return Err(LifecycleError::SwitchInProgress);
        }
        self.enable_inner(id)
    }

    fn enable_inner(&mut self, id: &str) -> Result<(), LifecycleError> {
        let state = self.state_of(id)?;

        if matches!(
            state,
            PluginState::Enabled | PluginState::Loading | PluginState::Running
        ) {
            log::debug!("plugin '{}' already {}, enable is a no-op", id, state);
            return Ok(());
        }

        if self.in_flight.contains(id) {
            return Err(LifecycleError::InstallInFlight(id.to_string()));
        }

        if state == PluginState::Unloaded {
            // Still installed from this session; just make sure the
            // workspace remembers it.
            self.binding
                .enable_plugin(id)
                .map_err(|e| LifecycleError::Persistence(format!("{:#}", e)))?;
            return Ok(());
        }

        // New enable attempt: previous error and warnings are stale now.
        if let Some(record) = self.registry.get_mut(id) {
            record.last_error = None;
            record.warnings.clear();
        }

        let changed = self
            .registry
            .get(id)
            .map(|r| r.manifest_changed_since_install())
            .unwrap_or(true);

        if state == PluginState::Disabled && !changed {
            self.transition(id, PluginState::Enabled)?;
            self.binding
                .enable_plugin(id)
                .map_err(|e| LifecycleError::Persistence(format!("{:#}", e)))?;
            self.events.emit(&LifecycleEvent::PluginEnabled {
                id: id.to_string(),
            });
            return Ok(());
        }

        self.ensure_validated(id)?;

        let record = self
            .registry
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let specs = record.manifest.package_specs().map_err(|e| {
            // Validation accepts only parseable requirements, so this is
            // unreachable in practice; fail closed regardless.
            LifecycleError::Validation {
                id: id.to_string(),
                details: format!("{:#}", e),
            }
        })?;
        let plugin_dir = record.plugin_dir.clone();

        // Security screen: blocked packages never reach the installer.
        let report = self.security.screen(&specs);
        let blocked_names: HashSet<String> =
            report.blocked.iter().map(|f| f.package.clone()).collect();

        if !report.warnings.is_empty() || !report.blocked.is_empty() {
            if let Some(record) = self.registry.get_mut(id) {
                for finding in report.warnings.iter().chain(report.blocked.iter()) {
                    log::warn!("plugin '{}': {}", id, finding.reason);
                    record.warnings.push(finding.reason.clone());
                }
            }
        }

        let clean: Vec<_> = specs
            .iter()
            .filter(|s| !blocked_names.contains(&s.name))
            .cloned()
            .collect();

        if !report.blocked.is_empty() && clean.is_empty() {
            // Every declared package is blocked: the install never starts.
            let details = report
                .blocked
                .iter()
                .map(|f| f.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            if let Some(record) = self.registry.get_mut(id) {
                record.last_error = Some(details.clone());
            }
            self.events.emit(&LifecycleEvent::PluginError {
                id: id.to_string(),
                message: details.clone(),
            });
            return Err(LifecycleError::SecurityBlock {
                id: id.to_string(),
                details,
            });
        }

        let refused: Vec<PackageInstallResult> = report
            .blocked
            .iter()
            .map(|f| PackageInstallResult::refused(&f.package, &f.reason))
            .collect();

        // Conflict detection is advisory only: isolated per-plugin installs
        // make cross-plugin version clashes non-fatal.
        let installed = self.registry.installed_requirements(id);
        for conflict in detect_conflicts(id, &specs, &installed) {
            log::warn!("{}", conflict);
            if let Some(record) = self.registry.get_mut(id) {
                record.warnings.push(conflict.to_string());
            }
        }

        self.transition(id, PluginState::RequirementsInstalling)?;
        self.run_install(id, plugin_dir, clean, refused)
    }

    /// Spawn the install worker for one transaction and consume its messages
    /// until completion. Progress is re-emitted as life-cycle events; this is
    /// the only reader of the worker channel.
    fn run_install(
        &mut self,
        id: &str,
        plugin_dir: PathBuf,
        specs: Vec<crate::manifest::PackageSpec>,
        refused: Vec<PackageInstallResult>,
    ) -> Result<(), LifecycleError> {
        self.in_flight.insert(id.to_string());
        let cancel = Arc::new(AtomicBool::new(false));
        self.install_cancel.insert(id.to_string(), cancel.clone());

        let (tx, rx) = mpsc::channel();
        let worker = spawn_install(
            Arc::clone(&self.installer),
            id.to_string(),
            plugin_dir,
            specs,
            refused,
            tx,
            cancel,
        );

        let mut finished = None;
        while let Ok(message) = rx.recv() {
            match message {
                InstallerMessage::Progress {
                    plugin_id,
                    percent,
                    message,
                } => {
                    self.events.emit(&LifecycleEvent::InstallProgress {
                        id: plugin_id,
                        percent,
                        message,
                    });
                }
                InstallerMessage::Finished { outcome, .. } => {
                    finished = Some(outcome);
                    break;
                }
            }
        }
        let _ = worker.join();

        self.in_flight.remove(id);
        self.install_cancel.remove(id);

        let outcome = finished
            .unwrap_or_else(|| Err(anyhow::anyhow!("install worker terminated unexpectedly")));

        match outcome {
            Err(e) => {
                let details = format!("{:#}", e);
                self.fail(id, &details);
                Err(LifecycleError::InstallAborted {
                    id: id.to_string(),
                    details,
                })
            }
            Ok(InstallOutcome::Committed { transaction }) => {
                self.archive(&transaction);
                let failed = transaction.failed_packages();
                if let Some(record) = self.registry.get_mut(id) {
                    if !failed.is_empty() {
                        record
                            .warnings
                            .push(format!("packages failed to install: {}", failed.join(", ")));
                    }
                    record.installed_manifest_hash = Some(record.manifest_hash.clone());
                }
                self.transition(id, PluginState::Enabled)?;
                self.binding
                    .enable_plugin(id)
                    .map_err(|e| LifecycleError::Persistence(format!("{:#}", e)))?;
                self.events.emit(&LifecycleEvent::PluginEnabled {
                    id: id.to_string(),
                });
                Ok(())
            }
            Ok(InstallOutcome::RolledBack {
                transaction,
                reason,
            }) => {
                self.archive(&transaction);
                self.fail(id, &reason);
                Err(LifecycleError::CriticalInstall {
                    id: id.to_string(),
                    details: reason,
                })
            }
            Ok(InstallOutcome::RollbackFailed {
                transaction,
                reason,
                rollback_error,
            }) => {
                self.archive(&transaction);
                let details = format!("{} (rollback failed: {})", reason, rollback_error);
                self.fail(id, &details);
                Err(LifecycleError::RollbackFailure {
                    id: id.to_string(),
                    details,
                })
            }
        }
    }

    fn archive(&self, transaction: &crate::install::InstallTransaction) {
        if let Some(journal) = &self.journal {
            if let Err(e) = transaction.archive(journal) {
                log::warn!("failed to journal transaction: {:#}", e);
            }
        }
    }

    /// Load an enabled plugin's code and invoke its initialization hook.
    pub fn load(&mut self, id: &str) -> Result<(), LifecycleError> {
        let state = self.state_of(id)?;
        if state == PluginState::Running {
            return Ok(());
        }
        self.transition(id, PluginState::Loading)?;

        let entry_point = self
            .registry
            .get(id)
            .map(|r| r.manifest.entry_point.clone())
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        let Some(mut instance) = self.factories.create(&entry_point) else {
            let details = format!("no factory registered for entry point '{}'", entry_point);
            self.fail(id, &details);
            return Err(LifecycleError::Initialization {
                id: id.to_string(),
                details,
            });
        };

        let settings = self.binding.active().plugin_settings.get(id).cloned();
        let mut ctx = PluginContext {
            id,
            events: &mut self.events,
            settings: settings.as_ref(),
        };

        match instance.initialize(&mut ctx) {
            Ok(()) => {
                self.loaded.insert(id.to_string(), instance);
                self.transition(id, PluginState::Running)?;
                self.events.emit(&LifecycleEvent::PluginLoaded {
                    id: id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                // Automatic cleanup: drop the instance and revoke anything
                // it subscribed before failing.
                drop(instance);
                self.events.revoke_owned_by(id);
                let details = format!("{:#}", e);
                self.fail(id, &details);
                Err(LifecycleError::Initialization {
                    id: id.to_string(),
                    details,
                })
            }
        }
    }

    /// Stop a running plugin: invoke its cleanup hook, revoke every event
    /// subscription it created, and drop its instance.
    pub fn unload(&mut self, id: &str) -> Result<(), LifecycleError> {
        let state = self.state_of(id)?;
        if state != PluginState::Running {
            return Ok(());
        }

        self.transition(id, PluginState::Stopping)?;
        if let Some(mut instance) = self.loaded.remove(id) {
            instance.shutdown();
        }
        self.events.revoke_owned_by(id);
        self.transition(id, PluginState::Unloaded)?;
        self.events.emit(&LifecycleEvent::PluginUnloaded {
            id: id.to_string(),
        });
        Ok(())
    }

    /// Enable and load in one step.
    pub fn start(&mut self, id: &str) -> Result<(), LifecycleError> {
        if self.switching {
            return Err(LifecycleError::SwitchInProgress);
        }
        self.start_inner(id)
    }

    fn start_inner(&mut self, id: &str) -> Result<(), LifecycleError> {
        self.enable_inner(id)?;
        self.load(id)
    }

    /// Disable a plugin and remove it from the active workspace's enabled
    /// set. A running plugin is unloaded first.
    pub fn disable(&mut self, id: &str) -> Result<(), LifecycleError> {
        if self.switching {
            return Err(LifecycleError::SwitchInProgress);
        }

        let state = self.state_of(id)?;
        match state {
            PluginState::Disabled => return Ok(()),
            PluginState::Running => {
                self.unload(id)?;
                self.transition(id, PluginState::Disabled)?;
            }
            PluginState::Enabled | PluginState::Unloaded => {
                self.transition(id, PluginState::Disabled)?;
            }
            other => {
                // Not activated in this session; a plugin can still be
                // removed from the workspace's enabled set.
                if !self.binding.active().enabled_plugins.contains(id) {
                    return Err(LifecycleError::IllegalTransition {
                        id: id.to_string(),
                        from: other,
                        to: PluginState::Disabled,
                    });
                }
            }
        }

        self.binding
            .disable_plugin(id)
            .map_err(|e| LifecycleError::Persistence(format!("{:#}", e)))?;
        self.events.emit(&LifecycleEvent::PluginDisabled {
            id: id.to_string(),
        });
        Ok(())
    }

    /// Switch to another workspace: unload every running plugin, activate the
    /// target's config, re-run discovery over its plugin root, and start its
    /// enabled set. The teardown is unconditional even when switching to the
    /// current workspace, guaranteeing a clean re-initialization.
    ///
    /// Switches are serialized, and enable/disable requests are rejected
    /// while one is in progress.
    pub fn switch_workspace(&mut self, name: &str) -> Result<SwitchReport, LifecycleError> {
        if self.switching {
            return Err(LifecycleError::SwitchInProgress);
        }
        self.switching = true;
        let result = self.do_switch(name);
        self.switching = false;
        result
    }

    fn do_switch(&mut self, name: &str) -> Result<SwitchReport, LifecycleError> {
        let mut report = SwitchReport {
            workspace: name.to_string(),
            ..Default::default()
        };

        for id in self.registry.ids_in_state(PluginState::Running) {
            self.unload(&id)?;
            report.unloaded.push(id);
        }

        self.binding
            .activate(name)
            .map_err(|e| LifecycleError::Persistence(format!("{:#}", e)))?;
        self.registry
            .set_workspace_root(self.binding.dir().join(name).join("plugins"));
        self.registry
            .discover()
            .map_err(|e| LifecycleError::Discovery(format!("{:#}", e)))?;

        let registry = &self.registry;
        report.skipped = self
            .binding
            .prune_unknown(|id| registry.contains(id))
            .map_err(|e| LifecycleError::Persistence(format!("{:#}", e)))?;
        for id in &report.skipped {
            log::warn!("workspace '{}' enables unknown plugin '{}', skipping", name, id);
        }

        for id in self.binding.active().enabled_plugins.clone() {
            match self.start_inner(&id) {
                Ok(()) => report.started.push(id),
                Err(e) => {
                    log::warn!("failed to start '{}' after switch: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}
