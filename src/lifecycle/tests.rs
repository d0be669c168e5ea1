use super::*;
use crate::install::{FetchedPackage, InstallerConfig, PackageFetcher};
use crate::manifest::PackageSpec;
use crate::registry::{write_plugin_dir, PluginRoot, PluginRootKind};
use crate::workspace::{WorkspaceConfig, DEFAULT_WORKSPACE};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Records every fetched package name; names starting with "fail" error out.
#[derive(Default)]
struct CountingFetcher {
    fetched: Mutex<Vec<String>>,
}

impl CountingFetcher {
    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl PackageFetcher for CountingFetcher {
    fn fetch(&self, spec: &PackageSpec, dest: &Path) -> Result<FetchedPackage> {
        self.fetched.lock().unwrap().push(spec.name.clone());
        if spec.name.starts_with("fail") {
            anyhow::bail!("simulated registry failure");
        }
        fs::write(dest.join("payload.bin"), spec.name.as_bytes())?;
        Ok(FetchedPackage {
            name: spec.name.clone(),
            version: Some("1.0.0".to_string()),
            checksum: "sha256:mock".to_string(),
        })
    }
}

/// Shared log of plugin hook invocations.
#[derive(Default)]
struct PluginLog {
    entries: Mutex<Vec<String>>,
}

impl PluginLog {
    fn push(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn count_of(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

struct TestPlugin {
    id: String,
    log: Arc<PluginLog>,
    fail_init: bool,
}

impl PluginHandle for TestPlugin {
    fn initialize(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        self.log.push(format!("init:{}", self.id));
        ctx.subscribe(|_| {});
        if self.fail_init {
            anyhow::bail!("init hook exploded");
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.log.push(format!("shutdown:{}", self.id));
    }
}

struct Harness {
    _temp: TempDir,
    manager: LifecycleManager,
    fetcher: Arc<CountingFetcher>,
    shared_root: std::path::PathBuf,
    ws_dir: std::path::PathBuf,
    log: Arc<PluginLog>,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let shared_root = temp.path().join("plugins");
        let ws_dir = temp.path().join("workspaces");

        let binding = WorkspaceBinding::open(ws_dir.clone(), DEFAULT_WORKSPACE).unwrap();
        let registry = crate::registry::PluginRegistry::new(vec![
            PluginRoot {
                kind: PluginRootKind::Shared,
                path: shared_root.clone(),
            },
            PluginRoot {
                kind: PluginRootKind::Workspace,
                path: ws_dir.join("default").join("plugins"),
            },
        ]);

        let fetcher = Arc::new(CountingFetcher::default());
        let installer = Arc::new(IsolatedInstaller::new(
            fetcher.clone(),
            InstallerConfig {
                per_package_timeout: Duration::from_secs(5),
                critical_failure_ratio: 0.5,
                estimated_package_bytes: 1,
            },
        ));

        let manager = LifecycleManager::new(
            registry,
            installer,
            SecurityPolicy::default(),
            binding,
        )
        .with_journal(temp.path().join("install_log.jsonl"));

        Self {
            _temp: temp,
            manager,
            fetcher,
            shared_root,
            ws_dir,
            log: Arc::new(PluginLog::default()),
        }
    }

    /// Create a plugin directory and register a matching test factory.
    fn add_plugin(&mut self, id: &str, requirements: &[&str]) -> std::path::PathBuf {
        let dir = write_plugin_dir(&self.shared_root, id, requirements).unwrap();
        self.register_factory(id, false);
        dir
    }

    fn register_factory(&mut self, id: &str, fail_init: bool) {
        let log = self.log.clone();
        let owned = id.to_string();
        self.manager
            .register_factory(&format!("{}::create", id), move || {
                Box::new(TestPlugin {
                    id: owned.clone(),
                    log: log.clone(),
                    fail_init,
                })
            });
    }

    fn collect_events(&mut self) -> Arc<Mutex<Vec<LifecycleEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        self.manager.events_mut().subscribe(move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        seen
    }

    fn state(&self, id: &str) -> PluginState {
        self.manager.registry().get(id).unwrap().state
    }

    fn running(&self) -> Vec<String> {
        self.manager.registry().ids_in_state(PluginState::Running)
    }
}

#[test]
fn test_enable_installs_and_transitions() {
    let mut h = Harness::new();
    let dir = h.add_plugin("scanner", &["requests>=2.25,<3.0"]);
    h.manager.discover().unwrap();
    let events = h.collect_events();

    h.manager.enable("scanner").unwrap();

    assert_eq!(h.state("scanner"), PluginState::Enabled);
    assert!(dir.join("lib/requests/payload.bin").exists());
    assert!(h.manager.workspace().enabled_plugins.contains("scanner"));
    assert!(h
        .manager
        .registry()
        .get("scanner")
        .unwrap()
        .installed_manifest_hash
        .is_some());

    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::InstallProgress { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::PluginEnabled { id } if id == "scanner")));
}

#[test]
fn test_enable_running_plugin_is_noop() {
    let mut h = Harness::new();
    h.add_plugin("scanner", &["requests>=2.25"]);
    h.manager.discover().unwrap();

    h.manager.start("scanner").unwrap();
    assert_eq!(h.state("scanner"), PluginState::Running);
    let fetched_before = h.fetcher.fetched().len();

    // No new transaction for an already-running plugin.
    h.manager.enable("scanner").unwrap();
    assert_eq!(h.fetcher.fetched().len(), fetched_before);
    assert_eq!(h.state("scanner"), PluginState::Running);
}

#[test]
fn test_fully_blocked_requirements_stop_enable() {
    let mut h = Harness::new();
    h.add_plugin("evil", &["pkgbackdoor99999"]);
    h.manager.discover().unwrap();

    let err = h.manager.enable("evil").unwrap_err();
    assert!(matches!(err, LifecycleError::SecurityBlock { .. }));

    // The installer was never invoked and the plugin is not enabled.
    assert!(h.fetcher.fetched().is_empty());
    assert_eq!(h.state("evil"), PluginState::Validated);
    assert!(h
        .manager
        .registry()
        .get("evil")
        .unwrap()
        .last_error
        .as_deref()
        .unwrap()
        .contains("blocked pattern"));
}

#[test]
fn test_partially_blocked_requirements_install_the_rest() {
    // Manifest declares one clean and one blocklisted package: the clean one
    // installs, the blocked one counts as the 1-of-2 failure, and at exactly
    // 50% the transaction commits.
    let mut h = Harness::new();
    h.add_plugin("demo", &["good-pkg>=1.0", "pkgbackdoor123456"]);
    h.manager.discover().unwrap();

    h.manager.enable("demo").unwrap();

    assert_eq!(h.state("demo"), PluginState::Enabled);
    assert_eq!(h.fetcher.fetched(), vec!["good-pkg"]);
    let record = h.manager.registry().get("demo").unwrap();
    assert!(record
        .warnings
        .iter()
        .any(|w| w.contains("pkgbackdoor123456")));
}

#[test]
fn test_conflicting_ranges_warn_but_install() {
    let mut h = Harness::new();
    h.add_plugin("net_scanner", &["requests>=2.25,<3.0"]);
    h.add_plugin("templater", &["requests>=3.0"]);
    h.manager.discover().unwrap();

    h.manager.enable("net_scanner").unwrap();
    h.manager.enable("templater").unwrap();

    assert_eq!(h.state("templater"), PluginState::Enabled);
    let conflicts: Vec<&String> = h
        .manager
        .registry()
        .get("templater")
        .unwrap()
        .warnings
        .iter()
        .filter(|w| w.contains("no overlapping version"))
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].contains("net_scanner"));
    assert!(conflicts[0].contains("templater"));
}

#[test]
fn test_critical_failure_moves_to_error_and_permits_retry() {
    let mut h = Harness::new();
    let dir = h.add_plugin("broken", &["fail-one", "fail-two", "good-pkg"]);
    h.manager.discover().unwrap();

    let err = h.manager.enable("broken").unwrap_err();
    assert!(matches!(err, LifecycleError::CriticalInstall { .. }));
    assert_eq!(h.state("broken"), PluginState::Error);
    assert!(!dir.join("lib").exists());

    let record = h.manager.registry().get("broken").unwrap();
    assert!(record.last_error.as_deref().unwrap().contains("2 of 3"));
    // Error is distinct from Disabled in any listing.
    assert_ne!(record.state, PluginState::Disabled);

    // Retry is permitted but never automatic; same cause, same outcome.
    let err = h.manager.enable("broken").unwrap_err();
    assert!(matches!(err, LifecycleError::CriticalInstall { .. }));
    assert_eq!(h.state("broken"), PluginState::Error);
}

#[test]
fn test_initialization_failure_cleans_up() {
    let mut h = Harness::new();
    write_plugin_dir(&h.shared_root, "flaky", &[]).unwrap();
    h.register_factory("flaky", true);
    h.manager.discover().unwrap();

    let host_subs = h.manager.events_mut().subscription_count();
    h.manager.enable("flaky").unwrap();

    let err = h.manager.load("flaky").unwrap_err();
    assert!(matches!(err, LifecycleError::Initialization { .. }));
    assert_eq!(h.state("flaky"), PluginState::Error);
    // The subscription made inside the failing init hook is gone.
    assert_eq!(h.manager.events_mut().subscription_count(), host_subs);
    assert!(h
        .manager
        .registry()
        .get("flaky")
        .unwrap()
        .last_error
        .as_deref()
        .unwrap()
        .contains("exploded"));
}

#[test]
fn test_missing_factory_is_an_initialization_error() {
    let mut h = Harness::new();
    write_plugin_dir(&h.shared_root, "orphan", &[]).unwrap();
    h.manager.discover().unwrap();

    h.manager.enable("orphan").unwrap();
    let err = h.manager.load("orphan").unwrap_err();
    assert!(matches!(err, LifecycleError::Initialization { .. }));
    assert_eq!(h.state("orphan"), PluginState::Error);
}

#[test]
fn test_unload_revokes_subscriptions_and_runs_shutdown() {
    let mut h = Harness::new();
    h.add_plugin("scanner", &[]);
    h.manager.discover().unwrap();

    let host_subs = h.manager.events_mut().subscription_count();
    h.manager.start("scanner").unwrap();
    assert_eq!(h.manager.events_mut().subscription_count(), host_subs + 1);

    let events = h.collect_events();
    h.manager.unload("scanner").unwrap();

    assert_eq!(h.state("scanner"), PluginState::Unloaded);
    // collect_events added one host subscription of its own.
    assert_eq!(h.manager.events_mut().subscription_count(), host_subs + 1);
    assert_eq!(h.log.count_of("shutdown:scanner"), 1);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, LifecycleEvent::PluginUnloaded { id } if id == "scanner")));
}

#[test]
fn test_disable_then_fast_reenable_skips_install() {
    let mut h = Harness::new();
    h.add_plugin("scanner", &["requests>=2.25"]);
    h.manager.discover().unwrap();

    h.manager.start("scanner").unwrap();
    let fetched_before = h.fetcher.fetched().len();

    h.manager.disable("scanner").unwrap();
    assert_eq!(h.state("scanner"), PluginState::Disabled);
    assert!(!h.manager.workspace().enabled_plugins.contains("scanner"));

    // Manifest unchanged since the committed install: no validation or
    // installation re-run.
    h.manager.enable("scanner").unwrap();
    assert_eq!(h.state("scanner"), PluginState::Enabled);
    assert_eq!(h.fetcher.fetched().len(), fetched_before);
    assert!(h.manager.workspace().enabled_plugins.contains("scanner"));

    h.manager.load("scanner").unwrap();
    assert_eq!(h.state("scanner"), PluginState::Running);
}

#[test]
fn test_manifest_change_forces_full_reenable() {
    let mut h = Harness::new();
    h.add_plugin("scanner", &["requests>=2.25"]);
    h.manager.discover().unwrap();

    h.manager.start("scanner").unwrap();
    h.manager.disable("scanner").unwrap();
    let fetched_before = h.fetcher.fetched().len();

    // Rewrite the manifest with a new requirement set.
    write_plugin_dir(&h.shared_root, "scanner", &["requests>=2.25", "numpy>=1.20"]).unwrap();
    h.manager.discover().unwrap();

    h.manager.enable("scanner").unwrap();
    assert_eq!(h.state("scanner"), PluginState::Enabled);
    assert!(h.fetcher.fetched().len() > fetched_before);
    assert!(h.fetcher.fetched().contains(&"numpy".to_string()));
}

#[test]
fn test_workspace_switch_isolation() {
    let mut h = Harness::new();
    h.add_plugin("a", &[]);
    h.add_plugin("b", &[]);
    h.add_plugin("c", &[]);
    h.manager.discover().unwrap();

    h.manager.start("a").unwrap();
    h.manager.start("b").unwrap();
    assert_eq!(h.running(), vec!["a", "b"]);

    // Prepare the target workspace on disk: enabled set {b, c}.
    let mut prod = WorkspaceConfig::new("prod");
    prod.enabled_plugins.insert("b".to_string());
    prod.enabled_plugins.insert("c".to_string());
    prod.save_to(&h.ws_dir.join("prod.json")).unwrap();

    let report = h.manager.switch_workspace("prod").unwrap();

    assert_eq!(report.unloaded, vec!["a", "b"]);
    assert_eq!(report.started, vec!["b", "c"]);
    assert!(report.failed.is_empty());

    // Exactly prod's enabled set is running; nothing from "default" leaks.
    assert_eq!(h.running(), vec!["b", "c"]);
    assert_eq!(h.state("a"), PluginState::Unloaded);
    assert_eq!(h.manager.workspace().name, "prod");

    // "b" was torn down and re-initialized, not carried across.
    assert_eq!(h.log.count_of("init:b"), 2);
    assert_eq!(h.log.count_of("shutdown:b"), 1);
}

#[test]
fn test_switch_to_same_workspace_reinitializes() {
    let mut h = Harness::new();
    h.add_plugin("b", &[]);
    h.manager.discover().unwrap();
    h.manager.start("b").unwrap();

    let report = h.manager.switch_workspace(DEFAULT_WORKSPACE).unwrap();

    assert_eq!(report.unloaded, vec!["b"]);
    assert_eq!(report.started, vec!["b"]);
    assert_eq!(h.running(), vec!["b"]);
    assert_eq!(h.log.count_of("init:b"), 2);
}

#[test]
fn test_switch_skips_unknown_enabled_ids() {
    let mut h = Harness::new();
    h.add_plugin("b", &[]);
    h.manager.discover().unwrap();

    let mut prod = WorkspaceConfig::new("prod");
    prod.enabled_plugins.insert("b".to_string());
    prod.enabled_plugins.insert("ghost".to_string());
    prod.save_to(&h.ws_dir.join("prod.json")).unwrap();

    let report = h.manager.switch_workspace("prod").unwrap();

    assert_eq!(report.skipped, vec!["ghost"]);
    assert_eq!(report.started, vec!["b"]);
    assert!(!h.manager.workspace().enabled_plugins.contains("ghost"));
}

#[test]
fn test_second_enable_rejected_while_install_in_flight() {
    let mut h = Harness::new();
    h.add_plugin("scanner", &["requests>=2.25"]);
    h.manager.discover().unwrap();

    h.manager.in_flight.insert("scanner".to_string());
    let err = h.manager.enable("scanner").unwrap_err();
    assert!(matches!(err, LifecycleError::InstallInFlight(_)));

    h.manager.in_flight.remove("scanner");
    h.manager.enable("scanner").unwrap();
    assert_eq!(h.state("scanner"), PluginState::Enabled);
}

#[test]
fn test_enable_rejected_during_workspace_switch() {
    let mut h = Harness::new();
    h.add_plugin("scanner", &[]);
    h.manager.discover().unwrap();

    h.manager.switching = true;
    assert!(matches!(
        h.manager.enable("scanner"),
        Err(LifecycleError::SwitchInProgress)
    ));
    assert!(matches!(
        h.manager.disable("scanner"),
        Err(LifecycleError::SwitchInProgress)
    ));
    assert!(matches!(
        h.manager.switch_workspace("prod"),
        Err(LifecycleError::SwitchInProgress)
    ));
}

#[test]
fn test_invalid_manifest_keeps_plugin_unselectable() {
    let mut h = Harness::new();
    let dir = h.shared_root.join("badver");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join(crate::config::PLUGIN_MANIFEST),
        serde_json::to_string_pretty(&serde_json::json!({
            "id": "badver",
            "name": "Bad Version",
            "version": "one.two",
            "entry_point": "badver::create",
        }))
        .unwrap(),
    )
    .unwrap();
    h.manager.discover().unwrap();

    let err = h.manager.enable("badver").unwrap_err();
    assert!(matches!(err, LifecycleError::Validation { .. }));
    assert_eq!(h.state("badver"), PluginState::Discovered);
    assert!(h
        .manager
        .registry()
        .get("badver")
        .unwrap()
        .last_error
        .is_some());
}

#[test]
fn test_enable_unknown_plugin_not_found() {
    let mut h = Harness::new();
    h.manager.discover().unwrap();
    assert!(matches!(
        h.manager.enable("nope"),
        Err(LifecycleError::NotFound(_))
    ));
}

#[test]
fn test_last_error_survives_until_next_attempt() {
    let mut h = Harness::new();
    h.add_plugin("broken", &["fail-one", "fail-two"]);
    h.manager.discover().unwrap();

    let _ = h.manager.enable("broken");
    assert!(h.manager.registry().get("broken").unwrap().last_error.is_some());

    // The next enable attempt clears the stale error before running.
    write_plugin_dir(&h.shared_root, "broken", &["good-pkg"]).unwrap();
    h.manager.discover().unwrap();
    h.manager.enable("broken").unwrap();
    assert!(h.manager.registry().get("broken").unwrap().last_error.is_none());
    assert_eq!(h.state("broken"), PluginState::Enabled);
}

#[test]
fn test_disable_not_activated_this_session_updates_config_only() {
    let mut h = Harness::new();
    h.add_plugin("scanner", &[]);
    h.manager.discover().unwrap();

    // Enabled in the config by some earlier session.
    h.manager.binding.enable_plugin("scanner").unwrap();

    h.manager.disable("scanner").unwrap();
    assert!(!h.manager.workspace().enabled_plugins.contains("scanner"));
    // The record was never activated, so its state is untouched.
    assert_eq!(h.state("scanner"), PluginState::Discovered);

    // Disabling something neither active nor configured is an error.
    let err = h.manager.disable("scanner");
    assert!(matches!(err, Err(LifecycleError::IllegalTransition { .. })));
}
