use super::*;
use crate::manifest::PackageSpec;
use anyhow::bail;
use std::sync::Mutex;
use tempfile::TempDir;

/// Test fetcher: names starting with "fail" error out, names starting with
/// "slow" stall long enough to trip short timeouts, everything else writes a
/// small payload into the staging directory.
struct MockFetcher;

impl PackageFetcher for MockFetcher {
    fn fetch(&self, spec: &PackageSpec, dest: &Path) -> Result<FetchedPackage> {
        if spec.name.starts_with("fail") {
            bail!("simulated registry failure");
        }
        if spec.name.starts_with("slow") {
            thread::sleep(Duration::from_millis(300));
        }
        fs::write(dest.join("payload.bin"), spec.name.as_bytes())?;
        Ok(FetchedPackage {
            name: spec.name.clone(),
            version: Some("1.0.0".to_string()),
            checksum: "sha256:mock".to_string(),
        })
    }
}

fn test_installer(timeout_ms: u64, ratio: f64) -> IsolatedInstaller {
    IsolatedInstaller::new(
        Arc::new(MockFetcher),
        InstallerConfig {
            per_package_timeout: Duration::from_millis(timeout_ms),
            critical_failure_ratio: ratio,
            estimated_package_bytes: 1024,
        },
    )
}

fn specs(raws: &[&str]) -> Vec<PackageSpec> {
    raws.iter().map(|r| PackageSpec::parse(r).unwrap()).collect()
}

fn plugin_dir(temp: &TempDir) -> PathBuf {
    let dir = temp.path().join("net_scanner");
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn backup_dirs(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(config::LIB_BACKUP_PREFIX))
                .unwrap_or(false)
        })
        .collect()
}

#[test]
fn test_commit_all_success() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let outcome = installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["good-pkg>=1.0", "other-pkg"]),
            &[],
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(outcome.transaction().status, TransactionStatus::Committed);
    assert!(dir.join("lib/good-pkg/payload.bin").exists());
    assert!(dir.join("lib/other-pkg/payload.bin").exists());
    assert!(backup_dirs(&dir).is_empty());
}

#[test]
fn test_exactly_half_failures_commits() {
    // 1 of 2 failed is a ratio of exactly 0.5, which does not strictly
    // exceed the 0.5 threshold: the transaction commits with partial success.
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let outcome = installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["good-pkg>=1.0", "failpkg"]),
            &[],
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(outcome.transaction().failed_packages(), vec!["failpkg"]);
    assert!(dir.join("lib/good-pkg/payload.bin").exists());
    assert!(!dir.join("lib/failpkg").exists());
}

#[test]
fn test_majority_failure_restores_byte_identical_state() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);

    // Seed a prior install.
    let lib = dir.join("lib");
    fs::create_dir_all(lib.join("existing-pkg")).unwrap();
    fs::write(lib.join("existing-pkg/payload.bin"), b"previous install").unwrap();
    let before = dir_content_hash(&lib).unwrap();

    let installer = test_installer(5_000, 0.5);
    let outcome = installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["good-pkg", "fail-one", "fail-two"]),
            &[],
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap();

    match &outcome {
        InstallOutcome::RolledBack { transaction, reason } => {
            assert_eq!(transaction.status, TransactionStatus::RolledBack);
            assert!(reason.contains("2 of 3"));
        }
        other => panic!("expected rollback, got {:?}", other),
    }

    assert_eq!(dir_content_hash(&lib).unwrap(), before);
    assert!(backup_dirs(&dir).is_empty());
}

#[test]
fn test_rollback_to_absent_when_no_prior_install() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let outcome = installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["fail-one", "fail-two"]),
            &[],
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap();

    assert!(matches!(outcome, InstallOutcome::RolledBack { .. }));
    assert!(!dir.join("lib").exists());
}

#[test]
fn test_cancellation_fails_remaining_and_rolls_back() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let cancel = AtomicBool::new(true);
    let outcome = installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["good-pkg", "other-pkg"]),
            &[],
            &mut |_, _| {},
            &cancel,
        )
        .unwrap();

    match &outcome {
        InstallOutcome::RolledBack { transaction, .. } => {
            assert_eq!(transaction.failed_count(), 2);
            for result in &transaction.results {
                assert_eq!(result.error.as_deref(), Some("cancelled by user"));
            }
        }
        other => panic!("expected rollback, got {:?}", other),
    }
}

#[test]
fn test_per_package_timeout_records_failure() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(50, 0.5);

    let outcome = installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["slow-pkg", "good-pkg"]),
            &[],
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap();

    // 1 of 2 failed: commits with the timeout recorded.
    assert!(outcome.is_committed());
    let txn = outcome.transaction();
    assert_eq!(txn.failed_packages(), vec!["slow-pkg"]);
    let slow = txn.results.iter().find(|r| r.name == "slow-pkg").unwrap();
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
}

#[cfg(unix)]
#[test]
fn test_insufficient_disk_aborts_before_touching_filesystem() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = IsolatedInstaller::new(
        Arc::new(MockFetcher),
        InstallerConfig {
            per_package_timeout: Duration::from_secs(5),
            critical_failure_ratio: 0.5,
            estimated_package_bytes: u64::MAX,
        },
    );

    let err = installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["good-pkg"]),
            &[],
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap_err();

    assert!(err.to_string().contains("insufficient disk space"));
    assert!(!dir.join("lib").exists());
    assert!(backup_dirs(&dir).is_empty());
}

#[test]
fn test_progress_reported_per_package() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let seen: Mutex<Vec<(u8, String)>> = Mutex::new(Vec::new());
    installer
        .install(
            "net_scanner",
            &dir,
            &specs(&["good-pkg", "other-pkg"]),
            &[],
            &mut |percent, message| {
                seen.lock().unwrap().push((percent, message.to_string()));
            },
            &AtomicBool::new(false),
        )
        .unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, 50);
    assert_eq!(seen[1].0, 100);
    assert!(seen[0].1.contains("good-pkg"));
}

#[test]
fn test_empty_requirements_commit_trivially() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let outcome = installer
        .install("net_scanner", &dir, &[], &[], &mut |_, _| {}, &AtomicBool::new(false))
        .unwrap();

    assert!(outcome.is_committed());
    assert!(outcome.transaction().results.is_empty());
}

#[test]
fn test_transaction_archive_appends_jsonl() {
    let temp = TempDir::new().unwrap();
    let journal = temp.path().join("journal/install_log.jsonl");

    let txn = InstallTransaction::begin("net_scanner", None);
    txn.archive(&journal).unwrap();
    txn.archive(&journal).unwrap();

    let content = fs::read_to_string(&journal).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let parsed: InstallTransaction = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.plugin_id, "net_scanner");
    }
}

#[test]
fn test_spawn_install_streams_progress_then_finishes() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = Arc::new(test_installer(5_000, 0.5));

    let (tx, rx) = mpsc::channel();
    let handle = spawn_install(
        installer,
        "net_scanner".to_string(),
        dir,
        specs(&["good-pkg"]),
        vec![],
        tx,
        Arc::new(AtomicBool::new(false)),
    );

    let mut saw_progress = false;
    let mut finished = None;
    while let Ok(message) = rx.recv() {
        match message {
            InstallerMessage::Progress { percent, .. } => {
                saw_progress = true;
                assert!(percent <= 100);
            }
            InstallerMessage::Finished { outcome, .. } => {
                finished = Some(outcome);
                break;
            }
        }
    }
    handle.join().unwrap();

    assert!(saw_progress);
    assert!(finished.unwrap().unwrap().is_committed());
}

#[test]
fn test_refused_packages_count_toward_ratio() {
    // One refused of two declared is a ratio of exactly 0.5: the clean
    // package still installs and the transaction commits.
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let refused = vec![PackageInstallResult::refused(
        "pkgbackdoor123456",
        "package name matches blocked pattern",
    )];
    let outcome = installer
        .install(
            "demo",
            &dir,
            &specs(&["good-pkg>=1.0"]),
            &refused,
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(
        outcome.transaction().failed_packages(),
        vec!["pkgbackdoor123456"]
    );
    assert!(dir.join("lib/good-pkg/payload.bin").exists());
    assert!(!dir.join("lib/pkgbackdoor123456").exists());
}

#[test]
fn test_refused_majority_rolls_back() {
    let temp = TempDir::new().unwrap();
    let dir = plugin_dir(&temp);
    let installer = test_installer(5_000, 0.5);

    let refused = vec![
        PackageInstallResult::refused("bad-one", "blocked"),
        PackageInstallResult::refused("bad-two", "blocked"),
    ];
    let outcome = installer
        .install(
            "demo",
            &dir,
            &specs(&["good-pkg"]),
            &refused,
            &mut |_, _| {},
            &AtomicBool::new(false),
        )
        .unwrap();

    assert!(matches!(outcome, InstallOutcome::RolledBack { .. }));
    assert!(!dir.join("lib").exists());
}
