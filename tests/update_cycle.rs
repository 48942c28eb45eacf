use std::collections::HashMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use dockhand::update::{
    recover_from_previous_failure, run_engine_update, ChangeStatus, EngineFileChange,
    SourceFetcher, UpdateOutcome,
};
use dockhand::{AppError, AppResult, UpdateConfig};
use tempfile::tempdir;

struct MapFetcher {
    files: HashMap<String, Vec<u8>>,
}

impl MapFetcher {
    fn new(entries: &[(&str, &[u8])]) -> Self {
        MapFetcher {
            files: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl SourceFetcher for MapFetcher {
    async fn fetch(&self, _tag: &str, path: &str) -> AppResult<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::new("FETCH/GIT", format!("path not found: {path}")))
    }
}

fn fetch_js_payload() -> Vec<u8> {
    b"export async function fetch(route, init) { return upstream(route, init); }\n"
        .repeat(3)
}

fn added(path: &str) -> EngineFileChange {
    EngineFileChange::new(ChangeStatus::Added, path)
}

fn deleted(path: &str) -> EngineFileChange {
    EngineFileChange::new(ChangeStatus::Deleted, path)
}

fn seed(dir: &Path, name: &str, contents: &[u8]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(name), contents).unwrap();
}

/// Sorted (name, contents) listing of a directory's files.
fn dir_contents(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            (name, fs::read(entry.path()).unwrap())
        })
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn successful_update_leaves_only_the_new_file_set() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    fs::create_dir_all(&config.engine_dir).unwrap();

    let payload = fetch_js_payload();
    let fetcher = MapFetcher::new(&[
        ("engine/fetch.js", payload.as_slice()),
        ("engine/helper.js", b"export const helper = () => 42;".as_slice()),
    ]);
    let changes = vec![added("engine/fetch.js"), added("engine/helper.js")];

    let outcome = run_engine_update("v1.0.0", &changes, &fetcher, &config).await;

    match outcome {
        UpdateOutcome::Success { files_updated } => assert_eq!(files_updated, 2),
        other => panic!("expected success, got {other:?}"),
    }

    let names: Vec<String> = dir_contents(&config.engine_dir)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["fetch.js", "helper.js"]);
    assert!(!config.staging_dir.exists());
    assert!(!config.backup_dir.exists());
}

#[tokio::test]
async fn validation_failure_rolls_back_to_pre_update_state() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    seed(&config.engine_dir, "fetch.js", &fetch_js_payload());
    seed(&config.engine_dir, "helper.js", b"original helper");
    let before = dir_contents(&config.engine_dir);

    // The update ships a file set without the required fetch.js.
    let fetcher = MapFetcher::new(&[("engine/other.js", b"whatever".as_slice())]);
    let changes = vec![added("engine/other.js")];

    let outcome = run_engine_update("v1.0.1", &changes, &fetcher, &config).await;

    match outcome {
        UpdateOutcome::RolledBack { error } => {
            assert!(error.contains("UPDATE/VALIDATION"), "unexpected error: {error}")
        }
        other => panic!("expected rollback, got {other:?}"),
    }

    assert_eq!(dir_contents(&config.engine_dir), before);
    assert!(!config.staging_dir.exists());
    assert!(!config.backup_dir.exists());
}

#[tokio::test]
async fn extraction_failure_rolls_back_cleanly() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    seed(&config.engine_dir, "fetch.js", &fetch_js_payload());
    let before = dir_contents(&config.engine_dir);

    let fetcher = MapFetcher::new(&[]);
    let changes = vec![added("engine/fetch.js")];

    let outcome = run_engine_update("v1.0.2", &changes, &fetcher, &config).await;

    assert!(matches!(outcome, UpdateOutcome::RolledBack { .. }));
    assert_eq!(dir_contents(&config.engine_dir), before);
}

#[tokio::test]
async fn failed_rollback_demands_manual_recovery_and_keeps_the_backup() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    seed(&config.backup_dir, "fetch.js", &fetch_js_payload());
    // A plain file where the engine directory should be: the update fails
    // validation and the restore copy cannot create the directory either.
    fs::write(&config.engine_dir, b"not a directory").unwrap();

    let fetcher = MapFetcher::new(&[("engine/other.js", b"whatever".as_slice())]);
    let changes = vec![added("engine/other.js")];

    let outcome = run_engine_update("v1.0.4", &changes, &fetcher, &config).await;

    match outcome {
        UpdateOutcome::ManualRecoveryRequired {
            error,
            rollback_error,
            backup_path,
        } => {
            assert!(error.contains("UPDATE/VALIDATION"), "unexpected error: {error}");
            assert!(
                rollback_error.contains("UPDATE/ROLLBACK"),
                "unexpected rollback error: {rollback_error}"
            );
            assert_eq!(backup_path, config.backup_dir.display().to_string());
        }
        other => panic!("expected manual recovery, got {other:?}"),
    }

    // The operator still has the pre-update snapshot.
    assert!(config.backup_dir.join("fetch.js").exists());
}

#[tokio::test]
async fn empty_file_set_is_a_successful_no_op() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    seed(&config.engine_dir, "fetch.js", &fetch_js_payload());

    let fetcher = MapFetcher::new(&[]);
    let outcome = run_engine_update("v1.0.3", &[], &fetcher, &config).await;

    match outcome {
        UpdateOutcome::Success { files_updated } => assert_eq!(files_updated, 0),
        other => panic!("expected success, got {other:?}"),
    }
    assert!(config.engine_dir.join("fetch.js").exists());
}

#[tokio::test]
async fn update_applies_deferred_deletions() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    seed(&config.engine_dir, "fetch.js", &fetch_js_payload());
    seed(&config.engine_dir, "legacy.js", b"obsolete");

    let payload = fetch_js_payload();
    let fetcher = MapFetcher::new(&[("engine/fetch.js", payload.as_slice())]);
    let changes = vec![added("engine/fetch.js"), deleted("engine/legacy.js")];

    let outcome = run_engine_update("v1.1.0", &changes, &fetcher, &config).await;

    assert!(outcome.is_success());
    assert!(!config.engine_dir.join("legacy.js").exists());
    assert!(config.engine_dir.join("fetch.js").exists());
}

#[tokio::test]
async fn repeating_an_update_reproduces_the_same_engine_contents() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    fs::create_dir_all(&config.engine_dir).unwrap();

    let payload = fetch_js_payload();
    let fetcher = MapFetcher::new(&[
        ("engine/fetch.js", payload.as_slice()),
        ("engine/helper.js", b"export const helper = () => 42;".as_slice()),
    ]);
    let changes = vec![added("engine/fetch.js"), added("engine/helper.js")];

    let first = run_engine_update("v2.0.0", &changes, &fetcher, &config).await;
    assert!(first.is_success());
    let after_first = dir_contents(&config.engine_dir);

    let second = run_engine_update("v2.0.0", &changes, &fetcher, &config).await;
    assert!(second.is_success());

    assert_eq!(dir_contents(&config.engine_dir), after_first);
    assert!(!config.staging_dir.exists());
    assert!(!config.backup_dir.exists());
}

#[tokio::test]
async fn stale_backup_after_completed_swap_is_reaped_without_data_loss() {
    // Crash point: swap finished, success cleanup never ran.
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    seed(&config.engine_dir, "fetch.js", b"new version");
    seed(&config.backup_dir, "fetch.js", b"old version");

    let report = recover_from_previous_failure(&config);

    assert!(!report.recovered);
    assert!(report.error.is_none());
    assert!(!config.backup_dir.exists());
    assert_eq!(
        fs::read(config.engine_dir.join("fetch.js")).unwrap(),
        b"new version"
    );
}

#[tokio::test]
async fn reconciler_leaves_a_runnable_engine_for_every_crash_point() {
    // Crash during extraction: staging exists, engine untouched.
    {
        let root = tempdir().unwrap();
        let config = UpdateConfig::for_root(root.path());
        seed(&config.engine_dir, "fetch.js", b"live");
        seed(&config.staging_dir, "fetch.js", b"half-extracted");

        let report = recover_from_previous_failure(&config);
        assert!(!report.recovered);
        assert!(!config.staging_dir.exists());
        assert!(config.engine_dir.join("fetch.js").exists());
    }

    // Crash mid-swap: backup holds the snapshot, engine was wiped.
    {
        let root = tempdir().unwrap();
        let config = UpdateConfig::for_root(root.path());
        seed(&config.backup_dir, "fetch.js", b"snapshot");
        fs::create_dir_all(&config.engine_dir).unwrap();

        let report = recover_from_previous_failure(&config);
        assert!(report.recovered);
        assert_eq!(
            fs::read(config.engine_dir.join("fetch.js")).unwrap(),
            b"snapshot"
        );
        assert!(!config.backup_dir.exists());
    }

    // Crash between swap and cleanup: both directories populated.
    {
        let root = tempdir().unwrap();
        let config = UpdateConfig::for_root(root.path());
        seed(&config.engine_dir, "fetch.js", b"new");
        seed(&config.backup_dir, "fetch.js", b"old");
        seed(&config.staging_dir, "junk.js", b"leftover");

        let report = recover_from_previous_failure(&config);
        assert!(!report.recovered);
        assert!(!config.backup_dir.exists());
        assert!(!config.staging_dir.exists());
        assert!(config.engine_dir.join("fetch.js").exists());
    }
}

#[tokio::test]
async fn update_after_crash_recovers_then_succeeds() {
    let root = tempdir().unwrap();
    let config = UpdateConfig::for_root(root.path());
    // Previous attempt died mid-swap: engine empty, backup holds the data.
    seed(&config.backup_dir, "fetch.js", &fetch_js_payload());
    fs::create_dir_all(&config.engine_dir).unwrap();

    let payload = fetch_js_payload();
    let fetcher = MapFetcher::new(&[("engine/fetch.js", payload.as_slice())]);
    let changes = vec![added("engine/fetch.js")];

    let outcome = run_engine_update("v3.0.0", &changes, &fetcher, &config).await;

    assert!(outcome.is_success());
    assert!(config.engine_dir.join("fetch.js").exists());
    assert!(!config.backup_dir.exists());
    assert!(!config.staging_dir.exists());
}
