use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::retry::{execute_with_retry, RetryPolicy};

/// Persistent record of which migrations have been applied.
/// Absence of the table means "zero migrations applied", not an error.
pub const TRACKING_TABLE: &str = "schema_migrations";

/// Migration file each extension subdirectory may carry.
pub const EXTENSION_MIGRATION_FILE: &str = "migration.sql";

/// Sort key used when a migration file lacks a numeric prefix; such files
/// order after every well-formed one.
const MALFORMED_PREFIX_KEY: u64 = u64::MAX;

static NUMERIC_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)").unwrap());

#[derive(Debug, Clone, Serialize)]
pub struct MigrationError {
    pub file: String,
    pub error: String,
}

/// Aggregated result of one `run_migrations` pass. The batch always runs to
/// completion; per-file failures are collected, not raised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationBatch {
    pub success: bool,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<MigrationError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionMigrationResult {
    pub extension_id: String,
    pub success: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtensionBatch {
    pub success: bool,
    pub extensions: Vec<ExtensionMigrationResult>,
}

enum FileOutcome {
    Applied,
    /// Every effective statement hit "already exists"; the file had been
    /// applied before tracking knew about it.
    AlreadyApplied,
}

pub async fn ensure_tracking_table(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           name TEXT PRIMARY KEY,\
           applied_at TEXT NOT NULL\
         )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Names recorded in the tracking table. A missing table (or any read
/// failure) yields an empty set so a fresh database is indistinguishable
/// from "nothing applied yet".
pub async fn applied_migrations(pool: &SqlitePool) -> HashSet<String> {
    let rows = sqlx::query_scalar::<_, String>("SELECT name FROM schema_migrations")
        .fetch_all(pool)
        .await;

    match rows {
        Ok(names) => names.into_iter().collect(),
        Err(_) => HashSet::new(),
    }
}

fn prefix_key(name: &str) -> u64 {
    NUMERIC_PREFIX
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(MALFORMED_PREFIX_KEY)
}

/// Migration file names under `dir`, ascending by numeric prefix, malformed
/// prefixes last. Underscore-prefixed files are scratch and excluded.
pub fn migration_files(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".sql") && !name.starts_with('_'))
        .collect();

    files.sort_by(|a, b| prefix_key(a).cmp(&prefix_key(b)).then_with(|| a.cmp(b)));
    files
}

fn strip_comment_lines(sql: &str) -> String {
    sql.lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_already_exists(error: &AppError) -> bool {
    error
        .messages()
        .iter()
        .any(|m| m.contains("already exists"))
}

/// Executes one SQL file statement by statement. A statement failing with
/// "already exists" is skipped: reapplying a partially-applied file must be
/// safe. Any other failure aborts the file.
async fn execute_sql_file(
    pool: &SqlitePool,
    path: &Path,
    policy: &RetryPolicy,
) -> AppResult<FileOutcome> {
    let raw = fs::read_to_string(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_migration")
            .with_context("path", path.display().to_string())
    })?;

    let cleaned = strip_comment_lines(&raw);
    let mut ran = 0usize;
    let mut skipped_existing = 0usize;

    for stmt in cleaned.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        let upper = s.to_ascii_uppercase();
        if upper == "BEGIN" || upper == "COMMIT" {
            continue;
        }

        let result = execute_with_retry(policy, || async {
            sqlx::query(s).execute(pool).await.map_err(AppError::from)?;
            Ok(())
        })
        .await;

        match result {
            Ok(()) => ran += 1,
            Err(error) if is_already_exists(&error) => skipped_existing += 1,
            Err(error) => return Err(error),
        }
    }

    if ran == 0 && skipped_existing > 0 {
        Ok(FileOutcome::AlreadyApplied)
    } else {
        Ok(FileOutcome::Applied)
    }
}

/// Best-effort tracking insert; a failure here must not undo an applied
/// migration, so it is logged and swallowed.
async fn record_migration(pool: &SqlitePool, name: &str) {
    if let Err(error) = ensure_tracking_table(pool).await {
        warn!(
            target: "dockhand",
            event = "tracking_table_create_failed",
            error = %error
        );
        return;
    }

    let applied_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let insert = sqlx::query(
        "INSERT OR IGNORE INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
    )
    .bind(name)
    .bind(&applied_at)
    .execute(pool)
    .await;

    if let Err(error) = insert {
        warn!(
            target: "dockhand",
            event = "tracking_record_failed",
            file = %name,
            error = %error
        );
    }
}

/// Applies every pending migration file strictly in ascending order.
///
/// Pending = files on disk minus tracked names. The runner does not abort on
/// a per-file failure; it continues through the remaining files and reports
/// everything at the end, trading fail-fast for maximum forward progress and
/// full visibility.
pub async fn run_migrations(
    pool: &SqlitePool,
    migrations_dir: &Path,
    policy: &RetryPolicy,
) -> MigrationBatch {
    let mut batch = MigrationBatch {
        success: true,
        ..MigrationBatch::default()
    };

    if !migrations_dir.exists() {
        warn!(
            target: "dockhand",
            event = "migrations_dir_missing",
            path = %migrations_dir.display()
        );
        return batch;
    }

    let applied = applied_migrations(pool).await;
    let files = migration_files(migrations_dir);
    let pending: Vec<&String> = files.iter().filter(|f| !applied.contains(*f)).collect();

    if pending.is_empty() {
        info!(target: "dockhand", event = "migrations_up_to_date", tracked = applied.len());
        return batch;
    }

    info!(
        target: "dockhand",
        event = "migrations_pending",
        count = pending.len()
    );

    for file in pending {
        let path = migrations_dir.join(file);
        match execute_sql_file(pool, &path, policy).await {
            Ok(outcome) => {
                record_migration(pool, file).await;
                match outcome {
                    FileOutcome::Applied => {
                        batch.applied += 1;
                        info!(target: "dockhand", event = "migration_applied", file = %file);
                    }
                    FileOutcome::AlreadyApplied => {
                        batch.skipped += 1;
                        info!(target: "dockhand", event = "migration_skipped_existing", file = %file);
                    }
                }
            }
            Err(error) => {
                batch.failed += 1;
                warn!(
                    target: "dockhand",
                    event = "migration_failed",
                    file = %file,
                    error = %error
                );
                batch.errors.push(MigrationError {
                    file: file.clone(),
                    error: error.to_string(),
                });
            }
        }
    }

    batch.success = batch.failed == 0;
    batch
}

/// Applies one extension's `migration.sql` with the same single-file
/// semantics as core migrations. A missing file is a successful skip; the
/// extension simply has no schema of its own.
pub async fn run_extension_migration(
    pool: &SqlitePool,
    extension_id: &str,
    migration_path: &Path,
    policy: &RetryPolicy,
) -> ExtensionMigrationResult {
    if !migration_path.exists() {
        return ExtensionMigrationResult {
            extension_id: extension_id.to_string(),
            success: true,
            skipped: true,
            error: None,
        };
    }

    match execute_sql_file(pool, migration_path, policy).await {
        Ok(outcome) => {
            info!(
                target: "dockhand",
                event = "extension_migration_applied",
                extension = %extension_id
            );
            ExtensionMigrationResult {
                extension_id: extension_id.to_string(),
                success: true,
                skipped: matches!(outcome, FileOutcome::AlreadyApplied),
                error: None,
            }
        }
        Err(error) => {
            warn!(
                target: "dockhand",
                event = "extension_migration_failed",
                extension = %extension_id,
                error = %error
            );
            ExtensionMigrationResult {
                extension_id: extension_id.to_string(),
                success: false,
                skipped: false,
                error: Some(error.to_string()),
            }
        }
    }
}

/// Discovers extensions by enumerating the immediate subdirectories of
/// `extensions_dir` and applies each one's migration file, if present.
pub async fn run_all_extension_migrations(
    pool: &SqlitePool,
    extensions_dir: &Path,
    policy: &RetryPolicy,
) -> ExtensionBatch {
    let mut batch = ExtensionBatch {
        success: true,
        ..ExtensionBatch::default()
    };

    let entries = match fs::read_dir(extensions_dir) {
        Ok(entries) => entries,
        Err(_) => return batch,
    };

    let mut ids: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    ids.sort();

    for id in ids {
        let migration_path = extensions_dir.join(&id).join(EXTENSION_MIGRATION_FILE);
        if !migration_path.exists() {
            continue;
        }
        let result = run_extension_migration(pool, &id, &migration_path, policy).await;
        batch.success &= result.success;
        batch.extensions.push(result);
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_pool;
    use tempfile::tempdir;

    fn write_migration(dir: &Path, name: &str, sql: &str) {
        fs::write(dir.join(name), sql).unwrap();
    }

    #[test]
    fn migration_files_sort_by_numeric_prefix_with_malformed_last() {
        let dir = tempdir().unwrap();
        write_migration(dir.path(), "0010_later.sql", "");
        write_migration(dir.path(), "0002_early.sql", "");
        write_migration(dir.path(), "no_prefix.sql", "");
        write_migration(dir.path(), "_scratch.sql", "");
        write_migration(dir.path(), "readme.txt", "");

        let files = migration_files(dir.path());
        assert_eq!(
            files,
            vec!["0002_early.sql", "0010_later.sql", "no_prefix.sql"]
        );
    }

    #[tokio::test]
    async fn applied_migrations_is_empty_when_table_is_absent() {
        let pool = open_memory_pool().await.unwrap();
        assert!(applied_migrations(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn run_migrations_applies_in_order_and_records() {
        let pool = open_memory_pool().await.unwrap();
        let dir = tempdir().unwrap();
        write_migration(
            dir.path(),
            "0001_base.sql",
            "CREATE TABLE patients (id INTEGER PRIMARY KEY);",
        );
        write_migration(
            dir.path(),
            "0002_visits.sql",
            "CREATE TABLE visits (\n  id INTEGER PRIMARY KEY,\n  patient_id INTEGER REFERENCES patients(id)\n);",
        );

        let batch = run_migrations(&pool, dir.path(), &RetryPolicy::default()).await;
        assert!(batch.success);
        assert_eq!(batch.applied, 2);
        assert_eq!(batch.failed, 0);

        let applied = applied_migrations(&pool).await;
        assert!(applied.contains("0001_base.sql"));
        assert!(applied.contains("0002_visits.sql"));
    }

    #[tokio::test]
    async fn already_existing_schema_is_an_idempotent_skip() {
        let pool = open_memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE patients (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();

        let dir = tempdir().unwrap();
        write_migration(
            dir.path(),
            "0001_base.sql",
            "CREATE TABLE patients (id INTEGER PRIMARY KEY);",
        );

        let batch = run_migrations(&pool, dir.path(), &RetryPolicy::default()).await;
        assert!(batch.success);
        assert_eq!(batch.applied, 0);
        assert_eq!(batch.skipped, 1);
        // Seeded going forward: the file is now tracked.
        assert!(applied_migrations(&pool).await.contains("0001_base.sql"));
    }

    #[tokio::test]
    async fn batch_continues_past_a_failing_file() {
        let pool = open_memory_pool().await.unwrap();
        let dir = tempdir().unwrap();
        write_migration(dir.path(), "0001_bad.sql", "CREATE BOGUS SYNTAX;");
        write_migration(
            dir.path(),
            "0002_good.sql",
            "CREATE TABLE survivors (id INTEGER PRIMARY KEY);",
        );

        let batch = run_migrations(&pool, dir.path(), &RetryPolicy::default()).await;
        assert!(!batch.success);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.applied, 1);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].file, "0001_bad.sql");

        let applied = applied_migrations(&pool).await;
        assert!(!applied.contains("0001_bad.sql"));
        assert!(applied.contains("0002_good.sql"));
    }

    #[tokio::test]
    async fn missing_migrations_dir_is_a_no_op() {
        let pool = open_memory_pool().await.unwrap();
        let dir = tempdir().unwrap();
        let batch =
            run_migrations(&pool, &dir.path().join("nope"), &RetryPolicy::default()).await;
        assert!(batch.success);
        assert_eq!(batch.applied, 0);
    }

    #[tokio::test]
    async fn extension_migrations_are_discovered_per_subdirectory() {
        let pool = open_memory_pool().await.unwrap();
        let dir = tempdir().unwrap();
        let ext_a = dir.path().join("labs");
        let ext_b = dir.path().join("billing");
        let ext_c = dir.path().join("no-schema");
        fs::create_dir_all(&ext_a).unwrap();
        fs::create_dir_all(&ext_b).unwrap();
        fs::create_dir_all(&ext_c).unwrap();
        fs::write(
            ext_a.join(EXTENSION_MIGRATION_FILE),
            "CREATE TABLE labs (id INTEGER PRIMARY KEY);",
        )
        .unwrap();
        fs::write(
            ext_b.join(EXTENSION_MIGRATION_FILE),
            "CREATE TABLE billing (id INTEGER PRIMARY KEY);",
        )
        .unwrap();

        let batch =
            run_all_extension_migrations(&pool, dir.path(), &RetryPolicy::default()).await;
        assert!(batch.success);
        assert_eq!(batch.extensions.len(), 2);

        let tables = crate::db::schema::user_tables(&pool).await.unwrap();
        assert!(tables.contains(&"labs".to_string()));
        assert!(tables.contains(&"billing".to_string()));
    }

    #[tokio::test]
    async fn extension_without_migration_file_is_skipped_successfully() {
        let pool = open_memory_pool().await.unwrap();
        let dir = tempdir().unwrap();
        let result = run_extension_migration(
            &pool,
            "ghost",
            &dir.path().join(EXTENSION_MIGRATION_FILE),
            &RetryPolicy::default(),
        )
        .await;
        assert!(result.success);
        assert!(result.skipped);
    }
}
