use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::db::migrate::{applied_migrations, TRACKING_TABLE};
use crate::error::AppResult;

/// Hash value reported when the database holds no user tables.
pub const EMPTY_SCHEMA_SENTINEL: &str = "empty_db";

const SCHEMA_HASH_LEN: usize = 16;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static OPEN_PAREN_PAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(\s+").unwrap());
static CLOSE_PAREN_PAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+\)").unwrap());
static COMMA_PAD: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s+").unwrap());

/// Collapses formatting noise out of a `CREATE TABLE` statement so two
/// textually different but structurally identical definitions hash alike.
fn normalize_create_statement(sql: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(sql, " ");
    let open = OPEN_PAREN_PAD.replace_all(&collapsed, "(");
    let close = CLOSE_PAREN_PAD.replace_all(&open, ")");
    let commas = COMMA_PAD.replace_all(&close, ", ");
    commas.trim().to_lowercase()
}

async fn user_table_rows(pool: &SqlitePool) -> AppResult<Vec<(String, Option<String>)>> {
    let rows = sqlx::query(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?1 \
         ORDER BY name",
    )
    .bind(TRACKING_TABLE)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        let sql: Option<String> = row.try_get("sql")?;
        out.push((name, sql));
    }
    Ok(out)
}

/// Names of all user tables, excluding SQLite internals and the tracking table.
pub async fn user_tables(pool: &SqlitePool) -> AppResult<Vec<String>> {
    Ok(user_table_rows(pool)
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// Deterministic fingerprint of the current table definitions.
///
/// Normalized `CREATE TABLE` statements are sorted before hashing, so the
/// fingerprint does not depend on physical table-creation order. Diagnostic
/// only; never persisted and never used as a gate.
pub async fn compute_schema_hash(pool: &SqlitePool) -> AppResult<String> {
    let mut statements: Vec<String> = user_table_rows(pool)
        .await?
        .into_iter()
        .filter_map(|(_, sql)| sql)
        .filter(|sql| !sql.is_empty())
        .map(|sql| normalize_create_statement(&sql))
        .collect();

    if statements.is_empty() {
        return Ok(EMPTY_SCHEMA_SENTINEL.to_string());
    }

    statements.sort();

    let digest = Sha256::digest(statements.join("\n").as_bytes());
    Ok(format!("{digest:x}")[..SCHEMA_HASH_LEN].to_string())
}

/// Advisory classification of tracking/schema consistency.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStateReport {
    /// Always `true` today: the verifier reports, it does not block.
    pub is_valid: bool,
    pub needs_bootstrap: bool,
    pub has_schema_conflict: bool,
    pub migration_count: usize,
    pub table_count: usize,
    pub schema_hash: String,
    pub tables: Vec<String>,
    pub applied_migrations: Vec<String>,
    pub warnings: Vec<String>,
}

/// Classifies the database into one of three states:
///
/// 1. no tracked migrations, no user tables: virgin install, bootstrap.
/// 2. no tracked migrations, user tables present: the schema predates
///    tracking. Reported as a conflict but still valid; the tracking table
///    is seeded as migrations re-run idempotently, existing installations
///    are never locked out.
/// 3. tracked migrations present: steady state, informational only.
pub async fn verify_migration_state(pool: &SqlitePool) -> AppResult<MigrationStateReport> {
    let applied: Vec<String> = {
        let mut names: Vec<String> = applied_migrations(pool).await.into_iter().collect();
        names.sort();
        names
    };
    let tables = user_tables(pool).await?;
    let schema_hash = compute_schema_hash(pool).await?;

    let mut report = MigrationStateReport {
        is_valid: true,
        needs_bootstrap: false,
        has_schema_conflict: false,
        migration_count: applied.len(),
        table_count: tables.len(),
        schema_hash,
        tables,
        applied_migrations: applied,
        warnings: Vec::new(),
    };

    if report.migration_count == 0 && report.table_count == 0 {
        report.needs_bootstrap = true;
        report
            .warnings
            .push("first run: all migrations will be applied in order".to_string());
        return Ok(report);
    }

    if report.migration_count == 0 && report.table_count > 0 {
        report.has_schema_conflict = true;
        report.needs_bootstrap = true;

        let sample: Vec<&str> = report.tables.iter().take(5).map(String::as_str).collect();
        let suffix = if report.table_count > 5 { "…" } else { "" };
        report.warnings.push(format!(
            "schema exists but the tracking table is empty ({} tables: {}{})",
            report.table_count,
            sample.join(", "),
            suffix
        ));
        report.warnings.push(format!("schema hash: {}", report.schema_hash));
        report
            .warnings
            .push("the tracking table will be seeded automatically".to_string());
        return Ok(report);
    }

    report.warnings.push(format!(
        "applied migrations: {}, user tables: {}, schema hash: {}",
        report.migration_count, report.table_count, report.schema_hash
    ));

    Ok(report)
}

/// Renders a state report for the console.
pub fn print_state_report(report: &MigrationStateReport) {
    println!("schema state report");
    if report.has_schema_conflict {
        println!("  status: schema/tracking mismatch detected");
    } else if report.needs_bootstrap {
        println!("  status: bootstrap (first run)");
    } else {
        println!("  status: ok");
    }
    for warning in &report.warnings {
        println!("  {warning}");
    }
}
