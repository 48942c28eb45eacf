use std::fs;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};

pub mod migrate;
pub mod schema;

/// Opens (creating if needed) the embedded SQLite database at `db_path`.
///
/// A single connection is enough here: migrations are applied one at a time
/// and the schema verifier only reads.
pub async fn open_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_db_parent_dir")
                .with_context("path", parent.display().to_string())
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_pool")
                .with_context("path", db_path.display().to_string())
        })
}

/// In-memory pool for tests and dry runs. Pinned to one connection so every
/// query sees the same memory database.
pub async fn open_memory_pool() -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(AppError::from)?
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(AppError::from)
}
