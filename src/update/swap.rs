use std::fs;
use std::path::Path;

use fs2::available_space;
use tracing::info;

use crate::config::UpdateConfig;
use crate::error::{AppError, AppResult};
use crate::update::fs_util::{copy_dir_contents, dir_size, remove_dir_if_present};
use crate::update::staging::DELETE_LIST_FILE;

/// Headroom multiplier applied to the engine size before the backup copy.
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;

fn read_delete_list(staging: &Path) -> AppResult<Vec<String>> {
    let marker = staging.join(DELETE_LIST_FILE);
    if !marker.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(&marker).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_delete_list")
            .with_context("path", marker.display().to_string())
    })?;
    fs::remove_file(&marker).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_delete_list")
            .with_context("path", marker.display().to_string())
    })?;

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn ensure_free_space(engine: &Path) -> AppResult<()> {
    let engine_bytes = dir_size(engine).unwrap_or(0);
    let required = (engine_bytes as f64 * REQUIRED_FREE_MULTIPLIER) as u64;
    let available = available_space(engine).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", engine.display().to_string())
    })?;

    if available < required {
        return Err(AppError::new(
            "UPDATE/SWAP",
            "Not enough free disk space for the pre-update backup",
        )
        .with_context("required_bytes", required.to_string())
        .with_context("available_bytes", available.to_string()));
    }

    Ok(())
}

/// Activates staging over the live engine directory.
///
/// This is a multi-step copy protocol, not an OS-level transaction: safety
/// comes from the step ordering (backup before overwrite, staging deleted
/// last) plus the rollback handler. Files are copied rather than renamed so
/// long-lived processes holding open handles into the engine directory keep
/// serving old content file-by-file instead of losing the directory under
/// their feet.
pub fn atomic_swap(config: &UpdateConfig) -> AppResult<()> {
    let engine = &config.engine_dir;
    let staging = &config.staging_dir;
    let backup = &config.backup_dir;

    fs::create_dir_all(engine).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "ensure_engine_dir")
            .with_context("path", engine.display().to_string())
    })?;

    // Reconciliation should have removed any prior backup already.
    remove_dir_if_present(backup).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_existing_backup")
            .with_context("path", backup.display().to_string())
    })?;

    let files_to_delete = read_delete_list(staging)?;

    ensure_free_space(engine)?;

    copy_dir_contents(engine, backup).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "backup_engine")
            .with_context("from", engine.display().to_string())
            .with_context("to", backup.display().to_string())
    })?;

    copy_dir_contents(staging, engine).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "activate_staging")
            .with_context("from", staging.display().to_string())
            .with_context("to", engine.display().to_string())
    })?;

    for file in &files_to_delete {
        let target = engine.join(file);
        if target.exists() {
            fs::remove_file(&target).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "apply_deletion")
                    .with_context("path", target.display().to_string())
            })?;
        }
    }

    remove_dir_if_present(staging).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_consumed_staging")
            .with_context("path", staging.display().to_string())
    })?;

    info!(
        target: "dockhand",
        event = "swap_complete",
        deletions = files_to_delete.len()
    );
    Ok(())
}
