use tracing::{error, info};

use crate::config::UpdateConfig;
use crate::error::{AppError, AppResult};
use crate::update::fs_util::{copy_dir_contents, remove_dir_if_present};

/// Restores the live engine from the backup snapshot after a failed update.
///
/// If the backup is absent the failure happened before activation, so only
/// staging needs cleaning. A failure inside this function is the one state
/// software cannot recover from: the error is logged with the backup's
/// on-disk location for manual intervention and re-raised; it is never
/// retried automatically.
pub fn rollback_engine(config: &UpdateConfig) -> AppResult<()> {
    let engine = &config.engine_dir;
    let backup = &config.backup_dir;
    let staging = &config.staging_dir;

    let outcome: AppResult<()> = (|| {
        if backup.exists() {
            copy_dir_contents(backup, engine).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "restore_engine_from_backup")
                    .with_context("from", backup.display().to_string())
                    .with_context("to", engine.display().to_string())
            })?;
            remove_dir_if_present(backup).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "remove_backup")
                    .with_context("path", backup.display().to_string())
            })?;
            info!(target: "dockhand", event = "rollback_engine_restored");
        }

        remove_dir_if_present(staging).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "remove_staging")
                .with_context("path", staging.display().to_string())
        })?;

        Ok(())
    })();

    outcome.map_err(|err| {
        error!(
            target: "dockhand",
            event = "rollback_failed",
            backup = %backup.display(),
            error = %err,
            "rollback failed; manual recovery may be required, the pre-update \
             snapshot is preserved at the backup path"
        );
        AppError::new("UPDATE/ROLLBACK", "Engine rollback failed")
            .with_context("backup", backup.display().to_string())
            .with_cause(err)
    })
}
