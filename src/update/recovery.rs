use std::fs;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::UpdateConfig;
use crate::error::AppResult;
use crate::update::fs_util::{dir_has_entries, remove_dir_if_present};

/// Outcome of a reconciliation pass over the engine/staging/backup triple.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub recovered: bool,
    pub actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Repairs leftover state from a previous crashed update.
///
/// Runs before any new update. Decision table:
/// - backup present and engine missing/empty: move backup into the engine
///   position and report `recovered`.
/// - staging present: delete it; staging is always re-derivable from source.
/// - backup present and engine healthy: the prior update already activated,
///   the backup is stale; delete it.
///
/// Unexpected I/O errors are captured into the report instead of propagated
/// so that later steps can still report their own state.
pub fn recover_from_previous_failure(config: &UpdateConfig) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let outcome: AppResult<()> = (|| {
        let staging = &config.staging_dir;
        let backup = &config.backup_dir;
        let engine = &config.engine_dir;

        let has_staging = staging.exists();
        let has_backup = backup.exists();
        let has_engine = engine.exists();
        let engine_has_files = has_engine && dir_has_entries(engine)?;

        if has_backup && !engine_has_files {
            info!(
                target: "dockhand",
                event = "recovery_restore_from_backup",
                backup = %backup.display(),
                engine = %engine.display()
            );
            if has_engine {
                fs::remove_dir_all(engine)?;
            }
            fs::rename(backup, engine)?;
            report.recovered = true;
            report
                .actions
                .push("restored engine from backup".to_string());
        }

        if has_staging {
            remove_dir_if_present(staging)?;
            report
                .actions
                .push("removed stale staging directory".to_string());
        }

        if has_backup && engine_has_files {
            remove_dir_if_present(backup)?;
            report
                .actions
                .push("removed stale backup directory".to_string());
        }

        Ok(())
    })();

    if let Err(error) = outcome {
        warn!(
            target: "dockhand",
            event = "recovery_failed",
            error = %error
        );
        report.error = Some(error.to_string());
    }

    if !report.actions.is_empty() {
        info!(
            target: "dockhand",
            event = "recovery_complete",
            recovered = report.recovered,
            actions = %report.actions.join("; ")
        );
    }

    report
}
