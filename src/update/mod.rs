use serde::Serialize;
use tokio::task;
use tracing::{info, warn};

use crate::config::UpdateConfig;
use crate::error::{AppError, AppResult};

mod fs_util;
pub mod manifest;
pub mod recovery;
pub mod rollback;
pub mod staging;
pub mod swap;

pub use manifest::{ChangeStatus, EngineFileChange};
pub use recovery::{recover_from_previous_failure, RecoveryReport};
pub use staging::{GitShowFetcher, SourceFetcher};

/// Final state of one engine update attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Update activated and the backup was cleaned up.
    Success { files_updated: usize },
    /// Update failed but the engine was restored to its pre-update state.
    RolledBack { error: String },
    /// Rollback itself failed. Terminal: the operator must inspect the
    /// backup directory by hand.
    ManualRecoveryRequired {
        error: String,
        rollback_error: String,
        backup_path: String,
    },
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Success { .. })
    }
}

async fn run_blocking<T, F>(op: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    task::spawn_blocking(op).await.map_err(|err| {
        AppError::new("UPDATE/SWAP", "Filesystem task panicked")
            .with_context("error", err.to_string())
    })?
}

async fn attempt_update<F: SourceFetcher + ?Sized>(
    tag: &str,
    changes: &[EngineFileChange],
    fetcher: &F,
    config: &UpdateConfig,
) -> AppResult<()> {
    staging::extract_to_staging(tag, changes, fetcher, config).await?;

    let validate_config = config.clone();
    run_blocking(move || staging::validate_staging(&validate_config)).await?;

    let swap_config = config.clone();
    run_blocking(move || swap::atomic_swap(&swap_config)).await?;

    let backup = config.backup_dir.clone();
    run_blocking(move || {
        fs_util::remove_dir_if_present(&backup).map_err(AppError::from)
    })
    .await?;

    Ok(())
}

/// Sequences one full update cycle: reconcile leftovers, extract, validate,
/// swap, clean up; roll back on any failure past extraction start.
///
/// An empty change set is a successful no-op. Two concurrent invocations on
/// the same root are not guarded against.
pub async fn run_engine_update<F: SourceFetcher + ?Sized>(
    tag: &str,
    changes: &[EngineFileChange],
    fetcher: &F,
    config: &UpdateConfig,
) -> UpdateOutcome {
    let recovery = recover_from_previous_failure(config);
    if recovery.recovered {
        warn!(
            target: "dockhand",
            event = "update_recovered_previous_failure",
            actions = %recovery.actions.join("; ")
        );
    }

    if changes.is_empty() {
        info!(target: "dockhand", event = "update_skipped_empty_file_set", tag);
        return UpdateOutcome::Success { files_updated: 0 };
    }

    info!(
        target: "dockhand",
        event = "update_start",
        tag,
        files = changes.len()
    );

    match attempt_update(tag, changes, fetcher, config).await {
        Ok(()) => {
            info!(
                target: "dockhand",
                event = "update_complete",
                tag,
                files_updated = changes.len()
            );
            UpdateOutcome::Success {
                files_updated: changes.len(),
            }
        }
        Err(error) => {
            warn!(
                target: "dockhand",
                event = "update_failed",
                tag,
                error = %error
            );

            let rollback_config = config.clone();
            let rollback =
                run_blocking(move || rollback::rollback_engine(&rollback_config)).await;

            match rollback {
                Ok(()) => UpdateOutcome::RolledBack {
                    error: error.to_string(),
                },
                Err(rollback_error) => UpdateOutcome::ManualRecoveryRequired {
                    error: error.to_string(),
                    rollback_error: rollback_error.to_string(),
                    backup_path: config.backup_dir.display().to_string(),
                },
            }
        }
    }
}
