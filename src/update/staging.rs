use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::config::UpdateConfig;
use crate::error::{AppError, AppResult};
use crate::update::fs_util::remove_dir_if_present;
use crate::update::manifest::{ChangeStatus, EngineFileChange};

/// Marker file in staging that carries deletions deferred to the swap phase.
pub const DELETE_LIST_FILE: &str = ".delete-list";

/// Opaque source of versioned file content. The core never assumes which
/// version-control mechanism backs a tag.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, tag: &str, path: &str) -> AppResult<Vec<u8>>;
}

/// Fetches file content out of a local git repository via `git show`.
pub struct GitShowFetcher {
    repo_dir: PathBuf,
}

impl GitShowFetcher {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        GitShowFetcher {
            repo_dir: repo_dir.into(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GitShowFetcher {
    async fn fetch(&self, tag: &str, path: &str) -> AppResult<Vec<u8>> {
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .arg("show")
            .arg(format!("{tag}:{path}"))
            .output()
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "spawn_git_show")
                    .with_context("path", path.to_string())
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(AppError::new("FETCH/GIT", stderr)
                .with_context("tag", tag.to_string())
                .with_context("path", path.to_string()));
        }

        Ok(output.stdout)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StagingSummary {
    pub extracted: usize,
    pub deletions: usize,
}

fn basename(path: &str) -> AppResult<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            AppError::new("UPDATE/EXTRACTION", "Change entry has no file name")
                .with_context("path", path.to_string())
        })
}

/// Pulls the target version's files into a freshly recreated staging
/// directory. Files land under staging by basename only; nested source paths
/// collapse. `Deleted` entries are not fetched, they are recorded in the
/// `.delete-list` marker for the swap phase.
///
/// Any single fetch failure aborts the whole extraction; staging is not yet
/// live, so aborting here is always safe.
pub async fn extract_to_staging<F: SourceFetcher + ?Sized>(
    tag: &str,
    changes: &[EngineFileChange],
    fetcher: &F,
    config: &UpdateConfig,
) -> AppResult<StagingSummary> {
    let staging = &config.staging_dir;

    remove_dir_if_present(staging)?;
    fs::create_dir_all(staging)?;

    let mut extracted = 0usize;
    let mut deleted: Vec<String> = Vec::new();

    for change in changes {
        let file_name = basename(&change.path)?;

        if change.status == ChangeStatus::Deleted {
            deleted.push(file_name);
            continue;
        }

        let fetch = fetcher.fetch(tag, &change.path);
        let content = match tokio::time::timeout(config.fetch_timeout, fetch).await {
            Ok(result) => result.map_err(|err| {
                AppError::new(
                    "UPDATE/EXTRACTION",
                    format!("failed to extract {}", change.path),
                )
                .with_context("tag", tag.to_string())
                .with_cause(err)
            })?,
            Err(_) => {
                return Err(AppError::new(
                    "FETCH/TIMEOUT",
                    format!("connection timed out fetching {}", change.path),
                )
                .with_context("tag", tag.to_string())
                .with_context("timeout_ms", config.fetch_timeout.as_millis().to_string()));
            }
        };

        fs::write(staging.join(&file_name), &content).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_staged_file")
                .with_context("file", file_name.clone())
        })?;
        extracted += 1;
    }

    if !deleted.is_empty() {
        fs::write(staging.join(DELETE_LIST_FILE), deleted.join("\n")).map_err(|err| {
            AppError::from(err).with_context("operation", "write_delete_list")
        })?;
    }

    info!(
        target: "dockhand",
        event = "staging_extracted",
        tag,
        extracted,
        deletions = deleted.len()
    );

    Ok(StagingSummary {
        extracted,
        deletions: deleted.len(),
    })
}

/// Checks staging for every required file and for minimum file sizes.
///
/// All violations are collected before failing so the operator sees the full
/// list in one error, not one name per attempt.
pub fn validate_staging(config: &UpdateConfig) -> AppResult<()> {
    let staging = &config.staging_dir;
    let mut violations: Vec<String> = Vec::new();

    for required in &config.required_files {
        let path = staging.join(required);
        if !path.exists() {
            violations.push(format!("missing required file: {required}"));
            continue;
        }

        let size = fs::metadata(&path)?.len();
        if size < config.min_file_bytes {
            violations.push(format!(
                "file too small: {required} ({size} bytes, minimum {})",
                config.min_file_bytes
            ));
        }
    }

    if !violations.is_empty() {
        return Err(AppError::new(
            "UPDATE/VALIDATION",
            format!("staging validation failed: {}", violations.join("; ")),
        )
        .with_context("staging", staging.display().to_string()));
    }

    info!(target: "dockhand", event = "staging_validated");
    Ok(())
}
