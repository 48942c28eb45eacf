use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENGINE_DIR_NAME: &str = "engine";
const STAGING_DIR_NAME: &str = ".engine-staging";
const BACKUP_DIR_NAME: &str = ".engine-backup";
const MIGRATIONS_DIR_NAME: &str = "migrations";
const EXTENSIONS_DIR_NAME: &str = "extensions";

const DEFAULT_MIN_FILE_BYTES: u64 = 100;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const HARD_MAX_FETCH_TIMEOUT_SECS: u64 = 600;

/// Default set of files every valid engine snapshot must contain.
const REQUIRED_ENGINE_FILES: &[&str] = &["fetch.js"];

/// Explicit directory layout and validation thresholds for one update target.
///
/// Every component takes this by reference instead of reaching for global
/// paths, so tests can point the whole engine at a temp directory.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Live, served engine directory.
    pub engine_dir: PathBuf,
    /// Ephemeral staging directory, sibling of the engine.
    pub staging_dir: PathBuf,
    /// Ephemeral rollback backup directory, sibling of the engine.
    pub backup_dir: PathBuf,
    /// Flat directory of numerically prefixed `*.sql` migrations.
    pub migrations_dir: PathBuf,
    /// Directory whose immediate subdirectories may carry a `migration.sql`.
    pub extensions_dir: PathBuf,
    /// Files that must exist in staging before a swap is allowed.
    pub required_files: Vec<String>,
    /// Minimum size for each required file, guards against truncated fetches.
    pub min_file_bytes: u64,
    /// Per-file timeout applied to every source fetch.
    pub fetch_timeout: Duration,
}

impl UpdateConfig {
    /// Standard layout under a single root: `engine/` plus its two ephemeral
    /// siblings, `migrations/` and `extensions/`.
    pub fn for_root(root: &Path) -> Self {
        UpdateConfig {
            engine_dir: root.join(ENGINE_DIR_NAME),
            staging_dir: root.join(STAGING_DIR_NAME),
            backup_dir: root.join(BACKUP_DIR_NAME),
            migrations_dir: root.join(MIGRATIONS_DIR_NAME),
            extensions_dir: root.join(EXTENSIONS_DIR_NAME),
            required_files: REQUIRED_ENGINE_FILES
                .iter()
                .map(|f| f.to_string())
                .collect(),
            min_file_bytes: min_file_bytes_from_env(),
            fetch_timeout: fetch_timeout_from_env(),
        }
    }

    pub fn with_required_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_file_bytes(mut self, bytes: u64) -> Self {
        self.min_file_bytes = bytes;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

fn min_file_bytes_from_env() -> u64 {
    env::var("DOCKHAND_MIN_FILE_BYTES")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MIN_FILE_BYTES)
}

fn fetch_timeout_from_env() -> Duration {
    let secs = env::var("DOCKHAND_FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(|value| value.min(HARD_MAX_FETCH_TIMEOUT_SECS))
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
    Duration::from_secs(secs)
}
