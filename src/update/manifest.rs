use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Delta status of one engine file between the current and target version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
}

/// One entry of the versioned file set driving an update cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFileChange {
    pub status: ChangeStatus,
    pub path: String,
}

impl EngineFileChange {
    pub fn new(status: ChangeStatus, path: impl Into<String>) -> Self {
        EngineFileChange {
            status,
            path: path.into(),
        }
    }
}

/// Reads a JSON file-set manifest from disk.
///
/// A missing or unparsable manifest degrades to an empty change set: the
/// orchestrator treats that as "nothing to update" rather than failing the
/// whole run on a diagnostic-only artifact.
pub fn load_file_set(path: &Path) -> Vec<EngineFileChange> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(
                target: "dockhand",
                event = "manifest_read_failed",
                path = %path.display(),
                error = %error
            );
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<EngineFileChange>>(&raw) {
        Ok(changes) => changes,
        Err(error) => {
            warn!(
                target: "dockhand",
                event = "manifest_parse_failed",
                path = %path.display(),
                error = %error
            );
            Vec::new()
        }
    }
}
