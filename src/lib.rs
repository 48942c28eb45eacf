//! Single-host atomic update and migration engine.
//!
//! Updates a running application's engine files in place (staging, backup,
//! swap, rollback) and advances its embedded SQLite schema through ordered,
//! idempotent migration files. Built to survive a crash at any point of an
//! update: the recovery reconciler repairs leftover state before the next
//! attempt.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod retry;
pub mod update;

pub use config::UpdateConfig;
pub use error::{AppError, AppResult};
pub use retry::RetryPolicy;
pub use update::{run_engine_update, SourceFetcher, UpdateOutcome};
