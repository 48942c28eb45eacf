use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{AppError, AppResult};

/// SQLite primary result codes that signal lock contention.
const TRANSIENT_SQLITE_CODES: &[&str] = &["Sqlite/5", "Sqlite/6", "Sqlite/261", "Sqlite/262"];

/// Backoff doubling stops here; later attempts reuse the capped delay.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Retry policy for transient storage faults.
///
/// Classification prefers the structured SQLite result code carried on the
/// error; the marker whitelist remains as a fallback for errors that only
/// surface a message (e.g. output captured from a child process).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub transient_markers: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            transient_markers: vec![
                "SQLITE_BUSY".to_string(),
                "SQLITE_LOCKED".to_string(),
                "database is locked".to_string(),
                "database table is locked".to_string(),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn is_transient(&self, error: &AppError) -> bool {
        if TRANSIENT_SQLITE_CODES.contains(&error.code()) {
            return true;
        }
        self.transient_markers
            .iter()
            .any(|marker| error.messages().iter().any(|m| m.contains(marker.as_str())))
    }
}

/// Runs `op` until it succeeds, a non-transient error occurs, or the retry
/// budget is spent. Attempts are strictly sequential; the delay before
/// attempt `n + 1` is `base_delay * 2^n`.
pub async fn execute_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut last_error: Option<AppError> = None;

    for attempt in 1..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let transient = policy.is_transient(&error);

                if transient && attempt < policy.max_retries {
                    let delay = policy
                        .base_delay
                        .saturating_mul(2u32.pow(attempt.min(MAX_BACKOFF_EXPONENT)));
                    warn!(
                        target: "dockhand",
                        event = "storage_busy_retry",
                        attempt,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(error);
                    continue;
                }

                if transient {
                    return Err(AppError::new(
                        "DB/RETRY_EXHAUSTED",
                        format!(
                            "storage still busy after {} attempts: {}",
                            policy.max_retries,
                            error.message()
                        ),
                    )
                    .with_cause(error));
                }

                return Err(error);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| AppError::new("DB/RETRY_EXHAUSTED", "retry budget exhausted")))
}
