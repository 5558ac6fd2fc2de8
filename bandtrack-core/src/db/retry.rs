//! Database Retry Logic
//!
//! Exponential backoff for transient "database is locked" errors. The total
//! budget comes from the `database_max_lock_wait_ms` setting.

use crate::{Error, Result};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};

/// Fallback when the setting is missing or unreadable
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Read the retry budget from `app_settings`
pub async fn max_lock_wait_ms(pool: &SqlitePool) -> u64 {
    let value: Option<i64> = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM app_settings WHERE key = 'database_max_lock_wait_ms'",
    )
    .fetch_optional(pool)
    .await
    .ok()
    .flatten();

    match value {
        Some(ms) if ms > 0 => ms as u64,
        _ => DEFAULT_MAX_LOCK_WAIT_MS,
    }
}

/// Retry a database operation with exponential backoff until max_wait_ms elapses.
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If "database is locked" error:
///    a. If time elapsed < max_wait_ms: log WARN, backoff, retry
///    b. If time elapsed >= max_wait_ms: log ERROR, return `Internal`
/// 4. If other error: return error immediately (no retry)
///
/// Backoff starts at 10ms and doubles up to 1000ms.
///
/// The operation must open and commit its own transaction so that each
/// attempt starts from a fresh snapshot.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        if attempt > 1 {
            tracing::debug!(
                operation = operation_name,
                attempt,
                "Retrying database operation"
            );
        }

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis();
                    if elapsed_ms > 2000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = elapsed_ms,
                            "Database operation succeeded after significant retry period (>2s)"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = elapsed_ms,
                            "Database operation succeeded after retry"
                        );
                    }
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_database_locked() {
                    return Err(err);
                }

                let elapsed = start_time.elapsed();

                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis(),
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(Error::Internal(format!(
                        "Database locked after {} attempts ({} ms elapsed, max {} ms)",
                        attempt,
                        elapsed.as_millis(),
                        max_wait_ms
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = elapsed.as_millis(),
                    backoff_ms,
                    remaining_ms = max_duration.saturating_sub(elapsed).as_millis(),
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_on_lock("test op", 1000, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_lock_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_lock("test op", 1000, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Forbidden("nope".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::Forbidden(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_budget_without_settings_table() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        assert_eq!(max_lock_wait_ms(&pool).await, DEFAULT_MAX_LOCK_WAIT_MS);
    }
}
