//! Retry and polling loops for eventually-consistent storage.
//!
//! Workers return `Ok(Some(v))` when done, `Ok(None)` when the thing they wait
//! for is not there yet, or `Err(e)`. A stop predicate decides whether an
//! error is fatal (returned unchanged) or just means "not ready".

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::HarnessError;

/// Attempt bound and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_DELAY)
    }
}

/// Why a retry loop ended without a value.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The stop predicate flagged this error as fatal.
    #[error("{0}")]
    Stopped(E),

    /// Every attempt came back empty or with a non-fatal error.
    #[error("not found after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

impl RetryError<HarnessError> {
    /// Flatten into a harness error, naming what was waited for.
    pub fn into_harness_error(self, what: impl Into<String>) -> HarnessError {
        match self {
            Self::Stopped(e) => e,
            Self::Exhausted { attempts } => HarnessError::NotFoundAfterRetries {
                what: what.into(),
                attempts,
            },
        }
    }
}

/// Run `worker` until it yields a value, at most `policy.max_attempts` times.
///
/// Errors for which `stop` returns true end the loop at once; any other error
/// counts as an empty attempt. No delay follows the last attempt.
pub async fn execute_with_retry<T, E, F, Fut, S>(
    policy: &RetryPolicy,
    progress: &str,
    mut worker: F,
    stop: S,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    S: Fn(&E) -> bool,
    E: Display,
{
    let start = Instant::now();
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        attempts += 1;

        match worker().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => debug!(attempt = attempts, "no result yet"),
            Err(e) if stop(&e) => return Err(RetryError::Stopped(e)),
            Err(e) => debug!(attempt = attempts, error = %e, "not ready yet"),
        }

        if attempts < policy.max_attempts {
            tokio::time::sleep(policy.delay).await;
            info!("{} [{} elapsed]", progress, format_elapsed(start.elapsed()));
        }
    }

    Err(RetryError::Exhausted { attempts })
}

/// Poll `worker` every `interval` until it yields a value or `timeout` passes.
///
/// The deadline is checked before each attempt, so a slow worker can overrun
/// it by at most one call.
pub async fn poll_until_deadline<T, E, F, Fut, S>(
    timeout: Duration,
    interval: Duration,
    progress: &str,
    mut worker: F,
    stop: S,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    S: Fn(&E) -> bool,
    E: Display,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0;

    while Instant::now() < deadline {
        attempts += 1;
        info!("{} [{} elapsed]", progress, format_elapsed(start.elapsed()));

        match worker().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if stop(&e) => return Err(RetryError::Stopped(e)),
            Err(e) => debug!(attempt = attempts, error = %e, "polling error, continuing"),
        }

        tokio::time::sleep(interval).await;
    }

    Err(RetryError::Exhausted { attempts })
}

/// `XmYs` once past a minute, `Ys` before.
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let minutes = seconds / 60;
    if minutes > 0 {
        format!("{}m{}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<&str, RetryError<String>> = execute_with_retry(
            &fast(5),
            "waiting",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("done"))
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_invokes_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), RetryError<String>> = execute_with_retry(
            &fast(7),
            "waiting",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("NoSuchKey".to_string())
                }
            },
            |_| false,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 7);
        match result {
            Err(RetryError::Exhausted { attempts }) => assert_eq!(attempts, 7),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_predicate_short_circuits_with_original_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), RetryError<String>> = execute_with_retry(
            &fast(60),
            "waiting",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("AccessDenied".to_string())
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(RetryError::Stopped(e)) => assert_eq!(e, "AccessDenied"),
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recovers_after_not_found() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, RetryError<HarnessError>> = execute_with_retry(
            &fast(10),
            "waiting",
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(HarnessError::ObjectNotFound {
                            bucket: "out".into(),
                            key: "k".into(),
                        })
                    } else {
                        Ok(Some(n))
                    }
                }
            },
            |e| !matches!(e, HarnessError::ObjectNotFound { .. }),
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhausted_maps_to_not_found_after_retries() {
        let err = RetryError::<HarnessError>::Exhausted { attempts: 60 }.into_harness_error("a.csv");
        assert_eq!(err.to_string(), "a.csv not found after 60 attempts");
    }

    #[tokio::test]
    async fn test_poll_until_deadline_times_out() {
        let result: Result<(), RetryError<String>> = poll_until_deadline(
            Duration::from_millis(30),
            Duration::from_millis(5),
            "polling",
            || async { Ok(None) },
            |_| false,
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts }) => assert!(attempts >= 1),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m5s");
    }
}
