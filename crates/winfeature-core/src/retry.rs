//! Retry policy engine
//!
//! Runs a fallible operation over and over with a fixed delay until it
//! succeeds, the caller cancels, the attempt budget runs out or the start
//! timeout elapses. Attempts are strictly sequential.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors that know whether trying again could help
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// How a caller wants a fallible operation retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between a failed attempt and the next one
    pub retry_delay: Duration,
    /// Wall-clock budget measured from the first attempt, `None` for unbounded
    pub start_timeout: Option<Duration>,
    /// Maximum number of attempts, `None` for unbounded
    pub max_tries: Option<u32>,
}

impl RetryPolicy {
    /// Retry until `start_timeout` has elapsed since the first attempt
    #[must_use]
    pub const fn with_start_timeout(retry_delay: Duration, start_timeout: Duration) -> Self {
        Self {
            retry_delay,
            start_timeout: Some(start_timeout),
            max_tries: None,
        }
    }

    /// Make at most `tries` attempts (at least one)
    #[must_use]
    pub const fn with_max_tries(retry_delay: Duration, tries: u32) -> Self {
        Self {
            retry_delay,
            start_timeout: None,
            max_tries: Some(if tries == 0 { 1 } else { tries }),
        }
    }

    /// Retry until success or cancellation
    #[must_use]
    pub const fn unbounded(retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            start_timeout: None,
            max_tries: None,
        }
    }

    /// Run `op` under this policy.
    ///
    /// `op` receives the 1-based attempt number. Both the running attempt and
    /// the delay between attempts are abandoned as soon as `cancel` fires or
    /// the start timeout passes.
    ///
    /// # Errors
    /// Returns the reason retrying stopped; see [`RetryError`].
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let start = Instant::now();
        let deadline = self.start_timeout.map(|timeout| start + timeout);
        let mut attempts = 0;
        let mut last = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts, last });
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(RetryError::TimedOut {
                    elapsed: start.elapsed(),
                    attempts,
                    last,
                });
            }

            attempts += 1;
            let attempt = op(attempts);
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts, last });
                }
                () = wait_for(deadline) => {
                    return Err(RetryError::TimedOut {
                        elapsed: start.elapsed(),
                        attempts,
                        last,
                    });
                }
                result = attempt => result,
            };

            let err = match result {
                Ok(value) => {
                    debug!(attempts, elapsed = ?start.elapsed(), "operation succeeded");
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(RetryError::Aborted(err)),
                Err(err) => err,
            };

            if self.max_tries.is_some_and(|max| attempts >= max) {
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            }

            warn!(
                attempt = attempts,
                error = %err,
                delay = ?self.retry_delay,
                "retryable error"
            );
            last = Some(err);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts, last });
                }
                () = wait_for(deadline) => {
                    return Err(RetryError::TimedOut {
                        elapsed: start.elapsed(),
                        attempts,
                        last,
                    });
                }
                () = sleep(self.retry_delay) => {}
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Why [`RetryPolicy::run`] stopped without a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The cancellation token fired
    Cancelled { attempts: u32, last: Option<E> },
    /// The start timeout elapsed
    TimedOut {
        elapsed: Duration,
        attempts: u32,
        last: Option<E>,
    },
    /// Every allowed attempt failed
    Exhausted { attempts: u32, last: E },
    /// The operation failed with an error that is not worth retrying
    Aborted(E),
}

impl<E> RetryError<E> {
    /// Number of attempts started before giving up
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryError::Cancelled { attempts, .. }
            | RetryError::TimedOut { attempts, .. }
            | RetryError::Exhausted { attempts, .. } => Some(*attempts),
            RetryError::Aborted(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled { attempts, .. } => {
                write!(f, "cancelled after {attempts} attempts")
            }
            RetryError::TimedOut {
                elapsed,
                attempts,
                last,
            } => {
                write!(f, "timed out after {elapsed:?} ({attempts} attempts)")?;
                if let Some(last) = last {
                    write!(f, ": {last}")?;
                }
                Ok(())
            }
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Aborted(e) => e.fmt(f),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        Transient(u32),
        Fatal,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient(_))
        }
    }

    const DELAY: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures() {
        let token = CancellationToken::new();
        let mut calls = 0;

        let result = RetryPolicy::with_max_tries(DELAY, 5)
            .run(&token, |attempt| {
                calls += 1;
                async move {
                    if attempt <= 3 {
                        Err(TestError::Transient(attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_is_immediate() {
        let token = CancellationToken::new();
        let start = Instant::now();

        let result: Result<(), RetryError<TestError>> = RetryPolicy::unbounded(DELAY)
            .run(&token, |_| async { Ok(()) })
            .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_exhausted() {
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: Result<(), _> = RetryPolicy::with_max_tries(DELAY, 5)
            .run(&token, |attempt| {
                calls += 1;
                async move { Err(TestError::Transient(attempt)) }
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 5,
                last: TestError::Transient(5)
            })
        );
        assert_eq!(calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_bounds_elapsed_time() {
        let token = CancellationToken::new();
        let timeout = Duration::from_secs(30);
        let start = Instant::now();
        let mut calls = 0;

        let result: Result<(), _> = RetryPolicy::with_start_timeout(DELAY, timeout)
            .run(&token, |attempt| {
                calls += 1;
                async move { Err(TestError::Transient(attempt)) }
            })
            .await;

        let Err(RetryError::TimedOut { attempts, last, .. }) = result else {
            panic!("expected timeout, got {result:?}");
        };
        assert_eq!(attempts, calls);
        assert_eq!(last, Some(TestError::Transient(calls)));
        assert!(start.elapsed() <= timeout + DELAY);
        assert!(calls <= 7, "too many attempts: {calls}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_is_cut_off_by_start_timeout() {
        let token = CancellationToken::new();
        let timeout = Duration::from_secs(60);
        let start = Instant::now();

        let result: Result<(), RetryError<TestError>> =
            RetryPolicy::with_start_timeout(DELAY, timeout)
                .run(&token, |_| std::future::pending())
                .await;

        assert!(matches!(
            result,
            Err(RetryError::TimedOut {
                attempts: 1,
                last: None,
                ..
            })
        ));
        assert!(start.elapsed() >= timeout);
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_aborts() {
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: Result<(), _> = RetryPolicy::unbounded(DELAY)
            .run(&token, |_| {
                calls += 1;
                async { Err(TestError::Fatal) }
            })
            .await;

        assert_eq!(result, Err(RetryError::Aborted(TestError::Fatal)));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay_skips_remaining_sleep() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let counter = calls.clone();
        let result: Result<(), _> = RetryPolicy::unbounded(Duration::from_secs(600))
            .run(&token, move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(TestError::Transient(attempt)) }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Cancelled { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_raised_inside_attempt_stops_retrying() {
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: Result<(), _> = RetryPolicy::unbounded(DELAY)
            .run(&token, |attempt| {
                calls += 1;
                if attempt == 2 {
                    token.cancel();
                }
                async move { Err(TestError::Transient(attempt)) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_already_cancelled_runs_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let mut calls = 0;

        let result: Result<(), RetryError<TestError>> = RetryPolicy::unbounded(DELAY)
            .run(&token, |_| {
                calls += 1;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Cancelled { attempts: 0, .. })
        ));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_zero_tries_means_one() {
        assert_eq!(RetryPolicy::with_max_tries(DELAY, 0).max_tries, Some(1));
    }
}
