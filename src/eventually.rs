//! Condition polling for eventually-consistent state
//!
//! A [`Waiter`] repeatedly runs a supplier and checks its value against a
//! predicate until the predicate holds or the timeout elapses. The first
//! satisfying value is returned as-is; nothing is debounced.
//!
//! Supplier errors count as "not yet" and are kept for the timeout report.
//! The interval is a full `tokio::time::sleep`, so a wait may overshoot its
//! timeout by up to one interval but never undershoots it. Dropping the
//! future cancels the wait.
//!
//! # Example
//!
//! ```ignore
//! use deploytest::eventually::{wait, Waiter};
//! use std::time::Duration;
//!
//! // Wait for the watch output to report a redeploy
//! let output = Waiter::new("watch output")
//!     .condition("contains 'Updating resources'")
//!     .timeout(Duration::from_secs(60))
//!     .interval(Duration::from_millis(500))
//!     .until_value(|| async { handle.output().snapshot() }, |out| out.contains("Updating resources"))
//!     .await?;
//!
//! // Or the plain function form
//! let phase = wait(fetch_phase, |p| p == "Running", Duration::from_secs(30), Duration::from_secs(1)).await?;
//! ```

use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::ProjectConfig;
use crate::wait::{Observation, TimeoutError};

/// Polling configuration for one kind of wait
#[derive(Debug, Clone)]
pub struct Waiter {
    subject: String,
    condition: String,
    timeout: Duration,
    interval: Duration,
}

/// Why a poll loop stopped without a satisfying value
#[derive(Debug)]
pub(crate) enum PollFailure<T, E> {
    Timeout(TimeoutError<T>),
    Aborted(E),
}

/// Wait until `predicate` accepts a value produced by `supplier`
///
/// Supplier errors are swallowed until the deadline and then reported as the
/// last observation of the returned [`TimeoutError`].
pub async fn wait<T, E, F, Fut, P>(
    supplier: F,
    predicate: P,
    timeout: Duration,
    interval: Duration,
) -> Result<T, TimeoutError<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: FnMut(&T) -> bool,
{
    Waiter::new("condition")
        .timeout(timeout)
        .interval(interval)
        .until(supplier, predicate)
        .await
}

/// Wait until an async boolean check returns true
///
/// Default timeout: 30 seconds
/// Default interval: 250ms
pub async fn eventually<F, Fut>(condition: F) -> Result<(), TimeoutError<bool>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    Waiter::new("condition")
        .timeout(Duration::from_secs(30))
        .interval(Duration::from_millis(250))
        .until_value(condition, |ok| *ok)
        .await
        .map(|_| ())
}

impl Waiter {
    /// Create a waiter for the named subject
    ///
    /// Default timeout: 60 seconds
    /// Default interval: 1 second
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            condition: "condition".to_string(),
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(1),
        }
    }

    /// Create a waiter using a suite's configured timeouts
    pub fn from_config(subject: impl Into<String>, config: &ProjectConfig) -> Self {
        Self::new(subject)
            .timeout(config.timeouts.wait)
            .interval(config.timeouts.poll_interval)
    }

    /// Describe the condition for timeout reports
    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    /// Set the timeout duration
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the polling interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll a fallible supplier until the predicate accepts its value
    pub async fn until<T, E, F, Fut, P>(
        &self,
        supplier: F,
        predicate: P,
    ) -> Result<T, TimeoutError<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: FnMut(&T) -> bool,
    {
        match self.poll(supplier, predicate, |_| true).await {
            Ok(value) => Ok(value),
            Err(PollFailure::Timeout(err)) => Err(err),
            // every error is retryable here
            Err(PollFailure::Aborted(e)) => Err(self.timeout_error(Duration::ZERO, 0)
                .with_last(Observation::Error(e.to_string()))),
        }
    }

    /// Poll an infallible supplier until the predicate accepts its value
    pub async fn until_value<T, F, Fut, P>(
        &self,
        mut supplier: F,
        predicate: P,
    ) -> Result<T, TimeoutError<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
        P: FnMut(&T) -> bool,
    {
        self.until(
            || {
                let fut = supplier();
                async move { Ok::<T, Infallible>(fut.await) }
            },
            predicate,
        )
        .await
    }

    /// The polling loop shared by condition and resource waits
    ///
    /// Errors for which `retryable` returns false stop the loop immediately.
    pub(crate) async fn poll<T, E, F, Fut, P, R>(
        &self,
        mut supplier: F,
        mut predicate: P,
        retryable: R,
    ) -> Result<T, PollFailure<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: FnMut(&T) -> bool,
        R: Fn(&E) -> bool,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        debug!(
            subject = %self.subject,
            timeout = ?self.timeout,
            interval = ?self.interval,
            "Starting wait"
        );

        loop {
            attempts += 1;

            let last = match supplier().await {
                Ok(value) => {
                    if predicate(&value) {
                        debug!(
                            subject = %self.subject,
                            attempts = attempts,
                            elapsed = ?start.elapsed(),
                            "Condition met"
                        );
                        return Ok(value);
                    }
                    Observation::Value(value)
                }
                Err(e) if retryable(&e) => {
                    debug!(
                        subject = %self.subject,
                        attempts = attempts,
                        error = %e,
                        "Supplier failed, waiting..."
                    );
                    Observation::Error(e.to_string())
                }
                Err(e) => return Err(PollFailure::Aborted(e)),
            };

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                debug!(
                    subject = %self.subject,
                    attempts = attempts,
                    elapsed = ?elapsed,
                    "Wait timed out"
                );
                return Err(PollFailure::Timeout(
                    self.timeout_error(elapsed, attempts).with_last(last),
                ));
            }

            sleep(self.interval).await;
        }
    }

    fn timeout_error<T>(&self, elapsed: Duration, attempts: u32) -> TimeoutError<T> {
        TimeoutError::new(self.subject.clone(), self.timeout, elapsed)
            .with_condition(self.condition.clone())
            .with_attempts(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_succeeds_immediately() {
        let result = wait(
            || async { Ok::<_, Infallible>(7) },
            |v| *v == 7,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_never_true_times_out_within_one_interval() {
        let start = Instant::now();
        let result = wait(
            || async { Ok::<_, Infallible>(0) },
            |v| *v > 0,
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
        .await;
        let elapsed = start.elapsed();

        let err = result.unwrap_err();
        assert!(elapsed >= Duration::from_millis(200), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(250), "elapsed {:?}", elapsed);
        assert_eq!(err.last, Observation::Value(0));
        assert_eq!(err.attempts, 5);
    }

    #[tokio::test]
    async fn test_wait_times_out_in_real_time() {
        let start = std::time::Instant::now();
        let result = wait(
            || async { Ok::<_, Infallible>(0) },
            |v| *v > 0,
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
        .await;

        assert!(result.is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_first_satisfying_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let sequence = [0, 0, 1, 2];

        let supplier_calls = calls.clone();
        let result = wait(
            move || {
                let n = supplier_calls.fetch_add(1, Ordering::SeqCst) as usize;
                let value = sequence[n.min(sequence.len() - 1)];
                async move { Ok::<_, Infallible>(value) }
            },
            |v| *v == 1,
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "stops at the third call");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_keeps_polling_on_false_values() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        // a value that exists but fails the predicate is "keep polling"
        let result = Waiter::new("flag")
            .timeout(Duration::from_secs(1))
            .interval(Duration::from_millis(10))
            .until_value(
                move || {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    async move { n >= 4 }
                },
                |ready| *ready,
            )
            .await;

        assert!(result.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplier_errors_are_swallowed_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = Waiter::new("configmap/app")
            .timeout(Duration::from_secs(1))
            .interval(Duration::from_millis(10))
            .until(
                move || {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("not found")
                        } else {
                            Ok("created")
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), "created");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_error() {
        let err = Waiter::new("pod/web")
            .condition("phase Running")
            .timeout(Duration::from_millis(50))
            .interval(Duration::from_millis(10))
            .until(|| async { Err::<u8, _>("pods \"web\" not found") }, |_| true)
            .await
            .unwrap_err();

        assert_eq!(err.subject, "pod/web");
        assert_eq!(err.condition, "phase Running");
        assert_eq!(err.last, Observation::Error("pods \"web\" not found".to_string()));
        assert!(err.to_string().contains("phase Running not met"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_aborts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = Waiter::new("secret/creds")
            .timeout(Duration::from_secs(10))
            .interval(Duration::from_millis(10))
            .poll(
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err::<u8, _>("forbidden") }
                },
                |_| true,
                |e: &&str| *e != "forbidden",
            )
            .await;

        assert!(matches!(result, Err(PollFailure::Aborted("forbidden"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_succeeds_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = eventually(move || {
            let c = c.clone();
            async move { c.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_waiter_defaults_and_config() {
        let waiter = Waiter::new("x");
        assert_eq!(waiter.timeout, Duration::from_secs(60));
        assert_eq!(waiter.interval, Duration::from_secs(1));

        let config = ProjectConfig::new("app")
            .wait_timeout(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(100));
        let waiter = Waiter::from_config("x", &config);
        assert_eq!(waiter.timeout, Duration::from_secs(5));
        assert_eq!(waiter.interval, Duration::from_millis(100));
    }
}
