//! Rich timeout errors with debugging context
//!
//! Every bounded wait in deploytest fails with a [`TimeoutError`] that names
//! the subject being polled and carries the last thing the poll saw: the
//! last value (when the predicate rejected it) or the last supplier error.
//!
//! # Example
//!
//! ```ignore
//! match waiter.until(fetch_phase, |phase| phase == "Running").await {
//!     Err(err) => {
//!         println!("Subject: {}", err.subject);
//!         println!("Attempts: {}", err.attempts);
//!         println!("Last: {:?}", err.last);
//!     }
//!     Ok(_) => {}
//! }
//! ```

use std::fmt;
use std::time::Duration;

/// The last observation made before a wait gave up
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<T> {
    /// Supplier never ran
    Nothing,
    /// Supplier returned a value the predicate rejected
    Value(T),
    /// Supplier failed; the error is kept as text
    Error(String),
}

impl<T> Observation<T> {
    /// The last rejected value, if the last attempt produced one
    pub fn value(&self) -> Option<&T> {
        match self {
            Observation::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Consume the observation, returning the last rejected value
    pub fn into_value(self) -> Option<T> {
        match self {
            Observation::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// A wait deadline elapsed without the condition becoming true
#[derive(Debug, Clone)]
pub struct TimeoutError<T> {
    /// What was being polled (e.g. "deployment/myapp", "watch output")
    pub subject: String,
    /// Description of the unmet condition
    pub condition: String,
    /// The timeout that was configured
    pub timeout: Duration,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// How many times the supplier ran
    pub attempts: u32,
    /// Last value or error seen
    pub last: Observation<T>,
}

impl<T> TimeoutError<T> {
    /// Create a new TimeoutError
    pub fn new(subject: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self {
            subject: subject.into(),
            condition: "condition".to_string(),
            timeout,
            elapsed,
            attempts: 0,
            last: Observation::Nothing,
        }
    }

    /// Set the condition description
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    /// Set the attempt count
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the last observation
    pub fn with_last(mut self, last: Observation<T>) -> Self {
        self.last = last;
        self
    }

    /// Map the carried value, e.g. to drop a large payload before reporting
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TimeoutError<U> {
        TimeoutError {
            subject: self.subject,
            condition: self.condition,
            timeout: self.timeout,
            elapsed: self.elapsed,
            attempts: self.attempts,
            last: match self.last {
                Observation::Nothing => Observation::Nothing,
                Observation::Value(v) => Observation::Value(f(v)),
                Observation::Error(e) => Observation::Error(e),
            },
        }
    }
}

impl<T: fmt::Debug> fmt::Display for TimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}: {} not met", self.subject, self.condition)?;
        match &self.last {
            Observation::Nothing => writeln!(f, "├─ Last state: nothing observed")?,
            Observation::Value(v) => writeln!(f, "├─ Last value: {:?}", v)?,
            Observation::Error(e) => writeln!(f, "├─ Last error: {}", e)?,
        }
        writeln!(f, "├─ Attempts: {}", self.attempts)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        write!(f, "└─ Timeout: {:?}", self.timeout)
    }
}

impl<T: fmt::Debug> std::error::Error for TimeoutError<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_display_with_value() {
        let err = TimeoutError::new("deployment/myapp", Duration::from_secs(60), Duration::from_secs(61))
            .with_condition("2/2 replicas ready")
            .with_attempts(61)
            .with_last(Observation::Value("1/2 ready"));

        let output = err.to_string();
        assert!(output.contains("Wait timeout for deployment/myapp"));
        assert!(output.contains("2/2 replicas ready not met"));
        assert!(output.contains("Last value: \"1/2 ready\""));
        assert!(output.contains("Attempts: 61"));
    }

    #[test]
    fn test_timeout_error_display_with_error() {
        let err: TimeoutError<()> = TimeoutError::new("pod/web", Duration::from_secs(5), Duration::from_secs(5))
            .with_last(Observation::Error("pods \"web\" not found".to_string()));

        assert!(err.to_string().contains("Last error: pods \"web\" not found"));
    }

    #[test]
    fn test_timeout_error_display_nothing_observed() {
        let err: TimeoutError<u32> =
            TimeoutError::new("counter", Duration::from_millis(10), Duration::from_millis(10));
        assert!(err.to_string().contains("nothing observed"));
    }

    #[test]
    fn test_timeout_error_map() {
        let err = TimeoutError::new("log", Duration::from_secs(1), Duration::from_secs(1))
            .with_last(Observation::Value("a long log".to_string()))
            .map(|s| s.len());

        assert_eq!(err.last.value(), Some(&10));
        assert_eq!(err.subject, "log");
    }
}
