//! Logging for deploytest
//!
//! Plain tracing-based logging to stderr. Process output forwarded by the
//! invoker uses the `deploytest::output` target, so it can be filtered on
//! its own, e.g. `RUST_LOG=info,deploytest::output=off`.
//!
//! # Example
//!
//! ```no_run
//! use deploytest::telemetry::init_logging;
//!
//! init_logging();
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Target used when forwarding captured process output
pub const OUTPUT_TARGET: &str = "deploytest::output";

/// Initialize logging with tracing-subscriber
///
/// Uses RUST_LOG env var for filtering (default: info). Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        tracing::info!(target: OUTPUT_TARGET, "forwarded line");
    }
}
