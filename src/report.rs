//! Pass/fail log
//!
//! A [`ReportSink`] appends one line per finished test to a text file:
//!
//! ```text
//! 2026-10-16T09:12:44.117+00:00 PASS watch_redeploys_on_change
//! 2026-10-16T09:13:02.540+00:00 FAIL service_has_endpoint
//! ```
//!
//! The global sink is enabled by setting `DEPLOYTEST_REPORT` to a path.

use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, warn};

use crate::config::ENV_REPORT;

/// Errors from the report file
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to open report {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only pass/fail file
#[derive(Debug)]
pub struct ReportSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReportSink {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ReportError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The sink named by `DEPLOYTEST_REPORT`, if set and openable
    pub fn global() -> Option<&'static ReportSink> {
        static GLOBAL: OnceLock<Option<ReportSink>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let path = std::env::var_os(ENV_REPORT)?;
                match ReportSink::open(&path) {
                    Ok(sink) => Some(sink),
                    Err(e) => {
                        warn!(error = %e, "Report disabled");
                        None
                    }
                }
            })
            .as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line for `test`
    pub fn record(&self, test: &str, outcome: Outcome) -> Result<(), ReportError> {
        let line = format!(
            "{} {} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false),
            outcome,
            test
        );

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| ReportError::Write {
                path: self.path.clone(),
                source,
            })?;

        debug!(test = %test, outcome = %outcome, "Recorded test result");
        Ok(())
    }
}

/// Record in the global sink, if one is configured
pub fn record(test: &str, outcome: Outcome) {
    if let Some(sink) = ReportSink::global() {
        if let Err(e) = sink.record(test, outcome) {
            warn!(error = %e, "Failed to record test result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Pass.to_string(), "PASS");
        assert_eq!(Outcome::Fail.to_string(), "FAIL");
    }

    #[test]
    fn test_open_missing_parent_fails() {
        let err = ReportSink::open("/definitely/not/here/report.txt").unwrap_err();
        assert!(matches!(err, ReportError::Open { .. }));
    }
}
