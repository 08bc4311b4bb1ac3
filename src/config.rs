//! Configuration types for deploytest
//!
//! A `ProjectConfig` describes which fixture project a suite drives and how
//! the shared objects for that suite are constructed. Build it
//! programmatically (or let `#[deploytest::test(...)]` build it for you) -
//! no config files needed.
//!
//! # Example
//!
//! ```
//! use deploytest::config::ProjectConfig;
//! use std::time::Duration;
//!
//! let config = ProjectConfig::new("zero-config")
//!     .forward_output(true)
//!     .clean(true)
//!     .build(true)
//!     .wait_timeout(Duration::from_secs(120));
//!
//! assert!(config.validate().is_ok());
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Forces output forwarding when set to a truthy value
pub const ENV_FORWARD_OUTPUT: &str = "DEPLOYTEST_FORWARD_OUTPUT";
/// Overrides the default wait timeout (whole seconds)
pub const ENV_TIMEOUT_SECS: &str = "DEPLOYTEST_TIMEOUT_SECS";
/// Root directory containing fixture projects
pub const ENV_PROJECTS_DIR: &str = "DEPLOYTEST_PROJECTS_DIR";
/// Build tool executable used by `BuildProject`
pub const ENV_TOOL: &str = "DEPLOYTEST_TOOL";
/// File the global `ReportSink` appends to
pub const ENV_REPORT: &str = "DEPLOYTEST_REPORT";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("no project configured: declare `project = \"...\"` on the suite")]
    MissingProject,

    #[error("invalid duration for {field}: {reason}")]
    InvalidDuration { field: &'static str, reason: String },
}

/// Timeouts used by the waiters and the invoker
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    /// Default deadline for condition/resource waits
    pub wait: Duration,
    /// Default polling interval for condition/resource waits
    pub poll_interval: Duration,
    /// How long a cancelled process gets between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// Deadline for one-shot build invocations
    pub build: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            build: Duration::from_secs(600),
        }
    }
}

/// Suite configuration
///
/// Recognized declarative fields are `project`, `forward_output`, `clean`
/// and `build`. The remaining fields have defaults and are set through the
/// builder methods.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectConfig {
    /// Fixture project (build module) the suite drives
    pub project: String,

    /// Forward captured process output to the log
    pub forward_output: bool,

    /// Run the tool's clean step when the suite starts
    pub clean: bool,

    /// Run the tool's build step when the suite starts
    pub build: bool,

    /// Kubernetes namespace override (defaults to the client's namespace)
    pub namespace: Option<String>,

    /// Extra environment for every process started on behalf of the suite
    pub env: HashMap<String, String>,

    /// Root directory holding fixture projects
    pub projects_dir: PathBuf,

    /// Build tool executable
    pub tool: String,

    /// Timeouts
    pub timeouts: Timeouts,
}

impl ProjectConfig {
    /// Create a config for the given fixture project
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            forward_output: false,
            clean: false,
            build: false,
            namespace: None,
            env: HashMap::new(),
            projects_dir: PathBuf::from("projects"),
            tool: "gradle".to_string(),
            timeouts: Timeouts::default(),
        }
    }

    /// Forward captured process output to the log
    pub fn forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    /// Run the clean step at suite start
    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// Run the build step at suite start
    pub fn build(mut self, build: bool) -> Self {
        self.build = build;
        self
    }

    /// Set the Kubernetes namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Add an environment variable for spawned processes
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the fixture projects root
    pub fn projects_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.projects_dir = dir.into();
        self
    }

    /// Set the build tool executable
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Set the default wait timeout
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.wait = timeout;
        self
    }

    /// Set the default polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.timeouts.poll_interval = interval;
        self
    }

    /// Set the cancellation grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.timeouts.grace_period = grace;
        self
    }

    /// Set the one-shot build timeout
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.build = timeout;
        self
    }

    /// Directory of this suite's fixture project
    pub fn project_dir(&self) -> PathBuf {
        self.projects_dir.join(&self.project)
    }

    /// Apply `DEPLOYTEST_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup(ENV_FORWARD_OUTPUT).is_some_and(|v| is_truthy(&v)) {
            self.forward_output = true;
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.timeouts.wait = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup(ENV_PROJECTS_DIR).filter(|v| !v.trim().is_empty()) {
            self.projects_dir = PathBuf::from(dir);
        }
        if let Some(tool) = lookup(ENV_TOOL).filter(|v| !v.trim().is_empty()) {
            self.tool = tool;
        }
        self
    }

    /// Check that the config carries everything needed to build shared objects
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::MissingProject);
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "poll_interval",
                reason: "must be positive".to_string(),
            });
        }
        if self.timeouts.poll_interval > self.timeouts.wait {
            return Err(ConfigError::InvalidDuration {
                field: "poll_interval",
                reason: format!(
                    "{:?} exceeds wait timeout {:?}",
                    self.timeouts.poll_interval, self.timeouts.wait
                ),
            });
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
