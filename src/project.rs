//! Fixture project driven by the build tool
//!
//! [`BuildProject`] is the suite-shared handle on one fixture project
//! directory. It runs the tool's one-shot tasks, starts long-running ones
//! (watch mode) in the background, and edits sources for hot-reload
//! scenarios. Every background process it started is cancelled when the
//! suite closes it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ProjectConfig;
use crate::inject::{InjectError, Managed};
use crate::invoker::{AsyncInvoker, CancelOutcome, InvokeError, Invocation, ProcessHandle, RunResult};

/// Lines of process output included in failure diagnostics
const DIAGNOSTIC_LINES: usize = 40;

/// Errors from project operations
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("`{tasks}` failed with exit code {code:?}\n{output}")]
    TaskFailed {
        tasks: String,
        code: Option<i32>,
        output: String,
    },

    #[error("failed to edit {path}: {source}")]
    Edit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One fixture project and the processes started for it
pub struct BuildProject {
    name: String,
    dir: PathBuf,
    tool: String,
    env: HashMap<String, String>,
    forward_output: bool,
    build_timeout: Duration,
    invoker: AsyncInvoker,
    started: Mutex<Vec<ProcessHandle>>,
}

impl std::fmt::Debug for BuildProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildProject")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("tool", &self.tool)
            .finish()
    }
}

impl BuildProject {
    /// Resolve the fixture directory without running anything
    pub fn open(config: &ProjectConfig) -> Result<Self, InjectError> {
        config.validate()?;
        let dir = config.project_dir();
        if !dir.is_dir() {
            return Err(InjectError::Build(format!(
                "project directory {} does not exist",
                dir.display()
            )));
        }

        Ok(Self {
            name: config.project.clone(),
            dir,
            tool: config.tool.clone(),
            env: config.env.clone(),
            forward_output: config.forward_output,
            build_timeout: config.timeouts.build,
            invoker: AsyncInvoker::from_config(config),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Invocation of the build tool with `tasks` in the project directory
    pub fn invocation<I, S>(&self, tasks: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(&self.tool)
            .args(tasks)
            .current_dir(&self.dir)
            .envs(&self.env)
            .forward_output(self.forward_output)
    }

    /// Start `tasks` in the background; cancelled when the suite closes
    pub fn start<I, S>(&self, tasks: I) -> Result<ProcessHandle, ProjectError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handle = self.invoker.start(self.invocation(tasks))?;
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        started.retain(|h| !h.state().is_finished());
        started.push(handle.clone());
        Ok(handle)
    }

    /// Run `tasks` to completion, failing on a non-zero exit
    pub async fn run<I, S>(&self, tasks: I) -> Result<RunResult, ProjectError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let invocation = self.invocation(tasks);
        let tasks = invocation.command_line();
        info!(project = %self.name, command = %tasks, "Running build tool");

        let result = self.invoker.run(invocation, self.build_timeout).await?;
        if !result.passed() {
            return Err(ProjectError::TaskFailed {
                tasks,
                code: result.exit_code,
                output: tail(&result.output, DIAGNOSTIC_LINES),
            });
        }
        Ok(result)
    }

    /// Rewrite a file under the project directory
    pub fn edit_file(
        &self,
        relative: impl AsRef<Path>,
        edit: impl FnOnce(String) -> String,
    ) -> Result<(), ProjectError> {
        let path = self.dir.join(relative);
        let content = std::fs::read_to_string(&path).map_err(|source| ProjectError::Edit {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, edit(content)).map_err(|source| ProjectError::Edit {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "Edited project file");
        Ok(())
    }

    /// Handles started through [`start`](Self::start)
    pub fn started(&self) -> Vec<ProcessHandle> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel every background process
    pub async fn cancel_all(&self) -> usize {
        let handles = std::mem::take(&mut *self.started.lock().unwrap_or_else(PoisonError::into_inner));
        let mut cancelled = 0;
        for handle in handles {
            if handle.cancel().await == CancelOutcome::Cancelled {
                cancelled += 1;
            }
        }
        cancelled
    }
}

#[async_trait]
impl Managed for BuildProject {
    async fn build(config: &ProjectConfig) -> Result<Self, InjectError> {
        let project = Self::open(config)?;

        let mut tasks = Vec::new();
        if config.clean {
            tasks.push("clean");
        }
        if config.build {
            tasks.push("build");
        }
        if !tasks.is_empty() {
            project
                .run(tasks)
                .await
                .map_err(|e| InjectError::Build(e.to_string()))?;
        }

        Ok(project)
    }

    async fn close(&self) -> Result<(), InjectError> {
        let cancelled = self.cancel_all().await;
        if cancelled > 0 {
            info!(project = %self.name, cancelled, "Cancelled background processes");
        }
        Ok(())
    }

    fn diagnostics(&self) -> Option<String> {
        let handles = self.started();
        if handles.is_empty() {
            return None;
        }

        let mut report = String::new();
        for handle in handles {
            report.push_str(&format!(
                "--- {} ({:?}) ---\n{}\n",
                handle.command(),
                handle.state(),
                handle.output().tail(DIAGNOSTIC_LINES)
            ));
        }
        Some(report)
    }
}

impl Drop for BuildProject {
    fn drop(&mut self) {
        let running = self
            .started
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.is_running())
            .count();
        if running > 0 {
            // kill_on_drop reaps the direct children
            warn!(project = %self.name, running, "Project dropped with running processes");
        }
    }
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(tool: &str) -> (TempDir, ProjectConfig) {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("app")).unwrap();
        let config = ProjectConfig::new("app")
            .projects_dir(root.path())
            .tool(tool);
        (root, config)
    }

    #[test]
    fn test_open_missing_directory() {
        let root = TempDir::new().unwrap();
        let config = ProjectConfig::new("missing").projects_dir(root.path());

        let err = BuildProject::open(&config).unwrap_err();
        assert!(matches!(err, InjectError::Build(_)));
    }

    #[test]
    fn test_invocation_uses_project_dir_and_env() {
        let (_root, config) = fixture("gradle");
        let config = config.env("CI", "true").forward_output(true);
        let project = BuildProject::open(&config).unwrap();

        let invocation = project.invocation(["k8sWatch"]);
        assert_eq!(invocation.command_line(), "gradle k8sWatch");
        assert_eq!(invocation.working_dir(), Some(project.dir()));
    }

    #[test]
    fn test_edit_file() {
        let (root, config) = fixture("gradle");
        let source = root.path().join("app").join("Main.txt");
        std::fs::write(&source, "Hello World").unwrap();

        let project = BuildProject::open(&config).unwrap();
        project
            .edit_file("Main.txt", |content| content.replace("World", "deploytest"))
            .unwrap();

        assert_eq!(std::fs::read_to_string(&source).unwrap(), "Hello deploytest");
        assert!(matches!(
            project.edit_file("Missing.txt", |c| c),
            Err(ProjectError::Edit { .. })
        ));
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("", 5), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_runs_clean_and_build_tasks() {
        // `echo` stands in for the build tool
        let (_root, config) = fixture("echo");
        let config = config.clean(true).build(true);

        let project = BuildProject::build(&config).await.unwrap();
        let result = project.run(["status"]).await.unwrap();
        assert!(result.output.contains("status"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_fails_on_task_failure() {
        let (_root, config) = fixture("false");
        let config = config.build(true);

        let err = BuildProject::build(&config).await.unwrap_err();
        assert!(matches!(err, InjectError::Build(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_cancels_started_processes() {
        let (_root, config) = fixture("sleep");
        let project = BuildProject::open(&config.grace_period(Duration::from_millis(500))).unwrap();

        let handle = project.start(["30"]).unwrap();
        assert!(handle.is_running());
        assert!(project.diagnostics().is_some());

        project.close().await.unwrap();
        assert!(!handle.is_running());
        assert!(project.started().is_empty());
    }
    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_forgets_finished_processes() {
        let (_root, config) = fixture("echo");
        let project = BuildProject::open(&config).unwrap();

        let first = project.start(["one"]).unwrap();
        first.await_completion(Duration::from_secs(10)).await.unwrap();
        let second = project.start(["two"]).unwrap();

        let started = project.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].command(), second.command());
    }
}
