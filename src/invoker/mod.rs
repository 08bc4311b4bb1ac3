//! Background process invocation
//!
//! [`AsyncInvoker::start`] launches an external command (typically the build
//! tool in watch mode) without blocking the caller and hands back a
//! [`ProcessHandle`]. A collector task merges stdout and stderr into the
//! handle's [`OutputBuffer`], which tests read while the process runs, usually
//! through a `Waiter`.
//!
//! Cancellation signals the process group, waits a grace period, then kills
//! it. `cancel` is idempotent and bounded: teardown never hangs on a process
//! that refuses to die.
//!
//! Must be used from within a tokio runtime.
//!
//! # Example
//!
//! ```ignore
//! let invoker = AsyncInvoker::new();
//! let watch = invoker.start(
//!     Invocation::new("gradle").args(["k8sWatch", "--console=plain"]).current_dir("projects/zero-config"),
//! )?;
//!
//! Waiter::new("watch output")
//!     .until_value(|| async { watch.output().snapshot() }, |out| out.contains("Watching for changes"))
//!     .await?;
//!
//! // ... edit a source file, wait for the redeploy ...
//!
//! watch.cancel().await;
//! ```

mod kill;
pub mod output;

pub use output::OutputBuffer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::ProjectConfig;
use crate::telemetry::OUTPUT_TARGET;
use kill::{kill_group, terminate_tree};
use output::Utf8Decoder;

/// How long pipes may stay open after the process itself exited
const DRAIN_WAIT: Duration = Duration::from_secs(2);

/// Slack on top of the grace period before `cancel` stops waiting
const CANCEL_SLACK: Duration = Duration::from_secs(7);

/// Errors from process invocation
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("working directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("empty command")]
    EmptyCommand,

    #[error("`{command}` did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{0}` was cancelled")]
    Cancelled(String),
}

/// An external command to run
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    forward_output: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: HashMap::new(),
            forward_output: false,
        }
    }

    /// Build from an argv-style vector; the first element is the program
    pub fn from_argv<I, S>(argv: I) -> Result<Self, InvokeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next().ok_or(InvokeError::EmptyCommand)?;
        Ok(Self::new(program).args(argv))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Also log every output line under the `deploytest::output` target
    pub fn forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// The command as a single display string
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Lifecycle of a started process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited on its own; `code` is None when a signal ended it
    Exited { code: Option<i32> },
    Cancelled,
}

impl ProcessState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

/// What a `cancel` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// This call terminated the process
    Cancelled,
    /// The process had already exited on its own
    AlreadyFinished,
    /// An earlier call cancelled it
    AlreadyCancelled,
}

/// Result of a one-shot invocation
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

struct Shared {
    command: String,
    pid: Option<u32>,
    output: OutputBuffer,
    state_rx: watch::Receiver<ProcessState>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    cancelled: AtomicBool,
    grace: Duration,
}

/// Handle to one started process
///
/// Clones share the same process. Dropping every clone cancels it.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.shared.command)
            .field("pid", &self.shared.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessHandle {
    pub fn command(&self) -> &str {
        &self.shared.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    /// Live output of the process
    pub fn output(&self) -> &OutputBuffer {
        &self.shared.output
    }

    pub fn state(&self) -> ProcessState {
        let state = self.shared.state_rx.borrow().clone();
        if state == ProcessState::Running && self.shared.cancelled.load(Ordering::SeqCst) {
            return ProcessState::Cancelled;
        }
        state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Exit code if the process already exited on its own
    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            ProcessState::Exited { code } => code,
            _ => None,
        }
    }

    /// Terminate the process tree
    ///
    /// Safe to call any number of times and after natural completion.
    /// Returns within roughly the grace period plus a few seconds even if the
    /// process cannot be reaped; the handle is marked cancelled either way
    /// and its output is sealed.
    #[instrument(skip(self), fields(command = %self.shared.command, pid = ?self.shared.pid))]
    pub async fn cancel(&self) -> CancelOutcome {
        match self.state() {
            ProcessState::Exited { .. } => return CancelOutcome::AlreadyFinished,
            ProcessState::Cancelled => return CancelOutcome::AlreadyCancelled,
            ProcessState::Running => {}
        }

        let sender = self
            .shared
            .cancel_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(sender) = sender else {
            // another clone is cancelling right now
            self.wait_finished(self.shared.grace + CANCEL_SLACK).await;
            return CancelOutcome::AlreadyCancelled;
        };

        info!("Cancelling process");
        let _ = sender.send(());

        if !self.wait_finished(self.shared.grace + CANCEL_SLACK).await {
            warn!("Process did not confirm termination, marking cancelled anyway");
        }

        self.shared.output.seal();
        match self.shared.state_rx.borrow().clone() {
            ProcessState::Exited { .. } => CancelOutcome::AlreadyFinished,
            _ => {
                self.shared.cancelled.store(true, Ordering::SeqCst);
                CancelOutcome::Cancelled
            }
        }
    }

    /// Wait for the process to exit on its own
    ///
    /// Returns the exit code (None when a signal ended the process). Does not
    /// stop the process when the timeout passes.
    pub async fn await_completion(&self, limit: Duration) -> Result<Option<i32>, InvokeError> {
        if !self.wait_finished(limit).await {
            return Err(InvokeError::Timeout {
                command: self.shared.command.clone(),
                timeout: limit,
            });
        }

        match self.state() {
            ProcessState::Exited { code } => Ok(code),
            _ => Err(InvokeError::Cancelled(self.shared.command.clone())),
        }
    }

    /// Wait until the supervisor records a final state; false on timeout
    async fn wait_finished(&self, limit: Duration) -> bool {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let mut rx = self.shared.state_rx.clone();
        let finished = matches!(
            timeout(limit, rx.wait_for(ProcessState::is_finished)).await,
            Ok(Ok(_))
        );
        finished
    }
}

/// Starts external processes in the background
#[derive(Debug, Clone)]
pub struct AsyncInvoker {
    grace_period: Duration,
}

impl Default for AsyncInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncInvoker {
    /// Default grace period is 10 seconds
    pub fn new() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &ProjectConfig) -> Self {
        Self::new().grace_period(config.timeouts.grace_period)
    }

    /// Time between SIGTERM and SIGKILL on cancel
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Spawn the command and return immediately
    ///
    /// Fails synchronously if the working directory is missing or the
    /// program cannot be spawned. IO errors after the spawn only end output
    /// capture.
    #[instrument(skip(self, invocation), fields(command = %invocation.command_line()))]
    pub fn start(&self, invocation: Invocation) -> Result<ProcessHandle, InvokeError> {
        let command_line = invocation.command_line();

        if let Some(dir) = invocation.working_dir() {
            if !dir.is_dir() {
                return Err(InvokeError::MissingDirectory(dir.to_path_buf()));
            }
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = invocation.working_dir() {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            // lead a new process group so cancel reaches forked watchers
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| InvokeError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id();

        let output = OutputBuffer::new();
        let collector = tokio::spawn(collect(
            child.stdout.take(),
            child.stderr.take(),
            output.clone(),
            invocation.forward_output,
        ));

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        tokio::spawn(supervise(Supervision {
            child,
            pid,
            collector,
            output: output.clone(),
            cancel_rx,
            state_tx,
            grace: self.grace_period,
        }));

        info!(pid = ?pid, "Started process");

        Ok(ProcessHandle {
            shared: Arc::new(Shared {
                command: command_line,
                pid,
                output,
                state_rx,
                cancel_tx: Mutex::new(Some(cancel_tx)),
                cancelled: AtomicBool::new(false),
                grace: self.grace_period,
            }),
        })
    }

    /// Run a command to completion and collect its output
    ///
    /// The process is cancelled if it outlives `limit`.
    pub async fn run(&self, invocation: Invocation, limit: Duration) -> Result<RunResult, InvokeError> {
        let handle = self.start(invocation)?;

        match handle.await_completion(limit).await {
            Ok(exit_code) => Ok(RunResult {
                exit_code,
                output: handle.output().snapshot(),
            }),
            Err(e) => {
                handle.cancel().await;
                Err(e)
            }
        }
    }
}

struct Supervision {
    child: Child,
    pid: Option<u32>,
    collector: JoinHandle<()>,
    output: OutputBuffer,
    cancel_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ProcessState>,
    grace: Duration,
}

/// Owns the child until it exits or is cancelled, then publishes the final state
async fn supervise(sup: Supervision) {
    let Supervision {
        mut child,
        pid,
        mut collector,
        output,
        cancel_rx,
        state_tx,
        grace,
    } = sup;

    let final_state = tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid = ?pid, error = %e, "Failed to wait for process");
                    None
                }
            };
            // forked children must not outlive the leader
            kill_group(pid);
            if timeout(DRAIN_WAIT, &mut collector).await.is_err() {
                debug!(pid = ?pid, "Output still open after exit, detaching");
                collector.abort();
            }
            output.seal();
            info!(pid = ?pid, code = ?code, "Process exited");
            ProcessState::Exited { code }
        }
        // an Err here means every handle was dropped, which also cancels
        _ = cancel_rx => {
            let termination = terminate_tree(&mut child, pid, grace).await;
            output.seal();
            collector.abort();
            info!(pid = ?pid, termination = ?termination, "Process cancelled");
            ProcessState::Cancelled
        }
    };

    let _ = state_tx.send(final_state);
}

/// Merge stdout and stderr into the buffer
async fn collect(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    output: OutputBuffer,
    forward: bool,
) {
    tokio::join!(
        pump(stdout, &output, forward, "stdout"),
        pump(stderr, &output, forward, "stderr"),
    );
}

async fn pump<R>(reader: Option<R>, output: &OutputBuffer, forward: bool, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = decoder.push(&buf[..n]);
                if !emit(output, &chunk, forward, stream) {
                    return;
                }
            }
            Err(e) => {
                warn!(stream = stream, error = %e, "Output stream failed, no more output");
                break;
            }
        }
    }

    let rest = decoder.finish();
    emit(output, &rest, forward, stream);
}

fn emit(output: &OutputBuffer, chunk: &str, forward: bool, stream: &'static str) -> bool {
    if chunk.is_empty() {
        return !output.is_sealed();
    }
    if forward {
        for line in chunk.lines() {
            info!(target: OUTPUT_TARGET, stream = stream, "{}", line);
        }
    }
    output.append(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder() {
        let invocation = Invocation::new("gradle")
            .arg("-p")
            .arg("projects/app")
            .args(["k8sWatch", "--console=plain"])
            .env("CI", "true")
            .forward_output(true);

        assert_eq!(
            invocation.command_line(),
            "gradle -p projects/app k8sWatch --console=plain"
        );
        assert_eq!(invocation.env.get("CI").map(String::as_str), Some("true"));
        assert!(invocation.forward_output);
    }

    #[test]
    fn test_invocation_from_argv() {
        let invocation = Invocation::from_argv(["mvn", "k8s:watch"]).unwrap();
        assert_eq!(invocation.command_line(), "mvn k8s:watch");

        let empty: [&str; 0] = [];
        assert!(matches!(
            Invocation::from_argv(empty),
            Err(InvokeError::EmptyCommand)
        ));
    }

    #[test]
    fn test_process_state_is_finished() {
        assert!(!ProcessState::Running.is_finished());
        assert!(ProcessState::Exited { code: Some(0) }.is_finished());
        assert!(ProcessState::Cancelled.is_finished());
    }

    #[test]
    fn test_run_result_passed() {
        let ok = RunResult {
            exit_code: Some(0),
            output: "BUILD SUCCESSFUL".to_string(),
        };
        let failed = RunResult {
            exit_code: Some(1),
            output: "BUILD FAILED".to_string(),
        };
        let killed = RunResult {
            exit_code: None,
            output: String::new(),
        };
        assert!(ok.passed());
        assert!(!failed.passed());
        assert!(!killed.passed());
    }

    #[tokio::test]
    async fn test_start_missing_directory() {
        let err = AsyncInvoker::new()
            .start(Invocation::new("echo").current_dir("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, InvokeError::MissingDirectory(_)));
    }

    #[tokio::test]
    async fn test_start_missing_program() {
        let err = AsyncInvoker::new()
            .start(Invocation::new("nonexistent_command_xyz"))
            .unwrap_err();

        match err {
            InvokeError::Spawn { command, .. } => assert_eq!(command, "nonexistent_command_xyz"),
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_simple_command() {
        let result = AsyncInvoker::new()
            .run(Invocation::new("echo").arg("hello"), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("hello"));
        assert!(result.passed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stderr_and_exit_code() {
        let result = AsyncInvoker::new()
            .run(
                Invocation::new("sh").args(["-c", "echo error >&2; exit 3"]),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.contains("error"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_env() {
        let result = AsyncInvoker::new()
            .run(
                Invocation::new("sh").args(["-c", "echo $MY_VAR"]).env("MY_VAR", "my_value"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert!(result.output.contains("my_value"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out_and_cancels() {
        let err = AsyncInvoker::new()
            .grace_period(Duration::from_millis(500))
            .run(Invocation::new("sleep").arg("30"), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::Timeout { .. }));
    }
}
