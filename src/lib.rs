//! deploytest - integration testing for build tools that deploy into Kubernetes
//!
//! deploytest drives a fixture project through its build tool (build,
//! deploy, watch mode) and asserts on what shows up in the cluster and in
//! the tool's output. It provides:
//!
//! - Bounded polling: [`Waiter`] for any async condition, [`ResourceWaiter`]
//!   for cluster objects and pod logs
//! - Background processes: [`AsyncInvoker`] with live output and bounded,
//!   idempotent cancellation of the whole process tree
//! - Suite-shared objects: a [`Registry`] that builds each [`Managed`] type
//!   once and closes it after the last test that uses it
//! - `#[deploytest::test]`, which wires all of the above into a test
//!
//! # Example
//!
//! ```ignore
//! use deploytest::{BuildProject, ClusterContext, Waiter};
//! use std::sync::Arc;
//!
//! #[deploytest::test(project = "zero-config", build)]
//! async fn watch_redeploys_on_change(project: Arc<BuildProject>, ctx: Arc<ClusterContext>) {
//!     let watch = project.start(["k8sWatch"]).unwrap();
//!     Waiter::new("watch")
//!         .until_value(|| async { watch.output().snapshot() }, |out| out.contains("Watching"))
//!         .await
//!         .unwrap();
//!
//!     project
//!         .edit_file("src/main/java/App.java", |src| src.replace("Hello", "Howdy"))
//!         .unwrap();
//!
//!     ctx.waiter()
//!         .wait_for(&ctx.pod_logs("zero-config"), |log| log.contains("Howdy"))
//!         .await
//!         .unwrap();
//!     watch.cancel().await;
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `DEPLOYTEST_FORWARD_OUTPUT=true` - log all process output
//! - `DEPLOYTEST_TIMEOUT_SECS` - default wait timeout
//! - `DEPLOYTEST_PROJECTS_DIR` - fixture projects root (default `projects`)
//! - `DEPLOYTEST_TOOL` - build tool executable (default `gradle`)
//! - `DEPLOYTEST_REPORT` - append PASS/FAIL lines to this file

pub mod config;
pub mod context;
pub mod eventually;
pub mod inject;
pub mod invoker;
pub mod project;
pub mod report;
pub mod resource;
pub mod telemetry;
pub mod wait;

pub use config::{ConfigError, ProjectConfig, Timeouts};
pub use context::ClusterContext;
pub use eventually::{eventually, wait, Waiter};
pub use inject::{InjectError, Injectable, Lifecycle, LifecycleState, Managed, Manifest, Namespace, Registry, Scope};
pub use invoker::{
    AsyncInvoker, CancelOutcome, InvokeError, Invocation, OutputBuffer, ProcessHandle, ProcessState, RunResult,
};
pub use project::{BuildProject, ProjectError};
pub use report::{Outcome, ReportError, ReportSink};
pub use resource::{Fetch, FetchError, KubeObject, PodLogs, ResourceWaitError, ResourceWaiter};
pub use telemetry::init_logging;
pub use wait::{Observation, TimeoutError};

// Re-export the test macro
pub use deploytest_macros::test;

use std::sync::OnceLock;
use tokio::runtime::{Builder, Runtime};

/// Process-wide runtime that drives `#[deploytest::test]` bodies
///
/// Shared by every test so suite-scoped objects (and the clients inside
/// them) outlive any single test.
pub fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        Builder::new_multi_thread()
            .enable_all()
            .thread_name("deploytest")
            .build()
            .unwrap_or_else(|e| panic!("failed to build deploytest runtime: {}", e))
    })
}

#[doc(hidden)]
pub mod __private {
    pub use futures;
}
