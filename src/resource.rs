//! Waiting on external resources
//!
//! A [`ResourceWaiter`] polls a [`Fetch`] source (a cluster object, a pod's
//! log, anything with a read operation) and returns the first value for
//! which the condition holds.
//!
//! Fetch failures are classified: `NotFound` and `Transient` mean "not yet"
//! and only show up as the last error of a timeout, `Fatal` stops the wait
//! immediately.
//!
//! # Example
//!
//! ```ignore
//! use deploytest::resource::{KubeObject, PodLogs, ResourceWaiter};
//! use k8s_openapi::api::apps::v1::Deployment;
//!
//! let waiter = ResourceWaiter::new().timeout(Duration::from_secs(120));
//!
//! let deployment = waiter
//!     .wait_for(&KubeObject::<Deployment>::new(api, "zero-config"), |d| {
//!         d.status.as_ref().and_then(|s| s.ready_replicas) == Some(1)
//!     })
//!     .await?;
//!
//! waiter
//!     .wait_for(&PodLogs::new(pods, "zero-config-abc"), |log| log.contains("Started"))
//!     .await?;
//! ```

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::ProjectConfig;
use crate::eventually::{PollFailure, Waiter};
use crate::wait::TimeoutError;

/// Error from a single fetch
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl FetchError {
    /// Whether polling should continue after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Fatal(_))
    }

    /// Classify a Kubernetes API error
    ///
    /// 404 is `NotFound`, auth failures are `Fatal`, everything else
    /// (5xx, 400 from a container still starting, connection resets) is
    /// `Transient`.
    pub fn from_kube(err: kube::Error, subject: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => FetchError::NotFound(subject.to_string()),
            kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => FetchError::Fatal(
                format!("{subject}: permission denied (check RBAC): {}", resp.message),
            ),
            other => FetchError::Transient(format!("{subject}: {other}")),
        }
    }
}

/// A readable external resource
#[async_trait]
pub trait Fetch: Send + Sync {
    /// What a successful read produces
    type Output: Send;

    /// Read the current state once
    async fn fetch(&self) -> Result<Self::Output, FetchError>;

    /// Human-readable reference used in timeout reports, e.g. "deployment/web"
    fn subject(&self) -> String;
}

/// A namespaced Kubernetes object read with `GET`
pub struct KubeObject<K>
where
    K: kube::Resource,
{
    api: Api<K>,
    name: String,
}

impl<K> KubeObject<K>
where
    K: kube::Resource,
{
    pub fn new(api: Api<K>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<K> Fetch for KubeObject<K>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    <K as kube::Resource>::DynamicType: Default,
{
    type Output = K;

    async fn fetch(&self) -> Result<K, FetchError> {
        self.api
            .get(&self.name)
            .await
            .map_err(|e| FetchError::from_kube(e, &self.subject()))
    }

    fn subject(&self) -> String {
        let kind = K::kind(&Default::default()).to_lowercase();
        format!("{}/{}", kind, self.name)
    }
}

/// The accumulated log of one pod (or one of its containers)
pub struct PodLogs {
    api: Api<Pod>,
    pod: String,
    params: LogParams,
}

impl PodLogs {
    pub fn new(api: Api<Pod>, pod: impl Into<String>) -> Self {
        Self {
            api,
            pod: pod.into(),
            params: LogParams::default(),
        }
    }

    /// Read a specific container instead of the pod's default one
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.params.container = Some(container.into());
        self
    }
}

#[async_trait]
impl Fetch for PodLogs {
    type Output = String;

    async fn fetch(&self) -> Result<String, FetchError> {
        self.api
            .logs(&self.pod, &self.params)
            .await
            .map_err(|e| FetchError::from_kube(e, &self.subject()))
    }

    fn subject(&self) -> String {
        match &self.params.container {
            Some(container) => format!("logs of pod/{} [{}]", self.pod, container),
            None => format!("logs of pod/{}", self.pod),
        }
    }
}

/// A fetch source built from an async closure
pub struct FnFetch<F> {
    subject: String,
    f: F,
}

/// Wrap an async closure as a [`Fetch`] source
///
/// ```ignore
/// let exit = from_fn("watch process", || async { handle.exit_code().ok_or(FetchError::NotFound("exit".into())) });
/// ```
pub fn from_fn<F, Fut, T>(subject: impl Into<String>, f: F) -> FnFetch<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + 'static,
{
    FnFetch {
        subject: subject.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut, T> Fetch for FnFetch<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn fetch(&self) -> Result<T, FetchError> {
        (self.f)().await
    }

    fn subject(&self) -> String {
        self.subject.clone()
    }
}

/// Errors from resource waits
#[derive(Debug)]
pub enum ResourceWaitError<T> {
    /// The deadline passed; carries the last value or fetch error
    Timeout(TimeoutError<T>),
    /// A non-retryable fetch error
    Fetch { subject: String, source: FetchError },
}

impl<T> ResourceWaitError<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResourceWaitError::Timeout(_))
    }
}

impl<T: fmt::Debug> fmt::Display for ResourceWaitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceWaitError::Timeout(err) => write!(f, "{}", err),
            ResourceWaitError::Fetch { subject, source } => {
                write!(f, "Failed to fetch {}: {}", subject, source)
            }
        }
    }
}

impl<T: fmt::Debug> std::error::Error for ResourceWaitError<T> {}

/// Polls [`Fetch`] sources until a condition holds
#[derive(Debug, Clone)]
pub struct ResourceWaiter {
    condition: String,
    timeout: Duration,
    interval: Duration,
}

impl Default for ResourceWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceWaiter {
    /// Default timeout is 60 seconds, polling interval is 1 second
    pub fn new() -> Self {
        Self {
            condition: "condition".to_string(),
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(1),
        }
    }

    /// Use a suite's configured timeouts
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self::new()
            .timeout(config.timeouts.wait)
            .interval(config.timeouts.poll_interval)
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn waiter(&self, subject: String) -> Waiter {
        Waiter::new(subject)
            .condition(self.condition.clone())
            .timeout(self.timeout)
            .interval(self.interval)
    }

    /// Wait until the fetched value satisfies `predicate`
    pub async fn wait_for<S, P>(
        &self,
        source: &S,
        predicate: P,
    ) -> Result<S::Output, ResourceWaitError<S::Output>>
    where
        S: Fetch,
        P: FnMut(&S::Output) -> bool,
    {
        let subject = source.subject();
        self.waiter(subject.clone())
            .poll(|| source.fetch(), predicate, FetchError::is_retryable)
            .await
            .map_err(|failure| match failure {
                PollFailure::Timeout(err) => ResourceWaitError::Timeout(err),
                PollFailure::Aborted(source) => ResourceWaitError::Fetch { subject, source },
            })
    }

    /// Wait until the source reports `NotFound`
    pub async fn wait_gone<S>(&self, source: &S) -> Result<(), ResourceWaitError<bool>>
    where
        S: Fetch,
    {
        let subject = source.subject();
        debug!(subject = %subject, "Waiting for resource to disappear");

        self.waiter(subject.clone())
            .condition("resource deleted")
            .poll(
                || async {
                    match source.fetch().await {
                        Ok(_) => Ok(false),
                        Err(FetchError::NotFound(_)) => Ok(true),
                        Err(e) => Err(e),
                    }
                },
                |gone| *gone,
                FetchError::is_retryable,
            )
            .await
            .map(|_| ())
            .map_err(|failure| match failure {
                PollFailure::Timeout(err) => ResourceWaitError::Timeout(err),
                PollFailure::Aborted(source) => ResourceWaitError::Fetch { subject, source },
            })
    }
}
