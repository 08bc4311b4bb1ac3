//! Suite-shared cluster context
//!
//! [`ClusterContext`] holds the Kubernetes client and the application under
//! test. It is built once per suite through the [`Registry`](crate::inject::Registry)
//! and shared by every test; tests never construct or close it themselves.
//!
//! # Example
//!
//! ```ignore
//! #[deploytest::test(project = "zero-config")]
//! async fn test_deploys(ctx: Arc<ClusterContext>) {
//!     let deployment = ctx
//!         .wait_for::<Deployment, _>(ctx.application(), |d| {
//!             d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0) >= 1
//!         })
//!         .await?;
//! }
//! ```

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::config::ProjectConfig;
use crate::inject::{InjectError, Managed};
use crate::resource::{KubeObject, PodLogs, ResourceWaitError, ResourceWaiter};

/// Kubernetes client plus the application identity of a suite
pub struct ClusterContext {
    client: Client,
    application: String,
    namespace: String,
    waiter: ResourceWaiter,
    closed: AtomicBool,
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("application", &self.application)
            .field("namespace", &self.namespace)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClusterContext {
    pub fn new(client: Client, application: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            application: application.into(),
            namespace: namespace.into(),
            waiter: ResourceWaiter::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Waits issued through this context use `waiter`'s timeouts
    pub fn with_waiter(mut self, waiter: ResourceWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Application identifier (the fixture project name)
    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Label selector matching the application's pods
    pub fn app_selector(&self) -> String {
        format!("app={}", self.application)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Api for a namespaced resource kind in this context's namespace
    pub fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Fetch source for a named object
    pub fn object<K>(&self, name: &str) -> KubeObject<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        KubeObject::new(self.api::<K>(), name)
    }

    /// Fetch source for a pod's log
    pub fn pod_logs(&self, pod: &str) -> PodLogs {
        PodLogs::new(self.api::<Pod>(), pod)
    }

    /// The waiter used by [`wait_for`](Self::wait_for)
    pub fn waiter(&self) -> &ResourceWaiter {
        &self.waiter
    }

    /// Wait until the named object satisfies `predicate`
    pub async fn wait_for<K, P>(&self, name: &str, predicate: P) -> Result<K, ResourceWaitError<K>>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug
            + Send
            + Sync
            + 'static,
        <K as kube::Resource>::DynamicType: Default,
        P: FnMut(&K) -> bool,
    {
        self.waiter.wait_for(&self.object::<K>(name), predicate).await
    }

    /// Wait until the named object is deleted
    pub async fn wait_gone<K>(&self, name: &str) -> Result<(), ResourceWaitError<bool>>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug
            + Send
            + Sync
            + 'static,
        <K as kube::Resource>::DynamicType: Default,
    {
        self.waiter.wait_gone(&self.object::<K>(name)).await
    }
}

#[async_trait]
impl Managed for ClusterContext {
    async fn build(config: &ProjectConfig) -> Result<Self, InjectError> {
        let client = Client::try_default()
            .await
            .map_err(|e| InjectError::Build(format!("failed to create Kubernetes client: {}", e)))?;

        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());

        info!(application = %config.project, namespace = %namespace, "Connected to cluster");

        Ok(ClusterContext::new(client, &config.project, namespace)
            .with_waiter(ResourceWaiter::from_config(config)))
    }

    async fn close(&self) -> Result<(), InjectError> {
        self.closed.store(true, Ordering::SeqCst);
        info!(application = %self.application, namespace = %self.namespace, "Closed cluster context");
        Ok(())
    }

    fn diagnostics(&self) -> Option<String> {
        Some(format!(
            "application: {}\nnamespace: {}\nselector: {}",
            self.application,
            self.namespace,
            self.app_selector()
        ))
    }
}
