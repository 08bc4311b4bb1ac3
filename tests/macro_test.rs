//! Integration tests using the #[deploytest::test] macro

use async_trait::async_trait;
use deploytest::{ClusterContext, InjectError, Managed, ProjectConfig, Registry};
use k8s_openapi::api::core::v1::ConfigMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Records the configuration it was built from
struct Recorder {
    project: String,
    forward_output: bool,
    clean: bool,
    build: bool,
}

#[async_trait]
impl Managed for Recorder {
    async fn build(config: &ProjectConfig) -> Result<Self, InjectError> {
        Ok(Recorder {
            project: config.project.clone(),
            forward_output: config.forward_output,
            clean: config.clean,
            build: config.build,
        })
    }
}

struct Greeter(String);

#[async_trait]
impl Managed for Greeter {
    async fn build(config: &ProjectConfig) -> Result<Self, InjectError> {
        Ok(Greeter(format!("hello from {}", config.project)))
    }

    fn diagnostics(&self) -> Option<String> {
        Some(format!("greeting: {}", self.0))
    }
}

struct Fragile;

#[async_trait]
impl Managed for Fragile {
    async fn build(_config: &ProjectConfig) -> Result<Self, InjectError> {
        Ok(Fragile)
    }
}

/// Counts how often the suite object is built and closed
struct Counted;

static COUNTED_BUILDS: AtomicUsize = AtomicUsize::new(0);
static COUNTED_CLOSES: AtomicUsize = AtomicUsize::new(0);

#[async_trait]
impl Managed for Counted {
    async fn build(_config: &ProjectConfig) -> Result<Self, InjectError> {
        COUNTED_BUILDS.fetch_add(1, Ordering::SeqCst);
        Ok(Counted)
    }

    async fn close(&self) -> Result<(), InjectError> {
        COUNTED_CLOSES.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Unbuildable;

#[async_trait]
impl Managed for Unbuildable {
    async fn build(_config: &ProjectConfig) -> Result<Self, InjectError> {
        Err(InjectError::Build("no cluster".to_string()))
    }
}

/// The macro builds the config from the attribute arguments
#[deploytest::test(project = "zero-config", forward_output, clean = true, build = false)]
async fn test_macro_passes_configuration(recorder: Arc<Recorder>) {
    assert_eq!(recorder.project, "zero-config");
    assert!(recorder.forward_output);
    assert!(recorder.clean);
    assert!(!recorder.build);
}

/// Parameters are matched by type, whatever they are named
#[deploytest::test(project = "greetings")]
async fn test_macro_injects_several_objects(hello: Arc<Greeter>, fragile: Arc<Fragile>) {
    assert_eq!(hello.0, "hello from greetings");
    let _ = fragile;

    let registered = Registry::global().lookup::<Greeter>().unwrap();
    assert!(Arc::ptr_eq(&hello, &registered), "test sees the canonical instance");
}

/// Whichever of the two runs second still sees the first build
#[deploytest::test(project = "app")]
async fn test_suite_object_built_once_first(counted: Arc<Counted>) {
    let _ = counted;
    assert_eq!(COUNTED_BUILDS.load(Ordering::SeqCst), 1);
    assert_eq!(COUNTED_CLOSES.load(Ordering::SeqCst), 0);
}

#[deploytest::test(project = "app")]
async fn test_suite_object_built_once_second(counted: Arc<Counted>) {
    let registered = Registry::global().lookup::<Counted>().unwrap();
    assert!(Arc::ptr_eq(&counted, &registered));
    assert_eq!(COUNTED_BUILDS.load(Ordering::SeqCst), 1);
    assert_eq!(COUNTED_CLOSES.load(Ordering::SeqCst), 0);
}

/// Result-returning tests work with `?`
#[deploytest::test(project = "greetings")]
async fn test_macro_with_result(hello: Arc<Greeter>) -> Result<(), std::num::ParseIntError> {
    let n: u32 = "42".parse()?;
    assert_eq!(n, 42);
    assert!(hello.0.starts_with("hello"));
    Ok(())
}

/// Panics still fail the test after diagnostics are printed
#[deploytest::test(project = "greetings")]
#[should_panic(expected = "intentional failure")]
async fn test_macro_reraises_panics(hello: Arc<Greeter>) {
    assert!(!hello.0.is_empty());
    panic!("intentional failure");
}

/// An Err return fails the test like a panic
#[deploytest::test(project = "greetings")]
#[should_panic(expected = "test returned error")]
async fn test_macro_fails_on_err(_hello: Arc<Greeter>) -> Result<(), String> {
    Err("broken".to_string())
}

/// A missing project aborts before the body runs
#[deploytest::test]
#[should_panic(expected = "no project configured")]
async fn test_macro_requires_project(_fragile: Arc<Fragile>) {
    unreachable!("body must not run without a project");
}

/// Build failures abort before the body runs
#[deploytest::test(project = "greetings")]
#[should_panic(expected = "Failed to start suite")]
async fn test_macro_surfaces_build_errors(_unbuildable: Arc<Unbuildable>) {
    unreachable!("body must not run when the shared object cannot be built");
}

/// Test without parameters - just runs on the shared runtime
#[deploytest::test]
async fn test_macro_without_params() {
    let x = 1 + 1;
    tokio::task::yield_now().await;
    assert_eq!(x, 2);
}

/// Test against a real cluster
#[deploytest::test(project = "zero-config")]
#[ignore] // Requires real cluster
async fn test_macro_with_cluster_context(ctx: Arc<ClusterContext>) {
    let cm = ConfigMap {
        metadata: kube::api::ObjectMeta {
            name: Some("deploytest-macro".to_string()),
            ..Default::default()
        },
        data: Some(
            [("key".to_string(), "value".to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    };

    let api = ctx.api::<ConfigMap>();
    api.create(&Default::default(), &cm)
        .await
        .expect("Should create ConfigMap");

    let found = ctx
        .wait_for::<ConfigMap, _>("deploytest-macro", |cm| cm.data.is_some())
        .await
        .expect("ConfigMap should appear");
    assert_eq!(found.metadata.namespace.as_deref(), Some(ctx.namespace()));

    api.delete("deploytest-macro", &Default::default())
        .await
        .expect("Should delete ConfigMap");
}
