//! Suite-scoped shared objects
//!
//! A [`Managed`] type is built once per suite and handed to every test that
//! asks for it. The [`Registry`] keys each managed type by its [`Namespace`],
//! guards construction so concurrent suites observe one canonical instance,
//! and counts holders so the last suite to finish closes it.
//!
//! ```text
//! Uninitialized --begin--> Ready --last end--> Closed --begin--> Ready (new generation)
//! ```
//!
//! `#[deploytest::test]` uses [`Registry::attach`], which parks one
//! membership per type for the life of the test binary, so the object is
//! built before the first test that needs it and closed by
//! [`Registry::shutdown`] when the binary exits.
//!
//! Test fixtures that want the shared object in their own fields implement
//! [`Injectable`] and list setters in a [`Manifest`].
//!
//! # Example
//!
//! ```ignore
//! let config = ProjectConfig::new("zero-config");
//! let suite = Registry::global().begin::<ClusterContext>(&config).await?;
//!
//! let ctx = suite.shared();
//! // ... run tests ...
//!
//! suite.end().await?;
//! ```

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ProjectConfig};

/// Errors from the shared-object registry
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("failed to build shared object: {0}")]
    Build(String),

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("{0} holds a value of another type")]
    TypeMismatch(&'static str),
}

/// An object shared by every test of a suite
///
/// `build` runs at most once per lifecycle generation, `close` once when the
/// last holder ends.
#[async_trait]
pub trait Managed: Send + Sync + Sized + 'static {
    async fn build(config: &ProjectConfig) -> Result<Self, InjectError>;

    async fn close(&self) -> Result<(), InjectError> {
        Ok(())
    }

    /// Extra context printed when a test using this object fails
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Key of one managed type's shared state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Namespace {
    id: TypeId,
    name: &'static str,
}

impl Namespace {
    pub fn of<M: 'static>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Where a namespace is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Closed,
}

type Shared = Arc<dyn Any + Send + Sync>;

struct Slot {
    cell: Arc<OnceCell<Shared>>,
    holders: usize,
    state: LifecycleState,
    generation: u64,
    config: Option<ProjectConfig>,
}

impl Slot {
    fn new(generation: u64) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            holders: 0,
            state: LifecycleState::Uninitialized,
            generation,
            config: None,
        }
    }
}

/// Namespaced store of suite-shared objects
///
/// Clones share the same store. [`Registry::global`] is the process-wide
/// instance used by `#[deploytest::test]`.
#[derive(Clone, Default)]
pub struct Registry {
    slots: Arc<Mutex<HashMap<Namespace, Slot>>>,
    parked: Arc<Mutex<Vec<(Namespace, Box<dyn Parked>)>>>,
}

/// A membership held until shutdown, whatever its managed type
trait Parked: Send {
    fn end(self: Box<Self>) -> BoxFuture<'static, Result<(), InjectError>>;
}

impl<M: Managed> Parked for Lifecycle<M> {
    fn end(self: Box<Self>) -> BoxFuture<'static, Result<(), InjectError>> {
        Lifecycle::end(*self).boxed()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.lock();
        let mut map = f.debug_map();
        for (ns, slot) in slots.iter() {
            map.entry(&ns.name, &(slot.state, slot.holders));
        }
        map.finish()
    }
}

impl Registry {
    /// An isolated registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Join the suite lifecycle of `M`, building it if nobody holds it yet
    ///
    /// Concurrent callers share one build. The configuration of whichever
    /// caller builds the object wins; a differing configuration from a later
    /// caller is logged and ignored.
    pub async fn begin<M: Managed>(&self, config: &ProjectConfig) -> Result<Lifecycle<M>, InjectError> {
        let namespace = Namespace::of::<M>();
        if let Err(e) = config.validate() {
            warn!(namespace = %namespace, error = %e, "Rejected suite configuration");
            return Err(e.into());
        }

        let (cell, generation) = {
            let mut slots = self.lock();
            let slot = slots.entry(namespace).or_insert_with(|| Slot::new(0));
            if slot.state == LifecycleState::Closed {
                let next = slot.generation + 1;
                debug!(namespace = %namespace, generation = next, "Starting new lifecycle generation");
                *slot = Slot::new(next);
            }
            slot.holders += 1;
            match &slot.config {
                None => slot.config = Some(config.clone()),
                Some(existing) if existing != config => {
                    warn!(
                        namespace = %namespace,
                        project = %config.project,
                        active = %existing.project,
                        "Suite configuration differs from the active one, reusing the active object"
                    );
                }
                Some(_) => {}
            }
            (slot.cell.clone(), slot.generation)
        };

        let built = cell
            .get_or_try_init(|| async {
                info!(namespace = %namespace, project = %config.project, "Building shared object");
                let value = M::build(config).await?;
                Ok::<Shared, InjectError>(Arc::new(value))
            })
            .await
            .cloned();

        let shared = match built {
            Ok(shared) => shared,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Failed to build shared object");
                self.release(namespace, generation);
                return Err(e);
            }
        };

        {
            let mut slots = self.lock();
            if let Some(slot) = slots.get_mut(&namespace) {
                if slot.generation == generation && slot.state == LifecycleState::Uninitialized {
                    slot.state = LifecycleState::Ready;
                }
            }
        }

        let value = match shared.downcast::<M>() {
            Ok(value) => value,
            Err(_) => {
                self.release(namespace, generation);
                return Err(InjectError::TypeMismatch(namespace.name()));
            }
        };

        debug!(namespace = %namespace, "Joined suite lifecycle");
        Ok(Lifecycle {
            registry: self.clone(),
            namespace,
            generation,
            value,
            ended: false,
        })
    }

    /// Shared object of `M`, held until [`shutdown`](Self::shutdown)
    ///
    /// The first call joins the lifecycle and parks that membership in the
    /// registry. Later calls reuse it, so tests that run one after another
    /// still share a single build.
    pub async fn attach<M: Managed>(&self, config: &ProjectConfig) -> Result<Arc<M>, InjectError> {
        let namespace = Namespace::of::<M>();
        config.validate()?;
        if self.is_parked(namespace) {
            return self.lookup::<M>();
        }

        let lifecycle = self.begin::<M>(config).await?;
        let shared = lifecycle.shared();

        // a concurrent caller may have parked first
        let duplicate = {
            let mut parked = self.parked();
            if parked.iter().any(|(ns, _)| *ns == namespace) {
                Some(lifecycle)
            } else {
                debug!(namespace = %namespace, "Holding shared object until shutdown");
                let membership: Box<dyn Parked> = Box::new(lifecycle);
                parked.push((namespace, membership));
                None
            }
        };
        if let Some(duplicate) = duplicate {
            duplicate.end().await?;
        }
        Ok(shared)
    }

    /// End every membership taken by [`attach`](Self::attach), newest first
    ///
    /// Objects nobody else holds are closed. Every membership is ended even
    /// when a close fails; the first failure is returned.
    pub async fn shutdown(&self) -> Result<(), InjectError> {
        let parked = std::mem::take(&mut *self.parked());
        let mut first_err = None;

        for (namespace, lifecycle) in parked.into_iter().rev() {
            if let Err(e) = lifecycle.end().await {
                warn!(namespace = %namespace, error = %e, "Failed to close shared object");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn is_parked(&self, namespace: Namespace) -> bool {
        self.parked().iter().any(|(ns, _)| *ns == namespace)
    }

    fn parked(&self) -> MutexGuard<'_, Vec<(Namespace, Box<dyn Parked>)>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current shared object of `M`
    pub fn lookup<M: Managed>(&self) -> Result<Arc<M>, InjectError> {
        let namespace = Namespace::of::<M>();
        let shared = {
            let slots = self.lock();
            let slot = slots
                .get(&namespace)
                .ok_or(InjectError::NotInitialized(namespace.name()))?;
            match slot.state {
                LifecycleState::Uninitialized => return Err(InjectError::NotInitialized(namespace.name())),
                LifecycleState::Closed => return Err(InjectError::Closed(namespace.name())),
                LifecycleState::Ready => slot
                    .cell
                    .get()
                    .cloned()
                    .ok_or(InjectError::NotInitialized(namespace.name()))?,
            }
        };
        shared
            .downcast::<M>()
            .map_err(|_| InjectError::TypeMismatch(namespace.name()))
    }

    pub fn state<M: Managed>(&self) -> LifecycleState {
        self.lock()
            .get(&Namespace::of::<M>())
            .map_or(LifecycleState::Uninitialized, |slot| slot.state)
    }

    #[cfg(test)]
    fn holders<M: Managed>(&self) -> usize {
        self.lock()
            .get(&Namespace::of::<M>())
            .map_or(0, |slot| slot.holders)
    }

    /// Drop one holder; true when it was the last one of its generation
    fn release(&self, namespace: Namespace, generation: u64) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(&namespace) else {
            return false;
        };
        if slot.generation != generation {
            return false;
        }
        slot.holders = slot.holders.saturating_sub(1);
        if slot.holders > 0 {
            return false;
        }
        if slot.cell.initialized() {
            slot.state = LifecycleState::Closed;
            true
        } else {
            // build failed and nobody else is waiting
            *slot = Slot::new(generation + 1);
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Namespace, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shut the global registry down when the process exits
///
/// Called by `#[deploytest::test]`; registers the hook once. Without an exit
/// hook (non-unix targets) attached objects are never closed.
pub fn shutdown_at_exit() {
    static REGISTERED: Once = Once::new();
    REGISTERED.call_once(|| {
        #[cfg(unix)]
        {
            // SAFETY: the hook is an extern "C" fn that catches every panic
            if unsafe { nix::libc::atexit(shutdown_global) } != 0 {
                warn!("Could not register exit hook, shared objects will not be closed");
            }
        }
    });
}

#[cfg(unix)]
extern "C" fn shutdown_global() {
    let closed = std::panic::catch_unwind(|| crate::runtime().block_on(Registry::global().shutdown()));
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Shared objects closed with errors"),
        Err(_) => warn!("Panic while closing shared objects at exit"),
    }
}

/// One holder's membership in a suite lifecycle
///
/// Call [`end`](Self::end) when the suite finishes. A holder dropped without
/// `end` still releases its membership; if it was the last one, `close` is
/// spawned on the current runtime.
pub struct Lifecycle<M: Managed> {
    registry: Registry,
    namespace: Namespace,
    generation: u64,
    value: Arc<M>,
    ended: bool,
}

impl<M: Managed> fmt::Debug for Lifecycle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("namespace", &self.namespace.name)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<M: Managed> Lifecycle<M> {
    /// The canonical shared object
    pub fn shared(&self) -> Arc<M> {
        Arc::clone(&self.value)
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Set every field `target` declares for `M`
    ///
    /// Suite-scope fields receive the object cached at `begin`, test-scope
    /// fields a fresh registry lookup. Every value is resolved first, so a
    /// failed lookup leaves `target` untouched.
    pub fn inject<T: Injectable<M>>(&self, target: &mut T) -> Result<(), InjectError> {
        let manifest = T::manifest();

        let resolved = manifest
            .entries
            .iter()
            .map(|entry| {
                let value = match entry.scope {
                    Scope::Suite => Ok(self.shared()),
                    Scope::Test => self.registry.lookup::<M>(),
                };
                value.map(|value| (entry, value))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (entry, value) in resolved {
            (entry.set)(target, value);
            debug!(namespace = %self.namespace, field = entry.field, scope = ?entry.scope, "Injected field");
        }
        Ok(())
    }

    /// Fresh `T` with its fields injected
    pub fn instance<T: Injectable<M> + Default>(&self) -> Result<T, InjectError> {
        let mut target = T::default();
        self.inject(&mut target)?;
        Ok(target)
    }

    /// Leave the lifecycle; the last holder closes the shared object
    pub async fn end(mut self) -> Result<(), InjectError> {
        self.ended = true;
        if !self.registry.release(self.namespace, self.generation) {
            debug!(namespace = %self.namespace, "Left suite lifecycle");
            return Ok(());
        }

        info!(namespace = %self.namespace, "Closing shared object");
        self.value.close().await
    }
}

impl<M: Managed> Drop for Lifecycle<M> {
    fn drop(&mut self) {
        if self.ended || !self.registry.release(self.namespace, self.generation) {
            return;
        }

        warn!(namespace = %self.namespace, "Lifecycle dropped without end()");
        let value = Arc::clone(&self.value);
        let namespace = self.namespace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = value.close().await {
                        warn!(namespace = %namespace, error = %e, "Failed to close shared object");
                    }
                });
            }
            Err(_) => {
                warn!(namespace = %namespace, "No runtime available, shared object closed without close()");
            }
        }
    }
}

/// When an injected field is set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The object cached when the suite began
    Suite,
    /// Looked up again before each test
    Test,
}

type Setter<T, M> = Box<dyn Fn(&mut T, Arc<M>) + Send + Sync>;

struct Entry<T, M> {
    field: &'static str,
    scope: Scope,
    set: Setter<T, M>,
}

/// Fields of `T` that receive an `Arc<M>`
///
/// Name both types up front so the setters can be checked:
///
/// ```ignore
/// Manifest::<WatchTest, ClusterContext>::new().suite("ctx", |t, v| t.ctx = Some(v))
/// ```
pub struct Manifest<T, M> {
    entries: Vec<Entry<T, M>>,
}

impl<T, M> Default for Manifest<T, M> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T, M> Manifest<T, M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field set once per suite
    pub fn suite(self, field: &'static str, set: impl Fn(&mut T, Arc<M>) + Send + Sync + 'static) -> Self {
        self.field(field, Scope::Suite, set)
    }

    /// Field set before every test
    pub fn test(self, field: &'static str, set: impl Fn(&mut T, Arc<M>) + Send + Sync + 'static) -> Self {
        self.field(field, Scope::Test, set)
    }

    pub fn field(
        mut self,
        field: &'static str,
        scope: Scope,
        set: impl Fn(&mut T, Arc<M>) + Send + Sync + 'static,
    ) -> Self {
        self.entries.push(Entry {
            field,
            scope,
            set: Box::new(set),
        });
        self
    }

    /// Declared fields and their scopes
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, Scope)> + '_ {
        self.entries.iter().map(|e| (e.field, e.scope))
    }
}

/// A fixture with fields that hold `M`
pub trait Injectable<M: Managed>: Sized {
    fn manifest() -> Manifest<Self, M>;
}
