// ABOUTME: The Storage facade: builds the backend, cache and remote tier from config and hands out typed repositories.
// ABOUTME: Owns the lifecycle state machine, the background tasks and the synchronous shutdown flush.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use quill_cache::{CacheStats, RemoteCache};
use quill_core::{EntityType, FlushFailure, Record, StorageError};
use quill_store::{Backend, open_backend};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::config::{ConfigError, StorageConfig};
use crate::maintenance::{
    Registry, apply_health, managed, probe, spawn_flusher, spawn_health_checker,
};
use crate::repository::{Context, ManagedRepository, Remote, Repository};

/// Undelivered flush failure reports kept per subscriber.
const FAILURE_BUFFER: usize = 256;

/// Lifecycle of a [`Storage`].
///
/// `Uninitialized -> Ready <-> Degraded -> ShuttingDown -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    Uninitialized,
    Ready,
    /// The backend failed its health check. Reads are served from cache and
    /// writes are queued or rejected per `degraded_writes`.
    Degraded,
    ShuttingDown,
    Closed,
}

/// Errors that can occur while building a [`Storage`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid storage configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not open storage: {0}")]
    Storage(#[from] StorageError),

    #[error("no tokio runtime: call StorageBuilder::runtime or build from inside a runtime")]
    NoRuntime,
}

type Registration = fn(&Storage) -> Result<(), StorageError>;
type Preload = fn(&Storage) -> BoxFuture<'static, usize>;

fn register_type<R: Record>(storage: &Storage) -> Result<(), StorageError> {
    storage.repository::<R>().map(|_| ())
}

fn preload_type<R: Record>(storage: &Storage) -> BoxFuture<'static, usize> {
    let repo = storage.repository::<R>();
    async move {
        let repo = match repo {
            Ok(repo) => repo,
            Err(e) => {
                warn!(entity = R::ENTITY_TYPE, error = %e, "preload skipped");
                return 0;
            }
        };
        let mut load = repo.load_all();
        let mut loaded = 0;
        while let Some(item) = load.next().await {
            match item {
                Ok(_) => loaded += 1,
                Err(e) => warn!(entity = R::ENTITY_TYPE, error = %e, "preload skipped a record"),
            }
        }
        info!(entity = R::ENTITY_TYPE, loaded, "preloaded records");
        loaded
    }
    .boxed()
}

/// Assembles a [`Storage`] from a [`StorageConfig`].
///
/// The backend and remote tier default to what the configuration describes;
/// either can be replaced, which is how tests inject doubles.
pub struct StorageBuilder {
    config: StorageConfig,
    handle: Option<Handle>,
    backend: Option<Arc<dyn Backend>>,
    remote: Option<Arc<dyn RemoteCache>>,
    registrations: Vec<Registration>,
    preloads: Vec<Preload>,
}

impl StorageBuilder {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            handle: None,
            backend: None,
            remote: None,
            registrations: Vec::new(),
            preloads: Vec::new(),
        }
    }

    /// Run I/O and background tasks on this runtime instead of the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Create the repository for `R` up front.
    pub fn register<R: Record>(mut self) -> Self {
        self.registrations.push(register_type::<R>);
        self
    }

    /// Load every stored `R` into the cache before `build` returns.
    pub fn preload<R: Record>(mut self) -> Self {
        self.registrations.push(register_type::<R>);
        self.preloads.push(preload_type::<R>);
        self
    }

    pub fn build(self) -> Result<Storage, BuildError> {
        let config = self.config;
        config.validate()?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };
        let backend = match self.backend {
            Some(backend) => backend,
            None => open_backend(&config.to_descriptor())?,
        };
        let remote = match self.remote {
            Some(remote) => Some(remote),
            None => connect_remote(&config, &handle),
        };

        let (state, _) = watch::channel(StorageState::Uninitialized);
        let (failures, _) = broadcast::channel(FAILURE_BUFFER);
        let ctx = Arc::new(Context {
            handle,
            backend,
            remote: remote
                .map(|cache| Remote::new(cache, config.redis_key_prefix.clone(), config.redis_ttl())),
            mode: config.cache_mode,
            degraded_writes: config.degraded_writes,
            capacity: config.cache_capacity,
            ttl: config.cache_ttl(),
            retry: config.retry_policy(),
            operation_timeout: config.operation_timeout(),
            state,
            failures,
        });

        let storage = Storage {
            config,
            ctx,
            registry: Registry::default(),
            tasks: Mutex::new(Vec::new()),
        };
        for register in self.registrations {
            register(&storage)?;
        }

        storage.ctx.state.send_replace(StorageState::Ready);
        info!(
            backend = storage.ctx.backend.name(),
            mode = ?storage.config.cache_mode,
            capacity = storage.config.cache_capacity,
            remote = storage.ctx.remote.is_some(),
            "storage ready"
        );

        for preload in self.preloads {
            block_on(&storage.ctx.handle, preload(&storage))?;
        }
        storage.start_background();
        Ok(storage)
    }
}

#[cfg(feature = "redis")]
fn connect_remote(config: &StorageConfig, handle: &Handle) -> Option<Arc<dyn RemoteCache>> {
    if !config.redis_enabled {
        return None;
    }
    let url = config.redis_url.clone()?;
    let timeout = std::time::Duration::from_millis(config.connect_timeout_ms);
    let connecting = async move {
        tokio::time::timeout(timeout, quill_cache::RedisRemote::connect(&url)).await
    };
    match block_on(handle, connecting) {
        Ok(Ok(Ok(remote))) => Some(Arc::new(remote)),
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "redis unavailable; continuing without the remote cache");
            None
        }
        Ok(Err(_)) => {
            warn!(?timeout, "redis connect timed out; continuing without the remote cache");
            None
        }
        Err(e) => {
            warn!(error = %e, "could not wait for redis; continuing without the remote cache");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
fn connect_remote(_config: &StorageConfig, _handle: &Handle) -> Option<Arc<dyn RemoteCache>> {
    None
}

/// Drive `fut` to completion on `handle` from synchronous code.
///
/// From a multi-threaded runtime worker the worker is handed off first. From
/// inside a current-thread runtime the wait could never finish when `handle`
/// is also current-thread, since nothing else drives it; that fails with
/// `BlockingInRuntime`. Otherwise the future runs on a helper thread.
fn block_on<F>(handle: &Handle, fut: F) -> Result<F::Output, StorageError>
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
        }
        Ok(_) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
            Err(StorageError::BlockingInRuntime)
        }
        Ok(_) => Ok(std::thread::scope(|scope| {
            scope
                .spawn(|| handle.block_on(fut))
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        })),
        Err(_) => Ok(handle.block_on(fut)),
    }
}

/// Persistence for one plugin: a backend, an in-memory cache per entity type
/// and an optional remote tier.
///
/// There is no global instance; create one at plugin start, pass it (or the
/// repositories it hands out) to whatever needs storage, and call
/// [`Storage::shutdown`] at plugin stop.
pub struct Storage {
    config: StorageConfig,
    ctx: Arc<Context>,
    registry: Registry,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &self.ctx.backend.name())
            .field("state", &self.state())
            .field("entities", &self.registry.read().len())
            .finish()
    }
}

impl Storage {
    pub fn builder(config: StorageConfig) -> StorageBuilder {
        StorageBuilder::new(config)
    }

    /// Build with the backend and remote tier the configuration describes,
    /// on the current runtime.
    pub fn open(config: StorageConfig) -> Result<Self, BuildError> {
        StorageBuilder::new(config).build()
    }

    /// The repository for `R`, created on first use. Every call for the same
    /// entity type shares one cache.
    pub fn repository<R: Record>(&self) -> Result<Repository<R>, StorageError> {
        let entity = EntityType::new(R::ENTITY_TYPE)?;
        if let Some(existing) = self.registry.read().get(&entity) {
            return downcast::<R>(existing.as_ref());
        }

        let mut registry = self.registry.write();
        let managed = registry.entry(entity.clone()).or_insert_with(|| {
            info!(entity = %entity, "registered repository");
            Arc::new(Repository::<R>::new(entity.clone(), Arc::clone(&self.ctx)))
                as Arc<dyn ManagedRepository>
        });
        downcast::<R>(managed.as_ref())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn state(&self) -> StorageState {
        self.ctx.state()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<StorageState> {
        self.ctx.state.subscribe()
    }

    /// Reports for dirty entries whose flush retries ran out.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FlushFailure> {
        self.ctx.failures.subscribe()
    }

    pub fn backend_name(&self) -> &'static str {
        self.ctx.backend.name()
    }

    /// Probe the backend now instead of waiting for the next scheduled check,
    /// and return the resulting state.
    pub async fn check_health(&self) -> StorageState {
        let health = probe(&self.ctx).await;
        apply_health(&self.ctx, &self.registry, health);
        self.state()
    }

    /// Cache counters per registered entity type, sorted by entity type.
    pub fn cache_stats(&self) -> Vec<(EntityType, CacheStats)> {
        let mut stats: Vec<_> = managed(&self.registry)
            .iter()
            .map(|repo| (repo.entity().clone(), repo.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Write every dirty entry and block until each is durable or has failed.
    ///
    /// Meant for shutdown; it blocks the calling thread.
    pub fn flush_all(&self) -> Result<(), StorageError> {
        block_on(&self.ctx.handle, self.flush_all_async())?
    }

    pub async fn flush_all_async(&self) -> Result<(), StorageError> {
        if self.state() == StorageState::Closed {
            return Err(StorageError::Closed);
        }
        let mut failures = Vec::new();
        for repo in managed(&self.registry) {
            failures.extend(repo.flush_all().await);
        }
        if failures.is_empty() {
            info!("flushed all dirty entries");
            return Ok(());
        }
        for failure in &failures {
            error!(
                entity = %failure.entity,
                key = %failure.key,
                revision = %failure.revision,
                error = %failure.error,
                "entry could not be flushed"
            );
        }
        Err(StorageError::FlushFailed { failures })
    }

    /// Stop background tasks, flush, close the backend and end in `Closed`.
    ///
    /// The backend is closed even when the flush fails; the flush error is
    /// returned. Calling it again is a no-op. Called from inside a
    /// current-thread runtime it fails with `BlockingInRuntime`; use
    /// [`Storage::shutdown_async`] there.
    pub fn shutdown(&self) -> Result<(), StorageError> {
        block_on(&self.ctx.handle, self.shutdown_async())?
    }

    pub async fn shutdown_async(&self) -> Result<(), StorageError> {
        let began = self.ctx.state.send_if_modified(|state| match state {
            StorageState::ShuttingDown | StorageState::Closed => false,
            _ => {
                *state = StorageState::ShuttingDown;
                true
            }
        });
        if !began {
            return Ok(());
        }
        info!("storage shutting down");

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }

        let flushed = self.flush_all_async().await;
        for repo in managed(&self.registry) {
            repo.drained().await;
        }
        let fenced = self.ctx.repair_remote().await;
        if fenced > 0 {
            warn!(fenced, "remote cache keeps entries that could not be invalidated");
        }

        let backend = Arc::clone(&self.ctx.backend);
        if let Err(e) = self.ctx.handle.spawn_blocking(move || backend.close()).await {
            warn!(error = %e, "closing the backend failed");
        }
        self.ctx.state.send_replace(StorageState::Closed);
        info!("storage closed");
        flushed
    }

    fn start_background(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(spawn_flusher(
            Arc::clone(&self.ctx),
            Arc::clone(&self.registry),
            self.config.flush_interval(),
        ));
        tasks.push(spawn_health_checker(
            Arc::clone(&self.ctx),
            Arc::clone(&self.registry),
            self.config.health_check_interval(),
        ));
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if self.state() != StorageState::Closed {
            let dirty: usize = managed(&self.registry).iter().map(|repo| repo.stats().dirty).sum();
            if dirty > 0 {
                warn!(dirty, "storage dropped without shutdown; unflushed writes are lost");
            }
        }
    }
}

fn downcast<R: Record>(managed: &dyn ManagedRepository) -> Result<Repository<R>, StorageError> {
    managed
        .as_any()
        .downcast_ref::<Repository<R>>()
        .cloned()
        .ok_or_else(|| {
            StorageError::InvalidKey(format!(
                "entity type {} is already registered with a different record type",
                R::ENTITY_TYPE
            ))
        })
}
