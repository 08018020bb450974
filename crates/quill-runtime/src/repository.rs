// ABOUTME: Typed repositories: get, put, delete and bulk load for one entity type, routed through per-key actors.
// ABOUTME: Implements the cache read path, write-through and write-behind writes, and flushing of dirty entries.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use quill_cache::{CacheStats, FlushRetry, RecordCache, RemoteCache, remote_key};
use quill_core::{
    EntityKey, EntityType, Envelope, FlushFailure, Record, Revision, StorageError, Versioned,
    decode, encode,
};
use quill_store::Backend;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::actor::KeyedExecutor;
use crate::config::{CacheMode, DegradedWrites};
use crate::pending::{LoadAll, LoadGuard, LoadItem, Pending};
use crate::retry::RetryPolicy;
use crate::storage::StorageState;

/// Records buffered between a bulk-load producer and its consumer.
const LOAD_BUFFER: usize = 64;

/// Read-modify-write rounds before `update` gives up on conflicts.
const UPDATE_ATTEMPTS: u32 = 8;

/// The shared remote tier and how records are keyed in it.
pub(crate) struct Remote {
    pub(crate) cache: Arc<dyn RemoteCache>,
    pub(crate) prefix: String,
    pub(crate) ttl: Duration,
    /// Remote keys whose copy may be older than the backend because updating
    /// or deleting it failed. Reads skip them until the copy is dropped.
    fenced: Mutex<HashSet<String>>,
}

impl Remote {
    pub(crate) fn new(cache: Arc<dyn RemoteCache>, prefix: String, ttl: Duration) -> Self {
        Self {
            cache,
            prefix,
            ttl,
            fenced: Mutex::new(HashSet::new()),
        }
    }

    fn is_fenced(&self, remote_key: &str) -> bool {
        self.fenced.lock().contains(remote_key)
    }

    fn fence(&self, remote_key: String) {
        self.fenced.lock().insert(remote_key);
    }

    fn unfence(&self, remote_key: &str) {
        self.fenced.lock().remove(remote_key);
    }
}

/// Storage-wide collaborators and settings shared by every repository.
pub(crate) struct Context {
    pub(crate) handle: Handle,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) remote: Option<Remote>,
    pub(crate) mode: CacheMode,
    pub(crate) degraded_writes: DegradedWrites,
    pub(crate) capacity: usize,
    pub(crate) ttl: Option<Duration>,
    pub(crate) retry: RetryPolicy,
    pub(crate) operation_timeout: Duration,
    pub(crate) state: watch::Sender<StorageState>,
    pub(crate) failures: broadcast::Sender<FlushFailure>,
}

impl Context {
    pub(crate) fn state(&self) -> StorageState {
        *self.state.borrow()
    }

    /// The current state, or `Closed` when calls are no longer accepted.
    fn check_open(&self) -> Result<StorageState, StorageError> {
        match self.state() {
            state @ (StorageState::Ready | StorageState::Degraded) => Ok(state),
            StorageState::Uninitialized | StorageState::ShuttingDown | StorageState::Closed => {
                Err(StorageError::Closed)
            }
        }
    }

    /// Retry policy for backend calls made on behalf of a caller. A degraded
    /// backend gets a single try so callers fail fast.
    fn caller_retry(&self) -> RetryPolicy {
        if self.state() == StorageState::Degraded {
            RetryPolicy::once()
        } else {
            self.retry
        }
    }

    /// Run one backend call on a blocking worker, bounded by the operation timeout.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Backend) -> Result<T, StorageError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let task = self.handle.spawn_blocking(move || f(backend.as_ref()));
        match tokio::time::timeout(self.operation_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StorageError::BackendUnavailable(format!(
                "backend worker failed: {join}"
            ))),
            Err(_) => Err(StorageError::Timeout(self.operation_timeout)),
        }
    }

    async fn call_with_retry<T, F>(
        &self,
        what: &str,
        policy: RetryPolicy,
        f: F,
    ) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: Fn(&dyn Backend) -> Result<T, StorageError> + Clone + Send + 'static,
    {
        policy.run(what, move || self.call(f.clone())).await
    }

    async fn remote_get(&self, entity: &EntityType, key: &EntityKey) -> Option<Envelope> {
        let remote = self.remote.as_ref()?;
        let remote_key = remote_key(&remote.prefix, entity, key);
        if remote.is_fenced(&remote_key) {
            return None;
        }
        match remote.cache.get(&remote_key).await {
            Ok(Some(text)) => match serde_json::from_str(&text) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(key = %remote_key, error = %e, "ignoring unreadable remote cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %remote_key, error = %e, "remote cache read failed");
                None
            }
        }
    }

    /// Publish what the backend now stores. On failure the remote copy is
    /// fenced until a later write or [`Context::repair_remote`] replaces it.
    async fn remote_put(&self, entity: &EntityType, key: &EntityKey, envelope: &Envelope) {
        let Some(remote) = self.remote.as_ref() else {
            return;
        };
        let remote_key = remote_key(&remote.prefix, entity, key);
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %remote_key, error = %e, "could not serialize envelope for remote cache");
                remote.fence(remote_key);
                return;
            }
        };
        match remote.cache.set(&remote_key, text, remote.ttl).await {
            Ok(()) => remote.unfence(&remote_key),
            Err(e) => {
                warn!(key = %remote_key, error = %e, "remote cache write failed; fencing its copy");
                remote.fence(remote_key);
            }
        }
    }

    async fn remote_delete(&self, entity: &EntityType, key: &EntityKey) {
        let Some(remote) = self.remote.as_ref() else {
            return;
        };
        let remote_key = remote_key(&remote.prefix, entity, key);
        match remote.cache.delete(&remote_key).await {
            Ok(()) => remote.unfence(&remote_key),
            Err(e) => {
                warn!(
                    key = %remote_key,
                    error = %e,
                    "remote cache delete failed; fencing its copy"
                );
                remote.fence(remote_key);
            }
        }
    }

    /// Retry dropping fenced remote copies. Returns how many stay fenced.
    pub(crate) async fn repair_remote(&self) -> usize {
        let Some(remote) = self.remote.as_ref() else {
            return 0;
        };
        let fenced: Vec<String> = remote.fenced.lock().iter().cloned().collect();
        for remote_key in fenced {
            match remote.cache.delete(&remote_key).await {
                Ok(()) => {
                    remote.unfence(&remote_key);
                    debug!(key = %remote_key, "dropped stale remote cache entry");
                }
                Err(e) => {
                    debug!(key = %remote_key, error = %e, "remote cache still unavailable");
                    break;
                }
            }
        }
        remote.fenced.lock().len()
    }
}

fn rejected_while_degraded() -> StorageError {
    StorageError::BackendUnavailable("backend is degraded; writes are rejected".to_string())
}

struct RepoInner<R: Record> {
    entity: EntityType,
    cache: RecordCache<R>,
    executor: KeyedExecutor,
    ctx: Arc<Context>,
    loading: Arc<AtomicBool>,
}

/// Handle to the records of one entity type.
///
/// Cheap to clone; every clone shares the same cache and actors. Operations
/// return immediately with a [`Pending`] that resolves once the work for that
/// key has run.
pub struct Repository<R: Record> {
    inner: Arc<RepoInner<R>>,
}

impl<R: Record> Clone for Repository<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record> std::fmt::Debug for Repository<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &self.inner.entity)
            .field("cached", &self.inner.cache.len())
            .finish()
    }
}

impl<R: Record> Repository<R> {
    pub(crate) fn new(entity: EntityType, ctx: Arc<Context>) -> Self {
        let cache = RecordCache::new(entity.clone(), ctx.capacity, ctx.ttl);
        Self {
            inner: Arc::new(RepoInner {
                entity,
                cache,
                executor: KeyedExecutor::new(ctx.handle.clone()),
                ctx,
                loading: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn entity(&self) -> &EntityType {
        &self.inner.entity
    }

    /// Read a record. Fails with `NotFound` when no tier holds it.
    pub fn get(&self, key: &EntityKey) -> Pending<Versioned<R>> {
        let entity = self.inner.entity.to_string();
        let missing = key.to_string();
        self.read(key, move |found| {
            found.ok_or(StorageError::NotFound {
                entity,
                key: missing,
            })
        })
    }

    /// Read a record, or `default` at revision zero when none is stored.
    pub fn get_or_default(&self, key: &EntityKey, default: R) -> Pending<Versioned<R>> {
        self.read(key, move |found| {
            Ok(found.unwrap_or_else(|| Versioned::new(Revision::ZERO, default)))
        })
    }

    /// Write `value` if the current revision is `expected` (`Revision::ZERO`
    /// for a new record). Resolves to the new revision or `Conflict`.
    pub fn put(&self, key: &EntityKey, value: R, expected: Revision) -> Pending<Revision> {
        let ctx = &self.inner.ctx;
        let degraded = match ctx.check_open() {
            Ok(state) => state == StorageState::Degraded,
            Err(e) => return Pending::ready(Err(e)),
        };
        let reject = match ctx.mode {
            CacheMode::WriteThrough => degraded,
            CacheMode::WriteBehind => degraded && ctx.degraded_writes == DegradedWrites::Reject,
        };
        if reject {
            return Pending::ready(Err(rejected_while_degraded()));
        }

        self.submit(key, move |inner, key| async move {
            match inner.ctx.mode {
                CacheMode::WriteThrough => inner.write_through(&key, value, expected).await,
                CacheMode::WriteBehind => inner.stage(&key, value, expected).await,
            }
        })
    }

    /// Remove a record from every tier. Deleting a missing record succeeds.
    pub fn delete(&self, key: &EntityKey) -> Pending<()> {
        match self.inner.ctx.check_open() {
            Ok(StorageState::Degraded) => return Pending::ready(Err(rejected_while_degraded())),
            Ok(_) => {}
            Err(e) => return Pending::ready(Err(e)),
        }
        self.submit(key, |inner, key| async move { inner.remove(&key).await })
    }

    /// Read-modify-write: apply `f` to the current value (or `R::default()`)
    /// and put the result, re-reading on conflicts.
    pub fn update<F>(&self, key: &EntityKey, mut f: F) -> Pending<Versioned<R>>
    where
        R: Default,
        F: FnMut(R) -> R + Send + 'static,
    {
        if let Err(e) = self.inner.ctx.check_open() {
            return Pending::ready(Err(e));
        }
        let (reply, pending) = Pending::channel();
        let repo = self.clone();
        let key = key.clone();
        self.inner.ctx.handle.spawn(async move {
            if reply.is_closed() {
                return;
            }
            let result = repo.update_rounds(&key, &mut f).await;
            let _ = reply.send(result);
        });
        pending
    }

    async fn update_rounds<F>(&self, key: &EntityKey, f: &mut F) -> Result<Versioned<R>, StorageError>
    where
        R: Default,
        F: FnMut(R) -> R + Send,
    {
        let mut round = 0;
        loop {
            round += 1;
            let current = self.get_or_default(key, R::default()).await?;
            let next = f(current.value);
            match self.put(key, next.clone(), current.revision).await {
                Ok(revision) => return Ok(Versioned::new(revision, next)),
                Err(StorageError::Conflict { .. }) if round < UPDATE_ATTEMPTS => {
                    debug!(entity = %self.inner.entity, key = %key, round, "update conflicted, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream every stored record of this type, warming the cache as it goes.
    ///
    /// Cached values win over stored ones, and dirty records the backend has
    /// not seen yet are included at the end. Only one load per entity type
    /// may run at a time.
    pub fn load_all(&self) -> LoadAll<R> {
        if let Err(e) = self.inner.ctx.check_open() {
            return LoadAll::failed(e);
        }
        let Some(guard) = LoadGuard::acquire(&self.inner.loading) else {
            return LoadAll::failed(StorageError::LoadInProgress(self.inner.entity.to_string()));
        };

        let (tx, rx) = mpsc::channel(LOAD_BUFFER);
        let inner = Arc::clone(&self.inner);
        self.inner.ctx.handle.spawn_blocking(move || {
            inner.produce_all(&tx);
            // Release the flag before the consumer can observe the end of the stream.
            drop(guard);
            drop(tx);
        });
        LoadAll::new(rx)
    }

    /// Flush the key if dirty, then drop it from the cache.
    pub fn invalidate(&self, key: &EntityKey) -> Pending<()> {
        if let Err(e) = self.inner.ctx.check_open() {
            return Pending::ready(Err(e));
        }
        self.submit(key, |inner, key| async move {
            if inner.cache.flush_ticket(&key).is_some() {
                inner.flush_key(&key, true).await?;
            }
            inner.cache.remove(&key);
            Ok(())
        })
    }

    /// Write the key's dirty entry now instead of waiting for the flusher.
    pub fn flush(&self, key: &EntityKey) -> Pending<()> {
        if let Err(e) = self.inner.ctx.check_open() {
            return Pending::ready(Err(e));
        }
        self.submit(key, |inner, key| async move { inner.flush_key(&key, true).await })
    }

    /// Keep the key in memory until a matching [`Repository::unpin`].
    pub fn pin(&self, key: &EntityKey) {
        self.inner.cache.pin(key);
    }

    /// Release one pin. Returns whether the key is now unpinned.
    pub fn unpin(&self, key: &EntityKey) -> bool {
        self.inner.cache.unpin(key)
    }

    pub fn is_pinned(&self, key: &EntityKey) -> bool {
        self.inner.cache.is_pinned(key)
    }

    pub fn contains_cached(&self, key: &EntityKey) -> bool {
        self.inner.cache.contains(key)
    }

    pub fn cached_keys(&self) -> Vec<EntityKey> {
        self.inner.cache.keys()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    fn read<T, F>(&self, key: &EntityKey, finish: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Option<Versioned<R>>) -> Result<T, StorageError> + Send + 'static,
    {
        if let Err(e) = self.inner.ctx.check_open() {
            return Pending::ready(Err(e));
        }
        if let Some(found) = self.inner.cache.get(key) {
            return Pending::ready(finish(Some(found)));
        }
        self.submit(key, move |inner, key| async move { inner.load(&key).await.and_then(finish) })
    }

    /// Queue `job` on the key's actor and hand back its completion handle.
    fn submit<T, F, Fut>(&self, key: &EntityKey, job: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<RepoInner<R>>, EntityKey) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StorageError>> + Send + 'static,
    {
        let (reply, pending) = Pending::channel();
        let inner = Arc::clone(&self.inner);
        let job_key = key.clone();
        self.inner.executor.submit(
            key,
            async move {
                if reply.is_closed() {
                    debug!(entity = %inner.entity, key = %job_key, "skipping cancelled operation");
                    return;
                }
                let result = job(inner, job_key).await;
                let _ = reply.send(result);
            }
            .boxed(),
        );
        pending
    }
}

impl<R: Record> RepoInner<R> {
    /// Resolve a cache miss: remote tier first, then the backend.
    async fn load(self: &Arc<Self>, key: &EntityKey) -> Result<Option<Versioned<R>>, StorageError> {
        // An earlier job on this key may have loaded it since the caller missed.
        if self.cache.contains(key) {
            if let Some(found) = self.cache.peek(key) {
                return Ok(Some(found));
            }
        }

        if let Some(envelope) = self.ctx.remote_get(&self.entity, key).await {
            match decode::<R>(key.as_str(), envelope) {
                Ok(found) => {
                    self.schedule_flushes(self.cache.insert_loaded(key, found.clone()));
                    return Ok(Some(found));
                }
                Err(e) => warn!(entity = %self.entity, key = %key, error = %e, "ignoring undecodable remote entry"),
            }
        }

        let (entity, stored_key) = (self.entity.clone(), key.clone());
        let stored = self
            .ctx
            .call_with_retry("read", self.ctx.caller_retry(), move |backend| {
                backend.read_one(&entity, &stored_key)
            })
            .await?;
        let Some(envelope) = stored else {
            return Ok(None);
        };
        let found = decode::<R>(key.as_str(), envelope.clone())?;
        self.schedule_flushes(self.cache.insert_loaded(key, found.clone()));
        self.ctx.remote_put(&self.entity, key, &envelope).await;
        Ok(Some(found))
    }

    async fn stage(self: &Arc<Self>, key: &EntityKey, value: R, expected: Revision) -> Result<Revision, StorageError> {
        // Without an entry the stored revision decides whether `expected` holds.
        let stored = if self.cache.peek(key).is_some() {
            Revision::ZERO
        } else {
            self.load(key)
                .await?
                .map_or(Revision::ZERO, |found| found.revision)
        };
        let (revision, evict) = self.cache.stage_write(key, value, expected, stored)?;
        self.schedule_flushes(evict);
        debug!(entity = %self.entity, key = %key, revision = %revision, "staged write");
        Ok(revision)
    }

    async fn write_through(
        self: &Arc<Self>,
        key: &EntityKey,
        value: R,
        expected: Revision,
    ) -> Result<Revision, StorageError> {
        let record = Versioned::new(expected.next(), value);
        let envelope = encode(key.as_str(), &record)?;
        match self.persist(key, &envelope, expected, self.ctx.caller_retry()).await {
            Ok(revision) => {
                self.schedule_flushes(self.cache.store_clean(key, record));
                self.ctx.remote_put(&self.entity, key, &envelope).await;
                Ok(revision)
            }
            Err(e) => {
                if matches!(e, StorageError::Conflict { .. }) {
                    // Our copies are stale; the next read reloads from the backend.
                    self.cache.remove(key);
                    self.ctx.remote_delete(&self.entity, key).await;
                }
                Err(e)
            }
        }
    }

    async fn remove(self: &Arc<Self>, key: &EntityKey) -> Result<(), StorageError> {
        let (entity, stored_key) = (self.entity.clone(), key.clone());
        self.ctx
            .call_with_retry("delete", self.ctx.caller_retry(), move |backend| {
                backend.delete(&entity, &stored_key)
            })
            .await?;
        self.cache.remove(key);
        self.ctx.remote_delete(&self.entity, key).await;
        debug!(entity = %self.entity, key = %key, "deleted");
        Ok(())
    }

    /// Conditionally write `envelope`. A conflict whose stored revision and
    /// data equal the envelope means an earlier timed-out try already landed.
    async fn persist(
        &self,
        key: &EntityKey,
        envelope: &Envelope,
        expected: Revision,
        policy: RetryPolicy,
    ) -> Result<Revision, StorageError> {
        let (entity, stored_key, payload) = (self.entity.clone(), key.clone(), envelope.clone());
        let err = match self
            .ctx
            .call_with_retry("write", policy, move |backend| {
                backend.write_one(&entity, &stored_key, &payload, expected)
            })
            .await
        {
            Ok(revision) => return Ok(revision),
            Err(err) => err,
        };

        if let StorageError::Conflict { actual, .. } = &err {
            if *actual == envelope.revision && self.stored_matches(key, envelope).await {
                return Ok(envelope.revision);
            }
        }
        Err(err)
    }

    async fn stored_matches(&self, key: &EntityKey, envelope: &Envelope) -> bool {
        let (entity, stored_key) = (self.entity.clone(), key.clone());
        match self.ctx.call(move |backend| backend.read_one(&entity, &stored_key)).await {
            Ok(Some(stored)) => stored.revision == envelope.revision && stored.data == envelope.data,
            _ => false,
        }
    }

    /// Write one dirty entry. Scheduled flushes respect the entry's backoff
    /// and make a single try; forced flushes always run and retry in-line.
    async fn flush_key(self: &Arc<Self>, key: &EntityKey, forced: bool) -> Result<(), StorageError> {
        if !forced && !self.cache.is_flush_due(key, Instant::now()) {
            return Ok(());
        }
        let Some(ticket) = self.cache.flush_ticket(key) else {
            return Ok(());
        };
        let revision = ticket.record.revision;

        let envelope = match encode(key.as_str(), &ticket.record) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.flush_failed(key, revision, &e);
                return Err(e);
            }
        };
        let policy = if forced { self.ctx.retry } else { RetryPolicy::once() };

        match self.persist(key, &envelope, ticket.expected, policy).await {
            Ok(_) => {
                self.schedule_flushes(self.cache.mark_flushed(key, revision));
                self.ctx.remote_put(&self.entity, key, &envelope).await;
                debug!(entity = %self.entity, key = %key, revision = %revision, "flushed");
                Ok(())
            }
            Err(e) => {
                if matches!(e, StorageError::Conflict { .. }) {
                    self.ctx.remote_delete(&self.entity, key).await;
                }
                self.flush_failed(key, revision, &e);
                Err(e)
            }
        }
    }

    fn flush_failed(&self, key: &EntityKey, revision: Revision, err: &StorageError) {
        let retry = self.ctx.retry;
        let outcome = if err.is_retryable() {
            self.cache.record_flush_failure(key, |failures| retry.next_delay(failures))
        } else {
            self.cache.record_flush_failure(key, |_| None)
        };

        match outcome {
            Some(FlushRetry::Scheduled { attempts, delay }) => {
                warn!(
                    entity = %self.entity,
                    key = %key,
                    attempts,
                    error = %err,
                    "flush failed, retrying in {delay:?}"
                );
            }
            Some(FlushRetry::Exhausted { attempts }) => {
                error!(
                    entity = %self.entity,
                    key = %key,
                    revision = %revision,
                    attempts,
                    error = %err,
                    "flush failed permanently; entry stays dirty"
                );
                let _ = self.ctx.failures.send(FlushFailure {
                    entity: self.entity.to_string(),
                    key: key.to_string(),
                    revision,
                    error: err.to_string(),
                });
            }
            None => {}
        }
    }

    /// Queue flushes on the keys' own actors.
    fn schedule_flushes(self: &Arc<Self>, keys: Vec<EntityKey>) {
        for key in keys {
            let inner = Arc::clone(self);
            let job_key = key.clone();
            self.executor.submit(
                &key,
                async move {
                    let _ = inner.flush_key(&job_key, false).await;
                }
                .boxed(),
            );
        }
    }

    /// Bulk-load producer; runs on a blocking worker.
    fn produce_all(self: &Arc<Self>, tx: &mpsc::Sender<LoadItem<R>>) {
        let generation = self.cache.generation();
        let records = match self.ctx.backend.read_all(&self.entity) {
            Ok(records) => records,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        let mut seen = HashSet::new();
        for item in records {
            let item = item.and_then(|(key, envelope)| {
                let found = decode::<R>(key.as_str(), envelope)?;
                Ok((key, found))
            });
            let item = match item {
                Ok((key, found)) => {
                    seen.insert(key.clone());
                    let current = match self.cache.peek(&key) {
                        Some(cached) => cached,
                        None => {
                            self.schedule_flushes(self.cache.warm(&key, found.clone(), generation));
                            found
                        }
                    };
                    Ok((key, current))
                }
                Err(e) => {
                    warn!(entity = %self.entity, error = %e, "bulk load hit an unreadable record");
                    Err(e)
                }
            };
            if tx.blocking_send(item).is_err() {
                debug!(entity = %self.entity, "bulk load cancelled");
                return;
            }
        }

        for key in self.cache.dirty_keys() {
            if seen.contains(&key) {
                continue;
            }
            if let Some(cached) = self.cache.peek(&key) {
                seen.insert(key.clone());
                if tx.blocking_send(Ok((key, cached))).is_err() {
                    return;
                }
            }
        }
        info!(entity = %self.entity, records = seen.len(), "bulk load complete");
    }
}

/// The type-erased view the storage facade and its background tasks use.
#[async_trait]
pub(crate) trait ManagedRepository: Send + Sync {
    fn entity(&self) -> &EntityType;

    fn as_any(&self) -> &dyn Any;

    /// Queue flushes for every dirty entry whose backoff has elapsed.
    fn flush_due(&self) -> usize;

    /// Flush every dirty entry and wait, reporting the ones that failed.
    async fn flush_all(&self) -> Vec<FlushFailure>;

    /// Give permanently failed entries a fresh set of attempts.
    fn reset_failures(&self) -> usize;

    fn purge_expired(&self) -> usize;

    fn stats(&self) -> CacheStats;

    /// Wait until every queued job has finished.
    async fn drained(&self);
}

#[async_trait]
impl<R: Record> ManagedRepository for Repository<R> {
    fn entity(&self) -> &EntityType {
        &self.inner.entity
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn flush_due(&self) -> usize {
        let due = self.inner.cache.due_keys(Instant::now());
        let count = due.len();
        self.inner.schedule_flushes(due);
        count
    }

    async fn flush_all(&self) -> Vec<FlushFailure> {
        let waits: Vec<_> = self
            .inner
            .cache
            .dirty_keys()
            .into_iter()
            .map(|key| {
                let pending = self.submit(&key, |inner, key| async move {
                    inner.flush_key(&key, true).await
                });
                (key, pending)
            })
            .collect();

        let mut failures = Vec::new();
        for (key, pending) in waits {
            if let Err(e) = pending.await {
                let revision = self
                    .inner
                    .cache
                    .peek(&key)
                    .map_or(Revision::ZERO, |record| record.revision);
                failures.push(FlushFailure {
                    entity: self.inner.entity.to_string(),
                    key: key.to_string(),
                    revision,
                    error: e.to_string(),
                });
            }
        }
        failures
    }

    fn reset_failures(&self) -> usize {
        self.inner.cache.reset_failures()
    }

    fn purge_expired(&self) -> usize {
        self.inner.cache.purge_expired()
    }

    fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    async fn drained(&self) {
        self.inner.executor.drained().await;
    }
}
