// ABOUTME: Test backends for quill: an in-memory store and a wrapper that simulates outages.
// ABOUTME: Used by cache and facade tests to exercise failure paths without real I/O.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use quill_core::{EntityKey, EntityType, Envelope, Revision, StorageError};

use crate::backend::{Backend, BackendHealth, RecordIter, check_target_revision};

/// A backend keeping envelopes in a map, with the same revision rules as
/// the real adapters.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<(EntityType, EntityKey), Envelope>>,
    writes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `write_one` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Store an envelope directly, bypassing revision checks.
    pub fn seed(&self, entity: &EntityType, key: &EntityKey, envelope: Envelope) {
        self.records
            .lock()
            .insert((entity.clone(), key.clone()), envelope);
    }

    /// The stored envelope, readable even after `close`.
    pub fn stored(&self, entity: &EntityType, key: &EntityKey) -> Option<Envelope> {
        self.records
            .lock()
            .get(&(entity.clone(), key.clone()))
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.ensure_open()
    }

    fn read_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
    ) -> Result<Option<Envelope>, StorageError> {
        self.ensure_open()?;
        Ok(self
            .records
            .lock()
            .get(&(entity.clone(), key.clone()))
            .cloned())
    }

    fn write_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
        envelope: &Envelope,
        expected: Revision,
    ) -> Result<Revision, StorageError> {
        self.ensure_open()?;
        check_target_revision(entity, key, envelope, expected)?;
        let mut records = self.records.lock();
        let slot = (entity.clone(), key.clone());
        let actual = records
            .get(&slot)
            .map(|stored| stored.revision)
            .unwrap_or(Revision::ZERO);
        if actual != expected {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        records.insert(slot, envelope.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(envelope.revision)
    }

    fn delete(&self, entity: &EntityType, key: &EntityKey) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.records.lock().remove(&(entity.clone(), key.clone()));
        Ok(())
    }

    fn read_all(&self, entity: &EntityType) -> Result<RecordIter<'_>, StorageError> {
        self.ensure_open()?;
        let snapshot: Vec<_> = self
            .records
            .lock()
            .iter()
            .filter(|((stored_entity, _), _)| stored_entity == entity)
            .map(|((_, key), envelope)| Ok((key.clone(), envelope.clone())))
            .collect();
        Ok(Box::new(snapshot.into_iter()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Wraps another backend and fails every call with `BackendUnavailable`
/// while an outage is switched on.
pub struct FlakyBackend {
    inner: Arc<dyn Backend>,
    outage: AtomicBool,
    latency_ms: AtomicU64,
    rejected: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            outage: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Sleep this long before every call.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Calls refused because of an outage.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), StorageError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            thread::sleep(Duration::from_millis(latency));
        }
        if self.outage.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::BackendUnavailable("simulated outage".into()));
        }
        Ok(())
    }
}

impl Backend for FlakyBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.gate()?;
        self.inner.ping()
    }

    fn health_check(&self) -> BackendHealth {
        match self.gate() {
            Ok(()) => self.inner.health_check(),
            Err(_) => BackendHealth::Degraded,
        }
    }

    fn read_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
    ) -> Result<Option<Envelope>, StorageError> {
        self.gate()?;
        self.inner.read_one(entity, key)
    }

    fn write_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
        envelope: &Envelope,
        expected: Revision,
    ) -> Result<Revision, StorageError> {
        self.gate()?;
        self.inner.write_one(entity, key, envelope, expected)
    }

    fn delete(&self, entity: &EntityType, key: &EntityKey) -> Result<(), StorageError> {
        self.gate()?;
        self.inner.delete(entity, key)
    }

    fn read_all(&self, entity: &EntityType) -> Result<RecordIter<'_>, StorageError> {
        self.gate()?;
        self.inner.read_all(entity)
    }

    fn close(&self) {
        self.inner.close();
    }
}
