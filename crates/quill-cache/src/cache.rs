// ABOUTME: The per-entity-type record cache: lookups, staged writes, flush bookkeeping and eviction.
// ABOUTME: Clean entries are evicted least-recently-used first; dirty or pinned entries are never dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use quill_core::{EntityKey, EntityType, Revision, StorageError, Versioned};

use crate::entry::CacheEntry;

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub entries: usize,
    pub dirty: usize,
    pub failed: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// What a flush of one key has to write.
#[derive(Debug, Clone)]
pub struct FlushTicket<R> {
    pub key: EntityKey,
    pub record: Versioned<R>,
    /// Revision the backend must still hold for the write to apply.
    pub expected: Revision,
}

/// Outcome of recording a failed flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushRetry {
    Scheduled { attempts: u32, delay: Duration },
    /// No retries left; the entry stays dirty and is marked failed.
    Exhausted { attempts: u32 },
}

struct Inner<R> {
    entries: LruCache<EntityKey, CacheEntry<R>>,
    /// Pin counts live beside the entries so a key can be pinned before its
    /// record is loaded.
    pins: HashMap<EntityKey, u32>,
    /// Bumped by every explicit removal.
    generation: u64,
}

impl<R> Inner<R> {
    /// Whether `key` holds an entry that has not expired. Pinned entries
    /// never expire.
    fn is_live(&self, key: &EntityKey, ttl: Option<Duration>, now: Instant) -> bool {
        self.entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(ttl, now) || self.pins.contains_key(key))
    }
}

/// Cached records of one entity type.
///
/// Every method takes the internal lock briefly and never performs I/O.
/// Methods that can push the cache over capacity return the keys of dirty
/// entries that must be flushed before they can be evicted.
pub struct RecordCache<R> {
    entity: EntityType,
    capacity: usize,
    ttl: Option<Duration>,
    inner: Mutex<Inner<R>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<R: Clone> RecordCache<R> {
    pub fn new(entity: EntityType, capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entity,
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                pins: HashMap::new(),
                generation: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a live entry, refreshing its recency and access time.
    pub fn get(&self, key: &EntityKey) -> Option<Versioned<R>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let live = inner.is_live(key, self.ttl, now);
        let expired = match inner.entries.get_mut(key) {
            Some(entry) if live => {
                entry.touch();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.record.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.pop(key);
            tracing::debug!(entity = self.entity.as_str(), key = key.as_str(), "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Read an entry without touching recency, expiry or counters.
    pub fn peek(&self, key: &EntityKey) -> Option<Versioned<R>> {
        self.inner
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.record.clone())
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.inner.lock().is_live(key, self.ttl, Instant::now())
    }

    /// Cache a record just read from a lower tier, unless a live entry
    /// already exists.
    pub fn insert_loaded(&self, key: &EntityKey, record: Versioned<R>) -> Vec<EntityKey> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let live = inner.is_live(key, self.ttl, now);
        if live {
            return Vec::new();
        }
        inner.entries.put(key.clone(), CacheEntry::clean(record));
        self.enforce_capacity(&mut inner)
    }

    /// Current removal generation, captured before a bulk read.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Like [`RecordCache::insert_loaded`], but skipped when any entry was
    /// removed since `generation`, so a bulk read cannot resurrect a record
    /// deleted while it ran.
    pub fn warm(&self, key: &EntityKey, record: Versioned<R>, generation: u64) -> Vec<EntityKey> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let live = inner.is_live(key, self.ttl, now);
        if live || inner.generation != generation {
            return Vec::new();
        }
        inner.entries.put(key.clone(), CacheEntry::clean(record));
        self.enforce_capacity(&mut inner)
    }

    /// Replace the entry with a clean copy of what the backend now stores.
    pub fn store_clean(&self, key: &EntityKey, record: Versioned<R>) -> Vec<EntityKey> {
        let mut inner = self.inner.lock();
        inner.entries.put(key.clone(), CacheEntry::clean(record));
        self.enforce_capacity(&mut inner)
    }

    /// Apply a write-behind update.
    ///
    /// `stored` is the backend revision, consulted only when the key has no
    /// entry. Succeeds when `expected` equals the current revision and
    /// returns the new revision.
    pub fn stage_write(
        &self,
        key: &EntityKey,
        value: R,
        expected: Revision,
        stored: Revision,
    ) -> Result<(Revision, Vec<EntityKey>), StorageError> {
        let mut inner = self.inner.lock();
        let (current, persisted) = match inner.entries.peek(key) {
            Some(entry) => (entry.record.revision, entry.persisted),
            None => (stored, stored),
        };
        if expected != current {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                expected,
                actual: current,
            });
        }

        let revision = current.next();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.record = Versioned::new(revision, value);
                entry.dirty = true;
                entry.clear_failures();
                entry.touch();
            }
            None => {
                let mut entry = CacheEntry::clean(Versioned::new(revision, value));
                entry.persisted = persisted;
                entry.dirty = true;
                inner.entries.put(key.clone(), entry);
            }
        }
        let flush = self.enforce_capacity(&mut inner);
        Ok((revision, flush))
    }

    /// Snapshot a dirty entry for flushing, or `None` when it is clean or gone.
    pub fn flush_ticket(&self, key: &EntityKey) -> Option<FlushTicket<R>> {
        let inner = self.inner.lock();
        let entry = inner.entries.peek(key)?;
        entry.dirty.then(|| FlushTicket {
            key: key.clone(),
            record: entry.record.clone(),
            expected: entry.persisted,
        })
    }

    /// Record that the backend now stores `revision`. The entry becomes clean
    /// unless a newer write was staged meanwhile.
    pub fn mark_flushed(&self, key: &EntityKey, revision: Revision) -> Vec<EntityKey> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.peek_mut(key) {
            entry.persisted = entry.persisted.max(revision);
            if entry.record.revision == revision {
                entry.dirty = false;
                entry.clear_failures();
            }
        }
        self.enforce_capacity(&mut inner)
    }

    /// Count a failed flush. `backoff` maps the attempt count to the delay
    /// before the next try, or `None` when retries are exhausted.
    pub fn record_flush_failure(
        &self,
        key: &EntityKey,
        backoff: impl FnOnce(u32) -> Option<Duration>,
    ) -> Option<FlushRetry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.peek_mut(key)?;
        if !entry.dirty {
            return None;
        }
        entry.attempts += 1;
        let attempts = entry.attempts;
        Some(match backoff(attempts) {
            Some(delay) => {
                entry.retry_at = Some(Instant::now() + delay);
                FlushRetry::Scheduled { attempts, delay }
            }
            None => {
                entry.retry_at = None;
                entry.failed = true;
                FlushRetry::Exhausted { attempts }
            }
        })
    }

    pub fn is_flush_due(&self, key: &EntityKey, now: Instant) -> bool {
        self.inner
            .lock()
            .entries
            .peek(key)
            .is_some_and(|entry| entry.is_flush_due(now))
    }

    /// Dirty keys whose flush is due at `now`, least recently used first.
    pub fn due_keys(&self, now: Instant) -> Vec<EntityKey> {
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .filter(|(_, entry)| entry.is_flush_due(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Every dirty key, including ones whose retries are exhausted.
    pub fn dirty_keys(&self) -> Vec<EntityKey> {
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Forget flush failures so every dirty entry is retried from scratch.
    pub fn reset_failures(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut reset = 0;
        for (_, entry) in inner.entries.iter_mut() {
            if entry.dirty && (entry.failed || entry.attempts > 0) {
                entry.clear_failures();
                reset += 1;
            }
        }
        reset
    }

    pub fn remove(&self, key: &EntityKey) -> Option<CacheEntry<R>> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.entries.pop(key)
    }

    pub fn pin(&self, key: &EntityKey) {
        *self.inner.lock().pins.entry(key.clone()).or_default() += 1;
    }

    /// Drop one pin. Returns false when the key was not pinned.
    pub fn unpin(&self, key: &EntityKey) -> bool {
        let mut inner = self.inner.lock();
        let Some(count) = inner.pins.get_mut(key) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            inner.pins.remove(key);
        }
        true
    }

    pub fn is_pinned(&self, key: &EntityKey) -> bool {
        self.inner.lock().pins.contains_key(key)
    }

    /// Drop clean entries whose time-to-live has passed.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<EntityKey> = inner
            .entries
            .iter()
            .filter(|(key, entry)| entry.is_expired(Some(ttl), now) && !inner.pins.contains_key(*key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        expired.len()
    }

    /// Keys of live entries, most recently used first.
    pub fn keys(&self) -> Vec<EntityKey> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(key, _)| inner.is_live(key, self.ttl, now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut stats = CacheStats {
            capacity: self.capacity,
            entries: inner.entries.len(),
            pinned: inner.pins.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for (_, entry) in inner.entries.iter() {
            stats.dirty += usize::from(entry.dirty);
            stats.failed += usize::from(entry.failed);
        }
        stats
    }

    fn enforce_capacity(&self, inner: &mut Inner<R>) -> Vec<EntityKey> {
        let now = Instant::now();
        while inner.entries.len() > self.capacity {
            let victim = inner
                .entries
                .iter()
                .rev()
                .find(|(key, entry)| !entry.dirty && !inner.pins.contains_key(*key))
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    inner.entries.pop(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(entity = self.entity.as_str(), key = key.as_str(), "evicted cache entry");
                }
                None => {
                    let overflow = inner.entries.len() - self.capacity;
                    let flush: Vec<EntityKey> = inner
                        .entries
                        .iter()
                        .rev()
                        .filter(|(key, entry)| entry.is_flush_due(now) && !inner.pins.contains_key(*key))
                        .take(overflow)
                        .map(|(key, _)| key.clone())
                        .collect();
                    if flush.is_empty() {
                        tracing::warn!(
                            entity = self.entity.as_str(),
                            entries = inner.entries.len(),
                            capacity = self.capacity,
                            "cache over capacity with nothing evictable"
                        );
                    }
                    return flush;
                }
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cache(capacity: usize) -> RecordCache<i64> {
        RecordCache::new(EntityType::new("players").unwrap(), capacity, None)
    }

    fn key(raw: &str) -> EntityKey {
        EntityKey::new(raw).unwrap()
    }

    fn clean(revision: u64, value: i64) -> Versioned<i64> {
        Versioned::new(Revision(revision), value)
    }

    #[test]
    fn get_counts_hits_and_misses() {
        let cache = cache(4);
        assert!(cache.get(&key("p1")).is_none());
        cache.insert_loaded(&key("p1"), clean(1, 100));
        assert_eq!(cache.get(&key("p1")).unwrap().value, 100);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn staged_writes_advance_revision_and_reject_stale_expectations() {
        let cache = cache(4);
        let p1 = key("p1");

        let (rev, _) = cache.stage_write(&p1, 100, Revision::ZERO, Revision::ZERO).unwrap();
        assert_eq!(rev, Revision(1));

        let err = cache
            .stage_write(&p1, 150, Revision::ZERO, Revision::ZERO)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                expected: Revision::ZERO,
                actual: Revision(1),
                ..
            }
        ));

        let (rev, _) = cache.stage_write(&p1, 150, Revision(1), Revision::ZERO).unwrap();
        assert_eq!(rev, Revision(2));
        assert_eq!(cache.peek(&p1).unwrap(), clean(2, 150));

        let ticket = cache.flush_ticket(&p1).unwrap();
        assert_eq!(ticket.expected, Revision::ZERO);
        assert_eq!(ticket.record.revision, Revision(2));
    }

    #[test]
    fn stage_write_on_uncached_key_uses_stored_revision() {
        let cache = cache(4);
        let (rev, _) = cache.stage_write(&key("p1"), 5, Revision(7), Revision(7)).unwrap();
        assert_eq!(rev, Revision(8));
        assert_eq!(cache.flush_ticket(&key("p1")).unwrap().expected, Revision(7));
    }

    #[test]
    fn mark_flushed_keeps_newer_staged_write_dirty() {
        let cache = cache(4);
        let p1 = key("p1");
        cache.stage_write(&p1, 1, Revision::ZERO, Revision::ZERO).unwrap();
        let ticket = cache.flush_ticket(&p1).unwrap();
        cache.stage_write(&p1, 2, Revision(1), Revision::ZERO).unwrap();

        cache.mark_flushed(&p1, ticket.record.revision);
        let next = cache.flush_ticket(&p1).unwrap();
        assert_eq!(next.expected, Revision(1));
        assert_eq!(next.record.revision, Revision(2));

        cache.mark_flushed(&p1, Revision(2));
        assert!(cache.flush_ticket(&p1).is_none());
        assert!(cache.dirty_keys().is_empty());
    }

    #[test]
    fn evicts_least_recently_used_clean_entry() {
        let cache = cache(2);
        cache.insert_loaded(&key("a"), clean(1, 1));
        cache.insert_loaded(&key("b"), clean(1, 2));
        cache.get(&key("a"));
        cache.insert_loaded(&key("c"), clean(1, 3));

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let cache = cache(1);
        cache.pin(&key("online"));
        cache.insert_loaded(&key("online"), clean(1, 1));
        cache.insert_loaded(&key("other"), clean(1, 2));

        assert!(cache.contains(&key("online")));
        assert!(!cache.contains(&key("other")));

        assert!(cache.unpin(&key("online")));
        assert!(!cache.unpin(&key("online")));
        cache.insert_loaded(&key("third"), clean(1, 3));
        assert!(!cache.contains(&key("online")));
    }

    #[test]
    fn dirty_entries_are_flushed_before_eviction() {
        let cache = cache(1);
        cache.stage_write(&key("a"), 1, Revision::ZERO, Revision::ZERO).unwrap();
        let (_, flush) = cache.stage_write(&key("b"), 2, Revision::ZERO, Revision::ZERO).unwrap();

        assert_eq!(flush, vec![key("a")]);
        assert_eq!(cache.len(), 2, "dirty entries stay until flushed");

        cache.mark_flushed(&key("a"), Revision(1));
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(&key("a")));
        assert!(cache.contains(&key("b")));
    }

    #[test]
    fn flush_failures_back_off_then_exhaust() {
        let cache = cache(4);
        let p1 = key("p1");
        cache.stage_write(&p1, 1, Revision::ZERO, Revision::ZERO).unwrap();

        let retry = cache
            .record_flush_failure(&p1, |_| Some(Duration::from_secs(60)))
            .unwrap();
        assert!(matches!(retry, FlushRetry::Scheduled { attempts: 1, .. }));
        assert!(cache.due_keys(Instant::now()).is_empty());

        let retry = cache.record_flush_failure(&p1, |_| None).unwrap();
        assert_eq!(retry, FlushRetry::Exhausted { attempts: 2 });
        assert_eq!(cache.stats().failed, 1);
        assert_eq!(cache.dirty_keys(), vec![p1.clone()]);

        assert_eq!(cache.reset_failures(), 1);
        assert_eq!(cache.due_keys(Instant::now()), vec![p1]);
    }

    #[test]
    fn clean_entries_expire_after_ttl() {
        let cache = RecordCache::new(
            EntityType::new("players").unwrap(),
            8,
            Some(Duration::from_millis(20)),
        );
        cache.insert_loaded(&key("clean"), clean(1, 1));
        cache.stage_write(&key("dirty"), 2, Revision::ZERO, Revision::ZERO).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(cache.get(&key("clean")).is_none());
        assert_eq!(cache.get(&key("dirty")).unwrap().value, 2);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.keys(), vec![key("dirty")]);
    }

    #[test]
    fn pinned_entries_outlive_their_ttl() {
        let cache = RecordCache::new(
            EntityType::new("players").unwrap(),
            8,
            Some(Duration::from_millis(10)),
        );
        let online = key("online");
        cache.pin(&online);
        cache.insert_loaded(&online, clean(1, 7));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.contains(&online));
        assert_eq!(cache.keys(), vec![online.clone()]);
        assert_eq!(cache.get(&online).unwrap().value, 7);
        assert_eq!(cache.len(), 1);

        // Once released, the idle entry expires as usual.
        cache.unpin(&online);
        thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&online).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn warm_skips_after_concurrent_removal() {
        let cache = cache(4);
        let generation = cache.generation();
        cache.insert_loaded(&key("p1"), clean(1, 1));
        cache.remove(&key("p1"));

        cache.warm(&key("p1"), clean(1, 1), generation);
        assert!(!cache.contains(&key("p1")));

        cache.warm(&key("p1"), clean(1, 1), cache.generation());
        assert!(cache.contains(&key("p1")));
    }

    #[test]
    fn insert_loaded_does_not_clobber_live_entry() {
        let cache = cache(4);
        cache.stage_write(&key("p1"), 9, Revision::ZERO, Revision::ZERO).unwrap();
        cache.insert_loaded(&key("p1"), clean(0, 1));
        assert_eq!(cache.peek(&key("p1")).unwrap(), clean(1, 9));
    }
}
