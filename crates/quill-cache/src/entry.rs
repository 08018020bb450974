// ABOUTME: A single cached record with its access time, dirty flag and flush bookkeeping.
// ABOUTME: Entries are owned by the cache; callers only ever see clones of the record.

use std::time::{Duration, Instant};

use quill_core::{Revision, Versioned};

#[derive(Debug, Clone)]
pub struct CacheEntry<R> {
    pub record: Versioned<R>,
    pub last_access: Instant,
    /// The record holds a write the backend has not seen yet.
    pub dirty: bool,
    /// Revision the backend currently stores for this key.
    pub persisted: Revision,
    /// Consecutive failed flush attempts.
    pub attempts: u32,
    pub retry_at: Option<Instant>,
    /// Retries are exhausted; only `flush_all` or a backend recovery will try again.
    pub failed: bool,
}

impl<R> CacheEntry<R> {
    /// An entry mirroring what the backend stores.
    pub fn clean(record: Versioned<R>) -> Self {
        let persisted = record.revision;
        Self {
            record,
            last_access: Instant::now(),
            dirty: false,
            persisted,
            attempts: 0,
            retry_at: None,
            failed: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Dirty entries never expire.
    pub fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match ttl {
            Some(ttl) => !self.dirty && now.saturating_duration_since(self.last_access) > ttl,
            None => false,
        }
    }

    /// Dirty, not given up on, and past any backoff.
    pub fn is_flush_due(&self, now: Instant) -> bool {
        self.dirty && !self.failed && self.retry_at.is_none_or(|at| at <= now)
    }

    pub fn clear_failures(&mut self) {
        self.attempts = 0;
        self.retry_at = None;
        self.failed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_entry_mirrors_backend_revision() {
        let entry = CacheEntry::clean(Versioned::new(Revision(3), "v"));
        assert!(!entry.dirty);
        assert_eq!(entry.persisted, Revision(3));
    }

    #[test]
    fn dirty_entries_never_expire() {
        let mut entry = CacheEntry::clean(Versioned::new(Revision(1), 1));
        let later = Instant::now() + Duration::from_secs(60);
        assert!(entry.is_expired(Some(Duration::from_secs(1)), later));
        assert!(!entry.is_expired(None, later));

        entry.dirty = true;
        assert!(!entry.is_expired(Some(Duration::from_secs(1)), later));
    }

    #[test]
    fn flush_due_respects_backoff_and_failure() {
        let now = Instant::now();
        let mut entry = CacheEntry::clean(Versioned::new(Revision(1), 1));
        assert!(!entry.is_flush_due(now));

        entry.dirty = true;
        assert!(entry.is_flush_due(now));

        entry.retry_at = Some(now + Duration::from_secs(5));
        assert!(!entry.is_flush_due(now));
        assert!(entry.is_flush_due(now + Duration::from_secs(5)));

        entry.failed = true;
        assert!(!entry.is_flush_due(now + Duration::from_secs(5)));
        entry.clear_failures();
        assert!(entry.is_flush_due(now));
    }
}
