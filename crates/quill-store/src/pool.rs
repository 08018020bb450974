// ABOUTME: Bounded connection pool that lends live backend connections to worker threads.
// ABOUTME: Keeps a warm minimum, caps at a maximum, probes idle slots and degrades on sustained outage.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use quill_core::StorageError;

/// Creates and validates connections for a [`Pool`].
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection, StorageError>;

    /// A lightweight round trip proving the connection still works.
    fn probe(&self, conn: &mut Self::Connection) -> Result<(), StorageError>;
}

/// Sizing and timing parameters for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened at startup and restored by each health cycle.
    pub min: usize,
    /// Hard cap on simultaneously live connections.
    pub max: usize,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    /// Consecutive all-failing health cycles before the pool degrades.
    pub degraded_after: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Healthy,
    /// Every probe failed for `degraded_after` cycles; acquire fails fast.
    Degraded,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub lent: usize,
    pub peak_live: usize,
    pub created: u64,
    pub replaced: u64,
    pub state: PoolState,
}

struct Slot<C> {
    id: u64,
    conn: C,
    last_checked: Instant,
}

struct PoolInner<C> {
    idle: VecDeque<Slot<C>>,
    /// Idle plus lent plus reserved-while-connecting.
    live: usize,
    peak_live: usize,
    state: PoolState,
    failed_cycles: u32,
    next_id: u64,
}

impl<C> PoolInner<C> {
    fn reserve(&mut self) -> u64 {
        self.live += 1;
        self.peak_live = self.peak_live.max(self.live);
        self.next_id += 1;
        self.next_id
    }
}

/// A bounded pool of connections produced by `M`.
pub struct Pool<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    inner: Mutex<PoolInner<M::Connection>>,
    available: Condvar,
    created: AtomicU64,
    replaced: AtomicU64,
}

impl<M: ConnectionManager> Pool<M> {
    /// Build a pool and open `config.min` connections. Fails when the backend
    /// cannot be reached at all.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self, StorageError> {
        let max = config.max.max(1);
        let config = PoolConfig {
            min: config.min.min(max),
            max,
            ..config
        };

        let pool = Self {
            manager,
            config,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                live: 0,
                peak_live: 0,
                state: PoolState::Healthy,
                failed_cycles: 0,
                next_id: 0,
            }),
            available: Condvar::new(),
            created: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
        };

        for _ in 0..pool.config.min {
            let id = pool.inner.lock().reserve();
            match pool.manager.connect() {
                Ok(conn) => {
                    pool.created.fetch_add(1, Ordering::Relaxed);
                    pool.inner.lock().idle.push_back(Slot {
                        id,
                        conn,
                        last_checked: Instant::now(),
                    });
                }
                Err(e) => {
                    pool.inner.lock().live -= 1;
                    return Err(StorageError::BackendUnavailable(format!(
                        "could not open initial connection: {e}"
                    )));
                }
            }
        }

        tracing::info!(
            min = pool.config.min,
            max = pool.config.max,
            "connection pool ready"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a connection, waiting up to `timeout` for one to free up.
    ///
    /// Blocks the calling thread; never call this from the game loop.
    pub fn acquire(&self, timeout: Duration) -> Result<PooledConnection<'_, M>, StorageError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut inner = self.inner.lock();

        loop {
            match inner.state {
                PoolState::Closed => return Err(StorageError::Closed),
                PoolState::Degraded => {
                    return Err(StorageError::BackendUnavailable(
                        "connection pool is degraded".to_string(),
                    ));
                }
                PoolState::Healthy => {}
            }

            if let Some(slot) = inner.idle.pop_front() {
                return Ok(self.lend(slot));
            }

            if inner.live < self.config.max {
                let id = inner.reserve();
                drop(inner);
                return match self.manager.connect() {
                    Ok(conn) => {
                        self.created.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(slot = id, "opened pooled connection");
                        Ok(self.lend(Slot {
                            id,
                            conn,
                            last_checked: Instant::now(),
                        }))
                    }
                    Err(e) => {
                        self.inner.lock().live -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            if self.available.wait_until(&mut inner, deadline).timed_out() {
                if let Some(slot) = inner.idle.pop_front() {
                    return Ok(self.lend(slot));
                }
                tracing::warn!(waited = ?started.elapsed(), "connection pool exhausted");
                return Err(StorageError::PoolExhausted {
                    waited: started.elapsed(),
                });
            }
        }
    }

    fn lend(&self, slot: Slot<M::Connection>) -> PooledConnection<'_, M> {
        PooledConnection {
            pool: self,
            slot: Some(slot),
        }
    }

    fn give_back(&self, slot: Slot<M::Connection>) {
        let mut inner = self.inner.lock();
        if inner.state == PoolState::Closed {
            inner.live -= 1;
            drop(inner);
            drop(slot);
        } else {
            inner.idle.push_back(slot);
            drop(inner);
        }
        self.available.notify_one();
    }

    fn forget(&self, slot: Slot<M::Connection>) {
        tracing::debug!(slot = slot.id, "discarding pooled connection");
        drop(slot);
        self.inner.lock().live -= 1;
        self.available.notify_one();
    }

    /// Run one health-check cycle: probe idle slots, replace broken ones,
    /// top the pool up to `min`, and update the degraded state.
    pub fn health_check(&self) -> PoolState {
        let now = Instant::now();
        let recheck_after = self.config.health_check_interval / 2;

        let due: Vec<Slot<M::Connection>> = {
            let mut inner = self.inner.lock();
            if inner.state == PoolState::Closed {
                return PoolState::Closed;
            }
            let (due, fresh): (Vec<_>, Vec<_>) = inner
                .idle
                .drain(..)
                .partition(|slot| now.duration_since(slot.last_checked) >= recheck_after);
            inner.idle.extend(fresh);
            due
        };

        let mut attempts = 0usize;
        let mut successes = 0usize;
        let mut lost = 0usize;
        let mut healthy = Vec::with_capacity(due.len());

        for mut slot in due {
            attempts += 1;
            match self.manager.probe(&mut slot.conn) {
                Ok(()) => {
                    slot.last_checked = now;
                    successes += 1;
                    healthy.push(slot);
                }
                Err(e) => {
                    tracing::warn!(slot = slot.id, error = %e, "pooled connection failed probe");
                    let id = slot.id;
                    drop(slot);
                    match self.manager.connect() {
                        Ok(conn) => {
                            self.replaced.fetch_add(1, Ordering::Relaxed);
                            successes += 1;
                            healthy.push(Slot {
                                id,
                                conn,
                                last_checked: Instant::now(),
                            });
                        }
                        Err(e) => {
                            tracing::warn!(slot = id, error = %e, "could not replace pooled connection");
                            lost += 1;
                        }
                    }
                }
            }
        }

        let (to_open, degraded) = {
            let mut inner = self.inner.lock();
            inner.live -= lost;
            inner.idle.extend(healthy);
            let mut wanted = self.config.min.saturating_sub(inner.live);
            if wanted == 0 && attempts == 0 && inner.idle.is_empty() {
                // Nothing idle to check, so opening one connection is the check.
                // With every slot lent at the cap, the borrowers see failures first.
                wanted = usize::from(inner.live < self.config.max);
            }
            let ids: Vec<u64> = (0..wanted).map(|_| inner.reserve()).collect();
            (ids, inner.state == PoolState::Degraded)
        };

        for id in to_open {
            attempts += 1;
            match self.manager.connect() {
                Ok(conn) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    successes += 1;
                    self.inner.lock().idle.push_back(Slot {
                        id,
                        conn,
                        last_checked: Instant::now(),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not open pooled connection");
                    self.inner.lock().live -= 1;
                }
            }
        }

        let state = {
            let mut inner = self.inner.lock();
            if inner.state == PoolState::Closed {
                PoolState::Closed
            } else if attempts == 0 {
                inner.state
            } else if successes == 0 {
                inner.failed_cycles += 1;
                if inner.failed_cycles >= self.config.degraded_after && !degraded {
                    tracing::error!(
                        failed_cycles = inner.failed_cycles,
                        "backend unreachable, connection pool degraded"
                    );
                    inner.state = PoolState::Degraded;
                }
                inner.state
            } else {
                inner.failed_cycles = 0;
                if degraded {
                    tracing::info!("backend reachable again, connection pool healthy");
                    inner.state = PoolState::Healthy;
                }
                inner.state
            }
        };
        self.available.notify_all();
        state
    }

    pub fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            live: inner.live,
            idle: inner.idle.len(),
            lent: inner.live - inner.idle.len(),
            peak_live: inner.peak_live,
            created: self.created.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            state: inner.state,
        }
    }

    /// Close idle connections and refuse further acquires. Lent connections
    /// are closed as they come back.
    pub fn close(&self) {
        let idle: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.state = PoolState::Closed;
            let idle: Vec<_> = inner.idle.drain(..).collect();
            inner.live -= idle.len();
            idle
        };
        tracing::info!(closed = idle.len(), "connection pool closed");
        drop(idle);
        self.available.notify_all();
    }
}

/// A connection lent out by a [`Pool`]. Returned to the idle set exactly once,
/// on [`PooledConnection::release`] or drop.
pub struct PooledConnection<'a, M: ConnectionManager> {
    pool: &'a Pool<M>,
    slot: Option<Slot<M::Connection>>,
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot.as_ref().map(|slot| slot.id))
            .finish()
    }
}

impl<M: ConnectionManager> PooledConnection<'_, M> {
    pub fn release(self) {}

    /// Close the connection instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.forget(slot);
        }
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("slot is only taken on release"),
        }
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.slot {
            Some(slot) => &mut slot.conn,
            None => unreachable!("slot is only taken on release"),
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }
}
