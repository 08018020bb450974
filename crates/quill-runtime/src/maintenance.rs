// ABOUTME: Background tasks owned by Storage: the periodic flusher and the backend health checker.
// ABOUTME: The health checker drives the Ready/Degraded transitions and restarts flushing on recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use quill_core::EntityType;
use quill_store::BackendHealth;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CacheMode;
use crate::repository::{Context, ManagedRepository};
use crate::storage::StorageState;

/// Every repository handed out by a `Storage`, keyed by entity type.
pub(crate) type Registry = Arc<RwLock<HashMap<EntityType, Arc<dyn ManagedRepository>>>>;

/// Snapshot of the registered repositories, taken so no lock is held while
/// they are worked on.
pub(crate) fn managed(registry: &Registry) -> Vec<Arc<dyn ManagedRepository>> {
    registry.read().values().cloned().collect()
}

/// Move `state` from `from` to `to`. Returns false, leaving it untouched,
/// when the current state is not `from`.
pub(crate) fn transition(
    state: &watch::Sender<StorageState>,
    from: StorageState,
    to: StorageState,
) -> bool {
    state.send_if_modified(|current| {
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    })
}

/// Every `every`: retry fenced remote invalidations, drop expired entries
/// and, in write-behind mode while the backend is healthy, queue flushes for
/// dirty entries that are due.
pub(crate) fn spawn_flusher(ctx: Arc<Context>, registry: Registry, every: Duration) -> JoinHandle<()> {
    let handle = ctx.handle.clone();
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let fenced = ctx.repair_remote().await;
            if fenced > 0 {
                debug!(fenced, "remote cache entries still awaiting invalidation");
            }
            let flush = ctx.mode == CacheMode::WriteBehind && ctx.state() == StorageState::Ready;
            for repo in managed(&registry) {
                let purged = repo.purge_expired();
                if purged > 0 {
                    debug!(entity = %repo.entity(), purged, "expired idle cache entries");
                }
                if flush {
                    let queued = repo.flush_due();
                    if queued > 0 {
                        debug!(entity = %repo.entity(), queued, "queued dirty entries for flushing");
                    }
                }
            }
        }
    })
}

/// Every `every`: probe the backend on a blocking worker and apply the result.
pub(crate) fn spawn_health_checker(
    ctx: Arc<Context>,
    registry: Registry,
    every: Duration,
) -> JoinHandle<()> {
    let handle = ctx.handle.clone();
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let health = probe(&ctx).await;
            apply_health(&ctx, &registry, health);
        }
    })
}

/// Run one backend health check on a blocking worker.
pub(crate) async fn probe(ctx: &Context) -> BackendHealth {
    let backend = Arc::clone(&ctx.backend);
    match ctx.handle.spawn_blocking(move || backend.health_check()).await {
        Ok(health) => health,
        Err(e) => {
            warn!(error = %e, "health check task failed");
            BackendHealth::Degraded
        }
    }
}

/// Apply one health-check result to the storage state.
pub(crate) fn apply_health(ctx: &Context, registry: &Registry, health: BackendHealth) {
    match health {
        BackendHealth::Degraded => {
            if transition(&ctx.state, StorageState::Ready, StorageState::Degraded) {
                warn!(backend = ctx.backend.name(), "backend degraded; serving reads from cache");
            }
        }
        BackendHealth::Healthy => {
            if !transition(&ctx.state, StorageState::Degraded, StorageState::Ready) {
                return;
            }
            info!(backend = ctx.backend.name(), "backend recovered");
            for repo in managed(registry) {
                let reset = repo.reset_failures();
                let queued = repo.flush_due();
                if reset > 0 || queued > 0 {
                    info!(entity = %repo.entity(), reset, queued, "resuming flushes after recovery");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_only_moves_from_expected_state() {
        let (state, rx) = watch::channel(StorageState::Ready);

        assert!(transition(&state, StorageState::Ready, StorageState::Degraded));
        assert_eq!(*rx.borrow(), StorageState::Degraded);

        assert!(!transition(&state, StorageState::Ready, StorageState::Closed));
        assert_eq!(*rx.borrow(), StorageState::Degraded);

        state.send_replace(StorageState::ShuttingDown);
        assert!(!transition(&state, StorageState::Degraded, StorageState::Ready));
        assert_eq!(*rx.borrow(), StorageState::ShuttingDown);
    }
}
