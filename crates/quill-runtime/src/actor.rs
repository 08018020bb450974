// ABOUTME: Per-key actors that run the jobs for one entity key strictly in submission order.
// ABOUTME: Actors are spawned on demand and exit as soon as their queue runs dry.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use quill_core::EntityKey;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};

/// A unit of work for one key.
pub type Job = BoxFuture<'static, ()>;

struct Shared {
    actors: Mutex<HashMap<EntityKey, mpsc::UnboundedSender<Job>>>,
    idle: Notify,
}

/// Serializes work per key without a global lock.
///
/// Jobs submitted for the same key run one after another in submission
/// order; jobs for different keys run concurrently.
#[derive(Clone)]
pub struct KeyedExecutor {
    handle: Handle,
    shared: Arc<Shared>,
}

impl KeyedExecutor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shared: Arc::new(Shared {
                actors: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue `job` behind every job already submitted for `key`.
    pub fn submit(&self, key: &EntityKey, job: Job) {
        let mut actors = self.shared.actors.lock();
        let job = match actors.get(key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // The actor exited between lookups; start a new one.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job);
        actors.insert(key.clone(), tx);
        drop(actors);

        self.handle
            .spawn(run_actor(key.clone(), rx, Arc::clone(&self.shared)));
    }

    /// Number of keys with a live actor.
    pub fn active(&self) -> usize {
        self.shared.actors.lock().len()
    }

    /// Wait until every submitted job has finished.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.actors.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn run_actor(key: EntityKey, mut rx: mpsc::UnboundedReceiver<Job>, shared: Arc<Shared>) {
    loop {
        let job = match rx.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // Submitters send while holding the registry lock, so an empty
                // queue observed under the lock stays empty.
                let mut actors = shared.actors.lock();
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        actors.remove(&key);
                        drop(actors);
                        shared.idle.notify_waiters();
                        return;
                    }
                }
            }
        };
        job.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    fn key(raw: &str) -> EntityKey {
        EntityKey::new(raw).unwrap()
    }

    #[tokio::test]
    async fn jobs_for_one_key_run_in_order() {
        let executor = KeyedExecutor::new(Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20u64 {
            let log = Arc::clone(&log);
            executor.submit(
                &key("p1"),
                async move {
                    // Later jobs sleep less; order must still hold.
                    tokio::time::sleep(Duration::from_millis(20 - i)).await;
                    log.lock().push(i);
                }
                .boxed(),
            );
        }

        executor.drained().await;
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
        assert_eq!(executor.active(), 0);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let executor = KeyedExecutor::new(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        // The first key blocks until the second key's job runs.
        executor.submit(
            &key("a"),
            async move {
                let _ = rx.await;
            }
            .boxed(),
        );
        executor.submit(
            &key("b"),
            async move {
                let _ = tx.send(());
            }
            .boxed(),
        );

        tokio::time::timeout(Duration::from_secs(5), executor.drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn idle_actors_exit_and_respawn() {
        let executor = KeyedExecutor::new(Handle::current());
        let counter = Arc::new(Mutex::new(0));

        for _ in 0..2 {
            let c = Arc::clone(&counter);
            executor.submit(&key("p1"), async move { *c.lock() += 1 }.boxed());
            executor.drained().await;
            assert_eq!(executor.active(), 0);
        }
        assert_eq!(*counter.lock(), 2);
    }
}
