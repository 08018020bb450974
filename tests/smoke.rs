// ABOUTME: End-to-end scenarios for quill storage across every backend variant.
// ABOUTME: Covers revision conflicts, shutdown durability, reopen, pool limits, concurrent readers and a backend outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use quill_core::{
    DocumentFormat, EntityKey, EntityType, Record, Revision, StorageError, Versioned, decode,
};
use quill_runtime::{BackendKind, CacheMode, Storage, StorageConfig, StorageState};
use quill_store::testing::FlakyBackend;
use quill_store::{Backend, FileBackend, SqlBackend, open_backend};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Player {
    name: String,
    gold: u64,
}

impl Record for Player {
    const ENTITY_TYPE: &'static str = "players";
}

/// Every field is derived from the revision that wrote it, so a torn read
/// shows up as a mismatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Ledger {
    debit: u64,
    credit: u64,
    memo: String,
}

impl Record for Ledger {
    const ENTITY_TYPE: &'static str = "ledgers";
}

fn ledger(revision: Revision) -> Ledger {
    Ledger {
        debit: revision.0,
        credit: revision.0,
        memo: revision.0.to_string().repeat(64),
    }
}

fn key(raw: &str) -> EntityKey {
    EntityKey::new(raw).unwrap()
}

fn players() -> EntityType {
    EntityType::new("players").unwrap()
}

fn player(gold: u64) -> Player {
    Player {
        name: "Alex".to_string(),
        gold,
    }
}

fn config(dir: &TempDir, backend: BackendKind, mode: CacheMode) -> StorageConfig {
    StorageConfig {
        backend,
        data_dir: dir.path().to_path_buf(),
        cache_mode: mode,
        pool_min: 1,
        pool_max: 2,
        flush_interval_ms: 50,
        health_check_interval_ms: 20,
        retry_max_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 10,
        ..StorageConfig::default()
    }
}

/// Read straight from a backend, bypassing every cache.
fn read_from(backend: &dyn Backend, raw: &str) -> Option<Versioned<Player>> {
    backend
        .read_one(&players(), &key(raw))
        .unwrap()
        .map(|envelope| decode(raw, envelope).unwrap())
}

/// Read from a freshly opened backend. Only used while nothing else writes,
/// since opening a file backend sweeps leftover temp files.
fn read_back(config: &StorageConfig, raw: &str) -> Option<Versioned<Player>> {
    let backend = open_backend(&config.to_descriptor()).unwrap();
    read_from(backend.as_ref(), raw)
}

const VARIANTS: [BackendKind; 3] = [BackendKind::Json, BackendKind::Yaml, BackendKind::Sqlite];
const MODES: [CacheMode; 2] = [CacheMode::WriteThrough, CacheMode::WriteBehind];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revisions_conflict_and_flush_on_every_backend() {
    for backend in VARIANTS {
        for mode in MODES {
            let dir = TempDir::new().unwrap();
            let config = config(&dir, backend, mode);
            let storage = Storage::open(config.clone()).unwrap();
            let repo = storage.repository::<Player>().unwrap();
            let p1 = key("p1");

            assert_eq!(repo.put(&p1, player(10), Revision::ZERO).await.unwrap(), Revision(1));
            let stale = repo.put(&p1, player(99), Revision::ZERO).await;
            assert!(
                matches!(stale, Err(StorageError::Conflict { actual: Revision(1), .. })),
                "{backend:?}/{mode:?}: {stale:?}"
            );
            assert_eq!(repo.put(&p1, player(20), Revision(1)).await.unwrap(), Revision(2));

            storage.flush_all_async().await.unwrap();
            assert_eq!(
                read_back(&config, "p1"),
                Some(Versioned::new(Revision(2), player(20))),
                "{backend:?}/{mode:?}"
            );
            storage.shutdown_async().await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn records_survive_reopen() {
    for backend in VARIANTS {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, backend, CacheMode::WriteBehind);

        let storage = Storage::open(config.clone()).unwrap();
        let repo = storage.repository::<Player>().unwrap();
        repo.put(&key("p1"), player(7), Revision::ZERO).await.unwrap();
        repo.put(&key("p2"), player(8), Revision::ZERO).await.unwrap();
        repo.delete(&key("p2")).await.unwrap();
        storage.shutdown_async().await.unwrap();

        let reopened = Storage::open(config).unwrap();
        let repo = reopened.repository::<Player>().unwrap();
        assert_eq!(repo.get(&key("p1")).await.unwrap().value.gold, 7, "{backend:?}");
        assert!(matches!(
            repo.get(&key("p2")).await,
            Err(StorageError::NotFound { .. })
        ));
        reopened.shutdown_async().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relational_pool_never_exceeds_its_cap() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, BackendKind::Sqlite, CacheMode::WriteThrough);
    let sql = Arc::new(SqlBackend::open(config.database_path(), config.pool_config()).unwrap());
    let storage = Storage::builder(config)
        .backend(sql.clone())
        .build()
        .unwrap();
    let repo = storage.repository::<Player>().unwrap();

    let writes: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|raw| repo.put(&key(raw), player(1), Revision::ZERO))
        .collect();
    for pending in writes {
        assert_eq!(pending.await.unwrap(), Revision(1));
    }

    assert!(sql.pool_stats().peak_live <= 2);
    storage.shutdown_async().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_behind_rides_out_a_backend_outage() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, BackendKind::Json, CacheMode::WriteBehind);
    let files: Arc<dyn Backend> =
        Arc::new(FileBackend::open(dir.path(), DocumentFormat::Json).unwrap());
    let flaky = Arc::new(FlakyBackend::new(Arc::clone(&files)));
    let storage = Storage::builder(config.clone())
        .backend(flaky.clone())
        .build()
        .unwrap();
    let repo = storage.repository::<Player>().unwrap();
    repo.put(&key("p1"), player(1), Revision::ZERO).await.unwrap();
    repo.flush(&key("p1")).await.unwrap();

    flaky.set_outage(true);
    let mut states = storage.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == StorageState::Degraded),
    )
    .await
    .unwrap()
    .unwrap();

    // Accepted at once even though nothing can reach the backend.
    let put = tokio::time::timeout(
        Duration::from_millis(500),
        repo.put(&key("p1"), player(2), Revision(1)),
    );
    assert_eq!(put.await.unwrap().unwrap(), Revision(2));
    assert_eq!(repo.get(&key("p1")).await.unwrap().value.gold, 2);
    assert_eq!(read_from(files.as_ref(), "p1").unwrap().revision, Revision(1));

    flaky.set_outage(false);
    tokio::time::timeout(Duration::from_secs(5), async {
        while read_from(files.as_ref(), "p1").unwrap().revision != Revision(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queued write never reached the backend");
    assert_eq!(storage.state(), StorageState::Ready);
    storage.shutdown_async().await.unwrap();
}

#[test]
fn game_thread_polls_without_blocking() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let dir = TempDir::new().unwrap();
    let config = config(&dir, BackendKind::Sqlite, CacheMode::WriteBehind);
    let storage = Storage::builder(config.clone())
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();
    let repo = storage.repository::<Player>().unwrap();

    let mut pending = repo.update(&key("p1"), |mut p: Player| {
        p.gold += 25;
        p
    });
    let mut ticks = 0;
    let updated = loop {
        if let Some(result) = pending.try_take() {
            break result.unwrap();
        }
        ticks += 1;
        std::thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(updated, Versioned::new(Revision(1), Player { name: String::new(), gold: 25 }));
    assert!(ticks < 5_000);

    storage.shutdown().unwrap();
    assert_eq!(read_back(&config, "p1").unwrap().value.gold, 25);
    assert!(matches!(
        repo.get(&key("p1")).wait(),
        Err(StorageError::Closed)
    ));
}

#[test]
fn readers_on_other_threads_never_see_a_partial_write() {
    const WRITES: u64 = 200;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    for mode in MODES {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, BackendKind::Json, mode);
        let storage = Storage::builder(config.clone())
            .runtime(runtime.handle().clone())
            .build()
            .unwrap();
        let repo = storage.repository::<Ledger>().unwrap();
        let shared = key("shared");
        repo.put(&shared, ledger(Revision(1)), Revision::ZERO).wait().unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let threads: Vec<_> = (0..3)
            .map(|_| {
                let (repo, shared, done) = (repo.clone(), shared.clone(), Arc::clone(&done));
                std::thread::spawn(move || {
                    let (mut last, mut reads) = (Revision::ZERO, 0u32);
                    loop {
                        let finished = done.load(Ordering::SeqCst);
                        let seen = repo.get(&shared).wait().unwrap();
                        assert_eq!(seen.value, ledger(seen.revision), "{mode:?}: torn read");
                        assert!(seen.revision >= last, "{mode:?}: revision went backwards");
                        last = seen.revision;
                        reads += 1;
                        if finished {
                            break reads;
                        }
                    }
                })
            })
            .collect();
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let (repo, shared, done) = (repo.clone(), shared.clone(), Arc::clone(&done));
                runtime.spawn(async move {
                    let (mut last, mut reads) = (Revision::ZERO, 0u32);
                    loop {
                        let finished = done.load(Ordering::SeqCst);
                        let seen = repo.get(&shared).await.unwrap();
                        assert_eq!(seen.value, ledger(seen.revision), "{mode:?}: torn read");
                        assert!(seen.revision >= last, "{mode:?}: revision went backwards");
                        last = seen.revision;
                        reads += 1;
                        if finished {
                            break reads;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for n in 1..WRITES {
            let next = Revision(n + 1);
            assert_eq!(repo.put(&shared, ledger(next), Revision(n)).wait().unwrap(), next);
        }
        done.store(true, Ordering::SeqCst);
        for thread in threads {
            assert!(thread.join().unwrap() > 0);
        }
        for task in tasks {
            assert!(runtime.block_on(task).unwrap() > 0);
        }

        storage.shutdown().unwrap();
        let stored = open_backend(&config.to_descriptor())
            .unwrap()
            .read_one(&EntityType::new("ledgers").unwrap(), &shared)
            .unwrap()
            .map(|envelope| decode::<Ledger>("shared", envelope).unwrap())
            .unwrap();
        assert_eq!(stored, Versioned::new(Revision(WRITES), ledger(Revision(WRITES))));
    }
}
