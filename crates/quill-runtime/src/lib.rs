// ABOUTME: The storage facade for quill: typed repositories over a cache, a backend and a runtime.
// ABOUTME: Callers get completion handles back immediately; all I/O runs on tokio workers.

pub mod actor;
pub mod config;
mod maintenance;
pub mod pending;
pub mod repository;
pub mod retry;
pub mod storage;

pub use actor::KeyedExecutor;
pub use config::{BackendKind, CacheMode, ConfigError, DegradedWrites, StorageConfig};
pub use pending::{LoadAll, Pending};
pub use repository::Repository;
pub use retry::RetryPolicy;
pub use storage::{BuildError, Storage, StorageBuilder, StorageState};

pub use quill_cache::{CacheStats, MemoryRemote, RemoteCache};
pub use quill_core::{EntityKey, EntityType, FlushFailure, Record, Revision, StorageError, Versioned};
