// ABOUTME: Persistence layer for quill, handling raw record reads and writes per backend.
// ABOUTME: Provides document-file backends, pooled SQLite and MySQL backends, startup recovery and test doubles.

pub mod backend;
pub mod file;
pub mod mysql;
pub mod pool;
pub mod recovery;
pub mod sqlite;
pub mod testing;

pub use backend::{Backend, BackendDescriptor, BackendHealth, RecordIter, open_backend};
pub use file::FileBackend;
pub use mysql::{MysqlBackend, MysqlError, MysqlManager, MysqlTarget};
pub use pool::{ConnectionManager, Pool, PoolConfig, PoolState, PoolStats, PooledConnection};
pub use recovery::remove_stale_temp_files;
pub use sqlite::{SqlBackend, SqliteError, SqliteManager};
