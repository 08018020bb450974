// ABOUTME: The Backend contract shared by all storage variants and the descriptor that selects one.
// ABOUTME: Backends are synchronous and are always driven from worker threads, never the game loop.

use std::path::PathBuf;
use std::sync::Arc;

use quill_core::{DocumentFormat, EntityKey, EntityType, Envelope, Revision, StorageError};

use crate::file::FileBackend;
use crate::mysql::{MysqlBackend, MysqlTarget};
use crate::pool::PoolConfig;
use crate::sqlite::SqlBackend;

/// Lazily produced `(key, envelope)` pairs from a bulk read.
pub type RecordIter<'a> =
    Box<dyn Iterator<Item = Result<(EntityKey, Envelope), StorageError>> + Send + 'a>;

/// Reachability of a backend as seen by its last health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Healthy,
    Degraded,
}

/// Raw record persistence for one backend variant.
///
/// `write_one` stores `envelope` only when the stored revision equals
/// `expected` (`Revision::ZERO` meaning "no stored record"). The envelope's
/// own revision is the new stored revision and must be greater than
/// `expected`; it is returned on success.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Confirm the backend is reachable and writable.
    fn ping(&self) -> Result<(), StorageError>;

    /// Run one health-check cycle and report the result.
    fn health_check(&self) -> BackendHealth {
        match self.ping() {
            Ok(()) => BackendHealth::Healthy,
            Err(e) => {
                tracing::warn!(backend = self.name(), error = %e, "health check failed");
                BackendHealth::Degraded
            }
        }
    }

    fn read_one(&self, entity: &EntityType, key: &EntityKey)
    -> Result<Option<Envelope>, StorageError>;

    fn write_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
        envelope: &Envelope,
        expected: Revision,
    ) -> Result<Revision, StorageError>;

    fn delete(&self, entity: &EntityType, key: &EntityKey) -> Result<(), StorageError>;

    fn read_all(&self, entity: &EntityType) -> Result<RecordIter<'_>, StorageError>;

    /// Release held resources. Later calls fail with `StorageError::Closed`.
    fn close(&self) {}
}

/// Reject envelopes whose revision would not advance the stored one.
pub(crate) fn check_target_revision(
    entity: &EntityType,
    key: &EntityKey,
    envelope: &Envelope,
    expected: Revision,
) -> Result<(), StorageError> {
    if envelope.revision <= expected {
        return Err(StorageError::malformed(
            entity.as_str(),
            key.as_str(),
            format!(
                "target revision {} does not advance expected revision {}",
                envelope.revision, expected
            ),
        ));
    }
    Ok(())
}

/// Static selection of the active backend and its connection parameters.
#[derive(Debug, Clone)]
pub enum BackendDescriptor {
    Json { root: PathBuf },
    Yaml { root: PathBuf },
    Sqlite { path: PathBuf, pool: PoolConfig },
    Mysql { target: MysqlTarget, pool: PoolConfig },
}

impl BackendDescriptor {
    pub fn name(&self) -> &'static str {
        match self {
            BackendDescriptor::Json { .. } => "json",
            BackendDescriptor::Yaml { .. } => "yaml",
            BackendDescriptor::Sqlite { .. } => "sqlite",
            BackendDescriptor::Mysql { .. } => "mysql",
        }
    }
}

/// Open the backend described by `descriptor`, running its startup recovery.
pub fn open_backend(descriptor: &BackendDescriptor) -> Result<Arc<dyn Backend>, StorageError> {
    tracing::info!(backend = descriptor.name(), "opening storage backend");
    let backend: Arc<dyn Backend> = match descriptor {
        BackendDescriptor::Json { root } => {
            Arc::new(FileBackend::open(root.clone(), DocumentFormat::Json)?)
        }
        BackendDescriptor::Yaml { root } => {
            Arc::new(FileBackend::open(root.clone(), DocumentFormat::Yaml)?)
        }
        BackendDescriptor::Sqlite { path, pool } => {
            Arc::new(SqlBackend::open(path.clone(), pool.clone())?)
        }
        BackendDescriptor::Mysql { target, pool } => {
            Arc::new(MysqlBackend::open(target.clone(), pool.clone())?)
        }
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pool() -> PoolConfig {
        PoolConfig {
            min: 1,
            max: 2,
            acquire_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(30),
            degraded_after: 3,
        }
    }

    #[test]
    fn open_backend_selects_variant() {
        let dir = TempDir::new().unwrap();

        let json = open_backend(&BackendDescriptor::Json {
            root: dir.path().join("json"),
        })
        .unwrap();
        assert_eq!(json.name(), "json");

        let yaml = open_backend(&BackendDescriptor::Yaml {
            root: dir.path().join("yaml"),
        })
        .unwrap();
        assert_eq!(yaml.name(), "yaml");

        let sql = open_backend(&BackendDescriptor::Sqlite {
            path: dir.path().join("quill.db"),
            pool: pool(),
        })
        .unwrap();
        assert_eq!(sql.name(), "sqlite");
        sql.ping().unwrap();
        sql.close();
    }

    #[test]
    fn mysql_descriptor_connects_to_a_server() {
        let descriptor = BackendDescriptor::Mysql {
            target: MysqlTarget {
                host: "127.0.0.1".to_string(),
                port: 1,
                database: "quill".to_string(),
                username: "quill".to_string(),
                password: None,
            },
            pool: pool(),
        };
        assert_eq!(descriptor.name(), "mysql");
        assert!(matches!(
            open_backend(&descriptor),
            Err(StorageError::BackendUnavailable(_))
        ));
    }
}
