// ABOUTME: Relational backend storing one row per record in a pooled SQLite database.
// ABOUTME: Also holds the row decoding and key-ordered paging shared with the MySQL backend.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use quill_core::{EntityKey, EntityType, Envelope, Revision, StorageError};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;

use crate::backend::{Backend, BackendHealth, RecordIter, check_target_revision};
use crate::pool::{ConnectionManager, Pool, PoolConfig, PoolState, PoolStats};

const DEFAULT_PAGE_SIZE: usize = 256;

/// Errors raised by the SQLite driver.
#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<SqliteError> for StorageError {
    fn from(err: SqliteError) -> Self {
        let message = err.to_string();
        match &err {
            SqliteError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => match failure.code {
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => {
                    StorageError::BackendUnavailable(message)
                }
                ErrorCode::SystemIoFailure | ErrorCode::DiskFull => StorageError::Io(message),
                _ => StorageError::Database(message),
            },
            _ => StorageError::Database(message),
        }
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, SqliteError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Opens SQLite connections for the pool.
pub struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteManager {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }
}

impl ConnectionManager for SqliteManager {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection, StorageError> {
        Ok(open_connection(&self.path, self.busy_timeout)?)
    }

    fn probe(&self, conn: &mut Connection) -> Result<(), StorageError> {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(SqliteError::from)?;
        Ok(())
    }
}

/// Raw column values of one `quill_records` row.
pub(crate) struct Row {
    pub(crate) key: String,
    pub(crate) revision: i64,
    pub(crate) schema_version: i64,
    pub(crate) payload: String,
    pub(crate) updated_at: String,
}

impl Row {
    pub(crate) fn into_envelope(self, entity: &EntityType) -> Result<(String, Envelope), StorageError> {
        let malformed = |reason: String| StorageError::malformed(entity.as_str(), &self.key, reason);
        let revision = u64::try_from(self.revision)
            .map_err(|_| malformed(format!("negative revision {}", self.revision)))?;
        let schema_version = u32::try_from(self.schema_version)
            .map_err(|_| malformed(format!("invalid schema version {}", self.schema_version)))?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| malformed(format!("invalid updated_at: {e}")))?
            .with_timezone(&Utc);
        let envelope =
            Envelope::from_row(schema_version, Revision(revision), updated_at, &self.payload)
                .map_err(|e| malformed(e.to_string()))?;
        Ok((self.key, envelope))
    }
}

pub(crate) fn sql_revision(
    entity: &EntityType,
    key: &EntityKey,
    revision: Revision,
) -> Result<i64, StorageError> {
    i64::try_from(revision.get()).map_err(|_| {
        StorageError::malformed(
            entity.as_str(),
            key.as_str(),
            format!("revision {revision} does not fit the revision column"),
        )
    })
}

/// Stores records in the `quill_records` table, borrowing connections from a pool.
pub struct SqlBackend {
    path: PathBuf,
    pool: Pool<SqliteManager>,
    page_size: usize,
}

impl SqlBackend {
    /// Open or create the database at `path`, create the schema and warm the pool.
    pub fn open(path: impl Into<PathBuf>, config: PoolConfig) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = open_connection(&path, config.connect_timeout)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS quill_records (
                entity_type TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                revision INTEGER NOT NULL,
                schema_version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_key)
            );",
        )
        .map_err(SqliteError::from)?;
        drop(conn);

        let manager = SqliteManager::new(&path, config.connect_timeout);
        let pool = Pool::new(manager, config)?;
        tracing::info!(path = %path.display(), "sqlite backend ready");

        Ok(Self {
            path,
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Rows fetched per pooled round trip in `read_all`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run `f` on a pooled connection, discarding the connection when the
    /// failure suggests it is broken.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.pool.acquire(self.pool.config().acquire_timeout)?;
        match f(&mut *conn) {
            Err(e @ (StorageError::BackendUnavailable(_) | StorageError::Io(_))) => {
                conn.discard();
                Err(e)
            }
            other => other,
        }
    }
}

impl PagedRows for SqlBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fetch_page(&self, entity: &EntityType, after: &str) -> Result<Vec<Row>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entity_key, revision, schema_version, payload, updated_at
                     FROM quill_records
                     WHERE entity_type = ?1 AND entity_key > ?2
                     ORDER BY entity_key
                     LIMIT ?3",
                )
                .map_err(SqliteError::from)?;
            let rows = stmt
                .query_map(
                    params![entity.as_str(), after, self.page_size as i64],
                    |row| {
                        Ok(Row {
                            key: row.get(0)?,
                            revision: row.get(1)?,
                            schema_version: row.get(2)?,
                            payload: row.get(3)?,
                            updated_at: row.get(4)?,
                        })
                    },
                )
                .map_err(SqliteError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(SqliteError::from)?;
            Ok(rows)
        })
    }
}

impl Backend for SqlBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(SqliteError::from)?;
            Ok(())
        })
    }

    fn health_check(&self) -> BackendHealth {
        match self.pool.health_check() {
            PoolState::Healthy => BackendHealth::Healthy,
            PoolState::Degraded | PoolState::Closed => BackendHealth::Degraded,
        }
    }

    fn read_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
    ) -> Result<Option<Envelope>, StorageError> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT entity_key, revision, schema_version, payload, updated_at
                     FROM quill_records
                     WHERE entity_type = ?1 AND entity_key = ?2",
                    params![entity.as_str(), key.as_str()],
                    |row| {
                        Ok(Row {
                            key: row.get(0)?,
                            revision: row.get(1)?,
                            schema_version: row.get(2)?,
                            payload: row.get(3)?,
                            updated_at: row.get(4)?,
                        })
                    },
                )
                .optional()
                .map_err(SqliteError::from)?;
            Ok(row)
        })?;

        row.map(|row| row.into_envelope(entity).map(|(_, envelope)| envelope))
            .transpose()
    }

    fn write_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
        envelope: &Envelope,
        expected: Revision,
    ) -> Result<Revision, StorageError> {
        check_target_revision(entity, key, envelope, expected)?;
        let target = sql_revision(entity, key, envelope.revision)?;
        let expected_sql = sql_revision(entity, key, expected)?;
        let payload = envelope
            .payload()
            .map_err(|e| StorageError::malformed(entity.as_str(), key.as_str(), e))?;
        let updated_at = envelope.updated_at.to_rfc3339();

        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(SqliteError::from)?;

            let updated = tx
                .execute(
                    "UPDATE quill_records
                     SET revision = ?1, schema_version = ?2, payload = ?3, updated_at = ?4
                     WHERE entity_type = ?5 AND entity_key = ?6 AND revision = ?7",
                    params![
                        target,
                        envelope.schema_version,
                        payload,
                        updated_at,
                        entity.as_str(),
                        key.as_str(),
                        expected_sql,
                    ],
                )
                .map_err(SqliteError::from)?;

            if updated == 0 {
                let stored: Option<i64> = tx
                    .query_row(
                        "SELECT revision FROM quill_records
                         WHERE entity_type = ?1 AND entity_key = ?2",
                        params![entity.as_str(), key.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(SqliteError::from)?;

                match stored {
                    Some(actual) => {
                        return Err(StorageError::Conflict {
                            key: key.to_string(),
                            expected,
                            actual: Revision(u64::try_from(actual).unwrap_or_default()),
                        });
                    }
                    None if expected != Revision::ZERO => {
                        return Err(StorageError::Conflict {
                            key: key.to_string(),
                            expected,
                            actual: Revision::ZERO,
                        });
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO quill_records
                                (entity_type, entity_key, revision, schema_version, payload, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            params![
                                entity.as_str(),
                                key.as_str(),
                                target,
                                envelope.schema_version,
                                payload,
                                updated_at,
                            ],
                        )
                        .map_err(SqliteError::from)?;
                    }
                }
            }

            tx.commit().map_err(SqliteError::from)?;
            tracing::debug!(
                entity = entity.as_str(),
                key = key.as_str(),
                revision = target,
                "wrote row"
            );
            Ok(envelope.revision)
        })
    }

    fn delete(&self, entity: &EntityType, key: &EntityKey) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM quill_records WHERE entity_type = ?1 AND entity_key = ?2",
                params![entity.as_str(), key.as_str()],
            )
            .map_err(SqliteError::from)?;
            Ok(())
        })
    }

    fn read_all(&self, entity: &EntityType) -> Result<RecordIter<'_>, StorageError> {
        if self.pool.state() == PoolState::Closed {
            return Err(StorageError::Closed);
        }
        Ok(Box::new(Pages::new(self, entity.clone())))
    }

    fn close(&self) {
        self.pool.close();
    }
}

/// A relational backend able to serve one key-ordered page of rows.
pub(crate) trait PagedRows: Sync {
    fn page_size(&self) -> usize;

    /// Up to `page_size` rows of `entity` whose keys sort after `after`.
    fn fetch_page(&self, entity: &EntityType, after: &str) -> Result<Vec<Row>, StorageError>;
}

/// Walks one entity type in key order, one pooled round trip per page.
pub(crate) struct Pages<'a, B> {
    backend: &'a B,
    entity: EntityType,
    after: String,
    buffered: VecDeque<Row>,
    done: bool,
}

impl<'a, B: PagedRows> Pages<'a, B> {
    pub(crate) fn new(backend: &'a B, entity: EntityType) -> Self {
        Self {
            backend,
            entity,
            after: String::new(),
            buffered: VecDeque::new(),
            done: false,
        }
    }
}

impl<B: PagedRows> Iterator for Pages<'_, B> {
    type Item = Result<(EntityKey, Envelope), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Some(row.into_envelope(&self.entity).and_then(|(key, envelope)| {
                    Ok((EntityKey::new(key)?, envelope))
                }));
            }
            if self.done {
                return None;
            }
            match self.backend.fetch_page(&self.entity, &self.after) {
                Ok(rows) => {
                    self.done = rows.len() < self.backend.page_size();
                    if let Some(last) = rows.last() {
                        self.after = last.key.clone();
                    }
                    self.buffered.extend(rows);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn pool_config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min,
            max,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            degraded_after: 3,
        }
    }

    fn envelope(revision: u64, gold: i64) -> Envelope {
        Envelope {
            schema_version: 1,
            revision: Revision(revision),
            updated_at: Utc::now(),
            data: json!({"gold": gold}),
        }
    }

    fn players() -> EntityType {
        EntityType::new("players").unwrap()
    }

    fn key(raw: &str) -> EntityKey {
        EntityKey::new(raw).unwrap()
    }

    #[test]
    fn insert_update_and_conflict() {
        let dir = TempDir::new().unwrap();
        let backend = SqlBackend::open(dir.path().join("quill.db"), pool_config(1, 2)).unwrap();
        let entity = players();
        let p1 = key("p1");

        assert!(backend.read_one(&entity, &p1).unwrap().is_none());
        assert_eq!(
            backend
                .write_one(&entity, &p1, &envelope(1, 100), Revision::ZERO)
                .unwrap(),
            Revision(1)
        );

        let err = backend
            .write_one(&entity, &p1, &envelope(1, 150), Revision::ZERO)
            .unwrap_err();
        assert!(
            matches!(err, StorageError::Conflict { actual: Revision(1), .. }),
            "got {err}"
        );

        backend
            .write_one(&entity, &p1, &envelope(2, 150), Revision(1))
            .unwrap();
        let stored = backend.read_one(&entity, &p1).unwrap().unwrap();
        assert_eq!(stored.revision, Revision(2));
        assert_eq!(stored.data, json!({"gold": 150}));
    }

    #[test]
    fn expected_revision_on_missing_row_conflicts() {
        let dir = TempDir::new().unwrap();
        let backend = SqlBackend::open(dir.path().join("quill.db"), pool_config(1, 1)).unwrap();
        let err = backend
            .write_one(&players(), &key("ghost"), &envelope(4, 1), Revision(3))
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                actual: Revision::ZERO,
                ..
            }
        ));
    }

    #[test]
    fn delete_removes_row_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = SqlBackend::open(dir.path().join("quill.db"), pool_config(1, 1)).unwrap();
        let entity = players();
        let p1 = key("p1");
        backend
            .write_one(&entity, &p1, &envelope(1, 1), Revision::ZERO)
            .unwrap();
        backend.delete(&entity, &p1).unwrap();
        backend.delete(&entity, &p1).unwrap();
        assert!(backend.read_one(&entity, &p1).unwrap().is_none());
    }

    #[test]
    fn read_all_pages_in_key_order() {
        let dir = TempDir::new().unwrap();
        let backend = SqlBackend::open(dir.path().join("quill.db"), pool_config(1, 1))
            .unwrap()
            .with_page_size(2);
        let entity = players();
        for i in 0..5 {
            backend
                .write_one(&entity, &key(&format!("p{i}")), &envelope(1, i), Revision::ZERO)
                .unwrap();
        }
        backend
            .write_one(
                &EntityType::new("regions").unwrap(),
                &key("spawn"),
                &envelope(1, 0),
                Revision::ZERO,
            )
            .unwrap();

        let keys: Vec<String> = backend
            .read_all(&entity)
            .unwrap()
            .map(|item| item.unwrap().0.to_string())
            .collect();
        assert_eq!(keys, vec!["p0", "p1", "p2", "p3", "p4"]);
    }

    #[test]
    fn corrupt_payload_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quill.db");
        let backend = SqlBackend::open(&path, pool_config(1, 1)).unwrap();
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO quill_records VALUES ('players', 'p1', 1, 1, '{oops', ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();

        let err = backend.read_one(&players(), &key("p1")).unwrap_err();
        assert!(matches!(err, StorageError::MalformedData { .. }), "got {err}");
    }

    #[test]
    fn three_writers_share_two_connections() {
        let dir = TempDir::new().unwrap();
        let backend =
            Arc::new(SqlBackend::open(dir.path().join("quill.db"), pool_config(0, 2)).unwrap());

        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let backend = Arc::clone(&backend);
                thread::spawn(move || {
                    backend
                        .write_one(&players(), &key(name), &envelope(1, 1), Revision::ZERO)
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = backend.pool_stats();
        assert!(stats.peak_live <= 2, "peak {}", stats.peak_live);
        assert_eq!(backend.read_all(&players()).unwrap().count(), 3);
    }

    #[test]
    fn closed_backend_refuses_calls() {
        let dir = TempDir::new().unwrap();
        let backend = SqlBackend::open(dir.path().join("quill.db"), pool_config(1, 1)).unwrap();
        assert_eq!(backend.health_check(), BackendHealth::Healthy);
        backend.close();
        assert!(matches!(backend.ping(), Err(StorageError::Closed)));
        assert!(matches!(backend.read_all(&players()), Err(StorageError::Closed)));
    }
}
