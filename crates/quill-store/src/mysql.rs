// ABOUTME: Relational backend storing one row per record in a MySQL database through pooled sqlx connections.
// ABOUTME: A private driver runtime turns the async sqlx calls into the synchronous Backend contract.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quill_core::{EntityKey, EntityType, Envelope, Revision, StorageError};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{ConnectOptions, Connection as _, Row as _};
use thiserror::Error;
use tokio::runtime::Runtime;

use crate::backend::{Backend, BackendHealth, RecordIter, check_target_revision};
use crate::pool::{ConnectionManager, Pool, PoolConfig, PoolState, PoolStats};
use crate::sqlite::{PagedRows, Pages, Row, sql_revision};

const DEFAULT_PAGE_SIZE: usize = 256;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS quill_records (
    entity_type VARCHAR(128) NOT NULL,
    entity_key VARCHAR(128) NOT NULL,
    revision BIGINT NOT NULL,
    schema_version BIGINT NOT NULL,
    payload LONGTEXT NOT NULL,
    updated_at VARCHAR(64) NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4 COLLATE = utf8mb4_bin";

/// Errors raised by the MySQL driver.
#[derive(Debug, Error)]
pub enum MysqlError {
    #[error("mysql error: {0}")]
    Mysql(#[from] sqlx::Error),

    #[error("no mysql connection within {0:?}")]
    ConnectTimeout(Duration),
}

impl From<MysqlError> for StorageError {
    fn from(err: MysqlError) -> Self {
        let message = err.to_string();
        match &err {
            MysqlError::ConnectTimeout(_) => StorageError::BackendUnavailable(message),
            MysqlError::Mysql(
                sqlx::Error::Io(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed,
            ) => StorageError::BackendUnavailable(message),
            _ => StorageError::Database(message),
        }
    }
}

/// Where the MySQL backend connects.
#[derive(Clone, PartialEq, Eq)]
pub struct MysqlTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for MysqlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl MysqlTarget {
    fn connect_options(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username);
        let options = match &self.password {
            Some(password) => options.password(password),
            None => options,
        };
        options.disable_statement_logging()
    }
}

/// Owns the runtime that polls sqlx futures for synchronous callers.
struct Driver {
    runtime: Option<Runtime>,
}

impl Driver {
    fn new() -> Result<Self, StorageError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("quill-mysql")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Run `fut` to completion on the driver runtime and wait for it.
    fn run<F>(&self, fut: F) -> Result<F::Output, StorageError>
    where
        F: Future + Send,
        F::Output: Send,
    {
        let handle = self.runtime.as_ref().ok_or(StorageError::Closed)?.handle();
        if tokio::runtime::Handle::try_current().is_err() {
            return Ok(handle.block_on(fut));
        }
        // Inside another runtime's context; wait from a thread that has none.
        thread::scope(|scope| match scope.spawn(|| handle.block_on(fut)).join() {
            Ok(output) => Ok(output),
            Err(panic) => std::panic::resume_unwind(panic),
        })
    }

    /// Like [`Driver::run`] for a driver call, mapping its error.
    fn query<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
        T: Send,
    {
        self.run(fut)?.map_err(|e| MysqlError::from(e).into())
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Opens MySQL connections for the pool.
pub struct MysqlManager {
    options: MySqlConnectOptions,
    connect_timeout: Duration,
    driver: Arc<Driver>,
}

impl ConnectionManager for MysqlManager {
    type Connection = MySqlConnection;

    fn connect(&self) -> Result<MySqlConnection, StorageError> {
        let connected = self.driver.run(async {
            match tokio::time::timeout(self.connect_timeout, self.options.connect()).await {
                Ok(conn) => conn.map_err(MysqlError::from),
                Err(_) => Err(MysqlError::ConnectTimeout(self.connect_timeout)),
            }
        })?;
        Ok(connected?)
    }

    fn probe(&self, conn: &mut MySqlConnection) -> Result<(), StorageError> {
        self.driver.query(conn.ping())
    }
}

/// How a guarded write ended once its transaction closed.
enum WriteOutcome {
    Written,
    Stale(Revision),
}

fn decode_row(row: &MySqlRow) -> Result<Row, sqlx::Error> {
    Ok(Row {
        key: row.try_get("entity_key")?,
        revision: row.try_get("revision")?,
        schema_version: row.try_get("schema_version")?,
        payload: row.try_get("payload")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

async fn stored_revision(
    conn: &mut MySqlConnection,
    entity: &EntityType,
    key: &EntityKey,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT revision FROM quill_records
         WHERE entity_type = ? AND entity_key = ?
         FOR UPDATE",
    )
    .bind(entity.as_str())
    .bind(key.as_str())
    .fetch_optional(conn)
    .await
}

/// Stores records in a MySQL `quill_records` table, borrowing connections from a pool.
pub struct MysqlBackend {
    target: MysqlTarget,
    pool: Pool<MysqlManager>,
    driver: Arc<Driver>,
    page_size: usize,
}

impl MysqlBackend {
    /// Connect to `target`, create the schema and warm the pool.
    pub fn open(target: MysqlTarget, config: PoolConfig) -> Result<Self, StorageError> {
        let driver = Arc::new(Driver::new()?);
        let manager = MysqlManager {
            options: target.connect_options(),
            connect_timeout: config.connect_timeout,
            driver: Arc::clone(&driver),
        };

        let mut conn = manager.connect()?;
        driver.query(sqlx::query(SCHEMA).execute(&mut conn))?;
        drop(conn);

        let pool = Pool::new(manager, config)?;
        tracing::info!(
            host = %target.host,
            port = target.port,
            database = %target.database,
            "mysql backend ready"
        );

        Ok(Self {
            target,
            pool,
            driver,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Rows fetched per pooled round trip in `read_all`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn target(&self) -> &MysqlTarget {
        &self.target
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run `f` on a pooled connection, discarding the connection when the
    /// failure suggests it is broken.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Driver, &mut MySqlConnection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.pool.acquire(self.pool.config().acquire_timeout)?;
        match f(&self.driver, &mut *conn) {
            Err(e @ (StorageError::BackendUnavailable(_) | StorageError::Io(_))) => {
                conn.discard();
                Err(e)
            }
            other => other,
        }
    }
}

impl PagedRows for MysqlBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fetch_page(&self, entity: &EntityType, after: &str) -> Result<Vec<Row>, StorageError> {
        let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);
        let rows = self.with_conn(|driver, conn| {
            driver.query(
                sqlx::query(
                "SELECT entity_key, revision, schema_version, payload, updated_at
                 FROM quill_records
                 WHERE entity_type = ? AND entity_key > ?
                 ORDER BY entity_key
                 LIMIT ?",
                )
                .bind(entity.as_str())
                .bind(after)
                .bind(limit)
                .fetch_all(conn),
            )
        })?;
        rows.iter()
            .map(|row| decode_row(row).map_err(|e| MysqlError::from(e).into()))
            .collect()
    }
}

impl Backend for MysqlBackend {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|driver, conn| driver.query(conn.ping()))
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
        let row = self.with_conn(|driver, conn| {
            driver.query(
                sqlx::query(
                    "SELECT entity_key, revision, schema_version, payload, updated_at
                     FROM quill_records
                     WHERE entity_type = ? AND entity_key = ?",
                )
                .bind(entity.as_str())
                .bind(key.as_str())
                .fetch_optional(conn),
            )
        })?;

        row.map(|row| {
            decode_row(&row)
                .map_err(|e| StorageError::from(MysqlError::from(e)))
                .and_then(|row| row.into_envelope(entity))
                .map(|(_, envelope)| envelope)
        })
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
        let schema_version = envelope.schema_version;

        let outcome = self.with_conn(|driver, conn| driver.query(async move {
            let mut tx = conn.begin().await?;

            let updated = sqlx::query(
                "UPDATE quill_records
                 SET revision = ?, schema_version = ?, payload = ?, updated_at = ?
                 WHERE entity_type = ? AND entity_key = ? AND revision = ?",
            )
            .bind(target)
            .bind(schema_version)
            .bind(payload.as_str())
            .bind(updated_at.as_str())
            .bind(entity.as_str())
            .bind(key.as_str())
            .bind(expected_sql)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                match stored_revision(&mut tx, entity, key).await? {
                    Some(actual) => {
                        return Ok(WriteOutcome::Stale(Revision(
                            u64::try_from(actual).unwrap_or_default(),
                        )));
                    }
                    None if expected != Revision::ZERO => {
                        return Ok(WriteOutcome::Stale(Revision::ZERO));
                    }
                    None => {
                        let inserted = sqlx::query(
                            "INSERT INTO quill_records (entity_type, entity_key,
                                 revision, schema_version, payload, updated_at)
                             VALUES (?, ?, ?, ?, ?, ?)",
                        )
                        .bind(entity.as_str())
                        .bind(key.as_str())
                        .bind(target)
                        .bind(schema_version)
                        .bind(payload.as_str())
                        .bind(updated_at.as_str())
                        .execute(&mut *tx)
                        .await;
                        // A concurrent first write won the insert.
                        if let Err(e) = inserted {
                            if !is_unique_violation(&e) {
                                return Err(e);
                            }
                            let actual = stored_revision(&mut tx, entity, key).await?;
                            return Ok(WriteOutcome::Stale(Revision(
                                actual.and_then(|a| u64::try_from(a).ok()).unwrap_or_default(),
                            )));
                        }
                    }
                }
            }

            tx.commit().await?;
            Ok(WriteOutcome::Written)
        }))?;

        match outcome {
            WriteOutcome::Written => {
                tracing::debug!(
                    entity = entity.as_str(),
                    key = key.as_str(),
                    revision = target,
                    "wrote mysql row"
                );
                Ok(envelope.revision)
            }
            WriteOutcome::Stale(actual) => Err(StorageError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            }),
        }
    }

    fn delete(&self, entity: &EntityType, key: &EntityKey) -> Result<(), StorageError> {
        self.with_conn(|driver, conn| {
            driver.query(
                sqlx::query("DELETE FROM quill_records WHERE entity_type = ? AND entity_key = ?")
                    .bind(entity.as_str())
                    .bind(key.as_str())
                    .execute(conn),
            )
        })?;
        Ok(())
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
