// ABOUTME: Storage configuration: backend choice and MySQL target, cache policy, pool sizing, timeouts, retries and Redis.
// ABOUTME: Loads from a JSON/YAML document or QUILL_* environment variables and validates the result.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use quill_store::{BackendDescriptor, MysqlTarget, PoolConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("pool_min ({min}) must not exceed pool_max ({max}), and pool_max must be at least 1")]
    PoolBounds { min: usize, max: usize },

    #[error("cache_capacity must be at least 1")]
    ZeroCapacity,

    #[error("flush_interval_ms must be at least 1")]
    ZeroFlushInterval,

    #[error("redis_enabled is true but redis_url is not set")]
    RedisWithoutUrl,

    #[error("redis_enabled is true but quill was built without the `redis` feature")]
    RedisUnsupported,

    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Which backend variant stores records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Json,
    Yaml,
    /// Rows in a MySQL server named by the `mysql_*` options.
    Mysql,
    /// Rows in a local SQLite database file.
    Sqlite,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(BackendKind::Json),
            "yaml" | "yml" => Ok(BackendKind::Yaml),
            "mysql" => Ok(BackendKind::Mysql),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(other.to_string()),
        }
    }
}

/// When cached writes reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// `put` resolves after the backend write.
    WriteThrough,
    /// `put` resolves once cached; the flusher writes it later.
    WriteBehind,
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "write-through" | "write_through" | "through" => Ok(CacheMode::WriteThrough),
            "write-behind" | "write_behind" | "behind" => Ok(CacheMode::WriteBehind),
            other => Err(other.to_string()),
        }
    }
}

/// What write-behind puts do while the backend is degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradedWrites {
    /// Stage in the cache and flush once the backend recovers.
    Queue,
    Reject,
}

impl FromStr for DegradedWrites {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(DegradedWrites::Queue),
            "reject" => Ok(DegradedWrites::Reject),
            other => Err(other.to_string()),
        }
    }
}

/// Storage configuration. Every field has a default, so a document only
/// needs the options it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    /// Database file for the sqlite backend. Defaults to `<data_dir>/quill.db`.
    pub database_path: Option<PathBuf>,
    pub mysql_host: String,
    pub mysql_port: u16,
    pub mysql_database: String,
    pub mysql_username: String,
    pub mysql_password: Option<String>,
    /// Maximum cached entries per entity type.
    pub cache_capacity: usize,
    pub cache_mode: CacheMode,
    /// Idle time after which clean entries expire. `None` keeps them until evicted.
    pub cache_ttl_ms: Option<u64>,
    pub flush_interval_ms: u64,
    pub pool_min: usize,
    pub pool_max: usize,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub degraded_after_failures: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub degraded_writes: DegradedWrites,
    pub redis_enabled: bool,
    pub redis_url: Option<String>,
    pub redis_ttl_ms: u64,
    pub redis_key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Json,
            data_dir: PathBuf::from("./data"),
            database_path: None,
            mysql_host: "localhost".to_string(),
            mysql_port: 3306,
            mysql_database: "quill".to_string(),
            mysql_username: "quill".to_string(),
            mysql_password: None,
            cache_capacity: 1024,
            cache_mode: CacheMode::WriteBehind,
            cache_ttl_ms: None,
            flush_interval_ms: 5000,
            pool_min: 2,
            pool_max: 10,
            connect_timeout_ms: 5000,
            acquire_timeout_ms: 5000,
            operation_timeout_ms: 10_000,
            health_check_interval_ms: 30_000,
            degraded_after_failures: 3,
            retry_max_attempts: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            degraded_writes: DegradedWrites::Queue,
            redis_enabled: false,
            redis_url: None,
            redis_ttl_ms: 300_000,
            redis_key_prefix: "quill:".to_string(),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(None),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { var, value }),
        },
        None => Ok(None),
    }
}

impl StorageConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - QUILL_BACKEND: json, yaml, mysql or sqlite (default: json)
    /// - QUILL_DATA_DIR: document root and default database location (default: ./data)
    /// - QUILL_DATABASE_PATH: sqlite database file (default: <data_dir>/quill.db)
    /// - QUILL_MYSQL_HOST, QUILL_MYSQL_PORT, QUILL_MYSQL_DATABASE (default: localhost:3306/quill)
    /// - QUILL_MYSQL_USERNAME, QUILL_MYSQL_PASSWORD (default: quill, no password)
    /// - QUILL_CACHE_CAPACITY, QUILL_CACHE_MODE, QUILL_CACHE_TTL_MS
    /// - QUILL_FLUSH_INTERVAL_MS
    /// - QUILL_POOL_MIN, QUILL_POOL_MAX
    /// - QUILL_CONNECT_TIMEOUT_MS, QUILL_ACQUIRE_TIMEOUT_MS, QUILL_OPERATION_TIMEOUT_MS
    /// - QUILL_HEALTH_CHECK_INTERVAL_MS, QUILL_DEGRADED_AFTER_FAILURES
    /// - QUILL_RETRY_MAX_ATTEMPTS, QUILL_RETRY_BASE_DELAY_MS, QUILL_RETRY_MAX_DELAY_MS
    /// - QUILL_DEGRADED_WRITES: queue or reject (default: queue)
    /// - QUILL_REDIS_ENABLED, QUILL_REDIS_URL, QUILL_REDIS_TTL_MS, QUILL_REDIS_KEY_PREFIX
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`StorageConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "QUILL_BACKEND")? {
            config.backend = v;
        }
        if let Some(v) = lookup("QUILL_DATA_DIR").filter(|v| !v.is_empty()) {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUILL_DATABASE_PATH").filter(|v| !v.is_empty()) {
            config.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("QUILL_MYSQL_HOST").filter(|v| !v.is_empty()) {
            config.mysql_host = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_MYSQL_PORT")? {
            config.mysql_port = v;
        }
        if let Some(v) = lookup("QUILL_MYSQL_DATABASE").filter(|v| !v.is_empty()) {
            config.mysql_database = v;
        }
        if let Some(v) = lookup("QUILL_MYSQL_USERNAME").filter(|v| !v.is_empty()) {
            config.mysql_username = v;
        }
        if let Some(v) = lookup("QUILL_MYSQL_PASSWORD") {
            config.mysql_password = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "QUILL_CACHE_CAPACITY")? {
            config.cache_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_CACHE_MODE")? {
            config.cache_mode = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_CACHE_TTL_MS")? {
            config.cache_ttl_ms = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "QUILL_FLUSH_INTERVAL_MS")? {
            config.flush_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_POOL_MIN")? {
            config.pool_min = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_POOL_MAX")? {
            config.pool_max = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_ACQUIRE_TIMEOUT_MS")? {
            config.acquire_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_OPERATION_TIMEOUT_MS")? {
            config.operation_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_HEALTH_CHECK_INTERVAL_MS")? {
            config.health_check_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_DEGRADED_AFTER_FAILURES")? {
            config.degraded_after_failures = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_RETRY_MAX_ATTEMPTS")? {
            config.retry_max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_RETRY_MAX_DELAY_MS")? {
            config.retry_max_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUILL_DEGRADED_WRITES")? {
            config.degraded_writes = v;
        }
        if let Some(v) = parse_flag(&lookup, "QUILL_REDIS_ENABLED")? {
            config.redis_enabled = v;
        }
        if let Some(v) = lookup("QUILL_REDIS_URL").filter(|v| !v.is_empty()) {
            config.redis_url = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "QUILL_REDIS_TTL_MS")? {
            config.redis_ttl_ms = v;
        }
        if let Some(v) = lookup("QUILL_REDIS_KEY_PREFIX") {
            config.redis_key_prefix = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a JSON or YAML config document, chosen by file extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |reason: String| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&text).map_err(|e| parse_error(e.to_string()))?,
            _ => serde_yaml::from_str(&text).map_err(|e| parse_error(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_max == 0 || self.pool_min > self.pool_max {
            return Err(ConfigError::PoolBounds {
                min: self.pool_min,
                max: self.pool_max,
            });
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.redis_enabled {
            if self.redis_url.is_none() {
                return Err(ConfigError::RedisWithoutUrl);
            }
            if !cfg!(feature = "redis") {
                return Err(ConfigError::RedisUnsupported);
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("quill.db"))
    }

    pub fn mysql_target(&self) -> MysqlTarget {
        MysqlTarget {
            host: self.mysql_host.clone(),
            port: self.mysql_port,
            database: self.mysql_database.clone(),
            username: self.mysql_username.clone(),
            password: self.mysql_password.clone(),
        }
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn redis_ttl(&self) -> Duration {
        Duration::from_millis(self.redis_ttl_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min: self.pool_min,
            max: self.pool_max,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            health_check_interval: self.health_check_interval(),
            degraded_after: self.degraded_after_failures,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// The backend selection this configuration describes.
    pub fn to_descriptor(&self) -> BackendDescriptor {
        match self.backend {
            BackendKind::Json => BackendDescriptor::Json {
                root: self.data_dir.clone(),
            },
            BackendKind::Yaml => BackendDescriptor::Yaml {
                root: self.data_dir.clone(),
            },
            BackendKind::Sqlite => BackendDescriptor::Sqlite {
                path: self.database_path(),
                pool: self.pool_config(),
            },
            BackendKind::Mysql => BackendDescriptor::Mysql {
                target: self.mysql_target(),
                pool: self.pool_config(),
            },
        }
    }
}
