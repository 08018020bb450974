// ABOUTME: The optional shared cache tier that sits between the in-memory cache and the backend.
// ABOUTME: Provides an in-process implementation for tests and a Redis one behind the `redis` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use quill_core::{EntityKey, EntityType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("remote cache unavailable: {0}")]
    Unavailable(String),
}

/// Key under which a record is stored remotely: `<prefix><entity>:<key>`.
pub fn remote_key(prefix: &str, entity: &EntityType, key: &EntityKey) -> String {
    format!("{prefix}{}:{}", entity.as_str(), key.as_str())
}

/// A shared key/value cache holding serialized envelopes.
///
/// Failures are reported to the caller, which logs them and carries on with
/// the backend; a remote cache is never required for correctness.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;
}

/// An in-process remote cache with expiry, plus a switch to simulate outages.
#[derive(Default)]
pub struct MemoryRemote {
    values: Mutex<HashMap<String, (String, Instant)>>,
    failing: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.values
            .lock()
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCache for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError> {
        self.check()?;
        let mut values = self.values.lock();
        match values.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), RemoteError> {
        self.check()?;
        self.values
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.values.lock().remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
mod redis_remote {
    use super::*;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;

    /// Redis-backed remote cache over a reconnecting connection manager.
    #[derive(Clone)]
    pub struct RedisRemote {
        connection: ConnectionManager,
    }

    impl std::fmt::Debug for RedisRemote {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisRemote")
                .field("connection", &"<ConnectionManager>")
                .finish()
        }
    }

    impl RedisRemote {
        pub async fn connect(url: &str) -> Result<Self, RemoteError> {
            let client = redis::Client::open(url)?;
            let connection = client.get_connection_manager().await?;
            tracing::info!("connected to redis cache");
            Ok(Self { connection })
        }
    }

    #[async_trait]
    impl RemoteCache for RedisRemote {
        async fn get(&self, key: &str) -> Result<Option<String>, RemoteError> {
            let mut conn = self.connection.clone();
            Ok(conn.get(key).await?)
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), RemoteError> {
            let mut conn = self.connection.clone();
            let seconds = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(key, value, seconds).await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), RemoteError> {
            let mut conn = self.connection.clone();
            conn.del::<_, ()>(key).await?;
            Ok(())
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_remote::RedisRemote;
