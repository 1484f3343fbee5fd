//! Cache layer backends.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use redis::{RedisBackend, RedisConfig};

/// Byte-level key/value store used for one cache layer.
///
/// All methods take `&self`; implementations use interior mutability or an
/// external server. Futures are `Send` so backends can be used from spawned
/// rebuild tasks.
pub trait CacheBackend: Send + Sync + Clone + 'static {
    /// Retrieve value by key. `Ok(None)` is a miss.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store value with an optional TTL (`None` = no expiry).
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> impl Future<Output = Result<()>> + Send;

    /// Remove value.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Store `value` only if `key` is absent (or expired). Returns whether it was stored.
    ///
    /// The primitive under the rebuild lock: must be atomic across all clients of
    /// the backend.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Remove `key` only if its current value equals `expected`. Returns whether it
    /// was removed.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn delete_if_eq(&self, key: &str, expected: &[u8]) -> impl Future<Output = Result<bool>> + Send;

    /// Check if key exists.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unreachable.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Verify the backend is accessible.
    ///
    /// # Errors
    /// Returns `Err` if the backend is not accessible.
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }

    /// Clear every entry.
    ///
    /// # Errors
    /// Returns `Err` if the operation is not implemented or fails.
    fn clear_all(&self) -> impl Future<Output = Result<()>> + Send {
        async {
            Err(crate::error::Error::NotImplemented(
                "clear_all not implemented for this backend".to_string(),
            ))
        }
    }
}

/// Shared cache layer selected at startup: Redis when a URL is configured,
/// otherwise a process-local map.
#[derive(Clone)]
pub enum SharedBackend {
    InMemory(InMemoryBackend),
    #[cfg(feature = "redis")]
    Redis(RedisBackend),
}

impl SharedBackend {
    /// # Errors
    /// Returns `Err` if the Redis pool cannot be created.
    pub fn from_url(url: Option<&str>) -> Result<Self> {
        let Some(url) = url else {
            warn!("⚠ REDIS_URL not set: shared cache layer is in-memory and not shared between processes");
            return Ok(SharedBackend::InMemory(InMemoryBackend::new()));
        };

        #[cfg(feature = "redis")]
        {
            Ok(SharedBackend::Redis(RedisBackend::from_url(url)?))
        }

        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            warn!("⚠ REDIS_URL is set but the redis feature is disabled; using in-memory shared layer");
            Ok(SharedBackend::InMemory(InMemoryBackend::new()))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SharedBackend::InMemory(_) => "inmemory",
            #[cfg(feature = "redis")]
            SharedBackend::Redis(_) => "redis",
        }
    }
}

impl CacheBackend for SharedBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            SharedBackend::InMemory(b) => b.get(key).await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        match self {
            SharedBackend::InMemory(b) => b.set(key, value, ttl).await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            SharedBackend::InMemory(b) => b.delete(key).await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.delete(key).await,
        }
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        match self {
            SharedBackend::InMemory(b) => b.set_nx(key, value, ttl).await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.set_nx(key, value, ttl).await,
        }
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        match self {
            SharedBackend::InMemory(b) => b.delete_if_eq(key, expected).await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.delete_if_eq(key, expected).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            SharedBackend::InMemory(b) => b.exists(key).await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.exists(key).await,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        match self {
            SharedBackend::InMemory(b) => b.health_check().await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.health_check().await,
        }
    }

    async fn clear_all(&self) -> Result<()> {
        match self {
            SharedBackend::InMemory(b) => b.clear_all().await,
            #[cfg(feature = "redis")]
            SharedBackend::Redis(b) => b.clear_all().await,
        }
    }
}
