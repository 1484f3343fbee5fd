//! In-memory cache layer.
//!
//! Backs the fast per-process layer, and the shared layer when no Redis URL is
//! configured. DashMap gives per-key sharded locking; TTLs are checked on access.

use super::CacheBackend;
use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map(|d| Instant::now() + d);
        StoredValue { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Thread-safe in-memory backend. Clones share the same map.
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Number of entries, expired ones included until next accessed.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired() {
                debug!("✓ InMemory GET {} -> HIT", key);
                return Ok(Some(entry.data.clone()));
            }
        }

        self.store.remove_if(key, |_, v| v.is_expired());
        debug!("✓ InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.store.insert(key.to_string(), StoredValue::new(value, ttl));

        if let Some(d) = ttl {
            debug!("✓ InMemory SET {} (TTL: {:?})", key, d);
        } else {
            debug!("✓ InMemory SET {}", key);
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        // The entry guard holds the shard lock, so check-and-insert is atomic
        let stored = match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, Some(ttl)));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, Some(ttl)));
                true
            }
        };
        debug!(
            "✓ InMemory SETNX {} (TTL: {:?}) -> {}",
            key,
            ttl,
            if stored { "SET" } else { "EXISTS" }
        );
        Ok(stored)
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let removed = self
            .store
            .remove_if(key, |_, v| !v.is_expired() && v.data == expected)
            .is_some();
        debug!(
            "✓ InMemory DELIFEQ {} -> {}",
            key,
            if removed { "DELETED" } else { "KEPT" }
        );
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if let Some(entry) = self.store.get(key) {
            return Ok(!entry.is_expired());
        }

        Ok(false)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory CLEAR_ALL executed - all cache cleared!");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_backend_set_get() {
        let backend = InMemoryBackend::new();

        backend
            .set("key1", b"value1".to_vec(), None)
            .await
            .expect("Failed to set");

        let result = backend.get("key1").await.expect("Failed to get");
        assert_eq!(result, Some(b"value1".to_vec()));
        assert_eq!(backend.get("missing").await.expect("Failed to get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inmemory_backend_ttl_expiration() {
        let backend = InMemoryBackend::new();

        backend
            .set("key1", b"value1".to_vec(), Some(Duration::from_millis(100)))
            .await
            .expect("Failed to set");
        assert!(backend.get("key1").await.expect("Failed to get").is_some());

        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(backend.get("key1").await.expect("Failed to get").is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_live_entries_only() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(10);

        assert!(backend.set_nx("lock", b"a".to_vec(), ttl).await.unwrap());
        assert!(!backend.set_nx("lock", b"b".to_vec(), ttl).await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap(), Some(b"a".to_vec()));

        // Holder crashed: the lock expires and can be re-acquired
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(backend.set_nx("lock", b"c".to_vec(), ttl).await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap(), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_set_nx_is_exclusive_under_contention() {
        let backend = InMemoryBackend::new();
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let b = backend.clone();
            handles.push(tokio::spawn(async move {
                b.set_nx("lock", vec![i], Duration::from_secs(60)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("Task failed") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete_if_eq_only_removes_own_value() {
        let backend = InMemoryBackend::new();
        backend.set("lock", b"mine".to_vec(), None).await.unwrap();

        assert!(!backend.delete_if_eq("lock", b"theirs").await.unwrap());
        assert!(backend.exists("lock").await.unwrap());
        assert!(backend.delete_if_eq("lock", b"mine").await.unwrap());
        assert!(!backend.exists("lock").await.unwrap());
        assert!(!backend.delete_if_eq("lock", b"mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_backend_clear_all() {
        let backend = InMemoryBackend::new();
        backend.set("key1", b"value_with_data".to_vec(), None).await.unwrap();
        backend.set("key2", b"data".to_vec(), None).await.unwrap();
        assert_eq!(backend.len(), 2);

        backend.clear_all().await.expect("Failed to clear");
        assert!(backend.is_empty());
        assert!(!backend.exists("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_backend_clone_shares_store() {
        let backend1 = InMemoryBackend::new();
        backend1.set("key", b"value".to_vec(), None).await.unwrap();

        let backend2 = backend1.clone();
        assert_eq!(backend2.get("key").await.unwrap(), Some(b"value".to_vec()));
    }
}
