//! Two-level cache: a short-TTL in-process layer over a shared layer.
//!
//! Reads check the fast layer, then the shared layer, seeding the fast layer on a
//! shared hit. Entries older than their TTL, undecodable entries and layer errors
//! all read as absent. Writes go to the shared layer and seed the fast layer.
//!
//! The cache also hosts the rebuild lock: [`TieredCache::try_lock`] sets a random
//! token with `SET NX` semantics on the shared layer and [`RebuildLock::release`]
//! deletes the key only if it still holds that token.

use crate::backend::{CacheBackend, InMemoryBackend};
use crate::error::Result;
use crate::observability::{NoOpMetrics, PipelineMetrics, TtlPolicy};
use crate::serialization::{decode_entry, encode_entry, CacheEntry};
use crate::window::{Clock, SystemClock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Fast layer TTL when none is configured.
pub const DEFAULT_FAST_TTL: Duration = Duration::from_secs(30);

pub struct TieredCache<B: CacheBackend> {
    fast: InMemoryBackend,
    shared: B,
    fast_ttl: Duration,
    ttl_policy: TtlPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PipelineMetrics>,
}

impl<B: CacheBackend> TieredCache<B> {
    pub fn new(shared: B) -> Self {
        TieredCache {
            fast: InMemoryBackend::new(),
            shared,
            fast_ttl: DEFAULT_FAST_TTL,
            ttl_policy: TtlPolicy::default(),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// TTL of fast-layer copies. Zero disables the fast layer.
    pub fn with_fast_ttl(mut self, ttl: Duration) -> Self {
        self.fast_ttl = ttl;
        self
    }

    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared-layer TTL for a section.
    pub fn ttl_for(&self, section: &str) -> Duration {
        self.ttl_policy.get_ttl(section)
    }

    pub fn shared(&self) -> &B {
        &self.shared
    }

    /// Read a fresh entry, or `None`.
    pub async fn read(&self, key: &str) -> Option<CacheEntry> {
        let started = Instant::now();
        let now = self.clock.now();

        if let Some(entry) = self.read_layer(&self.fast, "fast", key).await {
            if !entry.is_expired(now) {
                self.metrics.record_hit(key, started.elapsed());
                return Some(entry);
            }
        }

        let entry = match self.read_layer(&self.shared, "shared", key).await {
            Some(entry) if !entry.is_expired(now) => entry,
            Some(_) => {
                debug!("Shared entry {} is past its TTL", key);
                self.metrics.record_miss(key, started.elapsed());
                return None;
            }
            None => {
                self.metrics.record_miss(key, started.elapsed());
                return None;
            }
        };

        self.seed_fast(key, &entry, now).await;
        self.metrics.record_hit(key, started.elapsed());
        Some(entry)
    }

    async fn read_layer<L: CacheBackend>(&self, layer: &L, name: &str, key: &str) -> Option<CacheEntry> {
        let bytes = match layer.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("⚠ {} layer read failed for {}: {}", name, key, e);
                self.metrics.record_cache_error(key, &e.to_string());
                return None;
            }
        };

        match decode_entry(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("⚠ Evicting undecodable {} entry {}: {}", name, key, e);
                self.metrics.record_cache_error(key, &e.to_string());
                if let Err(e) = layer.delete(key).await {
                    warn!("⚠ Eviction of {} failed: {}", key, e);
                }
                None
            }
        }
    }

    async fn seed_fast(&self, key: &str, entry: &CacheEntry, now: chrono::DateTime<chrono::Utc>) {
        if self.fast_ttl.is_zero() {
            return;
        }
        let remaining = entry.ttl.saturating_sub(entry.age(now));
        let ttl = self.fast_ttl.min(remaining);
        if ttl.is_zero() {
            return;
        }
        let seeded = match encode_entry(entry) {
            Ok(bytes) => self.fast.set(key, bytes, Some(ttl)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = seeded {
            warn!("⚠ Could not seed fast layer for {}: {}", key, e);
            self.metrics.record_cache_error(key, &e.to_string());
        }
    }

    /// Write an entry generated now to the shared layer and seed the fast layer.
    ///
    /// The entry is returned even when the shared write fails, so callers can still
    /// serve it.
    ///
    /// # Errors
    /// Returns `Error::SerializationError` if the payload cannot be encoded.
    pub async fn write<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        payload: &T,
        ttl: Duration,
    ) -> Result<(CacheEntry, bool)> {
        let started = Instant::now();
        let now = self.clock.now();
        let entry = CacheEntry::from_value(key, payload, now, ttl)?;
        let bytes = encode_entry(&entry)?;

        let stored = match self.shared.set(key, bytes, Some(ttl)).await {
            Ok(()) => {
                debug!("✓ Cache WRITE {} ({:?}) in {:?}", key, ttl, started.elapsed());
                true
            }
            Err(e) => {
                warn!("⚠ Shared layer write failed for {}: {}", key, e);
                self.metrics.record_cache_error(key, &e.to_string());
                false
            }
        };

        self.seed_fast(key, &entry, now).await;
        Ok((entry, stored))
    }

    /// Try to take the named lock for `ttl`. `Ok(None)` means another holder has it.
    ///
    /// # Errors
    /// Returns `Err` if the shared layer is unreachable.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<RebuildLock<B>>> {
        let token = Uuid::now_v7().to_string();
        let acquired = self
            .shared
            .set_nx(key, token.clone().into_bytes(), ttl)
            .await?;

        if acquired {
            info!("🔒 Acquired {} (ttl {:?})", key, ttl);
            Ok(Some(RebuildLock {
                backend: self.shared.clone(),
                key: key.to_string(),
                token,
                released: false,
            }))
        } else {
            debug!("Lock {} is held elsewhere", key);
            Ok(None)
        }
    }

    /// Drop both layers' contents.
    ///
    /// # Errors
    /// Returns `Err` if the shared layer cannot be cleared.
    pub async fn flush(&self) -> Result<()> {
        self.fast.clear_all().await?;
        self.shared.clear_all().await
    }

    /// Whether the shared layer answers.
    pub async fn shared_healthy(&self) -> bool {
        match self.shared.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!("⚠ Shared layer health check failed: {}", e);
                false
            }
        }
    }
}

/// Held rebuild lock. Release explicitly with [`RebuildLock::release`]; a lock
/// dropped without release is released from a spawned task, and otherwise expires
/// with its TTL.
pub struct RebuildLock<B: CacheBackend> {
    backend: B,
    key: String,
    token: String,
    released: bool,
}

impl<B: CacheBackend> RebuildLock<B> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock if this holder still owns it. Returns whether it did.
    pub async fn release(mut self) -> bool {
        self.released = true;
        release_lock(&self.backend, &self.key, &self.token).await
    }
}

async fn release_lock<B: CacheBackend>(backend: &B, key: &str, token: &str) -> bool {
    match backend.delete_if_eq(key, token.as_bytes()).await {
        Ok(true) => {
            info!("🔓 Released {}", key);
            true
        }
        Ok(false) => {
            warn!("⚠ Lock {} expired or was taken over before release", key);
            false
        }
        Err(e) => {
            warn!("⚠ Failed to release {} (expires with TTL): {}", key, e);
            false
        }
    }
}

impl<B: CacheBackend> Drop for RebuildLock<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("⚠ Lock {} dropped outside a runtime; expires with TTL", self.key);
            return;
        };
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            release_lock(&backend, &key, &token).await;
        });
    }
}
