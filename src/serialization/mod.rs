//! Cache entry model and its versioned binary envelope.
//!
//! Every value written to a cache layer is a [`CacheEntry`]: key, JSON payload,
//! generation timestamp and TTL. On the wire it is wrapped in a postcard envelope:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────────────────┐
//! │  MAGIC (4 bytes)│ VERSION (u32)   │ key, payload JSON, generated_at, ttl │
//! └─────────────────┴─────────────────┴──────────────────────────────────────┘
//!   "SRUP"
//! ```
//!
//! The payload travels as a JSON string because section payloads are free-form
//! `serde_json::Value`s, which postcard cannot encode directly.
//!
//! Bad magic, a different schema version or a truncated payload are all rejected;
//! the cache treats a rejected entry as absent and evicts it.

use crate::error::{Error, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Magic header for cache entries.
pub const CACHE_MAGIC: [u8; 4] = *b"SRUP";

/// Current schema version.
///
/// Increment when [`CacheEntry`] or any section payload changes shape. Entries
/// written by other versions are evicted and rebuilt.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope around any serializable payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEnvelope<T> {
    pub magic: [u8; 4],
    pub version: u32,
    pub payload: T,
}

impl<T> CacheEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: CACHE_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// A value held in a cache layer.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub generated_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// `generated_at` is truncated to the millisecond precision of the wire form.
    pub fn new(key: impl Into<String>, payload: Value, generated_at: DateTime<Utc>, ttl: Duration) -> Self {
        CacheEntry {
            key: key.into(),
            payload,
            generated_at: generated_at.trunc_subsecs(3),
            ttl,
        }
    }

    /// Build an entry from any serializable payload.
    ///
    /// # Errors
    /// Returns `Error::SerializationError` if the value cannot be represented as JSON.
    pub fn from_value<T: Serialize + ?Sized>(
        key: impl Into<String>,
        value: &T,
        generated_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self> {
        let payload = serde_json::to_value(value)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        Ok(Self::new(key, payload, generated_at, ttl))
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.generated_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Older than its TTL. Expired entries are treated as absent, not as errors.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    key: String,
    payload: String,
    generated_at_ms: i64,
    ttl_ms: u64,
}

/// Serialize a value with envelope for cache storage.
///
/// # Errors
/// Returns `Error::SerializationError` if postcard serialization fails.
pub fn serialize_for_cache<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let envelope = CacheEnvelope::new(value);
    postcard::to_allocvec(&envelope).map_err(|e| {
        error!("Cache serialization failed: {}", e);
        Error::SerializationError(e.to_string())
    })
}

/// Deserialize a value from cache storage with magic and version validation.
///
/// # Errors
/// - `Error::InvalidCacheEntry`: invalid magic header
/// - `Error::VersionMismatch`: schema version mismatch
/// - `Error::DeserializationError`: corrupted postcard payload
pub fn deserialize_from_cache<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    let envelope: CacheEnvelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        error!("Cache deserialization failed: {}", e);
        Error::DeserializationError(e.to_string())
    })?;

    if envelope.magic != CACHE_MAGIC {
        warn!(
            "Invalid cache entry: expected magic {:?}, got {:?}",
            CACHE_MAGIC, envelope.magic
        );
        return Err(Error::InvalidCacheEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            CACHE_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        warn!(
            "Cache version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION, envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}

/// Encode an entry for a cache layer.
///
/// # Errors
/// Returns `Error::SerializationError` if encoding fails.
pub fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>> {
    let wire = WireEntry {
        key: entry.key.clone(),
        payload: serde_json::to_string(&entry.payload)
            .map_err(|e| Error::SerializationError(e.to_string()))?,
        generated_at_ms: entry.generated_at.timestamp_millis(),
        ttl_ms: entry.ttl.as_millis().min(u64::MAX as u128) as u64,
    };
    serialize_for_cache(&wire)
}

/// Decode an entry read from a cache layer.
///
/// # Errors
/// Same as [`deserialize_from_cache`], plus `Error::DeserializationError` for an
/// invalid payload or timestamp.
pub fn decode_entry(bytes: &[u8]) -> Result<CacheEntry> {
    let wire: WireEntry = deserialize_from_cache(bytes)?;
    let payload: Value = serde_json::from_str(&wire.payload)
        .map_err(|e| Error::DeserializationError(e.to_string()))?;
    let generated_at = DateTime::<Utc>::from_timestamp_millis(wire.generated_at_ms)
        .ok_or_else(|| Error::DeserializationError("timestamp out of range".to_string()))?;
    Ok(CacheEntry {
        key: wire.key,
        payload,
        generated_at,
        ttl: Duration::from_millis(wire.ttl_ms),
    })
}
