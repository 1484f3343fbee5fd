//! Persistent store of completed period summaries.
//!
//! One JSON document maps `"<entityRef>:<windowStart>"` to a [`PeriodSummary`]. The
//! whole document is loaded at startup and kept in a [`DashMap`]; writes are
//! coalesced into a single delayed flush that rewrites the file atomically
//! (temp file + rename).

use crate::aggregate::PeriodSummary;
use crate::error::Result;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Store key for one (entity, window start).
pub fn store_key(entity_ref: &str, window_start: NaiveDate) -> String {
    format!("{}:{}", entity_ref, window_start.format("%Y-%m-%d"))
}

struct StoreInner {
    path: Option<PathBuf>,
    entries: DashMap<String, PeriodSummary>,
    flush_delay: Duration,
    flush_scheduled: AtomicBool,
    flushes: AtomicU64,
    write_lock: Mutex<()>,
}

/// Completed-period summaries, shared by reference between readers and rebuilds.
#[derive(Clone)]
pub struct PeriodStore {
    inner: Arc<StoreInner>,
}

impl PeriodStore {
    fn with_path(path: Option<PathBuf>, entries: DashMap<String, PeriodSummary>, flush_delay: Duration) -> Self {
        PeriodStore {
            inner: Arc::new(StoreInner {
                path,
                entries,
                flush_delay,
                flush_scheduled: AtomicBool::new(false),
                flushes: AtomicU64::new(0),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::with_path(None, DashMap::new(), Duration::ZERO)
    }

    /// Load the store document at `path`. A missing file yields an empty store; an
    /// unreadable one is logged and replaced on the next flush.
    ///
    /// # Errors
    /// Returns `Error::StorageError` if the file exists but cannot be read.
    pub async fn load(path: impl Into<PathBuf>, flush_delay: Duration) -> Result<Self> {
        let path = path.into();
        let entries = DashMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, PeriodSummary>>(&bytes) {
                Ok(map) => {
                    for (key, summary) in map {
                        entries.insert(key, summary);
                    }
                    info!("Loaded {} period summaries from {}", entries.len(), path.display());
                }
                Err(e) => {
                    warn!(
                        "⚠ Period store {} is unreadable, starting empty: {}",
                        path.display(),
                        e
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No period store at {}, starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self::with_path(Some(path), entries, flush_delay))
    }

    pub fn get(&self, entity_ref: &str, window_start: NaiveDate) -> Option<PeriodSummary> {
        let key = store_key(entity_ref, window_start);
        let hit = self.inner.entries.get(&key).map(|s| s.clone());
        debug!(
            "✓ Store GET {} -> {}",
            key,
            if hit.is_some() { "HIT" } else { "MISS" }
        );
        hit
    }

    /// Persist a summary if its window ended before `today` and it saw at least one
    /// transaction. Returns whether it was stored.
    ///
    /// Schedules a flush unless one is already pending.
    pub fn put(&self, entity_ref: &str, summary: &PeriodSummary, today: NaiveDate) -> bool {
        if !summary.window.is_completed(today) {
            debug!("Store PUT {} skipped: window {} still open", entity_ref, summary.window);
            return false;
        }
        if summary.is_trivial() {
            debug!("Store PUT {} skipped: window {} has no transactions", entity_ref, summary.window);
            return false;
        }

        let key = store_key(entity_ref, summary.window.start);
        let mut stored = summary.clone();
        stored.is_partial = false;
        self.inner.entries.insert(key.clone(), stored);
        debug!("✓ Store PUT {}", key);

        self.schedule_flush();
        true
    }

    fn schedule_flush(&self) {
        if self.inner.path.is_none() {
            return;
        }
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.inner.flush_scheduled.store(false, Ordering::Release);
                warn!("⚠ No runtime for period store flush; call flush_now() explicitly");
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            tokio::time::sleep(inner.flush_delay).await;
            inner.flush_scheduled.store(false, Ordering::Release);
            if let Err(e) = write_document(&inner).await {
                warn!("⚠ Period store flush failed: {}", e);
            }
        });
    }

    /// Write the document immediately.
    ///
    /// # Errors
    /// Returns `Error::StorageError` or `Error::SerializationError` if the write fails.
    pub async fn flush_now(&self) -> Result<()> {
        write_document(&self.inner).await
    }

    /// Completed flushes since startup.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }
}

async fn write_document(inner: &StoreInner) -> Result<()> {
    let Some(path) = inner.path.as_ref() else {
        return Ok(());
    };
    let _guard = inner.write_lock.lock().await;

    let snapshot: BTreeMap<String, PeriodSummary> = inner
        .entries
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;

    inner.flushes.fetch_add(1, Ordering::AcqRel);
    info!(
        "✓ Period store flushed: {} summaries ({} bytes) -> {}",
        snapshot.len(),
        bytes.len(),
        path.display()
    );
    Ok(())
}
