//! Read path with stale-while-revalidate.
//!
//! A read returns whatever the cache holds. On a miss it returns the section's
//! fallback (a direct computation or a "building" placeholder) and starts a
//! background rebuild of that section. A per-section in-flight flag keeps a burst
//! of misses from starting more than one rebuild from this process; the rebuild
//! lock covers other processes.
//!
//! Rebuilds started by one service take turns on a local gate, so a section
//! triggered while another rebuild runs waits for it instead of finding the
//! lock taken and ending skipped. While a rebuild of every section is in
//! flight, misses do not trigger anything: that rebuild already covers them.

use crate::backend::CacheBackend;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::inventory::{self, InventorySnapshot};
use crate::key::CacheKeyBuilder;
use crate::rebuild::{summarize_entity, RebuildCoordinator, RebuildStatus, ReportContext};
use crate::section::{self, Section};
use crate::strategy::{MissPolicy, SectionRead};
use crate::vendor::OrderSource;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// In-flight slot for `rebuild_all`, after the per-section slots.
const ALL_SLOT: usize = Section::ALL.len();

#[derive(Default)]
struct RebuildSlots {
    flags: [AtomicBool; Section::ALL.len() + 1],
    /// Held by the running rebuild; queued ones keep their flag set meanwhile.
    gate: Mutex<()>,
}

impl RebuildSlots {
    fn busy(&self, slot: usize) -> bool {
        self.flags[slot].load(Ordering::Acquire)
    }
}

type InFlight = Arc<RebuildSlots>;

/// Clears an in-flight flag when the rebuild task ends, however it ends.
struct InFlightGuard {
    slots: InFlight,
    slot: usize,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slots.flags[self.slot].store(false, Ordering::Release);
    }
}

/// Point-in-time view of the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub today: NaiveDate,
    pub entities: usize,
    pub rebuilding: Vec<&'static str>,
    pub stored_periods: usize,
    pub store_flushes: u64,
    pub shared_layer_healthy: bool,
}

/// Cheap to clone; clones share the context and the in-flight flags.
pub struct ReportService<S: OrderSource, B: CacheBackend> {
    coordinator: RebuildCoordinator<S, B>,
    in_flight: InFlight,
}

impl<S: OrderSource, B: CacheBackend> Clone for ReportService<S, B> {
    fn clone(&self) -> Self {
        ReportService {
            coordinator: self.coordinator.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S: OrderSource, B: CacheBackend> ReportService<S, B> {
    pub fn new(ctx: Arc<ReportContext<S, B>>) -> Self {
        ReportService {
            coordinator: RebuildCoordinator::new(ctx),
            in_flight: Arc::new(Default::default()),
        }
    }

    pub fn context(&self) -> &Arc<ReportContext<S, B>> {
        self.coordinator.context()
    }

    pub fn coordinator(&self) -> &RebuildCoordinator<S, B> {
        &self.coordinator
    }

    /// Read a section-wide payload.
    ///
    /// # Errors
    /// Returns `Error::Other` for a per-entity section.
    pub async fn read_section(&self, section: Section) -> Result<SectionRead> {
        if section.is_per_entity() {
            return Err(Error::Other(format!(
                "Section {} is per entity; use read_entity_section",
                section
            )));
        }
        Ok(self
            .read_key(section, &CacheKeyBuilder::section(section), None)
            .await)
    }

    /// Read one entity's payload of a per-entity section.
    ///
    /// # Errors
    /// Returns `Error::Other` for a section-wide section or an unknown entity.
    pub async fn read_entity_section(&self, section: Section, entity_id: &str) -> Result<SectionRead> {
        if !section.is_per_entity() {
            return Err(Error::Other(format!(
                "Section {} is not per entity; use read_section",
                section
            )));
        }
        let entity = self
            .context()
            .directory
            .get(entity_id)
            .ok_or_else(|| Error::Other(format!("Unknown entity: {}", entity_id)))?;
        Ok(self
            .read_key(
                section,
                &CacheKeyBuilder::entity_section(section, entity_id),
                Some(entity),
            )
            .await)
    }

    async fn read_key(&self, section: Section, key: &str, entity: Option<&Entity>) -> SectionRead {
        if let Some(entry) = self.context().cache.read(key).await {
            return SectionRead::Hit(entry);
        }

        self.trigger_rebuild(section);

        match (section.miss_policy(), entity) {
            (MissPolicy::DirectFallback, Some(entity)) => match self.compute_direct(section, entity).await {
                Some(value) => SectionRead::Direct(value),
                None => SectionRead::Building,
            },
            _ => SectionRead::Building,
        }
    }

    /// Compute one entity's payload now, without touching the cache.
    async fn compute_direct(&self, section: Section, entity: &Entity) -> Option<Value> {
        let ctx = self.context();
        let today = ctx.today();
        let windows = section.windows(today, &ctx.config);
        let outcome = summarize_entity(&**ctx, entity, &windows, today).await;

        let Some(summaries) = outcome.summaries else {
            warn!(
                "⚠ Direct {} for {} failed: {}",
                section,
                entity.id,
                outcome.error.unwrap_or_default()
            );
            return None;
        };

        let value = match section {
            Section::Staff => summaries
                .first()
                .map(|summary| serde_json::to_value(section::staff_payload(entity, summary))),
            Section::ProductVelocity => Some(serde_json::to_value(section::velocity_payload(entity, &summaries))),
            Section::WeeklyTrend => None,
        }?;

        match value {
            Ok(value) => {
                debug!("Direct {} for {} computed", section, entity.id);
                Some(value)
            }
            Err(e) => {
                error!("✗ Could not serialize direct {} payload: {}", section, e);
                None
            }
        }
    }

    /// Start a background rebuild of `section` unless one from this process is
    /// already queued or running, or a rebuild of every section is. Returns the
    /// task handle when one was started.
    pub fn trigger_rebuild(&self, section: Section) -> Option<JoinHandle<RebuildStatus>> {
        if self.in_flight.busy(ALL_SLOT) {
            debug!("Rebuild all in flight, covers {}", section);
            return None;
        }
        let coordinator = self.coordinator.clone();
        self.spawn_guarded(section.index(), section.name(), async move {
            coordinator.rebuild_section(section).await
        })
    }

    /// Start a background rebuild of every section.
    pub fn trigger_rebuild_all(&self) -> Option<JoinHandle<RebuildStatus>> {
        let coordinator = self.coordinator.clone();
        self.spawn_guarded(ALL_SLOT, "all", async move { coordinator.rebuild_all().await })
    }

    fn spawn_guarded<F>(&self, slot: usize, scope: &str, rebuild: F) -> Option<JoinHandle<RebuildStatus>>
    where
        F: std::future::Future<Output = RebuildStatus> + Send + 'static,
    {
        if self.in_flight.flags[slot]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Rebuild {} already in flight, not triggering another", scope);
            return None;
        }

        self.context().metrics.record_rebuild_triggered(scope);
        let guard = InFlightGuard {
            slots: Arc::clone(&self.in_flight),
            slot,
        };
        Some(tokio::spawn(async move {
            let _turn = guard.slots.gate.lock().await;
            rebuild.await
        }))
    }

    /// Current on-hand stock across the directory, straight from the vendor.
    ///
    /// # Errors
    /// Propagates upstream errors from the source.
    pub async fn inventory(&self) -> Result<InventorySnapshot> {
        let ctx = self.context();
        inventory::pull_inventory(
            &ctx.source,
            &ctx.directory,
            &ctx.config.excluded_products,
            ctx.clock.now(),
        )
        .await
    }

    /// Whether a rebuild covering `section` started by this process is queued
    /// or running.
    pub fn is_rebuilding(&self, section: Section) -> bool {
        self.in_flight.busy(section.index()) || self.in_flight.busy(ALL_SLOT)
    }

    pub async fn status(&self) -> ServiceStatus {
        let ctx = self.context();
        let mut rebuilding: Vec<&'static str> = Section::ALL
            .into_iter()
            .filter(|s| self.in_flight.busy(s.index()))
            .map(Section::name)
            .collect();
        if self.in_flight.busy(ALL_SLOT) {
            rebuilding.push("all");
        }

        ServiceStatus {
            today: ctx.today(),
            entities: ctx.directory.len(),
            rebuilding,
            stored_periods: ctx.store.len(),
            store_flushes: ctx.store.flush_count(),
            shared_layer_healthy: ctx.cache.shared_healthy().await,
        }
    }
}
