//! Background rebuild of report sections.
//!
//! A rebuild runs under the single shared-layer lock [`REBUILD_LOCK_KEY`]:
//!
//! ```text
//! Idle ──try_lock ok──▶ Running ──(sections done)──▶ release ──▶ Idle
//!   └───try_lock busy──▶ Skipped ──▶ Idle
//! ```
//!
//! Within a section, entities are aggregated concurrently, at most
//! `rebuild_concurrency` at a time. Completed windows already in the
//! [`PeriodStore`] are reused; only the missing windows are fetched, one query per
//! contiguous run. One entity's failure is recorded in its [`EntityOutcome`] and
//! the section carries on with the rest.

use crate::aggregate::{PeriodSummary, StreamAggregator};
use crate::backend::{CacheBackend, SharedBackend};
use crate::config::PipelineConfig;
use crate::entity::{Entity, EntityDirectory};
use crate::error::Result;
use crate::key::{CacheKeyBuilder, REBUILD_LOCK_KEY};
use crate::observability::{NoOpMetrics, PipelineMetrics, TtlPolicy};
use crate::section::{self, Section};
use crate::store::PeriodStore;
use crate::tiered::TieredCache;
use crate::vendor::{OrderSource, VendorClient};
use crate::window::{Clock, DateRange, PeriodWindow, SystemClock};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Everything a rebuild or a read needs, built once at startup and shared by `Arc`.
pub struct ReportContext<S: OrderSource, B: CacheBackend> {
    pub config: PipelineConfig,
    pub source: S,
    pub directory: EntityDirectory,
    pub store: PeriodStore,
    pub cache: TieredCache<B>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn PipelineMetrics>,
}

impl<S: OrderSource, B: CacheBackend> ReportContext<S, B> {
    pub fn new(
        config: PipelineConfig,
        source: S,
        directory: EntityDirectory,
        store: PeriodStore,
        shared: B,
    ) -> Self {
        let cache = TieredCache::new(shared)
            .with_fast_ttl(config.fast_cache_ttl)
            .with_ttl_policy(TtlPolicy::from_config(&config));
        ReportContext {
            config,
            source,
            directory,
            store,
            cache,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = self.cache.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn PipelineMetrics>) -> Self {
        self.cache = self.cache.with_metrics(Arc::clone(&metrics));
        self.metrics = metrics;
        self
    }

    /// Today's date in the report timezone.
    pub fn today(&self) -> NaiveDate {
        self.clock.today(self.config.timezone)
    }
}

impl ReportContext<VendorClient, SharedBackend> {
    /// Production wiring: HTTP vendor client, entity directory, period store from
    /// disk, and Redis (or in-memory) shared layer.
    ///
    /// # Errors
    /// - `Error::ConfigError` for invalid configuration or missing credentials
    /// - upstream errors if the entity directory cannot be fetched
    /// - `Error::StorageError` if the period store cannot be read
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let source = VendorClient::new(&config.vendor)?;
        let directory = EntityDirectory::load(&source, &config.excluded_entities).await?;
        let store = PeriodStore::load(config.store_path.clone(), config.store_flush_delay).await?;
        let shared = SharedBackend::from_url(config.redis_url.as_deref())?;
        info!(
            "✓ Report context ready: {} entities, {} stored periods, {} shared layer",
            directory.len(),
            store.len(),
            shared.kind()
        );
        Ok(Self::new(config, source, directory, store, shared))
    }
}

/// Result of aggregating one entity for one section.
#[derive(Clone, Debug)]
pub struct EntityOutcome {
    pub entity: Entity,
    /// One summary per requested window, in window order. `None` on failure.
    pub summaries: Option<Vec<PeriodSummary>>,
    pub error: Option<String>,
    pub windows_from_store: usize,
    pub windows_fetched: usize,
    pub records_seen: u64,
}

impl EntityOutcome {
    pub fn succeeded(entity: Entity, summaries: Vec<PeriodSummary>) -> Self {
        EntityOutcome {
            entity,
            summaries: Some(summaries),
            error: None,
            windows_from_store: 0,
            windows_fetched: 0,
            records_seen: 0,
        }
    }

    pub fn failed(entity: Entity, reason: String) -> Self {
        EntityOutcome {
            entity,
            summaries: None,
            error: Some(reason),
            windows_from_store: 0,
            windows_fetched: 0,
            records_seen: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.summaries.is_some()
    }
}

/// What one section rebuild did.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SectionReport {
    pub section: Section,
    pub entities_ok: usize,
    /// Entity id to failure reason.
    pub failed_entities: BTreeMap<String, String>,
    pub windows_from_store: usize,
    pub windows_fetched: usize,
    pub records_seen: u64,
    pub keys_written: usize,
    pub write_failures: usize,
    pub duration: Duration,
}

impl SectionReport {
    fn new(section: Section) -> Self {
        SectionReport {
            section,
            entities_ok: 0,
            failed_entities: BTreeMap::new(),
            windows_from_store: 0,
            windows_fetched: 0,
            records_seen: 0,
            keys_written: 0,
            write_failures: 0,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RebuildStatus {
    Completed { sections: Vec<SectionReport> },
    /// Another rebuild holds the lock.
    Skipped,
    /// The lock could not be attempted (shared layer unreachable).
    Failed { reason: String },
}

impl RebuildStatus {
    pub fn outcome(&self) -> &'static str {
        match self {
            RebuildStatus::Completed { .. } => "completed",
            RebuildStatus::Skipped => "skipped",
            RebuildStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RebuildStatus::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RebuildStatus::Skipped)
    }
}

/// Single sink for rebuild outcomes.
pub fn log_rebuild_outcome(scope: &str, status: &RebuildStatus, elapsed: Duration) {
    match status {
        RebuildStatus::Completed { sections } => {
            for report in sections {
                if report.failed_entities.is_empty() {
                    info!(
                        "✓ Rebuilt {}: {} entities, {} windows from store, {} fetched, {} records, {} keys in {:?}",
                        report.section,
                        report.entities_ok,
                        report.windows_from_store,
                        report.windows_fetched,
                        report.records_seen,
                        report.keys_written,
                        report.duration
                    );
                } else {
                    warn!(
                        "⚠ Rebuilt {} with {} failed entities ({} ok): {:?}",
                        report.section,
                        report.failed_entities.len(),
                        report.entities_ok,
                        report.failed_entities
                    );
                }
                if report.write_failures > 0 {
                    warn!(
                        "⚠ {} cache writes failed for {}",
                        report.write_failures, report.section
                    );
                }
            }
            info!("✓ Rebuild {} completed in {:?}", scope, elapsed);
        }
        RebuildStatus::Skipped => {
            info!("Rebuild {} skipped: another rebuild holds the lock", scope);
        }
        RebuildStatus::Failed { reason } => {
            error!("✗ Rebuild {} failed after {:?}: {}", scope, elapsed, reason);
        }
    }
}

/// Group sorted windows into contiguous date ranges.
fn contiguous_ranges(windows: &[PeriodWindow]) -> Vec<DateRange> {
    let mut ranges: Vec<DateRange> = Vec::new();
    for window in windows {
        match ranges.last_mut() {
            Some(range) if range.end.succ_opt() == Some(window.start) => range.end = window.end,
            _ => ranges.push(DateRange::new(window.start, window.end)),
        }
    }
    ranges
}

/// Summaries for `windows` for one entity: completed windows from the store when
/// present, everything else fetched and aggregated in one streaming pass.
///
/// Fetched completed windows are written back to the store.
pub async fn summarize_entity<S: OrderSource, B: CacheBackend>(
    ctx: &ReportContext<S, B>,
    entity: &Entity,
    windows: &[PeriodWindow],
    today: NaiveDate,
) -> EntityOutcome {
    let mut found: BTreeMap<NaiveDate, PeriodSummary> = BTreeMap::new();
    let mut missing: Vec<PeriodWindow> = Vec::new();

    for window in windows {
        let stored = if window.is_completed(today) {
            ctx.store.get(&entity.vendor_ref, window.start)
        } else {
            None
        };
        match stored {
            Some(summary) => {
                found.insert(window.start, summary);
            }
            None => missing.push(*window),
        }
    }

    let windows_from_store = found.len();
    if windows_from_store > 0 {
        ctx.metrics.record_store_reuse(&entity.id, windows_from_store);
    }

    let mut records_seen = 0;
    if !missing.is_empty() {
        missing.sort();
        let mut aggregator = StreamAggregator::new(&entity.vendor_ref, &missing, ctx.config.timezone)
            .with_excluded_products(&ctx.config.excluded_products);

        for range in contiguous_ranges(&missing) {
            let mut cursor = ctx.source.fetch_all(entity, range);
            while let Some(page) = cursor.next().await {
                match page {
                    Ok(page) => aggregator.fold_page(page),
                    Err(e) => {
                        warn!("⚠ {} failed fetching {}: {}", entity.id, range, e);
                        return EntityOutcome::failed(entity.clone(), e.to_string());
                    }
                }
            }
        }

        records_seen = aggregator.records_seen();
        for summary in aggregator.finish(today) {
            ctx.store.put(&entity.vendor_ref, &summary, today);
            found.insert(summary.window.start, summary);
        }
    }

    let summaries = windows
        .iter()
        .map(|w| {
            found
                .get(&w.start)
                .cloned()
                .unwrap_or_else(|| PeriodSummary::empty(&entity.vendor_ref, *w, !w.is_completed(today)))
        })
        .collect();

    EntityOutcome {
        entity: entity.clone(),
        summaries: Some(summaries),
        error: None,
        windows_from_store,
        windows_fetched: missing.len(),
        records_seen,
    }
}

/// Runs locked rebuilds over a shared [`ReportContext`].
pub struct RebuildCoordinator<S: OrderSource, B: CacheBackend> {
    ctx: Arc<ReportContext<S, B>>,
}

impl<S: OrderSource, B: CacheBackend> Clone for RebuildCoordinator<S, B> {
    fn clone(&self) -> Self {
        RebuildCoordinator {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<S: OrderSource, B: CacheBackend> RebuildCoordinator<S, B> {
    pub fn new(ctx: Arc<ReportContext<S, B>>) -> Self {
        RebuildCoordinator { ctx }
    }

    pub fn context(&self) -> &Arc<ReportContext<S, B>> {
        &self.ctx
    }

    /// Rebuild every section, sequentially, under the lock.
    pub async fn rebuild_all(&self) -> RebuildStatus {
        self.run_locked("all", &Section::ALL).await
    }

    /// Rebuild one section under the lock.
    pub async fn rebuild_section(&self, section: Section) -> RebuildStatus {
        self.run_locked(section.name(), &[section]).await
    }

    async fn run_locked(&self, scope: &str, sections: &[Section]) -> RebuildStatus {
        let started = Instant::now();

        let status = match self
            .ctx
            .cache
            .try_lock(REBUILD_LOCK_KEY, self.ctx.config.lock_ttl)
            .await
        {
            Ok(Some(lock)) => {
                let mut reports = Vec::with_capacity(sections.len());
                for &section in sections {
                    reports.push(self.run_section(section).await);
                }
                lock.release().await;
                RebuildStatus::Completed { sections: reports }
            }
            Ok(None) => RebuildStatus::Skipped,
            Err(e) => RebuildStatus::Failed {
                reason: format!("rebuild lock unavailable: {}", e),
            },
        };

        let elapsed = started.elapsed();
        log_rebuild_outcome(scope, &status, elapsed);
        self.ctx
            .metrics
            .record_rebuild_finished(scope, status.outcome(), elapsed);
        status
    }

    async fn run_section(&self, section: Section) -> SectionReport {
        let started = Instant::now();
        let today = self.ctx.today();
        let windows = section.windows(today, &self.ctx.config);
        info!(
            "▶ Rebuilding {}: {} windows x {} entities",
            section,
            windows.len(),
            self.ctx.directory.len()
        );

        let outcomes = self.summarize_all(&windows, today).await;

        let mut report = SectionReport::new(section);
        for outcome in &outcomes {
            report.windows_from_store += outcome.windows_from_store;
            report.windows_fetched += outcome.windows_fetched;
            report.records_seen += outcome.records_seen;
            match &outcome.error {
                None => report.entities_ok += 1,
                Some(reason) => {
                    self.ctx
                        .metrics
                        .record_entity_failure(section.name(), &outcome.entity.id, reason);
                    report
                        .failed_entities
                        .insert(outcome.entity.id.clone(), reason.clone());
                }
            }
        }

        match section {
            Section::WeeklyTrend => {
                if report.entities_ok == 0 && !outcomes.is_empty() {
                    warn!("⚠ Every entity failed; keeping the previous {} entry", section);
                } else {
                    let payload = section::weekly_trend_payload(&windows, &outcomes, today);
                    self.write_payload(section, &CacheKeyBuilder::section(section), &payload, &mut report)
                        .await;
                }
            }
            Section::Staff => {
                for outcome in &outcomes {
                    let Some(summary) = outcome.summaries.as_ref().and_then(|s| s.first()) else {
                        continue;
                    };
                    let payload = section::staff_payload(&outcome.entity, summary);
                    let key = CacheKeyBuilder::entity_section(section, &outcome.entity.id);
                    self.write_payload(section, &key, &payload, &mut report).await;
                }
            }
            Section::ProductVelocity => {
                for outcome in &outcomes {
                    let Some(summaries) = outcome.summaries.as_ref() else {
                        continue;
                    };
                    let payload = section::velocity_payload(&outcome.entity, summaries);
                    let key = CacheKeyBuilder::entity_section(section, &outcome.entity.id);
                    self.write_payload(section, &key, &payload, &mut report).await;
                }
            }
        }

        report.duration = started.elapsed();
        report
    }

    async fn write_payload<T: Serialize + Sync>(
        &self,
        section: Section,
        key: &str,
        payload: &T,
        report: &mut SectionReport,
    ) {
        let ttl = self.ctx.cache.ttl_for(section.name());
        match self.ctx.cache.write(key, payload, ttl).await {
            Ok((_, true)) => report.keys_written += 1,
            Ok((_, false)) => report.write_failures += 1,
            Err(e) => {
                error!("✗ Could not write {} payload for {}: {}", section, key, e);
                report.write_failures += 1;
            }
        }
    }

    /// Aggregate every entity in the directory, at most `rebuild_concurrency` at once.
    /// Outcomes come back in directory order.
    async fn summarize_all(&self, windows: &[PeriodWindow], today: NaiveDate) -> Vec<EntityOutcome> {
        let entities: Vec<Entity> = self.ctx.directory.iter().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.rebuild_concurrency.max(1)));
        let windows: Arc<[PeriodWindow]> = Arc::from(windows);
        let mut tasks = JoinSet::new();

        for (idx, entity) in entities.iter().cloned().enumerate() {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);
            let windows = Arc::clone(&windows);
            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = summarize_entity(&*ctx, &entity, &windows, today).await;
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<EntityOutcome>> = (0..entities.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => error!("✗ Entity aggregation task failed: {}", e),
            }
        }

        slots
            .into_iter()
            .zip(entities)
            .map(|(slot, entity)| {
                slot.unwrap_or_else(|| EntityOutcome::failed(entity, "aggregation task aborted".to_string()))
            })
            .collect()
    }
}
