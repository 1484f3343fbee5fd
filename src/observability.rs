//! Metrics hooks and TTL policies.
//!
//! [`PipelineMetrics`] receives every cache lookup and rebuild lifecycle event. The
//! default methods log through the `log` crate; [`NoOpMetrics`] discards them.
//! Implement the trait to forward events to a monitoring system:
//!
//! ```ignore
//! struct PrometheusMetrics;
//!
//! impl PipelineMetrics for PrometheusMetrics {
//!     fn record_rebuild_finished(&self, section: &str, outcome: &str, duration: Duration) {
//!         // histogram!("rebuild_seconds", "section" => section, "outcome" => outcome)
//!         //     .record(duration.as_secs_f64());
//!     }
//! }
//! ```

use crate::config::PipelineConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Hooks for cache and rebuild events.
pub trait PipelineMetrics: Send + Sync {
    /// A cache read found a fresh entry.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// A cache read found nothing usable.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// A cache layer failed; the operation degraded to a miss or skipped write.
    fn record_cache_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }

    /// A background rebuild was started for `section`.
    fn record_rebuild_triggered(&self, section: &str) {
        debug!("Rebuild triggered: {}", section);
    }

    /// A rebuild finished. `outcome` is `completed`, `skipped` or `failed`.
    fn record_rebuild_finished(&self, section: &str, outcome: &str, duration: Duration) {
        debug!("Rebuild {} {} in {:?}", section, outcome, duration);
    }

    /// One entity's aggregation failed during a rebuild.
    fn record_entity_failure(&self, section: &str, entity_id: &str, error: &str) {
        warn!("Rebuild {} entity {} failed: {}", section, entity_id, error);
    }

    /// Completed windows served from the period store instead of the vendor.
    fn record_store_reuse(&self, entity_id: &str, windows: usize) {
        debug!("Store reuse for {}: {} windows", entity_id, windows);
    }
}

/// Metrics implementation that records nothing.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl PipelineMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_cache_error(&self, _key: &str, _error: &str) {}
    fn record_rebuild_triggered(&self, _section: &str) {}
    fn record_rebuild_finished(&self, _section: &str, _outcome: &str, _duration: Duration) {}
    fn record_entity_failure(&self, _section: &str, _entity_id: &str, _error: &str) {}
    fn record_store_reuse(&self, _entity_id: &str, _windows: usize) {}
}

/// Metrics implementation that only logs, using the trait's default methods.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl PipelineMetrics for LogMetrics {}

/// Shared-layer TTL per section.
#[derive(Clone, Debug)]
pub enum TtlPolicy {
    /// Same duration for every section
    Fixed(Duration),

    /// Overrides keyed by section name, `default` for the rest
    PerSection {
        default: Duration,
        overrides: HashMap<String, Duration>,
    },
}

impl Default for TtlPolicy {
    fn default() -> Self {
        TtlPolicy::Fixed(Duration::from_secs(600))
    }
}

impl TtlPolicy {
    /// `Fixed(cache_ttl)` unless the configuration overrides some section.
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.section_ttls.is_empty() {
            return TtlPolicy::Fixed(config.cache_ttl);
        }
        TtlPolicy::PerSection {
            default: config.cache_ttl,
            overrides: config
                .section_ttls
                .iter()
                .map(|(section, ttl)| (section.name().to_string(), *ttl))
                .collect(),
        }
    }

    pub fn get_ttl(&self, section: &str) -> Duration {
        match self {
            TtlPolicy::Fixed(d) => *d,
            TtlPolicy::PerSection { default, overrides } => {
                overrides.get(section).copied().unwrap_or(*default)
            }
        }
    }
}
