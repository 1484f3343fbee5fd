//! # sales-rollup
//!
//! Weekly point-of-sale roll-ups behind a two-tier, stale-while-revalidate
//! report cache.
//!
//! ## Features
//!
//! - **Streaming ingestion:** Orders are pulled page by page from the vendor API
//!   and folded into per-week accumulators; a page is dropped once folded
//! - **Immutable history:** Completed weeks are persisted once and never refetched
//! - **Two-tier cache:** A process-local fast layer in front of a shared layer
//!   (Redis when configured, in-memory otherwise)
//! - **Single rebuild:** A token-checked lock in the shared layer keeps concurrent
//!   rebuilds from racing
//! - **Failure isolation:** One location failing does not poison a rebuild
//! - **Stock snapshot:** On-hand inventory across locations, pulled on demand
//!
//! ## Quick Start
//!
//! ```ignore
//! use sales_rollup::{PipelineConfig, ReportContext, ReportService, Section};
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::from_env()?;
//! let ctx = Arc::new(ReportContext::connect(config).await?);
//! let service = ReportService::new(ctx);
//!
//! // Returns immediately: a cached payload, or a placeholder while a
//! // background rebuild fills the cache.
//! let trend = service.read_section(Section::WeeklyTrend).await?;
//! println!("{}", trend.into_json());
//! ```

#[macro_use]
extern crate log;

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod entity;
pub mod error;
pub mod inventory;
pub mod key;
pub mod observability;
pub mod rebuild;
pub mod section;
pub mod serialization;
pub mod service;
pub mod store;
pub mod strategy;
pub mod tiered;
pub mod vendor;
pub mod window;

// Re-exports for convenience
pub use aggregate::{PeriodSummary, StreamAggregator};
pub use backend::{CacheBackend, SharedBackend};
pub use config::PipelineConfig;
pub use entity::{Entity, EntityDirectory};
pub use error::{Error, Result};
pub use inventory::InventorySnapshot;
pub use rebuild::{RebuildCoordinator, RebuildStatus, ReportContext};
pub use section::Section;
pub use service::{ReportService, ServiceStatus};
pub use store::PeriodStore;
pub use strategy::SectionRead;
pub use tiered::TieredCache;
pub use vendor::{OrderSource, VendorClient};
pub use window::{Clock, FixedClock, PeriodWindow, SystemClock};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
