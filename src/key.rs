//! Cache key construction.
//!
//! Shared-layer keys:
//! - `section:<name>` for section-wide payloads
//! - `section:<name>:<entityId>` for per-entity payloads
//! - `lock:rebuild` for the rebuild lock

use crate::section::Section;

/// Key of the single rebuild lock.
pub const REBUILD_LOCK_KEY: &str = "lock:rebuild";

const SECTION_PREFIX: &str = "section";

/// Builder for cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Key of a section-wide payload.
    pub fn section(section: Section) -> String {
        Self::build_composite(&[SECTION_PREFIX, section.name()])
    }

    /// Key of one entity's payload within a per-entity section.
    pub fn entity_section(section: Section, entity_id: &str) -> String {
        Self::build_composite(&[SECTION_PREFIX, section.name(), entity_id])
    }

    /// Build composite key from multiple parts.
    fn build_composite(parts: &[&str]) -> String {
        parts.join(":")
    }
}
