//! What a section read returns and what happens on a miss.
//!
//! | Policy | Cache hit | Cache miss |
//! |--------|-----------|------------|
//! | **DirectFallback** | Return entry | Compute directly for the caller, rebuild in background |
//! | **Placeholder** | Return entry | Return "still building", rebuild in background |
//!
//! Only per-entity sections computed from the open week use `DirectFallback`.

use crate::serialization::CacheEntry;
use serde_json::{json, Value};

/// Behavior on a cache miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissPolicy {
    DirectFallback,
    Placeholder,
}

/// Result of a section read. Never an error: the caller always gets something to show.
#[derive(Clone, Debug, PartialEq)]
pub enum SectionRead {
    /// Fresh cache entry.
    Hit(CacheEntry),
    /// Cache miss; value computed for this caller only.
    Direct(Value),
    /// Cache miss; a rebuild is (or was just) under way.
    Building,
}

impl SectionRead {
    pub fn is_hit(&self) -> bool {
        matches!(self, SectionRead::Hit(_))
    }

    pub fn is_building(&self) -> bool {
        matches!(self, SectionRead::Building)
    }

    /// The payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            SectionRead::Hit(entry) => Some(&entry.payload),
            SectionRead::Direct(value) => Some(value),
            SectionRead::Building => None,
        }
    }

    /// JSON body for an API response. A missing payload becomes a placeholder.
    pub fn into_json(self) -> Value {
        match self {
            SectionRead::Hit(entry) => entry.payload,
            SectionRead::Direct(value) => value,
            SectionRead::Building => json!({
                "status": "building",
                "message": "Data is being prepared, check back shortly"
            }),
        }
    }
}
