//! Reporting entities (retail locations) and the startup directory.

use crate::error::Result;
use crate::vendor::{fields, resolve_str, OrderSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reporting unit. Immutable once the directory is built.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier used in cache keys.
    pub id: String,
    /// Name as the vendor reports it.
    pub name: String,
    /// Short name for dashboards.
    pub display_name: String,
    /// Identifier the vendor expects in order queries. Also keys the period store.
    pub vendor_ref: String,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, vendor_ref: impl Into<String>) -> Self {
        let name = name.into();
        Entity {
            id: id.into(),
            display_name: display_name(&name),
            name,
            vendor_ref: vendor_ref.into(),
        }
    }

    /// Build from a raw directory record. Records without a name or any identifier
    /// are unusable and yield `None`.
    pub fn from_vendor(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let name = resolve_str(obj, fields::LOCATION_NAME)?;
        let id = resolve_str(obj, fields::LOCATION_ID)
            .or_else(|| resolve_str(obj, fields::LOCATION_VENDOR_REF))?;
        let vendor_ref = resolve_str(obj, fields::LOCATION_VENDOR_REF).unwrap_or_else(|| id.clone());
        Some(Entity::new(id, name, vendor_ref))
    }

    /// Case-insensitive substring match against a blocklist.
    pub fn is_excluded(&self, blocklist: &[String]) -> bool {
        let name = self.name.to_lowercase();
        blocklist
            .iter()
            .any(|blocked| !blocked.is_empty() && name.contains(&blocked.to_lowercase()))
    }
}

/// Brand prefix the vendor puts on every store name.
const BRAND_PREFIX: &str = "Thrive ";

/// Dashboard name: the brand prefix and any `" - "` suffix removed.
fn display_name(name: &str) -> String {
    let name = name.trim();
    let name = name.strip_prefix(BRAND_PREFIX).unwrap_or(name);
    name.split(" - ").next().unwrap_or(name).trim().to_string()
}

/// The set of entities a rebuild covers. Built once at startup.
#[derive(Clone, Debug, Default)]
pub struct EntityDirectory {
    entities: Vec<Entity>,
}

impl EntityDirectory {
    pub fn new(entities: Vec<Entity>) -> Self {
        EntityDirectory { entities }
    }

    /// Build from raw directory records, dropping blocklisted and unusable ones.
    pub fn from_vendor(records: &[Value], blocklist: &[String]) -> Self {
        let mut entities: Vec<Entity> = Vec::with_capacity(records.len());
        for record in records {
            let Some(entity) = Entity::from_vendor(record) else {
                debug!("Skipping unusable location record: {}", record);
                continue;
            };
            if entity.is_excluded(blocklist) {
                debug!("Excluding location {} ({})", entity.name, entity.id);
                continue;
            }
            if entities.iter().any(|e| e.id == entity.id) {
                continue;
            }
            entities.push(entity);
        }
        EntityDirectory { entities }
    }

    /// Fetch the vendor's location directory and filter it.
    ///
    /// # Errors
    /// Propagates upstream errors from the source.
    pub async fn load<S: OrderSource>(source: &S, blocklist: &[String]) -> Result<Self> {
        let records = source.fetch_locations().await?;
        let directory = Self::from_vendor(&records, blocklist);
        info!(
            "Loaded {} entities ({} directory records)",
            directory.len(),
            records.len()
        );
        Ok(directory)
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Lookup by either identifier; vendor payloads carry one or the other.
    pub fn find_by_any_id(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id || e.vendor_ref == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_from_vendor_field_precedence() {
        let entity = Entity::from_vendor(&json!({
            "locationName": "Thrive Downtown - RD",
            "name": "ignored",
            "locationId": "loc-1",
            "importId": "imp-1"
        }))
        .unwrap();

        assert_eq!(entity.id, "loc-1");
        assert_eq!(entity.vendor_ref, "imp-1");
        assert_eq!(entity.name, "Thrive Downtown - RD");
        assert_eq!(entity.display_name, "Downtown");
    }

    #[test]
    fn test_display_name_strips_brand_prefix_and_suffix() {
        assert_eq!(display_name("Thrive Harbor"), "Harbor");
        assert_eq!(display_name("Thrive Harbor - Pier 3"), "Harbor");
        assert_eq!(display_name("Downtown - Main St"), "Downtown");
        // Only a leading prefix is the brand
        assert_eq!(display_name("Uptown Thrive Market"), "Uptown Thrive Market");
    }

    #[test]
    fn test_entity_falls_back_to_import_id() {
        let entity = Entity::from_vendor(&json!({ "name": "Uptown", "importId": "imp-9" })).unwrap();
        assert_eq!(entity.id, "imp-9");
        assert_eq!(entity.vendor_ref, "imp-9");
    }

    #[test]
    fn test_unusable_record_is_skipped() {
        assert!(Entity::from_vendor(&json!({ "locationId": "x" })).is_none());
        assert!(Entity::from_vendor(&json!("not an object")).is_none());
    }

    #[test]
    fn test_directory_applies_blocklist_case_insensitively() {
        let records = vec![
            json!({ "locationName": "Downtown", "locationId": "1" }),
            json!({ "locationName": "Cultivation Facility", "locationId": "2" }),
            json!({ "locationName": "smoke & mirrors", "locationId": "3" }),
            json!({ "locationName": "Downtown duplicate", "locationId": "1" }),
        ];
        let blocklist = vec!["Cultivation".to_string(), "Smoke & Mirrors".to_string()];
        let directory = EntityDirectory::from_vendor(&records, &blocklist);

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.get("1").unwrap().name, "Downtown");
        assert!(directory.get("2").is_none());
    }

    #[test]
    fn test_find_by_any_id() {
        let directory = EntityDirectory::new(vec![Entity::new("loc-1", "Downtown", "imp-1")]);
        assert_eq!(directory.find_by_any_id("loc-1").unwrap().id, "loc-1");
        assert_eq!(directory.find_by_any_id("imp-1").unwrap().id, "loc-1");
        assert!(directory.find_by_any_id("imp-2").is_none());
    }
}
