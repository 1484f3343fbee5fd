//! On-hand stock snapshot across the entity directory.
//!
//! One vendor query returns stock for every location the credentials can see.
//! Lines are kept only when their location is in the directory, the product is
//! not blocklisted and the quantity is positive. Snapshots are computed on demand
//! and not cached.

use crate::aggregate::{is_excluded_product, round_cents};
use crate::entity::EntityDirectory;
use crate::error::Result;
use crate::vendor::{InventoryItem, OrderSource};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One stock line attributed to an entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StockLine {
    pub entity_id: String,
    pub display_name: String,
    pub variant_id: String,
    pub product_name: String,
    pub category: String,
    pub brand: String,
    pub supplier: String,
    pub product_type: String,
    pub strain: String,
    pub on_hand: f64,
    pub unit_cost: f64,
    pub unit_price: f64,
    /// `on_hand * unit_cost`
    pub cost_value: f64,
    /// `on_hand * unit_price`
    pub retail_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InventorySnapshot {
    pub taken_at: DateTime<Utc>,
    pub lines: Vec<StockLine>,
}

impl InventorySnapshot {
    pub fn total_units(&self) -> f64 {
        self.lines.iter().map(|l| l.on_hand).sum()
    }

    pub fn total_cost(&self) -> f64 {
        round_cents(self.lines.iter().map(|l| l.cost_value).sum())
    }

    pub fn total_retail(&self) -> f64 {
        round_cents(self.lines.iter().map(|l| l.retail_value).sum())
    }
}

/// Pull current stock through the first entity in the directory.
///
/// An empty directory yields an empty snapshot without querying the vendor.
///
/// # Errors
/// Propagates upstream errors from the source.
pub async fn pull_inventory<S: OrderSource>(
    source: &S,
    directory: &EntityDirectory,
    excluded_products: &[String],
    taken_at: DateTime<Utc>,
) -> Result<InventorySnapshot> {
    let Some(anchor) = directory.iter().next() else {
        warn!("⚠ No entities; inventory snapshot is empty");
        return Ok(InventorySnapshot {
            taken_at,
            lines: Vec::new(),
        });
    };

    let items = source.fetch_inventory(anchor).await?;
    let raw = items.len();
    let excluded: Vec<String> = excluded_products
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect();

    let lines: Vec<StockLine> = items
        .into_iter()
        .filter(|item| item.quantity > 0.0 && !is_excluded_product(&item.product_name, &excluded))
        .filter_map(|item| stock_line(directory, item))
        .collect();

    let snapshot = InventorySnapshot { taken_at, lines };
    info!(
        "✓ Inventory: {} lines of {} raw items, {} units, cost {:.2}",
        snapshot.lines.len(),
        raw,
        snapshot.total_units(),
        snapshot.total_cost()
    );
    Ok(snapshot)
}

fn stock_line(directory: &EntityDirectory, item: InventoryItem) -> Option<StockLine> {
    let entity = directory.find_by_any_id(&item.location_id)?;
    Some(StockLine {
        entity_id: entity.id.clone(),
        display_name: entity.display_name.clone(),
        cost_value: round_cents(item.quantity * item.unit_cost),
        retail_value: round_cents(item.quantity * item.unit_price),
        unit_cost: round_cents(item.unit_cost),
        unit_price: round_cents(item.unit_price),
        on_hand: item.quantity,
        variant_id: item.variant_id,
        product_name: item.product_name,
        category: item.category,
        brand: item.brand,
        supplier: item.supplier,
        product_type: item.product_type,
        strain: item.strain,
    })
}
