//! Streaming aggregation of vendor pages into weekly period summaries.
//!
//! The aggregator holds one [`PeriodAccumulator`] per requested window and folds
//! each page's records into them as the page arrives. Raw records are never kept:
//! peak working set is one page plus one accumulator per window, whatever the
//! total record count of the span.
//!
//! Folding is deterministic. The same records in the same order produce the same
//! summaries regardless of how they were split into pages.

use crate::vendor::{Page, Record};
use crate::window::PeriodWindow;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Sales attributed to one product category.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub net_sales: f64,
    pub item_count: f64,
}

/// Sales attributed to one staff member.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaffTotals {
    pub net_sales: f64,
    pub transaction_count: u64,
    pub item_count: f64,
}

/// Sales of one product variant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductTotals {
    pub name: String,
    pub category: String,
    pub brand: String,
    pub quantity: f64,
    pub net_sales: f64,
    pub cogs: f64,
}

/// Finalized aggregate for one (entity, window).
///
/// Immutable once the window has ended; sub-aggregates use ordered maps so the
/// serialized form is stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub entity_ref: String,
    pub window: PeriodWindow,
    pub net_sales: f64,
    pub gross_sales: f64,
    pub discounts: f64,
    pub cogs: f64,
    pub item_count: f64,
    pub transaction_count: u64,
    pub customer_types: BTreeMap<String, u64>,
    pub categories: BTreeMap<String, CategoryTotals>,
    pub staff: BTreeMap<String, StaffTotals>,
    pub products: BTreeMap<String, ProductTotals>,
    /// The window had not ended when this summary was computed.
    pub is_partial: bool,
}

impl PeriodSummary {
    /// An all-zero summary for a window with no sales.
    pub fn empty(entity_ref: &str, window: PeriodWindow, is_partial: bool) -> Self {
        PeriodAccumulator::new(entity_ref, window).finish_with(is_partial)
    }

    /// No transactions were seen. Trivial summaries are never persisted because the
    /// vendor may simply not have indexed the period yet.
    pub fn is_trivial(&self) -> bool {
        self.transaction_count == 0
    }

    pub fn gross_profit(&self) -> f64 {
        round_cents(self.net_sales - self.cogs)
    }

    /// Margin in percent of net sales, one decimal.
    pub fn margin_pct(&self) -> f64 {
        if self.net_sales > 0.0 {
            ((self.net_sales - self.cogs) / self.net_sales * 1000.0).round() / 10.0
        } else {
            0.0
        }
    }
}

/// Running totals for one (entity, window) during a single pass.
#[derive(Clone, Debug)]
pub struct PeriodAccumulator {
    entity_ref: String,
    window: PeriodWindow,
    net_sales: f64,
    gross_sales: f64,
    discounts: f64,
    cogs: f64,
    item_count: f64,
    transaction_count: u64,
    customer_types: BTreeMap<String, u64>,
    categories: BTreeMap<String, CategoryTotals>,
    staff: BTreeMap<String, StaffTotals>,
    products: BTreeMap<String, ProductTotals>,
}

impl PeriodAccumulator {
    pub fn new(entity_ref: &str, window: PeriodWindow) -> Self {
        PeriodAccumulator {
            entity_ref: entity_ref.to_string(),
            window,
            net_sales: 0.0,
            gross_sales: 0.0,
            discounts: 0.0,
            cogs: 0.0,
            item_count: 0.0,
            transaction_count: 0,
            customer_types: BTreeMap::new(),
            categories: BTreeMap::new(),
            staff: BTreeMap::new(),
            products: BTreeMap::new(),
        }
    }

    /// Fold one non-voided record. Voided line items and excluded products add nothing.
    fn fold(&mut self, record: &Record, excluded_products: &[String]) {
        self.transaction_count += 1;
        *self
            .customer_types
            .entry(record.customer_type.clone())
            .or_insert(0) += 1;

        let staff = self.staff.entry(record.staff_id.clone()).or_default();
        staff.transaction_count += 1;

        for item in record.items.iter().filter(|item| !item.voided) {
            if is_excluded_product(&item.product_name, excluded_products) {
                continue;
            }

            let gross = item.gross();
            let net = item.net();

            self.gross_sales += gross;
            self.discounts += item.total_discounts;
            self.net_sales += net;
            self.cogs += item.total_cost;
            self.item_count += item.quantity;

            staff.net_sales += net;
            staff.item_count += item.quantity;

            let category = self.categories.entry(item.category.clone()).or_default();
            category.net_sales += net;
            category.item_count += item.quantity;

            let product = self
                .products
                .entry(item.variant_id.clone())
                .or_insert_with(|| ProductTotals {
                    name: item.product_name.clone(),
                    category: item.category.clone(),
                    brand: item.brand.clone(),
                    ..ProductTotals::default()
                });
            product.quantity += item.quantity;
            product.net_sales += net;
            product.cogs += item.total_cost;
        }
    }

    fn finish_with(self, is_partial: bool) -> PeriodSummary {
        PeriodSummary {
            entity_ref: self.entity_ref,
            window: self.window,
            net_sales: round_cents(self.net_sales),
            gross_sales: round_cents(self.gross_sales),
            discounts: round_cents(self.discounts),
            cogs: round_cents(self.cogs),
            item_count: round_quantity(self.item_count),
            transaction_count: self.transaction_count,
            customer_types: self.customer_types,
            categories: self
                .categories
                .into_iter()
                .map(|(k, v)| {
                    (
                        k,
                        CategoryTotals {
                            net_sales: round_cents(v.net_sales),
                            item_count: round_quantity(v.item_count),
                        },
                    )
                })
                .collect(),
            staff: self
                .staff
                .into_iter()
                .map(|(k, v)| {
                    (
                        k,
                        StaffTotals {
                            net_sales: round_cents(v.net_sales),
                            transaction_count: v.transaction_count,
                            item_count: round_quantity(v.item_count),
                        },
                    )
                })
                .collect(),
            products: self
                .products
                .into_iter()
                .map(|(k, v)| {
                    (
                        k,
                        ProductTotals {
                            quantity: round_quantity(v.quantity),
                            net_sales: round_cents(v.net_sales),
                            cogs: round_cents(v.cogs),
                            ..v
                        },
                    )
                })
                .collect(),
            is_partial,
        }
    }
}

pub(crate) fn is_excluded_product(name: &str, excluded: &[String]) -> bool {
    if excluded.is_empty() || name.is_empty() {
        return false;
    }
    let name = name.to_lowercase();
    excluded.iter().any(|ex| name.contains(ex.as_str()))
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_quantity(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Folds pages for one entity into per-window accumulators.
///
/// Windows must be Monday-aligned weeks; a record's window is found by mapping its
/// local date to the Monday of its week, so lookup is O(1).
pub struct StreamAggregator {
    tz: Tz,
    index: HashMap<NaiveDate, usize>,
    accumulators: Vec<PeriodAccumulator>,
    excluded_products: Vec<String>,
    records_seen: u64,
    records_folded: u64,
}

impl StreamAggregator {
    pub fn new(entity_ref: &str, windows: &[PeriodWindow], tz: Tz) -> Self {
        let mut index = HashMap::with_capacity(windows.len());
        let mut accumulators = Vec::with_capacity(windows.len());
        for window in windows {
            if index.contains_key(&window.start) {
                continue;
            }
            index.insert(window.start, accumulators.len());
            accumulators.push(PeriodAccumulator::new(entity_ref, *window));
        }
        StreamAggregator {
            tz,
            index,
            accumulators,
            excluded_products: Vec::new(),
            records_seen: 0,
            records_folded: 0,
        }
    }

    /// Line items whose product name contains any of these (case-insensitive) are ignored.
    pub fn with_excluded_products(mut self, excluded: &[String]) -> Self {
        self.excluded_products = excluded
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .collect();
        self
    }

    /// Fold one page and drop it.
    pub fn fold_page(&mut self, page: Page) {
        for record in &page.records {
            self.fold(record);
        }
    }

    /// Fold one record. Voided records, records without a timestamp and records
    /// outside every window are counted as seen and otherwise skipped.
    pub fn fold(&mut self, record: &Record) {
        self.records_seen += 1;
        if record.voided {
            return;
        }
        let Some(created_at) = record.created_at else {
            return;
        };
        let local_date = created_at.with_timezone(&self.tz).date_naive();
        let week_start = PeriodWindow::week_containing(local_date).start;
        let Some(&slot) = self.index.get(&week_start) else {
            return;
        };
        let accumulator = &mut self.accumulators[slot];
        if !accumulator.window.contains(local_date) {
            return;
        }
        accumulator.fold(record, &self.excluded_products);
        self.records_folded += 1;
    }

    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    pub fn records_folded(&self) -> u64 {
        self.records_folded
    }

    /// Finalize every window, in the order the windows were given.
    ///
    /// Consumes the aggregator; a new pass needs a new aggregator.
    pub fn finish(self, today: NaiveDate) -> Vec<PeriodSummary> {
        self.accumulators
            .into_iter()
            .map(|acc| {
                let is_partial = !acc.window.is_completed(today);
                acc.finish_with(is_partial)
            })
            .collect()
    }
}
