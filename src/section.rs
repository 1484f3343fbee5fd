//! Report sections: which windows each one needs and how summaries become its payload.

use crate::aggregate::{round_cents, PeriodSummary};
use crate::config::PipelineConfig;
use crate::entity::Entity;
use crate::error::Error;
use crate::rebuild::EntityOutcome;
use crate::strategy::MissPolicy;
use crate::window::PeriodWindow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Longest product name carried in velocity rows.
const MAX_PRODUCT_NAME: usize = 55;

/// A distinct report type with its own cache key(s) and rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    /// Trailing weekly totals across all entities. One key.
    WeeklyTrend,
    /// Current-week sales per staff member. One key per entity.
    Staff,
    /// Units per week per product over the last completed weeks. One key per entity.
    ProductVelocity,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::WeeklyTrend, Section::Staff, Section::ProductVelocity];

    pub fn name(self) -> &'static str {
        match self {
            Section::WeeklyTrend => "weekly_trend",
            Section::Staff => "staff",
            Section::ProductVelocity => "product_velocity",
        }
    }

    /// Position in [`Section::ALL`].
    pub fn index(self) -> usize {
        match self {
            Section::WeeklyTrend => 0,
            Section::Staff => 1,
            Section::ProductVelocity => 2,
        }
    }

    pub fn is_per_entity(self) -> bool {
        !matches!(self, Section::WeeklyTrend)
    }

    pub fn miss_policy(self) -> MissPolicy {
        match self {
            Section::Staff => MissPolicy::DirectFallback,
            Section::WeeklyTrend | Section::ProductVelocity => MissPolicy::Placeholder,
        }
    }

    /// Windows this section aggregates, oldest first.
    pub fn windows(self, today: NaiveDate, config: &PipelineConfig) -> Vec<PeriodWindow> {
        match self {
            Section::WeeklyTrend => PeriodWindow::trailing(today, config.trend_weeks),
            Section::Staff => vec![PeriodWindow::week_containing(today)],
            Section::ProductVelocity => PeriodWindow::trailing_completed(today, config.velocity_weeks),
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Section {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Section::ALL
            .into_iter()
            .find(|section| section.name() == s)
            .ok_or_else(|| Error::Other(format!("Unknown section: {}", s)))
    }
}

/// One entity's share of a trend week.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityWeek {
    pub display_name: String,
    pub net_sales: f64,
    pub transaction_count: u64,
}

/// Totals for one week across all entities that aggregated successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendWeek {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub is_partial: bool,
    pub net_sales: f64,
    pub gross_sales: f64,
    pub discounts: f64,
    pub cogs: f64,
    pub gross_profit: f64,
    pub margin_pct: f64,
    pub item_count: f64,
    pub transaction_count: u64,
    pub avg_ticket: f64,
    pub by_entity: BTreeMap<String, EntityWeek>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeeklyTrendPayload {
    pub weeks: Vec<TrendWeek>,
    /// Entity id to failure reason; these entities are missing from every week.
    pub failed_entities: BTreeMap<String, String>,
}

fn avg_ticket(net_sales: f64, transactions: u64) -> f64 {
    if transactions == 0 {
        0.0
    } else {
        round_cents(net_sales / transactions as f64)
    }
}

fn margin_pct(net_sales: f64, cogs: f64) -> f64 {
    if net_sales > 0.0 {
        ((net_sales - cogs) / net_sales * 1000.0).round() / 10.0
    } else {
        0.0
    }
}

/// Combine per-entity summaries (aligned with `windows`) into trend weeks.
pub fn weekly_trend_payload(
    windows: &[PeriodWindow],
    outcomes: &[EntityOutcome],
    today: NaiveDate,
) -> WeeklyTrendPayload {
    let mut weeks = Vec::with_capacity(windows.len());
    for (idx, window) in windows.iter().enumerate() {
        let mut net_sales = 0.0;
        let mut gross_sales = 0.0;
        let mut discounts = 0.0;
        let mut cogs = 0.0;
        let mut item_count = 0.0;
        let mut transaction_count = 0;
        let mut by_entity = BTreeMap::new();

        for outcome in outcomes {
            let Some(summary) = outcome.summaries.as_ref().and_then(|s| s.get(idx)) else {
                continue;
            };
            net_sales += summary.net_sales;
            gross_sales += summary.gross_sales;
            discounts += summary.discounts;
            cogs += summary.cogs;
            item_count += summary.item_count;
            transaction_count += summary.transaction_count;
            by_entity.insert(
                outcome.entity.id.clone(),
                EntityWeek {
                    display_name: outcome.entity.display_name.clone(),
                    net_sales: summary.net_sales,
                    transaction_count: summary.transaction_count,
                },
            );
        }

        weeks.push(TrendWeek {
            start: window.start,
            end: window.end,
            is_partial: !window.is_completed(today),
            net_sales: round_cents(net_sales),
            gross_sales: round_cents(gross_sales),
            discounts: round_cents(discounts),
            cogs: round_cents(cogs),
            gross_profit: round_cents(net_sales - cogs),
            margin_pct: margin_pct(net_sales, cogs),
            item_count: (item_count * 1000.0_f64).round() / 1000.0,
            transaction_count,
            avg_ticket: avg_ticket(net_sales, transaction_count),
            by_entity,
        });
    }

    let failed_entities = outcomes
        .iter()
        .filter_map(|o| o.error.as_ref().map(|e| (o.entity.id.clone(), e.clone())))
        .collect();

    WeeklyTrendPayload {
        weeks,
        failed_entities,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaffRow {
    pub staff_id: String,
    pub net_sales: f64,
    pub transaction_count: u64,
    pub item_count: f64,
    pub avg_ticket: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaffPayload {
    pub entity_id: String,
    pub display_name: String,
    pub window: PeriodWindow,
    pub is_partial: bool,
    /// Highest net sales first.
    pub staff: Vec<StaffRow>,
}

/// Staff leaderboard for one entity's current week.
pub fn staff_payload(entity: &Entity, summary: &PeriodSummary) -> StaffPayload {
    let mut staff: Vec<StaffRow> = summary
        .staff
        .iter()
        .map(|(id, totals)| StaffRow {
            staff_id: id.clone(),
            net_sales: totals.net_sales,
            transaction_count: totals.transaction_count,
            item_count: totals.item_count,
            avg_ticket: avg_ticket(totals.net_sales, totals.transaction_count),
        })
        .collect();
    staff.sort_by(|a, b| {
        b.net_sales
            .total_cmp(&a.net_sales)
            .then_with(|| a.staff_id.cmp(&b.staff_id))
    });

    StaffPayload {
        entity_id: entity.id.clone(),
        display_name: entity.display_name.clone(),
        window: summary.window,
        is_partial: summary.is_partial,
        staff,
    }
}

/// Sales-velocity class by units sold per week.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VelocityClass {
    A,
    B,
    C,
    D,
}

impl VelocityClass {
    pub fn from_units_per_week(units: f64) -> Self {
        if units >= 20.0 {
            VelocityClass::A
        } else if units >= 10.0 {
            VelocityClass::B
        } else if units >= 3.0 {
            VelocityClass::C
        } else {
            VelocityClass::D
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VelocityRow {
    pub variant_id: String,
    pub name: String,
    pub category: String,
    pub brand: String,
    pub units: f64,
    pub units_per_week: f64,
    pub net_sales: f64,
    pub cogs: f64,
    pub margin_pct: f64,
    pub class: VelocityClass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VelocityPayload {
    pub entity_id: String,
    pub display_name: String,
    pub weeks: usize,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    /// Fastest movers first.
    pub products: Vec<VelocityRow>,
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Units per week per product across the given completed-week summaries.
pub fn velocity_payload(entity: &Entity, summaries: &[PeriodSummary]) -> VelocityPayload {
    let mut totals: BTreeMap<&str, VelocityRow> = BTreeMap::new();
    for summary in summaries {
        for (variant_id, product) in &summary.products {
            let row = totals.entry(variant_id.as_str()).or_insert_with(|| VelocityRow {
                variant_id: variant_id.clone(),
                name: truncate_chars(&product.name, MAX_PRODUCT_NAME),
                category: product.category.clone(),
                brand: product.brand.clone(),
                units: 0.0,
                units_per_week: 0.0,
                net_sales: 0.0,
                cogs: 0.0,
                margin_pct: 0.0,
                class: VelocityClass::D,
            });
            row.units += product.quantity;
            row.net_sales += product.net_sales;
            row.cogs += product.cogs;
        }
    }

    let weeks = summaries.len();
    let mut products: Vec<VelocityRow> = totals
        .into_values()
        .map(|mut row| {
            let per_week = if weeks == 0 { 0.0 } else { row.units / weeks as f64 };
            row.units = (row.units * 1000.0).round() / 1000.0;
            row.units_per_week = round_cents(per_week);
            row.class = VelocityClass::from_units_per_week(per_week);
            row.margin_pct = margin_pct(row.net_sales, row.cogs);
            row.net_sales = round_cents(row.net_sales);
            row.cogs = round_cents(row.cogs);
            row
        })
        .collect();
    products.sort_by(|a, b| {
        b.units_per_week
            .total_cmp(&a.units_per_week)
            .then_with(|| a.variant_id.cmp(&b.variant_id))
    });

    VelocityPayload {
        entity_id: entity.id.clone(),
        display_name: entity.display_name.clone(),
        weeks,
        start: summaries.first().map(|s| s.window.start),
        end: summaries.last().map(|s| s.window.end),
        products,
    }
}
