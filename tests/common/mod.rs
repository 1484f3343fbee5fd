//! Shared fixtures for integration tests: a scripted order source, a counting
//! metrics hook and a context wired to an in-memory shared layer.

#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sales_rollup::backend::InMemoryBackend;
use sales_rollup::observability::PipelineMetrics;
use sales_rollup::vendor::{InventoryItem, OrderSource, Page};
use sales_rollup::window::DateRange;
use sales_rollup::{Entity, EntityDirectory, Error, FixedClock, PeriodStore, PipelineConfig, ReportContext, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type TestContext = ReportContext<ScriptedSource, InMemoryBackend>;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Wednesday 2024-05-22, noon in Los Angeles.
pub fn wednesday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 22, 19, 0, 0).unwrap()
}

/// Tuesdays of the four trailing weeks ending with the current one.
pub const TRADING_DAYS: [&str; 4] = ["2024-04-30", "2024-05-07", "2024-05-14", "2024-05-21"];

/// One vendor order with a single line item, at 1pm Los Angeles time on `day`.
pub fn order(day: &str, staff: &str, product: &str, quantity: f64, unit_price: f64, cost: f64) -> Value {
    json!({
        "createdAt": format!("{}T20:00:00Z", day),
        "customerType": "recreational",
        "budtender": staff,
        "itemsInCart": [{
            "variantId": format!("v-{}", product.to_lowercase().replace(' ', "-")),
            "productName": product,
            "category": "Flower",
            "brand": "Acme",
            "quantity": quantity,
            "unitPrice": unit_price,
            "totalDiscounts": 0.0,
            "totalCost": cost
        }]
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchCall {
    pub entity_ref: String,
    pub range: DateRange,
    pub page: u32,
}

struct SourceState {
    orders: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<FetchCall>>,
    inventory: Mutex<Vec<Value>>,
    inventory_refs: Mutex<Vec<String>>,
    locations: Vec<Value>,
    page_size: u32,
    delay: Duration,
}

/// In-memory vendor. Orders are filtered by their UTC date, like the real
/// search endpoint filters by date.
#[derive(Clone)]
pub struct ScriptedSource {
    state: Arc<SourceState>,
}

impl ScriptedSource {
    pub fn new(page_size: u32) -> Self {
        Self::with_delay(page_size, Duration::ZERO)
    }

    pub fn with_delay(page_size: u32, delay: Duration) -> Self {
        ScriptedSource {
            state: Arc::new(SourceState {
                orders: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
                inventory: Mutex::new(Vec::new()),
                inventory_refs: Mutex::new(Vec::new()),
                locations: vec![
                    json!({ "locationId": "a", "importId": "loc-a", "locationName": "Downtown - Main St" }),
                    json!({ "locationId": "b", "importId": "loc-b", "locationName": "Harbor - Pier 3" }),
                    json!({ "locationId": "c", "importId": "loc-c", "locationName": "Cultivation" }),
                ],
                page_size,
                delay,
            }),
        }
    }

    pub fn add_order(&self, entity_ref: &str, order: Value) {
        self.state
            .orders
            .lock()
            .unwrap()
            .entry(entity_ref.to_string())
            .or_default()
            .push(order);
    }

    /// Two orders per trading day for each entity.
    pub fn seed_history(&self, entity_refs: &[&str]) {
        for entity_ref in entity_refs {
            for day in TRADING_DAYS {
                self.add_order(entity_ref, order(day, "alice", "Blue Dream", 2.0, 25.0, 20.0));
                self.add_order(entity_ref, order(day, "bob", "Sour Diesel", 1.0, 40.0, 15.0));
            }
        }
    }

    pub fn set_inventory(&self, items: Vec<Value>) {
        *self.state.inventory.lock().unwrap() = items;
    }

    /// Vendor refs that inventory queries went through.
    pub fn inventory_refs(&self) -> Vec<String> {
        self.state.inventory_refs.lock().unwrap().clone()
    }

    pub fn fail_entity(&self, entity_ref: &str) {
        self.state.failing.lock().unwrap().insert(entity_ref.to_string());
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().unwrap().clear();
    }
}

fn order_date(order: &Value) -> Option<NaiveDate> {
    let ts = order.get("createdAt")?.as_str()?;
    NaiveDate::parse_from_str(ts.get(..10)?, "%Y-%m-%d").ok()
}

impl OrderSource for ScriptedSource {
    async fn fetch_page(&self, entity: &Entity, range: DateRange, page: u32, page_size: u32) -> Result<Page> {
        if !self.state.delay.is_zero() {
            tokio::time::sleep(self.state.delay).await;
        }

        self.state.calls.lock().unwrap().push(FetchCall {
            entity_ref: entity.vendor_ref.clone(),
            range,
            page,
        });

        if self.state.failing.lock().unwrap().contains(&entity.vendor_ref) {
            return Err(Error::UpstreamUnavailable {
                attempts: 5,
                last_error: "HTTP 503".to_string(),
            });
        }

        let matching: Vec<Value> = {
            let orders = self.state.orders.lock().unwrap();
            orders
                .get(&entity.vendor_ref)
                .map(|orders| {
                    orders
                        .iter()
                        .filter(|o| order_date(o).is_some_and(|d| range.start <= d && d <= range.end))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let skip = ((page.max(1) - 1) * page_size) as usize;
        let slice: Vec<Value> = matching.iter().skip(skip).take(page_size as usize).cloned().collect();
        Page::from_json(&json!({ "orders": slice, "total": matching.len() }))
    }

    async fn fetch_locations(&self) -> Result<Vec<Value>> {
        Ok(self.state.locations.clone())
    }

    async fn fetch_inventory(&self, entity: &Entity) -> Result<Vec<InventoryItem>> {
        self.state.inventory_refs.lock().unwrap().push(entity.vendor_ref.clone());
        if self.state.failing.lock().unwrap().contains(&entity.vendor_ref) {
            return Err(Error::UpstreamUnavailable {
                attempts: 5,
                last_error: "HTTP 503".to_string(),
            });
        }
        Ok(self.state.inventory.lock().unwrap().iter().map(InventoryItem::from_vendor).collect())
    }

    fn page_size(&self) -> u32 {
        self.state.page_size
    }
}

/// Counts the hooks the read and rebuild paths fire.
#[derive(Default)]
pub struct CountingMetrics {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
    pub triggered: AtomicUsize,
    pub entity_failures: AtomicUsize,
    pub store_reuse: AtomicUsize,
    pub finished: Mutex<Vec<(String, String)>>,
}

impl CountingMetrics {
    pub fn triggered(&self) -> usize {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> Vec<(String, String)> {
        self.finished.lock().unwrap().clone()
    }
}

impl PipelineMetrics for CountingMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn record_miss(&self, _key: &str, _duration: Duration) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn record_rebuild_triggered(&self, _section: &str) {
        self.triggered.fetch_add(1, Ordering::SeqCst);
    }

    fn record_rebuild_finished(&self, section: &str, outcome: &str, _duration: Duration) {
        self.finished
            .lock()
            .unwrap()
            .push((section.to_string(), outcome.to_string()));
    }

    fn record_entity_failure(&self, _section: &str, _entity_id: &str, _error: &str) {
        self.entity_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn record_store_reuse(&self, _entity_id: &str, windows: usize) {
        self.store_reuse.fetch_add(windows, Ordering::SeqCst);
    }
}

/// Four trend weeks (three completed plus the current one), two velocity weeks.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        trend_weeks: 4,
        velocity_weeks: 2,
        rebuild_concurrency: 2,
        ..PipelineConfig::default()
    }
}

pub struct Harness {
    pub source: ScriptedSource,
    pub shared: InMemoryBackend,
    pub store: PeriodStore,
    pub clock: Arc<FixedClock>,
    pub metrics: Arc<CountingMetrics>,
}

impl Harness {
    pub fn new(source: ScriptedSource) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Harness {
            source,
            shared: InMemoryBackend::new(),
            store: PeriodStore::in_memory(),
            clock: Arc::new(FixedClock::new(wednesday_noon())),
            metrics: Arc::new(CountingMetrics::default()),
        }
    }

    pub fn with_store(mut self, store: PeriodStore) -> Self {
        self.store = store;
        self
    }

    /// A context over the harness's source, store and shared layer. Contexts built
    /// from one harness behave like separate processes sharing Redis and disk.
    pub async fn context(&self) -> Arc<TestContext> {
        self.context_with(test_config()).await
    }

    pub async fn context_with(&self, config: PipelineConfig) -> Arc<TestContext> {
        let directory = EntityDirectory::load(&self.source, &config.excluded_entities)
            .await
            .unwrap();
        Arc::new(
            ReportContext::new(
                config,
                self.source.clone(),
                directory,
                self.store.clone(),
                self.shared.clone(),
            )
            .with_clock(self.clock.clone())
            .with_metrics(self.metrics.clone()),
        )
    }
}
