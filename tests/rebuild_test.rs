//! Integration tests for the rebuild path.
//!
//! These run full rebuilds against a scripted vendor, an in-memory shared layer
//! and a fixed clock (Wednesday 2024-05-22 in Los Angeles).

mod common;

use common::{date, order, test_config, Harness, ScriptedSource};
use sales_rollup::backend::CacheBackend;
use sales_rollup::key::{CacheKeyBuilder, REBUILD_LOCK_KEY};
use sales_rollup::{PeriodStore, RebuildCoordinator, RebuildStatus, ReportService, Section, SectionRead};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn sections(status: &RebuildStatus) -> &[sales_rollup::rebuild::SectionReport] {
    match status {
        RebuildStatus::Completed { sections } => sections,
        other => panic!("expected a completed rebuild, got {:?}", other),
    }
}

fn hit_payload(read: SectionRead) -> Value {
    match read {
        SectionRead::Hit(entry) => entry.payload,
        other => panic!("expected a cache hit, got {:?}", other),
    }
}

/// Test 1: End-to-End Rebuild
///
/// One rebuild fills every section for every entity, and reads are then served
/// from the cache.
#[tokio::test]
async fn test_rebuild_all_populates_every_section() {
    let harness = Harness::new(ScriptedSource::new(3));
    harness.source.seed_history(&["loc-a", "loc-b"]);
    let ctx = harness.context().await;
    assert_eq!(ctx.directory.len(), 2, "Blocklisted location must be dropped");

    let status = RebuildCoordinator::new(ctx.clone()).rebuild_all().await;
    let reports = sections(&status);
    assert_eq!(reports.len(), 3);
    for report in reports {
        assert_eq!(report.entities_ok, 2, "{} should cover both entities", report.section);
        assert!(report.failed_entities.is_empty());
    }

    let service = ReportService::new(ctx);

    let trend = hit_payload(service.read_section(Section::WeeklyTrend).await.unwrap());
    let weeks = trend["weeks"].as_array().unwrap();
    assert_eq!(weeks.len(), 4);
    assert_eq!(weeks[0]["start"], "2024-04-29");
    assert_eq!(weeks[3]["start"], "2024-05-20");
    assert_eq!(weeks[0]["is_partial"], false);
    assert_eq!(weeks[3]["is_partial"], true);
    for week in weeks {
        assert_eq!(week["net_sales"].as_f64(), Some(180.0));
        assert_eq!(week["transaction_count"].as_u64(), Some(4));
        assert_eq!(week["by_entity"]["a"]["display_name"], "Downtown");
    }

    let staff = hit_payload(service.read_entity_section(Section::Staff, "a").await.unwrap());
    assert_eq!(staff["staff"][0]["staff_id"], "alice");
    assert_eq!(staff["staff"][0]["net_sales"].as_f64(), Some(50.0));
    assert_eq!(staff["staff"][1]["staff_id"], "bob");

    let velocity = hit_payload(
        service
            .read_entity_section(Section::ProductVelocity, "b")
            .await
            .unwrap(),
    );
    assert_eq!(velocity["weeks"].as_u64(), Some(2));
    assert_eq!(velocity["start"], "2024-05-06");
    assert_eq!(velocity["end"], "2024-05-19");
    assert_eq!(velocity["products"][0]["name"], "Blue Dream");
    assert_eq!(velocity["products"][0]["units_per_week"].as_f64(), Some(2.0));
    assert_eq!(velocity["products"][0]["class"], "D");
}

/// Test 2: Pagination
///
/// Pages are requested in order and stop after the first short page.
#[tokio::test]
async fn test_pages_requested_in_order_until_short_page() {
    let harness = Harness::new(ScriptedSource::new(3));
    harness.source.seed_history(&["loc-a"]);
    let ctx = harness.context().await;

    RebuildCoordinator::new(ctx).rebuild_section(Section::WeeklyTrend).await;

    // 8 orders in the trailing four weeks at 3 per page
    let pages: Vec<u32> = harness
        .source
        .calls()
        .into_iter()
        .filter(|c| c.entity_ref == "loc-a")
        .map(|c| c.page)
        .collect();
    assert_eq!(pages, vec![1, 2, 3]);
}

/// Test 3: Completed Weeks Are Immutable
///
/// A second rebuild fetches only the open week. Orders arriving late for a
/// completed week do not change that week; orders in the open week do.
#[tokio::test]
async fn test_completed_weeks_not_refetched() {
    let harness = Harness::new(ScriptedSource::new(50));
    harness.source.seed_history(&["loc-a", "loc-b"]);
    let ctx = harness.context().await;
    let coordinator = RebuildCoordinator::new(ctx.clone());
    let service = ReportService::new(ctx);

    assert!(coordinator.rebuild_all().await.is_completed());
    let before = hit_payload(service.read_section(Section::WeeklyTrend).await.unwrap());

    harness.source.clear_calls();
    harness
        .source
        .add_order("loc-a", order("2024-05-14", "alice", "Blue Dream", 10.0, 25.0, 20.0));
    harness
        .source
        .add_order("loc-a", order("2024-05-22", "carol", "Sour Diesel", 1.0, 40.0, 15.0));

    let status = coordinator.rebuild_all().await;
    let trend_report = &sections(&status)[0];
    assert_eq!(trend_report.section, Section::WeeklyTrend);
    assert_eq!(trend_report.windows_from_store, 6);
    assert_eq!(trend_report.windows_fetched, 2);

    let calls = harness.source.calls();
    assert!(!calls.is_empty());
    for call in &calls {
        assert_eq!(
            call.range.start,
            date(2024, 5, 20),
            "Only the open week may be fetched again, got {:?}",
            call
        );
    }
    assert!(harness.metrics.store_reuse.load(Ordering::SeqCst) > 0);

    let after = hit_payload(service.read_section(Section::WeeklyTrend).await.unwrap());
    let before_weeks = before["weeks"].as_array().unwrap();
    let after_weeks = after["weeks"].as_array().unwrap();
    assert_eq!(before_weeks[..3], after_weeks[..3]);
    assert_eq!(after_weeks[3]["net_sales"].as_f64(), Some(220.0));
    assert_eq!(after_weeks[3]["transaction_count"].as_u64(), Some(5));
}

/// Test 4: Single Rebuild At A Time
///
/// Two processes sharing one shared layer start a rebuild together: one runs,
/// the other is skipped, and the lock is free again afterwards.
#[tokio::test]
async fn test_concurrent_rebuilds_one_runs_one_skips() {
    let harness = Harness::new(ScriptedSource::with_delay(50, Duration::from_millis(20)));
    harness.source.seed_history(&["loc-a", "loc-b"]);
    let first = RebuildCoordinator::new(harness.context().await);
    let second = RebuildCoordinator::new(harness.context().await);

    let (a, b) = tokio::join!(first.rebuild_all(), second.rebuild_all());
    let completed = [&a, &b].iter().filter(|s| s.is_completed()).count();
    let skipped = [&a, &b].iter().filter(|s| s.is_skipped()).count();
    assert_eq!((completed, skipped), (1, 1), "got {:?} and {:?}", a, b);

    assert!(harness.shared.get(REBUILD_LOCK_KEY).await.unwrap().is_none());
    assert!(second.rebuild_all().await.is_completed());

    let finished = harness.metrics.finished();
    assert!(finished.contains(&("all".to_string(), "skipped".to_string())));
    assert_eq!(
        finished.iter().filter(|(_, outcome)| outcome == "completed").count(),
        2
    );
}

/// Test 5: Crashed Lock Holder
///
/// A lock left behind by a dead process blocks rebuilds until its TTL passes,
/// and is never deleted by a holder with a different token.
#[tokio::test(start_paused = true)]
async fn test_abandoned_lock_expires() {
    let harness = Harness::new(ScriptedSource::new(50));
    harness.source.seed_history(&["loc-a"]);
    let coordinator = RebuildCoordinator::new(harness.context().await);

    assert!(harness
        .shared
        .set_nx(REBUILD_LOCK_KEY, b"crashed-holder".to_vec(), Duration::from_secs(60))
        .await
        .unwrap());

    assert!(coordinator.rebuild_all().await.is_skipped());
    assert_eq!(
        harness.shared.get(REBUILD_LOCK_KEY).await.unwrap(),
        Some(b"crashed-holder".to_vec())
    );

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(coordinator.rebuild_all().await.is_completed());
}

/// Test 6: Failure Isolation
///
/// An entity whose fetch fails is reported and left out; the others are written.
#[tokio::test]
async fn test_entity_failure_isolated() {
    let harness = Harness::new(ScriptedSource::new(50));
    harness.source.seed_history(&["loc-a", "loc-b"]);
    harness.source.fail_entity("loc-b");
    let ctx = harness.context().await;
    let coordinator = RebuildCoordinator::new(ctx.clone());

    let status = coordinator.rebuild_all().await;
    for report in sections(&status) {
        assert_eq!(report.entities_ok, 1);
        assert!(report.failed_entities["b"].contains("503"));
    }
    assert_eq!(harness.metrics.entity_failures.load(Ordering::SeqCst), 3);

    let service = ReportService::new(ctx);
    let trend = hit_payload(service.read_section(Section::WeeklyTrend).await.unwrap());
    assert!(trend["failed_entities"]["b"].is_string());
    for week in trend["weeks"].as_array().unwrap() {
        assert_eq!(week["net_sales"].as_f64(), Some(90.0));
        assert!(week["by_entity"].get("b").is_none());
    }

    let staff_b = CacheKeyBuilder::entity_section(Section::Staff, "b");
    assert!(harness.shared.get(&staff_b).await.unwrap().is_none());
    let staff_a = CacheKeyBuilder::entity_section(Section::Staff, "a");
    assert!(harness.shared.get(&staff_a).await.unwrap().is_some());
}

/// Test 7: Total Failure Keeps The Previous Trend
#[tokio::test]
async fn test_all_entities_failing_keeps_previous_trend() {
    let harness = Harness::new(ScriptedSource::new(50));
    harness.source.seed_history(&["loc-a", "loc-b"]);
    let ctx = harness.context().await;
    let coordinator = RebuildCoordinator::new(ctx.clone());
    assert!(coordinator.rebuild_section(Section::WeeklyTrend).await.is_completed());

    let service = ReportService::new(ctx);
    let before = match service.read_section(Section::WeeklyTrend).await.unwrap() {
        SectionRead::Hit(entry) => entry,
        other => panic!("expected a cache hit, got {:?}", other),
    };

    harness.source.fail_entity("loc-a");
    harness.source.fail_entity("loc-b");
    let status = coordinator.rebuild_section(Section::WeeklyTrend).await;
    let report = &sections(&status)[0];
    assert_eq!(report.entities_ok, 0);
    assert_eq!(report.keys_written, 0);

    match service.read_section(Section::WeeklyTrend).await.unwrap() {
        SectionRead::Hit(entry) => assert_eq!(entry, before),
        other => panic!("expected the previous entry, got {:?}", other),
    }
}

/// Test 8: Period Store Survives A Restart
///
/// Completed weeks written by one process are reused after a reload from disk.
#[tokio::test]
async fn test_store_persists_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("periods.json");

    let store = PeriodStore::load(&path, Duration::from_millis(10)).await.unwrap();
    let harness = Harness::new(ScriptedSource::new(50)).with_store(store.clone());
    harness.source.seed_history(&["loc-a", "loc-b"]);
    assert!(RebuildCoordinator::new(harness.context().await)
        .rebuild_all()
        .await
        .is_completed());

    // 2 entities x 3 completed trend weeks
    assert_eq!(store.len(), 6);
    store.flush_now().await.unwrap();

    let reloaded = PeriodStore::load(&path, Duration::from_millis(10)).await.unwrap();
    assert_eq!(reloaded.len(), 6);
    let original = store.get("loc-a", date(2024, 5, 13)).unwrap();
    assert_eq!(reloaded.get("loc-a", date(2024, 5, 13)), Some(original.clone()));
    assert!(!original.is_partial);

    let restarted = Harness::new(harness.source.clone()).with_store(reloaded);
    restarted.source.clear_calls();
    assert!(RebuildCoordinator::new(restarted.context().await)
        .rebuild_all()
        .await
        .is_completed());
    assert!(restarted
        .source
        .calls()
        .iter()
        .all(|c| c.range.start == date(2024, 5, 20)));
}

/// Test 9: Section TTL Overrides
///
/// A configured per-section TTL applies to that section's entries only.
#[tokio::test]
async fn test_section_ttl_override_applies_to_written_entries() {
    let harness = Harness::new(ScriptedSource::new(50));
    harness.source.seed_history(&["loc-a", "loc-b"]);
    let mut config = test_config();
    config.section_ttls.insert(Section::Staff, Duration::from_secs(120));
    let ctx = harness.context_with(config).await;
    assert!(RebuildCoordinator::new(ctx.clone()).rebuild_all().await.is_completed());

    let staff = ctx
        .cache
        .read(&CacheKeyBuilder::entity_section(Section::Staff, "a"))
        .await
        .unwrap();
    assert_eq!(staff.ttl, Duration::from_secs(120));

    let trend = ctx.cache.read(&CacheKeyBuilder::section(Section::WeeklyTrend)).await.unwrap();
    assert_eq!(trend.ttl, Duration::from_secs(600));
}
