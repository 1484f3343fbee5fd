//! Run one full rebuild against the configured vendor and print what it did.
//!
//! ```bash
//! VENDOR_CLIENT_ID=... VENDOR_API_KEY=... RUST_LOG=info \
//!     cargo run --example rebuild_once
//! ```
//!
//! Set `REDIS_URL` to write into a shared Redis layer (build with `--features redis`).

use sales_rollup::error::Result;
use sales_rollup::observability::LogMetrics;
use sales_rollup::{PipelineConfig, RebuildStatus, ReportContext, ReportService, Section};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = PipelineConfig::from_env()?;
    println!("=== sales-rollup {} ===\n", sales_rollup::VERSION);
    println!("Timezone: {}", config.timezone);
    println!("Period store: {}", config.store_path.display());

    let ctx = ReportContext::connect(config)
        .await?
        .with_metrics(Arc::new(LogMetrics));
    let ctx = Arc::new(ctx);
    let service = ReportService::new(Arc::clone(&ctx));

    println!("Entities: {}\n", ctx.directory.len());

    let status = service.coordinator().rebuild_all().await;
    match &status {
        RebuildStatus::Completed { sections } => {
            for report in sections {
                println!(
                    "{:<18} ok={:<3} failed={:<3} from_store={:<4} fetched={:<4} records={:<7} keys={} ({:?})",
                    report.section.name(),
                    report.entities_ok,
                    report.failed_entities.len(),
                    report.windows_from_store,
                    report.windows_fetched,
                    report.records_seen,
                    report.keys_written,
                    report.duration
                );
            }
        }
        RebuildStatus::Skipped => println!("Another rebuild holds the lock; nothing done"),
        RebuildStatus::Failed { reason } => println!("Rebuild failed: {}", reason),
    }

    let trend = service.read_section(Section::WeeklyTrend).await?;
    println!(
        "\nWeekly trend:\n{}",
        serde_json::to_string_pretty(&trend.into_json())?
    );

    ctx.store.flush_now().await?;
    let status = service.status().await;
    println!(
        "\nStored periods: {} ({} flushes)",
        status.stored_periods, status.store_flushes
    );

    Ok(())
}
