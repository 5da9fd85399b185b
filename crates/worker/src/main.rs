//! Trackly Background Worker
//!
//! Handles scheduled billing jobs:
//! - Processor event retry queue draining (every minute)
//! - Cancellation finalization when periods lapse (every 10 minutes)
//! - Billing invariant sweep (hourly)

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use trackly_billing::BillingService;

/// Batch size per queue drain; leftover rows are picked up next tick
const QUEUE_BATCH: i64 = 25;

/// Cancellations finalized per sweep
const FINALIZE_BATCH: i64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Trackly Worker");

    // Create database pool
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = trackly_shared::create_pool(&database_url).await?;
    info!("Database pool created");

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe configuration there is nothing for this worker
            // to do beyond heartbeating
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: drain the processor event retry queue every minute
    let ingest_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = ingest_billing.clone();
            Box::pin(async move {
                match billing.ingest.process_queue(QUEUE_BATCH).await {
                    Ok(stats) => {
                        if stats.completed + stats.retried + stats.dead_lettered > 0 {
                            info!(
                                completed = stats.completed,
                                retried = stats.retried,
                                dead_lettered = stats.dead_lettered,
                                "Processor event queue drained"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to drain processor event queue"),
                }
            })
        })?)
        .await?;

    // Job 2: finalize lapsed cancellations every 10 minutes
    let finalize_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let billing = finalize_billing.clone();
            Box::pin(async move {
                match billing.engine.finalize_due_cancellations(FINALIZE_BATCH).await {
                    Ok(count) if count > 0 => {
                        info!(count = count, "Finalized lapsed cancellations")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Cancellation finalization failed"),
                }
            })
        })?)
        .await?;

    // Job 3: hourly invariant sweep
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "Billing invariants healthy"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Worker scheduler started");

    // Park the main task; jobs run on the scheduler
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
