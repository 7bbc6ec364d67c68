//! CareSight Billing Worker
//!
//! Handles scheduled billing jobs:
//! - Renewal transaction issuance for due subscriptions (hourly)
//! - Overdue sweep and past-due escalation (hourly)
//! - Billing invariant checks (daily at 2:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use caresight_billing::BillingService;
use caresight_shared::{create_migration_pool, create_pool, run_migrations};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

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

    info!("Starting CareSight Billing Worker");

    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    // Migrations need a direct connection (poolers in transaction mode do not
    // support prepared statements). DATABASE_DIRECT_URL overrides when set.
    if std::env::var("RUN_MIGRATIONS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
    {
        let migration_url =
            std::env::var("DATABASE_DIRECT_URL").unwrap_or_else(|_| database_url.clone());
        let migration_pool = create_migration_pool(&migration_url).await?;
        run_migrations(&migration_pool).await?;
    }

    let pool = create_pool(&database_url).await?;

    let billing = Arc::new(BillingService::from_env(pool)?);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Issue renewal transactions for due subscriptions (hourly)
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running renewal issuance job");
                let now = OffsetDateTime::now_utc();
                match billing.renewals.issue_due_renewals(now).await {
                    Ok(run) => {
                        if run.errors > 0 {
                            warn!(
                                issued = run.issued,
                                errors = run.errors,
                                "Renewal issuance finished with errors"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Renewal issuance job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Renewal issuance (hourly)");

    // Job 2: Sweep overdue transactions and escalate delinquents (hourly)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 35 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running overdue sweep job");
                let now = OffsetDateTime::now_utc();
                match billing.renewals.sweep_overdue(now).await {
                    Ok(sweep) => {
                        if sweep.subscriptions_past_due > 0 {
                            warn!(
                                transactions_marked = sweep.transactions_marked,
                                subscriptions_past_due = sweep.subscriptions_past_due,
                                "Subscriptions moved to past_due"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Overdue sweep job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Overdue sweep (hourly)");

    // Job 3: Billing invariant checks (daily at 2:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
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
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 2:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("CareSight Billing Worker started successfully with 4 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
