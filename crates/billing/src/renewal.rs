//! Renewal issuance and overdue sweep
//!
//! The ledger carries one row per attempted plan change or renewal; this
//! module is the renewal producer. The worker drives it on a schedule:
//!
//! - `issue_due_renewals` creates an `open` renewal transaction (plus a
//!   pending payment) for every active auto-renewing subscription whose
//!   period has ended and that has no renewal already in flight;
//! - `sweep_overdue` moves open transactions past the payment grace window
//!   to `overdue` and marks their subscriptions past_due.
//!
//! Each subscription is handled in its own database transaction so one bad
//! row never stalls the batch.

use caresight_shared::SubscriptionId;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::catalog::PlanCatalog;
use crate::dunning::env_parse;
use crate::error::{BillingError, BillingResult};
use crate::events::{SubscriptionEventBuilder, SubscriptionEventLogger, SubscriptionEventType};
use crate::ledger::{TransactionAction, TransactionDraft, TransactionLedger, TransactionStatus};
use crate::proration::add_months;
use crate::subscriptions::{SubscriptionService, SubscriptionStatus};

/// Summary of one renewal-issuance run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenewalRun {
    pub scanned: usize,
    pub issued: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Summary of one overdue sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverdueSweep {
    pub transactions_marked: u64,
    pub subscriptions_past_due: usize,
    pub errors: usize,
}

/// Scheduled renewal producer.
pub struct RenewalService {
    pool: PgPool,
    grace: Duration,
}

impl RenewalService {
    pub fn new(pool: PgPool) -> Self {
        // Payment window before an open transaction goes overdue.
        let grace_days: i64 = env_parse("OVERDUE_GRACE_DAYS", 3);
        Self {
            pool,
            grace: Duration::days(grace_days.max(0)),
        }
    }

    /// Issue renewal transactions for every subscription due at `now`.
    pub async fn issue_due_renewals(&self, now: OffsetDateTime) -> BillingResult<RenewalRun> {
        let due: Vec<(SubscriptionId,)> = sqlx::query_as(
            r#"
            SELECT s.id
            FROM subscriptions s
            WHERE s.status = 'active'
              AND s.billing_period = 'monthly'
              AND s.auto_renew
              AND s.current_period_end IS NOT NULL
              AND s.current_period_end <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM transactions t
                  WHERE t.subscription_id = s.id
                    AND t.action = 'renew'
                    AND t.status IN ('draft', 'open', 'overdue')
              )
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut run = RenewalRun {
            scanned: due.len(),
            ..Default::default()
        };

        for (subscription_id,) in due {
            match self.issue_renewal(subscription_id, now).await {
                Ok(true) => run.issued += 1,
                Ok(false) => run.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to issue renewal"
                    );
                    run.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = run.scanned,
            issued = run.issued,
            skipped = run.skipped,
            errors = run.errors,
            "Renewal issuance complete"
        );

        Ok(run)
    }

    /// Issue one renewal. Returns false when the subscription no longer
    /// qualifies by the time its row is locked.
    async fn issue_renewal(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let sub = SubscriptionService::fetch_for_update_unscoped(&mut tx, subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        let period_end = match sub.current_period_end {
            Some(end) if end <= now && sub.status == SubscriptionStatus::Active && sub.auto_renew => {
                end
            }
            _ => return Ok(false),
        };

        let plan = PlanCatalog::fetch(&mut tx, &sub.plan_code)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "subscription references missing plan '{}'",
                    sub.plan_code
                ))
            })?;

        let payment = TransactionLedger::insert_payment(
            &mut tx,
            sub.user_id,
            &plan.code,
            plan.price_cents,
            &plan.currency,
            None,
        )
        .await?;

        let next_period_end = add_months(period_end, 1);
        let draft = TransactionDraft {
            subscription_id: sub.id,
            plan_code: plan.code.clone(),
            plan_snapshot: plan.snapshot()?,
            plan_snapshot_old: None,
            plan_snapshot_new: Some(plan.snapshot()?),
            amount_subtotal: plan.price_cents,
            amount_discount: 0,
            amount_tax: 0,
            currency: plan.currency.clone(),
            period_start: Some(period_end),
            period_end: Some(next_period_end),
            action: TransactionAction::Renew,
            status: TransactionStatus::Open,
            provider: None,
            payment_id: Some(payment.id),
            idempotency_key: None,
            related_tx_id: None,
            proration_charge: 0,
            proration_credit: 0,
            is_proration: false,
            notes: None,
        };

        let inserted = TransactionLedger::insert(&mut tx, &draft)
            .await?
            .ok_or_else(|| {
                BillingError::Internal("renewal insert unexpectedly conflicted".to_string())
            })?;

        SubscriptionEventLogger::record(
            &mut tx,
            SubscriptionEventBuilder::new(sub.id, SubscriptionEventType::RenewalIssued)
                .data(serde_json::json!({
                    "plan_code": plan.code,
                    "amount_total": plan.price_cents,
                    "period_start": period_end,
                    "period_end": next_period_end,
                }))
                .transaction(inserted.id)
                .payment(payment.id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            transaction_id = %inserted.id,
            payment_id = %payment.id,
            plan_code = %plan.code,
            amount = plan.price_cents,
            "Renewal transaction issued"
        );

        Ok(true)
    }

    /// Mark open transactions past the grace window as overdue, then move
    /// their subscriptions to past_due.
    pub async fn sweep_overdue(&self, now: OffsetDateTime) -> BillingResult<OverdueSweep> {
        let cutoff = now - self.grace;

        let mut sweep = OverdueSweep::default();

        {
            let mut tx = self.pool.begin().await?;
            sweep.transactions_marked = TransactionLedger::mark_overdue_before(&mut tx, cutoff).await?;
            tx.commit().await?;
        }

        // Subscriptions still active but carrying an overdue obligation.
        let delinquent: Vec<(SubscriptionId,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT s.id
            FROM subscriptions s
            JOIN transactions t ON t.subscription_id = s.id
            WHERE s.status = 'active'
              AND t.status = 'overdue'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for (subscription_id,) in delinquent {
            match self.mark_past_due(subscription_id).await {
                Ok(true) => sweep.subscriptions_past_due += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to mark subscription past_due"
                    );
                    sweep.errors += 1;
                }
            }
        }

        tracing::info!(
            transactions_marked = sweep.transactions_marked,
            subscriptions_past_due = sweep.subscriptions_past_due,
            errors = sweep.errors,
            "Overdue sweep complete"
        );

        Ok(sweep)
    }

    async fn mark_past_due(&self, subscription_id: SubscriptionId) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let sub = SubscriptionService::fetch_for_update_unscoped(&mut tx, subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if !sub.status.can_transition_to(SubscriptionStatus::PastDue) {
            return Ok(false);
        }

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(sub.id)
        .bind(sub.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(BillingError::ConcurrentModification(
                "subscription was modified by another process".to_string(),
            ));
        }

        SubscriptionEventLogger::record(
            &mut tx,
            SubscriptionEventBuilder::new(sub.id, SubscriptionEventType::MarkedPastDue)
                .data(serde_json::json!({ "reason": "overdue_transaction" })),
        )
        .await?;

        tx.commit().await?;

        tracing::warn!(subscription_id = %subscription_id, "Subscription marked past_due");

        Ok(true)
    }
}
