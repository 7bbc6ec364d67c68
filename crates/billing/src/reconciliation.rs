//! Payment reconciliation
//!
//! Matches confirmed gateway payments to the ledger transactions they settle
//! and applies the held plan change to the subscription. Invoked only from
//! the webhook adapter with an already-verified, normalized event; the
//! prepare paths never settle anything themselves.
//!
//! Gateways retry webhooks, so settlement must tolerate replays: the
//! transaction's own status is the dedup record. A replay finds the row
//! already `paid`, is acknowledged as success, and changes nothing.

use caresight_shared::PaymentId;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::catalog::Plan;
use crate::dunning::{DunningAction, DunningPolicy};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    ActorType, SubscriptionEventBuilder, SubscriptionEventLogger, SubscriptionEventType,
};
use crate::ledger::{PaymentStatus, TransactionLedger, TransactionStatus};
use crate::subscriptions::{SubscriptionService, SubscriptionStatus};

/// Result of a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The transaction settled and the subscription now reflects it.
    Applied,
    /// The payment had already been applied; nothing changed. Acknowledged
    /// to the gateway as success so it stops retrying.
    AlreadyApplied,
}

/// Result of recording a failed payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PaymentFailureOutcome {
    pub attempt_count: i32,
    pub action: DunningAction,
}

/// Settles transactions against gateway confirmations.
pub struct PaymentReconciliationService {
    pool: PgPool,
    policy: DunningPolicy,
}

impl PaymentReconciliationService {
    pub fn new(pool: PgPool, policy: DunningPolicy) -> Self {
        Self { pool, policy }
    }

    /// Apply the plan change held by the transaction backed by `payment_id`.
    ///
    /// Single database transaction: lock the ledger row, check-and-set its
    /// status to `paid`, mutate the subscription from `plan_snapshot_new`,
    /// mark the payment row, append the audit event. Safe to call any number
    /// of times for the same payment.
    pub async fn apply_on_payment_success(
        &self,
        payment_id: PaymentId,
    ) -> BillingResult<ReconcileOutcome> {
        let strategy = ExponentialBackoff::from_millis(20).map(jitter).take(3);
        RetryIf::spawn(
            strategy,
            || self.apply_on_payment_success_once(payment_id),
            BillingError::is_retryable,
        )
        .await
    }

    async fn apply_on_payment_success_once(
        &self,
        payment_id: PaymentId,
    ) -> BillingResult<ReconcileOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let ledger_tx = TransactionLedger::find_by_payment_for_update(&mut tx, payment_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(payment_id.to_string()))?;

        match ledger_tx.status {
            TransactionStatus::Paid => {
                tracing::info!(
                    payment_id = %payment_id,
                    transaction_id = %ledger_tx.id,
                    "Webhook replay: transaction already paid, acknowledging"
                );
                return Ok(ReconcileOutcome::AlreadyApplied);
            }
            TransactionStatus::Void => {
                return Err(BillingError::InvalidState(format!(
                    "transaction for payment {} was voided and cannot be settled",
                    payment_id
                )));
            }
            TransactionStatus::Draft | TransactionStatus::Open | TransactionStatus::Overdue => {}
        }

        // Check-and-set under the row lock; losing here means another
        // reconciliation path settled first.
        if !TransactionLedger::settle(&mut tx, ledger_tx.id).await? {
            tracing::info!(
                payment_id = %payment_id,
                transaction_id = %ledger_tx.id,
                "Transaction settled by a concurrent reconciliation, acknowledging"
            );
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let sub = SubscriptionService::fetch_for_update_unscoped(&mut tx, ledger_tx.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "transaction {} references missing subscription",
                    ledger_tx.id
                ))
            })?;

        let snapshot = ledger_tx
            .plan_snapshot_new
            .as_ref()
            .unwrap_or(&ledger_tx.plan_snapshot);
        let new_plan = Plan::from_snapshot(snapshot)?;

        let period_start = ledger_tx.period_start.unwrap_or(now);
        let period_end = ledger_tx.period_end.unwrap_or(now);

        // Successful payment reactivates a delinquent or trialing subscription.
        let new_status = match sub.status {
            SubscriptionStatus::Trialing | SubscriptionStatus::PastDue => {
                SubscriptionStatus::Active
            }
            other => other,
        };

        SubscriptionService::apply_plan(
            &mut tx,
            &sub,
            &new_plan.code,
            period_start,
            period_end,
            new_status,
        )
        .await?;

        // apply_plan bumped the version; finish the payment bookkeeping on
        // the same row in the same transaction.
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_payment_at = $2, renewal_attempt_count = 0, dunning_stage = 0,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        TransactionLedger::mark_payment(&mut tx, payment_id, PaymentStatus::Paid).await?;

        SubscriptionEventLogger::record(
            &mut tx,
            SubscriptionEventBuilder::new(sub.id, SubscriptionEventType::PaymentRecorded)
                .data(serde_json::json!({
                    "plan_code": new_plan.code,
                    "amount_total": ledger_tx.amount_total,
                    "action": ledger_tx.action,
                    "previous_status": sub.status,
                    "new_status": new_status,
                }))
                .actor_type(ActorType::Gateway)
                .transaction(ledger_tx.id)
                .payment(payment_id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            transaction_id = %ledger_tx.id,
            payment_id = %payment_id,
            plan_code = %new_plan.code,
            amount_total = ledger_tx.amount_total,
            "Payment reconciled, plan change applied"
        );

        Ok(ReconcileOutcome::Applied)
    }

    /// Record a failed payment attempt and escalate per the dunning policy.
    ///
    /// A failure report arriving after the payment settled is ignored
    /// (gateways can deliver events out of order).
    pub async fn record_payment_failure(
        &self,
        payment_id: PaymentId,
    ) -> BillingResult<PaymentFailureOutcome> {
        let strategy = ExponentialBackoff::from_millis(20).map(jitter).take(3);
        RetryIf::spawn(
            strategy,
            || self.record_payment_failure_once(payment_id),
            BillingError::is_retryable,
        )
        .await
    }

    async fn record_payment_failure_once(
        &self,
        payment_id: PaymentId,
    ) -> BillingResult<PaymentFailureOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let payment = TransactionLedger::find_payment_for_update(&mut tx, payment_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))?;

        if payment.status == PaymentStatus::Paid {
            tracing::info!(
                payment_id = %payment_id,
                "Ignoring failure report for an already-settled payment"
            );
            return Ok(PaymentFailureOutcome {
                attempt_count: 0,
                action: DunningAction::Retry,
            });
        }

        TransactionLedger::mark_payment(&mut tx, payment_id, PaymentStatus::Failed).await?;

        let ledger_tx = TransactionLedger::find_by_payment_for_update(&mut tx, payment_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(payment_id.to_string()))?;

        let sub = SubscriptionService::fetch_for_update_unscoped(&mut tx, ledger_tx.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "transaction {} references missing subscription",
                    ledger_tx.id
                ))
            })?;

        let attempt_count = sub.renewal_attempt_count + 1;
        let action = self.policy.next_action(attempt_count);
        let stage = self.policy.stage_for(attempt_count);

        let (event_type, new_status) = match action {
            DunningAction::Retry => (SubscriptionEventType::PaymentFailed, sub.status),
            DunningAction::MarkPastDue => {
                let next = if sub.status.can_transition_to(SubscriptionStatus::PastDue) {
                    SubscriptionStatus::PastDue
                } else {
                    sub.status
                };
                (SubscriptionEventType::MarkedPastDue, next)
            }
            DunningAction::Suspend => {
                let target = if self.policy.pause_on_exhaust {
                    SubscriptionStatus::Paused
                } else {
                    SubscriptionStatus::Canceled
                };
                let next = if sub.status.can_transition_to(target) {
                    target
                } else {
                    sub.status
                };
                (SubscriptionEventType::Suspended, next)
            }
        };

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, renewal_attempt_count = $3, dunning_stage = $4,
                ended_at = CASE WHEN $2 = 'canceled' THEN $5 ELSE ended_at END,
                canceled_at = CASE WHEN $2 = 'canceled' THEN $5 ELSE canceled_at END,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(sub.id)
        .bind(new_status)
        .bind(attempt_count)
        .bind(stage)
        .bind(now)
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
            SubscriptionEventBuilder::new(sub.id, event_type)
                .data(serde_json::json!({
                    "attempt_count": attempt_count,
                    "dunning_stage": stage,
                    "previous_status": sub.status,
                    "new_status": new_status,
                }))
                .actor_type(ActorType::Gateway)
                .transaction(ledger_tx.id)
                .payment(payment_id),
        )
        .await?;

        tx.commit().await?;

        tracing::warn!(
            subscription_id = %sub.id,
            payment_id = %payment_id,
            attempt_count = attempt_count,
            action = ?action,
            "Payment failure recorded"
        );

        Ok(PaymentFailureOutcome {
            attempt_count,
            action,
        })
    }
}
