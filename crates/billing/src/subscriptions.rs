//! Subscription lifecycle management
//!
//! Owns the current plan, status and billing period of a customer's
//! subscription. Plan changes go through one consolidated routine:
//!
//! - zero-due changes (the remaining credit covers the charge) apply
//!   synchronously inside the request's database transaction;
//! - positive-due changes create an `open` ledger transaction plus a pending
//!   payment and leave the subscription untouched until payment
//!   reconciliation confirms settlement.
//!
//! Every operation is one serialized read-modify-write: the subscription row
//! is taken `FOR UPDATE`, and updates carry an optimistic `version` check on
//! top. Lock races surface as `ConcurrentModification` and are retried with
//! bounded exponential backoff before reaching the caller.

use caresight_shared::{PaymentId, SubscriptionId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::catalog::{Plan, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    ActorType, SubscriptionEventBuilder, SubscriptionEventLogger, SubscriptionEventType,
};
use crate::ledger::{
    PaymentProvider, Transaction, TransactionAction, TransactionDraft, TransactionLedger,
    TransactionStatus,
};
use crate::proration::{prorate, Proration};

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    /// Legal transitions of the state machine. `canceled` is terminal.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Trialing, Active)
                | (Trialing, Canceled)
                | (Active, PastDue)
                | (Active, Paused)
                | (Active, Canceled)
                | (PastDue, Active)
                | (PastDue, Canceled)
                | (Paused, Active)
                | (Paused, Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }
}

/// Cadence of the billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    None,
    Monthly,
}

/// A subscription row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_code: String,
    pub status: SubscriptionStatus,
    pub billing_period: BillingPeriod,
    pub started_at: OffsetDateTime,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub extra_cameras: i32,
    pub extra_caregivers: i32,
    pub extra_sites: i32,
    pub extra_storage_gb: i32,
    pub renewal_attempt_count: i32,
    pub dunning_stage: i32,
    pub notes: Option<String>,
    pub last_payment_at: Option<OffsetDateTime>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// The current billing period when both bounds are set.
    pub fn period_bounds(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        match (self.current_period_start, self.current_period_end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }
}

/// Parameters for preparing a plan change.
#[derive(Debug, Clone)]
pub struct PrepareChangeRequest {
    pub user_id: UserId,
    pub subscription_id: SubscriptionId,
    pub plan_code: String,
    pub provider: Option<PaymentProvider>,
    pub idempotency_key: Option<String>,
}

/// Caller-visible result of a prepare call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// The change is fully applied (zero amount due, or a same-plan no-op).
    Success,
    /// A payment must settle before the change takes effect.
    RequiresAction,
}

/// Outcome of `prepare_upgrade`/`prepare_downgrade`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub status: ChangeStatus,
    /// Absent for a same-plan no-op, which creates no ledger row.
    pub transaction_id: Option<TransactionId>,
    pub amount_due: i64,
    pub proration_charge: i64,
    pub proration_credit: i64,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    /// True when served from a previous request with the same idempotency key.
    pub replayed: bool,
}

/// What a requested plan change resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChangeDecision {
    /// Target plan equals the current plan: nothing to bill, nothing to write.
    NoOp,
    /// Credit covers the charge: apply immediately without payment.
    ApplyNow(Proration),
    /// Positive amount due: hold the change until payment settles.
    RequirePayment(Proration),
}

/// Pure decision step; the service wraps it in locking and persistence.
pub(crate) fn decide_change(
    current_plan: &Plan,
    target_plan: &Plan,
    bounds: Option<(OffsetDateTime, OffsetDateTime)>,
    now: OffsetDateTime,
) -> ChangeDecision {
    if current_plan.code == target_plan.code {
        return ChangeDecision::NoOp;
    }

    let proration = prorate(current_plan, target_plan, bounds, now);
    if proration.amount_due == 0 {
        ChangeDecision::ApplyNow(proration)
    } else {
        ChangeDecision::RequirePayment(proration)
    }
}

const SELECT_SUBSCRIPTION: &str = r#"
    SELECT id, user_id, plan_code, status, billing_period, started_at,
           current_period_start, current_period_end, trial_end_at, canceled_at,
           ended_at, auto_renew, extra_cameras, extra_caregivers, extra_sites,
           extra_storage_gb, renewal_attempt_count, dunning_stage, notes,
           last_payment_at, version, created_at, updated_at
    FROM subscriptions
    "#;

/// Subscription service: plan changes, cancellation, read accessors.
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Prepare an upgrade to `plan_code`.
    ///
    /// Zero-due changes (same plan, or credit covering the charge) apply
    /// immediately and return `success`; anything with a positive amount due
    /// returns `requires_action` and leaves the subscription untouched until
    /// payment reconciliation confirms settlement.
    pub async fn prepare_upgrade(
        &self,
        req: PrepareChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        self.prepare_change(req, TransactionAction::Upgrade).await
    }

    /// Prepare a downgrade to `plan_code`.
    ///
    /// Usually resolves to zero due (the remaining credit of the higher plan
    /// covers the lower charge) and applies immediately. A downgrade that
    /// still computes a positive due, e.g. when the old plan was bought at a
    /// promotional price below the target's per-day rate, is routed through
    /// `requires_action` like any other billable change.
    pub async fn prepare_downgrade(
        &self,
        req: PrepareChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        self.prepare_change(req, TransactionAction::Downgrade).await
    }

    async fn prepare_change(
        &self,
        req: PrepareChangeRequest,
        action: TransactionAction,
    ) -> BillingResult<PlanChangeOutcome> {
        let strategy = ExponentialBackoff::from_millis(20).map(jitter).take(3);
        RetryIf::spawn(
            strategy,
            || self.prepare_change_once(&req, action),
            BillingError::is_retryable,
        )
        .await
    }

    async fn prepare_change_once(
        &self,
        req: &PrepareChangeRequest,
        action: TransactionAction,
    ) -> BillingResult<PlanChangeOutcome> {
        let now = OffsetDateTime::now_utc();

        // Fast path: a previous request with this key already created the
        // transaction. Return its state verbatim; no recomputation, no new
        // side effects.
        if let Some(key) = &req.idempotency_key {
            if let Some(existing) =
                TransactionLedger::find_by_idempotency_key(&self.pool, key).await?
            {
                tracing::info!(
                    subscription_id = %req.subscription_id,
                    idempotency_key = %key,
                    transaction_id = %existing.id,
                    "Replaying plan change for idempotency key"
                );
                return Ok(Self::replay_outcome(existing));
            }
        }

        let mut tx = self.pool.begin().await?;

        let sub = Self::fetch_for_update(&mut tx, req.subscription_id, req.user_id)
            .await?
            .ok_or_else(|| {
                BillingError::SubscriptionNotFound(format!(
                    "subscription {} for this caller",
                    req.subscription_id
                ))
            })?;

        if sub.status.is_terminal() {
            return Err(BillingError::InvalidState(
                "a canceled subscription cannot change plans".to_string(),
            ));
        }

        let current_plan = PlanCatalog::fetch(&mut tx, &sub.plan_code)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "subscription references missing plan '{}'",
                    sub.plan_code
                ))
            })?;

        // Validation failures surface before anything is written, so a retry
        // with the same key re-validates and fails identically.
        let target_plan = PlanCatalog::fetch(&mut tx, &req.plan_code)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| BillingError::UnknownPlan(req.plan_code.clone()))?;

        match decide_change(&current_plan, &target_plan, sub.period_bounds(), now) {
            ChangeDecision::NoOp => {
                drop(tx);
                tracing::info!(
                    subscription_id = %sub.id,
                    plan_code = %sub.plan_code,
                    "Plan change is a no-op (already on target plan)"
                );
                let (period_start, period_end) = sub.period_bounds().unwrap_or((now, now));
                Ok(PlanChangeOutcome {
                    status: ChangeStatus::Success,
                    transaction_id: None,
                    amount_due: 0,
                    proration_charge: 0,
                    proration_credit: 0,
                    period_start,
                    period_end,
                    replayed: false,
                })
            }
            ChangeDecision::ApplyNow(p) => {
                self.apply_zero_due_change(tx, req, &sub, &current_plan, &target_plan, action, p)
                    .await
            }
            ChangeDecision::RequirePayment(p) => {
                self.stage_billable_change(tx, req, &sub, &current_plan, &target_plan, action, p)
                    .await
            }
        }
    }

    /// Credit covers the charge: record a settled transaction and move the
    /// subscription in the same database transaction.
    #[allow(clippy::too_many_arguments)]
    async fn apply_zero_due_change(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        req: &PrepareChangeRequest,
        sub: &Subscription,
        current_plan: &Plan,
        target_plan: &Plan,
        action: TransactionAction,
        proration: Proration,
    ) -> BillingResult<PlanChangeOutcome> {
        let draft = Self::change_draft(
            sub,
            current_plan,
            target_plan,
            action,
            &proration,
            TransactionStatus::Paid,
            None,
            req.idempotency_key.clone(),
        )?;

        let inserted = match TransactionLedger::insert(&mut tx, &draft).await? {
            Some(row) => row,
            None => return self.lost_idempotency_race(tx, req).await,
        };

        Self::apply_plan(
            &mut tx,
            sub,
            &target_plan.code,
            proration.period_start,
            proration.period_end,
            sub.status,
        )
        .await?;

        SubscriptionEventLogger::record(
            &mut tx,
            SubscriptionEventBuilder::new(sub.id, SubscriptionEventType::PlanChanged)
                .data(serde_json::json!({
                    "from_plan": current_plan.code,
                    "to_plan": target_plan.code,
                    "amount_due": 0,
                    "proration_credit": proration.proration_credit,
                }))
                .actor(req.user_id.0, ActorType::User)
                .transaction(inserted.id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            from_plan = %current_plan.code,
            to_plan = %target_plan.code,
            transaction_id = %inserted.id,
            "Zero-due plan change applied immediately"
        );

        Ok(PlanChangeOutcome {
            status: ChangeStatus::Success,
            transaction_id: Some(inserted.id),
            amount_due: 0,
            proration_charge: proration.proration_charge,
            proration_credit: proration.proration_credit,
            period_start: proration.period_start,
            period_end: proration.period_end,
            replayed: false,
        })
    }

    /// Positive amount due: stage an open transaction plus a pending payment;
    /// the subscription itself is only mutated by payment reconciliation.
    #[allow(clippy::too_many_arguments)]
    async fn stage_billable_change(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        req: &PrepareChangeRequest,
        sub: &Subscription,
        current_plan: &Plan,
        target_plan: &Plan,
        action: TransactionAction,
        proration: Proration,
    ) -> BillingResult<PlanChangeOutcome> {
        let payment = TransactionLedger::insert_payment(
            &mut tx,
            sub.user_id,
            &target_plan.code,
            proration.amount_due,
            &target_plan.currency,
            req.provider,
        )
        .await?;

        let draft = Self::change_draft(
            sub,
            current_plan,
            target_plan,
            action,
            &proration,
            TransactionStatus::Open,
            Some(payment.id),
            req.idempotency_key.clone(),
        )?;

        let inserted = match TransactionLedger::insert(&mut tx, &draft).await? {
            Some(row) => row,
            None => return self.lost_idempotency_race(tx, req).await,
        };

        let event_type = match action {
            TransactionAction::Downgrade => SubscriptionEventType::DowngradePrepared,
            _ => SubscriptionEventType::UpgradePrepared,
        };
        SubscriptionEventLogger::record(
            &mut tx,
            SubscriptionEventBuilder::new(sub.id, event_type)
                .data(serde_json::json!({
                    "from_plan": current_plan.code,
                    "to_plan": target_plan.code,
                    "amount_due": proration.amount_due,
                    "proration_charge": proration.proration_charge,
                    "proration_credit": proration.proration_credit,
                }))
                .actor(req.user_id.0, ActorType::User)
                .transaction(inserted.id)
                .payment(payment.id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            from_plan = %current_plan.code,
            to_plan = %target_plan.code,
            transaction_id = %inserted.id,
            payment_id = %payment.id,
            amount_due = proration.amount_due,
            "Plan change staged, awaiting payment"
        );

        Ok(PlanChangeOutcome {
            status: ChangeStatus::RequiresAction,
            transaction_id: Some(inserted.id),
            amount_due: proration.amount_due,
            proration_charge: proration.proration_charge,
            proration_credit: proration.proration_credit,
            period_start: proration.period_start,
            period_end: proration.period_end,
            replayed: false,
        })
    }

    /// Another caller holding the same idempotency key won the insert. Roll
    /// back our work and return the winning row's state.
    async fn lost_idempotency_race(
        &self,
        tx: sqlx::Transaction<'_, sqlx::Postgres>,
        req: &PrepareChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        tx.rollback().await?;

        let key = req.idempotency_key.as_deref().ok_or_else(|| {
            BillingError::Internal("idempotency conflict without a key".to_string())
        })?;

        let winner = TransactionLedger::find_by_idempotency_key(&self.pool, key)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "idempotency key '{}' conflicted but the winning row is missing",
                    key
                ))
            })?;

        tracing::info!(
            subscription_id = %req.subscription_id,
            idempotency_key = %key,
            transaction_id = %winner.id,
            "Lost idempotency race, returning winning transaction"
        );

        Ok(Self::replay_outcome(winner))
    }

    /// Build the caller-visible outcome from a previously created transaction.
    pub(crate) fn replay_outcome(existing: Transaction) -> PlanChangeOutcome {
        let status = if existing.status == TransactionStatus::Paid {
            ChangeStatus::Success
        } else {
            ChangeStatus::RequiresAction
        };
        PlanChangeOutcome {
            status,
            transaction_id: Some(existing.id),
            amount_due: existing.amount_total,
            proration_charge: existing.proration_charge,
            proration_credit: existing.proration_credit,
            period_start: existing.period_start.unwrap_or(existing.created_at),
            period_end: existing.period_end.unwrap_or(existing.created_at),
            replayed: true,
        }
    }

    /// Assemble the ledger draft for a plan change. `amount_discount` is the
    /// credit actually consumed, capped by the charge so the reconciled total
    /// equals the amount due and never goes negative.
    #[allow(clippy::too_many_arguments)]
    fn change_draft(
        sub: &Subscription,
        current_plan: &Plan,
        target_plan: &Plan,
        action: TransactionAction,
        proration: &Proration,
        status: TransactionStatus,
        payment_id: Option<PaymentId>,
        idempotency_key: Option<String>,
    ) -> BillingResult<TransactionDraft> {
        Ok(TransactionDraft {
            subscription_id: sub.id,
            plan_code: target_plan.code.clone(),
            plan_snapshot: target_plan.snapshot()?,
            plan_snapshot_old: Some(current_plan.snapshot()?),
            plan_snapshot_new: Some(target_plan.snapshot()?),
            amount_subtotal: proration.proration_charge,
            amount_discount: proration.proration_credit.min(proration.proration_charge),
            amount_tax: 0,
            currency: target_plan.currency.clone(),
            period_start: Some(proration.period_start),
            period_end: Some(proration.period_end),
            action,
            status,
            provider: None,
            payment_id,
            idempotency_key,
            related_tx_id: None,
            proration_charge: proration.proration_charge,
            proration_credit: proration.proration_credit,
            is_proration: true,
            notes: None,
        })
    }

    /// Cancel a subscription. Terminal; repeated cancels are no-ops.
    pub async fn cancel(
        &self,
        subscription_id: SubscriptionId,
        user_id: UserId,
    ) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let sub = Self::fetch_for_update(&mut tx, subscription_id, user_id)
            .await?
            .ok_or_else(|| {
                BillingError::SubscriptionNotFound(format!(
                    "subscription {} for this caller",
                    subscription_id
                ))
            })?;

        if sub.status == SubscriptionStatus::Canceled {
            return Ok(sub);
        }

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = $2, ended_at = $2,
                auto_renew = FALSE, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $3
            "#,
        )
        .bind(subscription_id)
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

        // A canceled subscription leaves nothing to collect.
        let voided = TransactionLedger::void_pending_for_subscription(
            &mut tx,
            subscription_id,
            "subscription canceled",
        )
        .await?;

        SubscriptionEventLogger::record(
            &mut tx,
            SubscriptionEventBuilder::new(sub.id, SubscriptionEventType::Canceled)
                .data(serde_json::json!({
                    "plan_code": sub.plan_code,
                    "voided_transactions": voided,
                }))
                .actor(user_id.0, ActorType::User),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            voided_transactions = voided,
            "Subscription canceled"
        );

        self.get_subscription(subscription_id, user_id).await
    }

    /// Read accessor for the caller's subscription.
    pub async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
        user_id: UserId,
    ) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "{} WHERE id = $1 AND user_id = $2",
            SELECT_SUBSCRIPTION
        ))
        .bind(subscription_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or_else(|| {
            BillingError::SubscriptionNotFound(format!(
                "subscription {} for this caller",
                subscription_id
            ))
        })
    }

    /// Lock the subscription row for a read-modify-write, scoped to its owner.
    pub(crate) async fn fetch_for_update(
        conn: &mut PgConnection,
        subscription_id: SubscriptionId,
        user_id: UserId,
    ) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "{} WHERE id = $1 AND user_id = $2 FOR UPDATE",
            SELECT_SUBSCRIPTION
        ))
        .bind(subscription_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(sub)
    }

    /// Lock the subscription row by id only (reconciliation path, which acts
    /// on behalf of the gateway rather than the owner).
    pub(crate) async fn fetch_for_update_unscoped(
        conn: &mut PgConnection,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "{} WHERE id = $1 FOR UPDATE",
            SELECT_SUBSCRIPTION
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(sub)
    }

    /// Apply a plan (and its fresh period bounds) to a locked subscription
    /// row with the optimistic version check. Extra quota add-ons are plan
    /// purchases, so an accepted plan change resets them.
    pub(crate) async fn apply_plan(
        conn: &mut PgConnection,
        sub: &Subscription,
        plan_code: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_code = $2, status = $3,
                current_period_start = $4, current_period_end = $5,
                extra_cameras = 0, extra_caregivers = 0,
                extra_sites = 0, extra_storage_gb = 0,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(sub.id)
        .bind(plan_code)
        .bind(status)
        .bind(period_start)
        .bind(period_end)
        .bind(sub.version)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(BillingError::ConcurrentModification(
                "subscription was modified by another process".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_plan;
    use time::macros::datetime;

    fn bounds() -> Option<(OffsetDateTime, OffsetDateTime)> {
        Some((
            datetime!(2024-03-01 00:00 UTC),
            datetime!(2024-03-31 00:00 UTC),
        ))
    }

    #[test]
    fn same_plan_is_a_no_op() {
        let plan = test_plan("home_basic", 100_000);
        let decision = decide_change(&plan, &plan, bounds(), datetime!(2024-03-16 00:00 UTC));
        assert_eq!(decision, ChangeDecision::NoOp);
    }

    #[test]
    fn downgrade_with_covering_credit_applies_now() {
        let old = test_plan("home_plus", 200_000);
        let new = test_plan("home_basic", 100_000);
        let decision = decide_change(&old, &new, bounds(), datetime!(2024-03-16 00:00 UTC));
        match decision {
            ChangeDecision::ApplyNow(p) => {
                assert_eq!(p.amount_due, 0);
                assert!(p.proration_credit >= p.proration_charge);
            }
            other => panic!("expected ApplyNow, got {:?}", other),
        }
    }

    #[test]
    fn upgrade_requires_payment() {
        let old = test_plan("home_basic", 100_000);
        let new = test_plan("home_plus", 200_000);
        let decision = decide_change(&old, &new, bounds(), datetime!(2024-03-16 00:00 UTC));
        match decision {
            ChangeDecision::RequirePayment(p) => assert!(p.amount_due > 0),
            other => panic!("expected RequirePayment, got {:?}", other),
        }
    }

    #[test]
    fn downgrade_to_pricier_per_day_plan_still_requires_payment() {
        // Promotional old price below the target plan's rate: the "downgrade"
        // computes a positive due and must not be forced to zero.
        let old = test_plan("promo_plus", 50_000);
        let new = test_plan("home_basic", 100_000);
        let decision = decide_change(&old, &new, bounds(), datetime!(2024-03-16 00:00 UTC));
        assert!(matches!(decision, ChangeDecision::RequirePayment(_)));
    }

    #[test]
    fn state_machine_transitions() {
        use SubscriptionStatus::*;
        assert!(Trialing.can_transition_to(Active));
        assert!(Active.can_transition_to(PastDue));
        assert!(Active.can_transition_to(Paused));
        assert!(PastDue.can_transition_to(Active));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Canceled));

        // canceled is terminal
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Canceled.can_transition_to(Trialing));
        // no way back into trial
        assert!(!Active.can_transition_to(Trialing));
        // past_due cannot pause
        assert!(!PastDue.can_transition_to(Paused));
    }
}
