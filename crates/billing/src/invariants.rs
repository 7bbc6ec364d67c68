//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing core. These can be
//! run after any mutation, reconciliation replay, or on a schedule to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use caresight_shared::{SubscriptionId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subscription(s) affected
    pub subscription_ids: Vec<SubscriptionId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - customers may be charged incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for period ordering violation
#[derive(Debug, sqlx::FromRow)]
struct PeriodOrderRow {
    sub_id: SubscriptionId,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
}

/// Row type for canceled-without-end violation
#[derive(Debug, sqlx::FromRow)]
struct CanceledNoEndRow {
    sub_id: SubscriptionId,
    auto_renew: bool,
}

/// Row type for amount reconciliation violation
#[derive(Debug, sqlx::FromRow)]
struct AmountMismatchRow {
    tx_id: TransactionId,
    sub_id: SubscriptionId,
    amount_subtotal: i64,
    amount_discount: i64,
    amount_tax: i64,
    amount_total: i64,
}

/// Row type for paid-without-payment violation
#[derive(Debug, sqlx::FromRow)]
struct PaidNoPaymentRow {
    tx_id: TransactionId,
    sub_id: SubscriptionId,
    amount_total: i64,
}

/// Row type for multiple active subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: UserId,
    sub_count: i64,
}

/// Row type for dunning consistency violation
#[derive(Debug, sqlx::FromRow)]
struct DunningInconsistencyRow {
    sub_id: SubscriptionId,
    renewal_attempt_count: i32,
    dunning_stage: i32,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_period_bounds_ordered().await?);
        violations.extend(self.check_canceled_has_end().await?);
        violations.extend(self.check_amount_totals_reconcile().await?);
        violations.extend(self.check_paid_transaction_has_payment().await?);
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_dunning_consistency().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: current_period_end >= current_period_start
    ///
    /// A period that ends before it starts makes every proration for that
    /// subscription meaningless.
    async fn check_period_bounds_ordered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PeriodOrderRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, current_period_start, current_period_end
            FROM subscriptions
            WHERE current_period_start IS NOT NULL
              AND current_period_end IS NOT NULL
              AND current_period_end < current_period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "period_bounds_ordered".to_string(),
                subscription_ids: vec![row.sub_id],
                description: "Billing period ends before it starts".to_string(),
                context: serde_json::json!({
                    "current_period_start": row.current_period_start,
                    "current_period_end": row.current_period_end,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: canceled subscriptions carry an end
    ///
    /// status = canceled implies ended_at is set or auto_renew is off;
    /// otherwise the renewal job could resurrect a canceled customer.
    async fn check_canceled_has_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoEndRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, auto_renew
            FROM subscriptions
            WHERE status = 'canceled'
              AND ended_at IS NULL
              AND auto_renew
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_end".to_string(),
                subscription_ids: vec![row.sub_id],
                description: "Canceled subscription has no ended_at and still auto-renews"
                    .to_string(),
                context: serde_json::json!({ "auto_renew": row.auto_renew }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: amount_total = amount_subtotal - amount_discount + amount_tax
    ///
    /// Amounts are reconciled once at creation; any drift means a settled
    /// row was mutated outside the authorized path.
    async fn check_amount_totals_reconcile(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AmountMismatchRow> = sqlx::query_as(
            r#"
            SELECT id as tx_id, subscription_id as sub_id,
                   amount_subtotal, amount_discount, amount_tax, amount_total
            FROM transactions
            WHERE amount_total != amount_subtotal - amount_discount + amount_tax
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "amount_totals_reconcile".to_string(),
                subscription_ids: vec![row.sub_id],
                description: format!(
                    "Transaction total {} does not equal {} - {} + {}",
                    row.amount_total, row.amount_subtotal, row.amount_discount, row.amount_tax
                ),
                context: serde_json::json!({
                    "transaction_id": row.tx_id,
                    "amount_subtotal": row.amount_subtotal,
                    "amount_discount": row.amount_discount,
                    "amount_tax": row.amount_tax,
                    "amount_total": row.amount_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: settled money has a payment behind it
    ///
    /// A paid transaction with a positive total must reference the payment
    /// that settled it (zero-due changes settle without one).
    async fn check_paid_transaction_has_payment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidNoPaymentRow> = sqlx::query_as(
            r#"
            SELECT id as tx_id, subscription_id as sub_id, amount_total
            FROM transactions
            WHERE status = 'paid'
              AND amount_total > 0
              AND payment_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_transaction_has_payment".to_string(),
                subscription_ids: vec![row.sub_id],
                description: format!(
                    "Paid transaction with total {} has no backing payment",
                    row.amount_total
                ),
                context: serde_json::json!({
                    "transaction_id": row.tx_id,
                    "amount_total": row.amount_total,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: at most 1 non-canceled subscription per user
    ///
    /// Multiple live subscriptions would cause double-billing and quota
    /// confusion.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('trialing', 'active', 'past_due', 'paused')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                subscription_ids: vec![],
                description: format!(
                    "User has {} live subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "user_id": row.user_id,
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: dunning stage matches attempt count
    ///
    /// A subscription deep in dunning with zero recorded attempts (or the
    /// reverse) means a reconciliation path skipped its counter updates.
    async fn check_dunning_consistency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DunningInconsistencyRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, renewal_attempt_count, dunning_stage
            FROM subscriptions
            WHERE (dunning_stage > 0 AND renewal_attempt_count = 0)
               OR (dunning_stage = 0 AND status = 'past_due')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "dunning_consistency".to_string(),
                subscription_ids: vec![row.sub_id],
                description: format!(
                    "Dunning stage {} with {} recorded attempts",
                    row.dunning_stage, row.renewal_attempt_count
                ),
                context: serde_json::json!({
                    "renewal_attempt_count": row.renewal_attempt_count,
                    "dunning_stage": row.dunning_stage,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "period_bounds_ordered" => self.check_period_bounds_ordered().await,
            "canceled_has_end" => self.check_canceled_has_end().await,
            "amount_totals_reconcile" => self.check_amount_totals_reconcile().await,
            "paid_transaction_has_payment" => self.check_paid_transaction_has_payment().await,
            "single_active_subscription" => self.check_single_active_subscription().await,
            "dunning_consistency" => self.check_dunning_consistency().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "period_bounds_ordered",
            "canceled_has_end",
            "amount_totals_reconcile",
            "paid_transaction_has_payment",
            "single_active_subscription",
            "dunning_consistency",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"period_bounds_ordered"));
        assert!(checks.contains(&"amount_totals_reconcile"));
    }
}
