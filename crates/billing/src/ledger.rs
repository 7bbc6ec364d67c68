//! Transaction ledger
//!
//! Append-mostly log of billing transactions: one row per attempted plan
//! change or renewal, each carrying frozen plan snapshots and the amounts
//! computed at creation time. Rows are mutated exactly once when they settle
//! (`paid`), are voided, or go overdue; any later correction is a new row
//! linked through `related_tx_id`.
//!
//! The uniqueness constraint on `idempotency_key` is the sole arbiter for
//! duplicate "prepare change" requests: inserts go through
//! `ON CONFLICT ... DO NOTHING RETURNING` so a losing concurrent insert
//! observes the winner instead of erroring.

use caresight_shared::{PaymentId, SubscriptionId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// What a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionAction {
    New,
    Renew,
    Upgrade,
    Downgrade,
    Adjustment,
}

/// Lifecycle state of a transaction.
///
/// `draft`/`open` rows are mutable; every other state is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Draft,
    Open,
    Paid,
    Void,
    Overdue,
}

impl TransactionStatus {
    /// Whether the row may still transition to `paid`.
    pub fn is_settleable(self) -> bool {
        matches!(self, Self::Draft | Self::Open | Self::Overdue)
    }
}

/// Payment gateway behind a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    VnPay,
    Stripe,
    Manual,
}

/// Lifecycle state of a gateway payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Canceled,
}

/// A billing transaction row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: TransactionId,
    pub subscription_id: SubscriptionId,
    pub plan_code: String,
    pub plan_snapshot: serde_json::Value,
    pub plan_snapshot_old: Option<serde_json::Value>,
    pub plan_snapshot_new: Option<serde_json::Value>,
    pub amount_subtotal: i64,
    pub amount_discount: i64,
    pub amount_tax: i64,
    pub amount_total: i64,
    pub currency: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub action: TransactionAction,
    pub status: TransactionStatus,
    pub provider: Option<PaymentProvider>,
    pub provider_payment_id: Option<String>,
    pub payment_id: Option<PaymentId>,
    pub idempotency_key: Option<String>,
    pub related_tx_id: Option<TransactionId>,
    pub proration_charge: i64,
    pub proration_credit: i64,
    pub is_proration: bool,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A gateway-facing payment row. One payment may settle several transactions;
/// transactions reference it by foreign key.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: PaymentId,
    pub user_id: UserId,
    pub plan_code: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider: Option<PaymentProvider>,
    pub provider_ref: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Everything needed to insert a transaction row. Amounts are reconciled here
/// once (`amount_total`), never recomputed later.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    pub subscription_id: SubscriptionId,
    pub plan_code: String,
    pub plan_snapshot: serde_json::Value,
    pub plan_snapshot_old: Option<serde_json::Value>,
    pub plan_snapshot_new: Option<serde_json::Value>,
    pub amount_subtotal: i64,
    pub amount_discount: i64,
    pub amount_tax: i64,
    pub currency: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub action: TransactionAction,
    pub status: TransactionStatus,
    pub provider: Option<PaymentProvider>,
    pub payment_id: Option<PaymentId>,
    pub idempotency_key: Option<String>,
    pub related_tx_id: Option<TransactionId>,
    pub proration_charge: i64,
    pub proration_credit: i64,
    pub is_proration: bool,
    pub notes: Option<String>,
}

impl TransactionDraft {
    /// `amount_total = amount_subtotal - amount_discount + amount_tax`.
    pub fn amount_total(&self) -> i64 {
        self.amount_subtotal - self.amount_discount + self.amount_tax
    }
}

const SELECT_TRANSACTION: &str = r#"
    SELECT id, subscription_id, plan_code, plan_snapshot, plan_snapshot_old,
           plan_snapshot_new, amount_subtotal, amount_discount, amount_tax,
           amount_total, currency, period_start, period_end, action, status,
           provider, provider_payment_id, payment_id, idempotency_key,
           related_tx_id, proration_charge, proration_credit, is_proration,
           notes, created_at, updated_at
    FROM transactions
    "#;

/// Ledger operations.
///
/// In-transaction mutations take a `&mut PgConnection` so they join the
/// caller's serialized read-modify-write; pool-based accessors serve the
/// receipt/notification collaborators.
pub struct TransactionLedger {
    pool: PgPool,
}

impl TransactionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a transaction row.
    ///
    /// Returns `None` when `idempotency_key` collided with an existing row:
    /// the caller lost the race and must read back the winning row.
    pub async fn insert(
        conn: &mut PgConnection,
        draft: &TransactionDraft,
    ) -> BillingResult<Option<Transaction>> {
        let inserted: Option<Transaction> = sqlx::query_as(
            r#"
            INSERT INTO transactions
                (subscription_id, plan_code, plan_snapshot, plan_snapshot_old,
                 plan_snapshot_new, amount_subtotal, amount_discount, amount_tax,
                 amount_total, currency, period_start, period_end, action, status,
                 provider, payment_id, idempotency_key, related_tx_id,
                 proration_charge, proration_credit, is_proration, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id, subscription_id, plan_code, plan_snapshot, plan_snapshot_old,
                      plan_snapshot_new, amount_subtotal, amount_discount, amount_tax,
                      amount_total, currency, period_start, period_end, action, status,
                      provider, provider_payment_id, payment_id, idempotency_key,
                      related_tx_id, proration_charge, proration_credit, is_proration,
                      notes, created_at, updated_at
            "#,
        )
        .bind(draft.subscription_id)
        .bind(&draft.plan_code)
        .bind(&draft.plan_snapshot)
        .bind(&draft.plan_snapshot_old)
        .bind(&draft.plan_snapshot_new)
        .bind(draft.amount_subtotal)
        .bind(draft.amount_discount)
        .bind(draft.amount_tax)
        .bind(draft.amount_total())
        .bind(&draft.currency)
        .bind(draft.period_start)
        .bind(draft.period_end)
        .bind(draft.action)
        .bind(draft.status)
        .bind(draft.provider)
        .bind(draft.payment_id)
        .bind(&draft.idempotency_key)
        .bind(draft.related_tx_id)
        .bind(draft.proration_charge)
        .bind(draft.proration_credit)
        .bind(draft.is_proration)
        .bind(&draft.notes)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(inserted)
    }

    /// Look up the transaction created by a previous request with this key.
    pub async fn find_by_idempotency_key(
        pool: &PgPool,
        key: &str,
    ) -> BillingResult<Option<Transaction>> {
        let tx: Option<Transaction> =
            sqlx::query_as(&format!("{} WHERE idempotency_key = $1", SELECT_TRANSACTION))
                .bind(key)
                .fetch_optional(pool)
                .await?;

        Ok(tx)
    }

    /// Lock and return the transaction backed by a payment, if any.
    pub async fn find_by_payment_for_update(
        conn: &mut PgConnection,
        payment_id: PaymentId,
    ) -> BillingResult<Option<Transaction>> {
        let tx: Option<Transaction> = sqlx::query_as(&format!(
            "{} WHERE payment_id = $1 FOR UPDATE",
            SELECT_TRANSACTION
        ))
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(tx)
    }

    /// Check-and-set a settleable row to `paid`. Returns false when another
    /// path already settled or froze the row.
    pub async fn settle(conn: &mut PgConnection, tx_id: TransactionId) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'paid', updated_at = NOW()
            WHERE id = $1 AND status IN ('draft', 'open', 'overdue')
            "#,
        )
        .bind(tx_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Check-and-set open rows of a subscription to `overdue` once their
    /// payment window has lapsed. Returns the number of rows moved.
    pub async fn mark_overdue_before(
        conn: &mut PgConnection,
        cutoff: OffsetDateTime,
    ) -> BillingResult<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'overdue', updated_at = NOW()
            WHERE status = 'open' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Void every settleable row of a subscription (the explicit cancel
    /// path), canceling the pending payments behind them first. Frozen rows
    /// are left untouched. Returns the number of transactions voided.
    pub async fn void_pending_for_subscription(
        conn: &mut PgConnection,
        subscription_id: SubscriptionId,
        reason: &str,
    ) -> BillingResult<u64> {
        sqlx::query(
            r#"
            UPDATE payments p
            SET status = 'canceled', updated_at = NOW()
            FROM transactions t
            WHERE t.payment_id = p.id
              AND t.subscription_id = $1
              AND t.status IN ('draft', 'open', 'overdue')
              AND p.status = 'pending'
            "#,
        )
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;

        let rows = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'void', notes = $2, updated_at = NOW()
            WHERE subscription_id = $1 AND status IN ('draft', 'open', 'overdue')
            "#,
        )
        .bind(subscription_id)
        .bind(reason)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Transactions of a subscription, newest first. Read accessor for the
    /// receipt/notification collaborator.
    pub async fn list_for_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<Transaction>> {
        let txs: Vec<Transaction> = sqlx::query_as(&format!(
            "{} WHERE subscription_id = $1 ORDER BY created_at DESC",
            SELECT_TRANSACTION
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(txs)
    }

    /// A single transaction by id.
    pub async fn get(&self, tx_id: TransactionId) -> BillingResult<Option<Transaction>> {
        let tx: Option<Transaction> =
            sqlx::query_as(&format!("{} WHERE id = $1", SELECT_TRANSACTION))
                .bind(tx_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(tx)
    }

    /// Insert a pending gateway payment and return it.
    pub async fn insert_payment(
        conn: &mut PgConnection,
        user_id: UserId,
        plan_code: &str,
        amount_cents: i64,
        currency: &str,
        provider: Option<PaymentProvider>,
    ) -> BillingResult<Payment> {
        let payment: Payment = sqlx::query_as(
            r#"
            INSERT INTO payments (user_id, plan_code, amount_cents, currency, status, provider)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING id, user_id, plan_code, amount_cents, currency, status, provider,
                      provider_ref, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(plan_code)
        .bind(amount_cents)
        .bind(currency)
        .bind(provider)
        .fetch_one(&mut *conn)
        .await?;

        Ok(payment)
    }

    /// Lock and return a payment row.
    pub async fn find_payment_for_update(
        conn: &mut PgConnection,
        payment_id: PaymentId,
    ) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_code, amount_cents, currency, status, provider,
                   provider_ref, created_at, updated_at
            FROM payments
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(payment)
    }

    /// Move a payment to a terminal gateway status.
    pub async fn mark_payment(
        conn: &mut PgConnection,
        payment_id: PaymentId,
        status: PaymentStatus,
    ) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(status)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(subtotal: i64, discount: i64, tax: i64) -> TransactionDraft {
        TransactionDraft {
            subscription_id: SubscriptionId::new(),
            plan_code: "home_plus".to_string(),
            plan_snapshot: serde_json::json!({}),
            plan_snapshot_old: None,
            plan_snapshot_new: None,
            amount_subtotal: subtotal,
            amount_discount: discount,
            amount_tax: tax,
            currency: "VND".to_string(),
            period_start: None,
            period_end: None,
            action: TransactionAction::Upgrade,
            status: TransactionStatus::Open,
            provider: None,
            payment_id: None,
            idempotency_key: None,
            related_tx_id: None,
            proration_charge: 0,
            proration_credit: 0,
            is_proration: false,
            notes: None,
        }
    }

    #[test]
    fn amount_total_reconciles_at_creation() {
        assert_eq!(draft(100_000, 50_000, 0).amount_total(), 50_000);
        assert_eq!(draft(100_000, 0, 10_000).amount_total(), 110_000);
        assert_eq!(draft(0, 0, 0).amount_total(), 0);
    }

    #[test]
    fn provider_serializes_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&PaymentProvider::VnPay).unwrap(),
            "\"vn_pay\""
        );
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Overdue).unwrap(),
            "\"overdue\""
        );
    }
}
