//! Subscription event log
//!
//! Append-only audit trail of everything that happens to a subscription.
//! Events are written inside the same database transaction as the state
//! change they describe; readers (receipt emails, admin timeline) only ever
//! see events whose state change committed.

use caresight_shared::{PaymentId, SubscriptionId, TransactionId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Who triggered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Admin,
    System,
    Gateway,
}

/// Types of subscription events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventType {
    UpgradePrepared,
    DowngradePrepared,
    PlanChanged,
    RenewalIssued,
    PaymentRecorded,
    PaymentFailed,
    MarkedPastDue,
    Suspended,
    Canceled,
}

impl SubscriptionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpgradePrepared => "upgrade_prepared",
            Self::DowngradePrepared => "downgrade_prepared",
            Self::PlanChanged => "plan_changed",
            Self::RenewalIssued => "renewal_issued",
            Self::PaymentRecorded => "payment_recorded",
            Self::PaymentFailed => "payment_failed",
            Self::MarkedPastDue => "marked_past_due",
            Self::Suspended => "suspended",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builder for a subscription event.
#[derive(Debug, Clone)]
pub struct SubscriptionEventBuilder {
    subscription_id: SubscriptionId,
    event_type: SubscriptionEventType,
    data: serde_json::Value,
    actor_type: ActorType,
    actor_id: Option<Uuid>,
    transaction_id: Option<TransactionId>,
    payment_id: Option<PaymentId>,
}

impl SubscriptionEventBuilder {
    pub fn new(subscription_id: SubscriptionId, event_type: SubscriptionEventType) -> Self {
        Self {
            subscription_id,
            event_type,
            data: serde_json::json!({}),
            actor_type: ActorType::System,
            actor_id: None,
            transaction_id: None,
            payment_id: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn payment(mut self, payment_id: PaymentId) -> Self {
        self.payment_id = Some(payment_id);
        self
    }
}

/// A persisted subscription event.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub event_type: String,
    pub data: serde_json::Value,
    pub actor_type: ActorType,
    pub actor_id: Option<Uuid>,
    pub transaction_id: Option<TransactionId>,
    pub payment_id: Option<PaymentId>,
    pub created_at: OffsetDateTime,
}

/// Writes and reads the `subscription_events` table.
pub struct SubscriptionEventLogger {
    pool: PgPool,
}

impl SubscriptionEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an event inside the caller's database transaction.
    pub async fn record(
        conn: &mut PgConnection,
        event: SubscriptionEventBuilder,
    ) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscription_events
                (subscription_id, event_type, data, actor_type, actor_id,
                 transaction_id, payment_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(event.subscription_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .bind(event.actor_type)
        .bind(event.actor_id)
        .bind(event.transaction_id)
        .bind(event.payment_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(id)
    }

    /// Recent events for a subscription, newest first. Consumed by the
    /// receipt/notification collaborator.
    pub async fn list_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionEvent>> {
        let events: Vec<SubscriptionEvent> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, event_type, data, actor_type, actor_id,
                   transaction_id, payment_id, created_at
            FROM subscription_events
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(SubscriptionEventType::PlanChanged.to_string(), "plan_changed");
        assert_eq!(
            SubscriptionEventType::MarkedPastDue.as_str(),
            "marked_past_due"
        );
    }

    #[test]
    fn builder_defaults_to_system_actor() {
        let b = SubscriptionEventBuilder::new(
            SubscriptionId::new(),
            SubscriptionEventType::RenewalIssued,
        );
        assert_eq!(b.actor_type, ActorType::System);
        assert!(b.actor_id.is_none());
    }
}
