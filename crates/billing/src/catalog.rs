//! Plan catalog
//!
//! Read-only access to the live pricing plans. Every billing computation
//! snapshots the plan at the instant of the computation; historical
//! transactions carry their own frozen copy and are never affected by later
//! catalog edits (plan administration itself lives outside this crate).

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::error::{BillingError, BillingResult};

/// How a plan is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanBillingType {
    Prepaid,
    Metered,
}

/// A pricing plan as stored in the catalog.
///
/// `price_cents` is in integer minor currency units. Quota fields are the
/// base allowances; per-subscription `extra_*` add-ons stack on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub camera_quota: i32,
    pub retention_days: i32,
    pub caregiver_seats: i32,
    pub sites: i32,
    pub major_updates_months: i32,
    pub billing_type: PlanBillingType,
    pub active: bool,
}

impl Plan {
    /// Serialize the plan for embedding in a transaction row.
    pub fn snapshot(&self) -> BillingResult<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| BillingError::Internal(format!("failed to snapshot plan: {}", e)))
    }

    /// Rehydrate a plan from a transaction snapshot.
    pub fn from_snapshot(value: &serde_json::Value) -> BillingResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| BillingError::Internal(format!("corrupt plan snapshot: {}", e)))
    }
}

const SELECT_PLAN: &str = r#"
    SELECT code, name, price_cents, currency, camera_quota, retention_days,
           caregiver_seats, sites, major_updates_months, billing_type, active
    FROM plans
    WHERE code = $1
    "#;

/// Read-side catalog service.
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a plan by code. Returns `UnknownPlan` when no such row exists.
    pub async fn get_plan(&self, code: &str) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(SELECT_PLAN)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        plan.ok_or_else(|| BillingError::UnknownPlan(code.to_string()))
    }

    /// In-transaction lookup so proration reads a snapshot consistent with
    /// the locked subscription row.
    pub async fn fetch(conn: &mut PgConnection, code: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(SELECT_PLAN)
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(plan)
    }
}

/// Test fixture shared by the unit tests across this crate.
#[cfg(test)]
pub(crate) fn test_plan(code: &str, price_cents: i64) -> Plan {
    Plan {
        code: code.to_string(),
        name: code.to_string(),
        price_cents,
        currency: "VND".to_string(),
        camera_quota: 4,
        retention_days: 30,
        caregiver_seats: 2,
        sites: 1,
        major_updates_months: 12,
        billing_type: PlanBillingType::Prepaid,
        active: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_preserves_pricing_fields() {
        let p = test_plan("home_plus", 200_000);
        let snap = p.snapshot().unwrap();
        assert_eq!(snap["price_cents"], 200_000);
        assert_eq!(snap["billing_type"], "prepaid");

        let restored = Plan::from_snapshot(&snap).unwrap();
        assert_eq!(restored, p);
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let err = Plan::from_snapshot(&serde_json::json!({"code": "x"})).unwrap_err();
        assert!(matches!(err, BillingError::Internal(_)));
    }
}
