// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CareSight Billing Module
//!
//! Subscription lifecycle and billing-transaction core for the CareSight
//! remote-monitoring platform.
//!
//! ## Features
//!
//! - **Plan Catalog**: Read-only pricing plans, snapshotted into every
//!   transaction so catalog edits never rewrite history
//! - **Proration**: Integer-only remaining-value math for mid-period plan
//!   changes
//! - **Transaction Ledger**: Append-mostly billing log with a unique
//!   idempotency-key arbiter for duplicate requests
//! - **Subscription State Machine**: Upgrades/downgrades/cancellation with
//!   row-level serialization and optimistic version checks
//! - **Payment Reconciliation**: Webhook-driven settlement, safe under
//!   gateway retry storms
//! - **Renewals & Dunning**: Scheduled renewal issuance, overdue sweep, and
//!   a configurable collection-escalation policy
//! - **Invariants**: Runnable read-only consistency checks

pub mod catalog;
pub mod dunning;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod proration;
pub mod reconciliation;
pub mod renewal;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{Plan, PlanBillingType, PlanCatalog};

// Dunning
pub use dunning::{DunningAction, DunningPolicy};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, SubscriptionEvent, SubscriptionEventBuilder, SubscriptionEventLogger,
    SubscriptionEventType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{
    Payment, PaymentProvider, PaymentStatus, Transaction, TransactionAction, TransactionDraft,
    TransactionLedger, TransactionStatus,
};

// Proration
pub use proration::{add_months, prorate, Proration};

// Reconciliation
pub use reconciliation::{PaymentFailureOutcome, PaymentReconciliationService, ReconcileOutcome};

// Renewal
pub use renewal::{OverdueSweep, RenewalRun, RenewalService};

// Subscriptions
pub use subscriptions::{
    BillingPeriod, ChangeStatus, PlanChangeOutcome, PrepareChangeRequest, Subscription,
    SubscriptionService, SubscriptionStatus,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub subscriptions: SubscriptionService,
    pub reconciliation: PaymentReconciliationService,
    pub renewals: RenewalService,
    pub events: SubscriptionEventLogger,
    pub ledger: TransactionLedger,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service with the dunning policy read from the
    /// environment.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let policy = DunningPolicy::from_env()?;
        Ok(Self::new(pool, policy))
    }

    /// Create a billing service with an explicit dunning policy.
    pub fn new(pool: PgPool, policy: DunningPolicy) -> Self {
        Self {
            catalog: PlanCatalog::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            reconciliation: PaymentReconciliationService::new(pool.clone(), policy),
            renewals: RenewalService::new(pool.clone()),
            events: SubscriptionEventLogger::new(pool.clone()),
            ledger: TransactionLedger::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }
}
