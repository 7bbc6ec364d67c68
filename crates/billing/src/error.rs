//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the billing core.
///
/// Validation errors (`UnknownPlan`, `SubscriptionNotFound`) are returned
/// before any row is written, so retrying them is side-effect free.
/// `ConcurrentModification` is transient and retried internally with bounded
/// backoff before it reaches a caller.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("no transaction found for payment {0}")]
    TransactionNotFound(String),

    #[error("payment not found: {0}")]
    PaymentNotFound(String),

    #[error("unknown plan '{0}'")]
    UnknownPlan(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("already applied: {0}")]
    AlreadyApplied(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl BillingError {
    /// Whether the error is a transient lock race worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ConcurrentModification(_))
    }
}
