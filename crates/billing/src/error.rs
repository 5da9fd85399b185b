//! Billing error types

use thiserror::Error;

/// Billing-specific errors
///
/// All store and processor errors are re-classified into this taxonomy at the
/// module boundary; raw sqlx/Stripe errors never cross into callers.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan is not active: {0}")]
    PlanInactive(String),

    #[error("The free plan cannot be checked out")]
    FreePlanNotCheckoutable,

    #[error("No {cycle} price configured for plan {plan}")]
    PriceNotConfigured { plan: String, cycle: String },

    #[error("No subscription found for subject {0}")]
    NoSubscription(String),

    #[error("Subscription not found for processor id: {0}")]
    SubscriptionNotFound(String),

    #[error("No cancellation is scheduled for subject {0}")]
    NoCancellationScheduled(String),

    #[error("Duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("Unrecognized event payload: {0}")]
    UnrecognizedEvent(String),

    #[error("External processor call outcome unknown: {0}")]
    ExternalCallIndeterminate(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("State invariant violated: {0}")]
    StateInvariantViolation(String),

    #[error("Processor API error: {0}")]
    ProcessorApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may retry the failed operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ExternalCallIndeterminate(_) | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ProcessorApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
