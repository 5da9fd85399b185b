//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use trackly_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("No subscription found")]
    NoSubscription,

    // Billing errors
    #[error("Plan not found: {0}")]
    PlanNotFound(String),
    #[error("Plan is not available: {0}")]
    PlanUnavailable(String),
    #[error("The free plan cannot be checked out")]
    FreePlanNotCheckoutable,
    #[error("No price configured for the requested billing cycle")]
    PriceNotConfigured,
    #[error("No cancellation is scheduled")]
    NoCancellationScheduled,

    // Transient errors (caller may retry)
    #[error("External billing call did not complete: {0}")]
    ExternalCallIndeterminate(String),
    #[error("Concurrent modification, retry: {0}")]
    Transient(String),

    // Internal errors
    #[error("Processor error: {0}")]
    Processor(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::NoSubscription => (StatusCode::NOT_FOUND, "NO_SUBSCRIPTION", self.to_string()),
            ApiError::PlanNotFound(_) => (StatusCode::NOT_FOUND, "PLAN_NOT_FOUND", self.to_string()),
            ApiError::PlanUnavailable(_) => (StatusCode::BAD_REQUEST, "PLAN_UNAVAILABLE", self.to_string()),
            ApiError::FreePlanNotCheckoutable => (StatusCode::BAD_REQUEST, "FREE_PLAN_NOT_CHECKOUTABLE", self.to_string()),
            ApiError::PriceNotConfigured => (StatusCode::BAD_REQUEST, "PRICE_NOT_CONFIGURED", self.to_string()),
            ApiError::NoCancellationScheduled => (StatusCode::CONFLICT, "NO_CANCELLATION_SCHEDULED", self.to_string()),

            ApiError::ExternalCallIndeterminate(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "EXTERNAL_CALL_INDETERMINATE",
                "Billing operation did not complete; please retry".to_string(),
            ),
            ApiError::Transient(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "TRANSIENT",
                "Temporary conflict; please retry".to_string(),
            ),

            // Internal detail never leaks to the caller, only the code
            ApiError::Processor(_) => (StatusCode::BAD_GATEWAY, "PROCESSOR_ERROR", "Billing provider error".to_string()),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::PlanNotFound(name) => ApiError::PlanNotFound(name),
            BillingError::PlanInactive(name) => ApiError::PlanUnavailable(name),
            BillingError::FreePlanNotCheckoutable => ApiError::FreePlanNotCheckoutable,
            BillingError::PriceNotConfigured { .. } => ApiError::PriceNotConfigured,
            BillingError::NoSubscription(_) => ApiError::NoSubscription,
            BillingError::SubscriptionNotFound(_) => ApiError::NotFound,
            BillingError::NoCancellationScheduled(_) => ApiError::NoCancellationScheduled,
            BillingError::ExternalCallIndeterminate(msg) => {
                ApiError::ExternalCallIndeterminate(msg)
            }
            BillingError::ConcurrentModification(msg) => ApiError::Transient(msg),
            BillingError::ProcessorApi(msg) => {
                tracing::error!(error = %msg, "Processor API error");
                ApiError::Processor(msg)
            }
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Billing database error");
                ApiError::Database(msg)
            }
            // Duplicate/unrecognized events are absorbed at the webhook
            // route; reaching here means a programming error
            BillingError::DuplicateEvent(_) | BillingError::UnrecognizedEvent(_) => {
                ApiError::Internal
            }
            BillingError::StateInvariantViolation(msg) => {
                tracing::error!(error = %msg, "State invariant violation");
                ApiError::Internal
            }
            BillingError::Config(msg) | BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
