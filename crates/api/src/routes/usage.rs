//! Usage and quota routes

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use trackly_billing::UsageReport;
use trackly_shared::UsageCounter;

use crate::{error::ApiError, state::AppState, subject::AuthSubject};

/// Current period usage for the subject
pub async fn get_usage(
    State(state): State<AppState>,
    subject: AuthSubject,
) -> Result<Json<UsageReport>, ApiError> {
    let report = state.billing.quota.usage_report(subject.subject_id).await?;
    Ok(Json(report))
}

/// Request to check and consume quota
#[derive(Debug, Deserialize)]
pub struct CheckUsageRequest {
    pub counter: String,
    /// Units to consume; defaults to 1
    pub amount: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CheckUsageResponse {
    pub allowed: bool,
    pub remaining: i64,
}

/// Check quota for an action and, if allowed, consume it.
///
/// Fails closed: an unexpected store failure is reported as a denial rather
/// than an allowance, so a degraded database can never hand out free quota.
pub async fn check_usage(
    State(state): State<AppState>,
    subject: AuthSubject,
    Json(req): Json<CheckUsageRequest>,
) -> Result<Json<CheckUsageResponse>, ApiError> {
    let counter: UsageCounter = req
        .counter
        .parse()
        .map_err(|e: String| ApiError::Validation(e))?;
    let amount = req.amount.unwrap_or(1);
    if amount <= 0 {
        return Err(ApiError::Validation(
            "amount must be a positive integer".to_string(),
        ));
    }

    match state
        .billing
        .quota
        .check_and_increment(subject.subject_id, counter, amount)
        .await
    {
        Ok(decision) => Ok(Json(CheckUsageResponse {
            allowed: decision.allowed,
            remaining: decision.remaining,
        })),
        Err(e) if e.is_retryable() => Err(e.into()),
        Err(e) => {
            tracing::error!(
                subject_id = %subject.subject_id,
                counter = %counter,
                error = %e,
                "Quota check failed, denying (fail closed)"
            );
            Ok(Json(CheckUsageResponse {
                allowed: false,
                remaining: 0,
            }))
        }
    }
}
