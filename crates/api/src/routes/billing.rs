//! Billing routes for Stripe integration

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use trackly_billing::{CheckoutResponse, PortalResponse};
use trackly_shared::BillingCycle;

use crate::{error::ApiError, state::AppState, subject::AuthSubject};

/// Request to create a checkout session
#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub plan: String,
    /// Billing cycle (monthly or yearly); defaults to monthly
    pub billing_cycle: Option<String>,
}

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub status: String,
    pub plan: String,
    pub is_free: bool,
    pub billing_cycle: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
}

/// Create a checkout session for a subscription
pub async fn create_checkout(
    State(state): State<AppState>,
    subject: AuthSubject,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    if req.plan.trim().is_empty() {
        return Err(ApiError::Validation("plan is required".to_string()));
    }

    let cycle = match req.billing_cycle.as_deref() {
        None => BillingCycle::Monthly,
        Some(raw) => BillingCycle::from_str(raw)
            .ok_or_else(|| ApiError::Validation(format!("unknown billing cycle: {}", raw)))?,
    };

    let response = state
        .billing
        .checkout
        .start_checkout(subject.subject_id, subject.subject_kind, &req.plan, cycle)
        .await?;

    Ok(Json(response))
}

/// Create a billing portal session
pub async fn create_portal_session(
    State(state): State<AppState>,
    subject: AuthSubject,
) -> Result<Json<PortalResponse>, ApiError> {
    let response = state.billing.portal.open_portal(subject.subject_id).await?;
    Ok(Json(response))
}

/// Remove a pending cancellation
pub async fn reactivate(
    State(state): State<AppState>,
    subject: AuthSubject,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .billing
        .subscriptions
        .reactivate(subject.subject_id)
        .await?;

    Ok(Json(serde_json::json!({ "reactivated": true })))
}

/// Get current subscription info
pub async fn get_subscription(
    State(state): State<AppState>,
    subject: AuthSubject,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let view = state
        .billing
        .subscriptions
        .get_subscription(subject.subject_id)
        .await?;

    let info = match view.subscription {
        Some(sub) => SubscriptionInfo {
            status: sub.status.clone(),
            plan: view.plan.name,
            is_free: view.is_free,
            billing_cycle: Some(sub.billing_cycle.clone()),
            cancel_at_period_end: sub.cancel_at_period_end,
            current_period_start: sub.current_period_start.map(format_ts),
            current_period_end: sub.current_period_end.map(format_ts),
        },
        None => SubscriptionInfo {
            status: "none".to_string(),
            plan: view.plan.name,
            is_free: true,
            billing_cycle: None,
            cancel_at_period_end: false,
            current_period_start: None,
            current_period_end: None,
        },
    };

    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub limit: Option<i64>,
}

/// Recent billing audit events for the subject (support/debugging)
pub async fn list_events(
    State(state): State<AppState>,
    subject: AuthSubject,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<trackly_shared::SubscriptionEvent>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let events = state
        .billing
        .engine
        .event_log()
        .events_for_subject(subject.subject_id, limit)
        .await?;

    Ok(Json(events))
}

fn format_ts(ts: time::OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
