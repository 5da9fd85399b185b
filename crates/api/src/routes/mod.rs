//! API route definitions

pub mod billing;
pub mod health;
pub mod usage;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        // Billing
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/portal", post(billing::create_portal_session))
        .route("/billing/reactivate", post(billing::reactivate))
        .route("/billing/subscription", get(billing::get_subscription))
        .route("/billing/events", get(billing::list_events))
        // Usage
        .route("/usage", get(usage::get_usage))
        .route("/usage/check", post(usage::check_usage))
        // Processor webhooks (payload verified upstream)
        .route("/webhooks/processor", post(webhooks::ingest_processor_event))
        .with_state(state)
}
