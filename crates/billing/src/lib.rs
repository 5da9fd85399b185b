// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries context strings
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Trackly Billing Module
//!
//! Keeps the internal record of "what plan/quota does this subject have"
//! consistent with the payment processor's notion of subscription status.
//!
//! ## Features
//!
//! - **Reconciliation Engine**: one state machine owning every subscription
//!   mutation, tolerant of duplicate and out-of-order processor events
//! - **Event Ingestion**: verified processor notifications in, idempotent
//!   transitions out, with a bounded-retry dead-letter queue
//! - **Quota Enforcement**: per-period usage counters checked and incremented
//!   atomically against the plan catalog
//! - **Checkout / Portal**: Stripe session glue for subscribing and self-serve
//!   billing management
//! - **Invariants**: runnable consistency checks over the stored state
//! - **Email Notifications**: lifecycle emails on cancel/past-due/reactivate

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod ingest;
pub mod invariants;
pub mod portal;
pub mod quota;
pub mod reconcile;
pub mod store;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{Plan, PlanCatalog, FREE_PLAN};

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{local_event_id, AuditEntry, SubscriptionEventLog};

// Ingest
pub use ingest::{IngestOutcome, IngestionPipeline, ProcessorNotification, QueueStats};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Portal
pub use portal::{PortalResponse, PortalService};

// Quota
pub use quota::{CounterUsage, QuotaDecision, QuotaEnforcer, UsageReport};

// Reconcile
pub use reconcile::{ApplyOutcome, AuditKind, DomainEvent, ReconciliationEngine};

// Store
pub use store::SubscriptionStore;

// Subscriptions
pub use subscriptions::{SubscriptionService, SubscriptionView};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
///
/// Constructed once at process start; the Stripe client and pool handles are
/// cloned into each sub-service — no hidden global state.
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub checkout: CheckoutService,
    pub email: BillingEmailService,
    pub engine: ReconciliationEngine,
    pub ingest: IngestionPipeline,
    pub invariants: InvariantChecker,
    pub portal: PortalService,
    pub quota: QuotaEnforcer,
    pub subscriptions: SubscriptionService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool))
    }

    /// Create a new billing service with an explicit Stripe client
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let catalog = PlanCatalog::new(pool.clone());
        let store = SubscriptionStore::new(pool.clone());
        let engine = ReconciliationEngine::new(pool.clone());
        let email = BillingEmailService::from_env(pool.clone());

        Self {
            catalog: catalog.clone(),
            checkout: CheckoutService::new(stripe.clone(), catalog.clone(), store.clone()),
            email: email.clone(),
            engine: engine.clone(),
            ingest: IngestionPipeline::new(pool.clone(), engine.clone(), email.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            portal: PortalService::new(stripe.clone(), store.clone()),
            quota: QuotaEnforcer::new(pool, store.clone(), catalog.clone()),
            subscriptions: SubscriptionService::new(stripe, store, catalog, engine, email),
        }
    }
}
