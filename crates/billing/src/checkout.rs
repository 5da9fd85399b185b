//! Stripe Checkout sessions

use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CustomerId,
};
use trackly_shared::{BillingCycle, SubjectKind};
use uuid::Uuid;

use crate::catalog::{Plan, PlanCatalog};
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;

/// Resolve the processor price for a checkout request.
///
/// The free plan is never checkoutable; paid plans without a configured price
/// for the requested cycle fail with `PriceNotConfigured`.
pub fn resolve_checkout_price(plan: &Plan, cycle: BillingCycle) -> BillingResult<String> {
    if plan.is_free() {
        return Err(BillingError::FreePlanNotCheckoutable);
    }
    plan.price_id_for_cycle(cycle)
        .map(String::from)
        .ok_or_else(|| BillingError::PriceNotConfigured {
            plan: plan.name.clone(),
            cycle: cycle.to_string(),
        })
}

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    stripe: StripeClient,
    catalog: PlanCatalog,
    store: SubscriptionStore,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, catalog: PlanCatalog, store: SubscriptionStore) -> Self {
        Self {
            stripe,
            catalog,
            store,
        }
    }

    /// Create a checkout session for a subject and plan.
    ///
    /// The session carries the subject id, kind, plan, and cycle as metadata
    /// so the processor's asynchronous events can be correlated back to the
    /// subject without a local lookup table. The subscription row itself is
    /// only written when the confirmed `checkout.session.completed` event
    /// flows through the reconciliation engine.
    pub async fn start_checkout(
        &self,
        subject_id: Uuid,
        subject_kind: SubjectKind,
        plan_name: &str,
        cycle: BillingCycle,
    ) -> BillingResult<CheckoutResponse> {
        if plan_name.trim().is_empty() {
            return Err(BillingError::Validation("plan name is required".to_string()));
        }

        let plan = self.catalog.get(plan_name).await?;
        let price_id = resolve_checkout_price(&plan, cycle)?;

        // Reuse the subject's processor customer when one is on file so the
        // processor keeps a single customer history per subject
        let existing_customer = self
            .store
            .load_latest(subject_id)
            .await?
            .and_then(|s| s.processor_customer_id);

        let customer_id = match existing_customer {
            Some(raw) => Some(raw.parse::<CustomerId>().map_err(|e| {
                BillingError::ProcessorApi(format!("Invalid customer ID: {}", e))
            })?),
            None => None,
        };

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("subject_id".to_string(), subject_id.to_string());
        metadata.insert("subject_kind".to_string(), subject_kind.to_string());
        metadata.insert("plan".to_string(), plan.name.clone());
        metadata.insert("billing_cycle".to_string(), cycle.to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }];

        let params = CreateCheckoutSession {
            customer: customer_id,
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            subject_id = %subject_id,
            session_id = %session.id,
            plan = %plan.name,
            cycle = %cycle,
            "Created checkout session"
        );

        Ok(session.into())
    }
}

/// Response for creating a checkout session
#[derive(Debug, serde::Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub checkout_url: Option<String>,
}

impl From<CheckoutSession> for CheckoutResponse {
    fn from(session: CheckoutSession) -> Self {
        Self {
            session_id: session.id.to_string(),
            checkout_url: session.url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_plans;

    #[test]
    fn free_plan_is_not_checkoutable() {
        let plan = test_plans::free();
        assert!(matches!(
            resolve_checkout_price(&plan, BillingCycle::Monthly),
            Err(BillingError::FreePlanNotCheckoutable)
        ));
    }

    #[test]
    fn missing_cycle_price_fails() {
        // Team has no yearly price configured
        let plan = test_plans::team();
        match resolve_checkout_price(&plan, BillingCycle::Yearly) {
            Err(BillingError::PriceNotConfigured { plan, cycle }) => {
                assert_eq!(plan, "team");
                assert_eq!(cycle, "yearly");
            }
            other => panic!("expected PriceNotConfigured, got {:?}", other),
        }
    }

    #[test]
    fn configured_price_resolves() {
        let plan = test_plans::pro();
        assert_eq!(
            resolve_checkout_price(&plan, BillingCycle::Yearly).unwrap(),
            "price_pro_yearly"
        );
    }
}
