//! Stripe Billing Portal

use stripe::{BillingPortalSession, CreateBillingPortalSession, CustomerId};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;

/// Portal service for Stripe billing portal sessions
pub struct PortalService {
    stripe: StripeClient,
    store: SubscriptionStore,
}

impl PortalService {
    pub fn new(stripe: StripeClient, store: SubscriptionStore) -> Self {
        Self { stripe, store }
    }

    /// Create a billing portal session for a subject.
    ///
    /// Requires a processor customer on file, which only exists once a
    /// checkout has completed — subjects that never subscribed fail with
    /// `NoSubscription`.
    pub async fn open_portal(&self, subject_id: Uuid) -> BillingResult<PortalResponse> {
        let customer_id = self
            .store
            .load_latest(subject_id)
            .await?
            .and_then(|s| s.processor_customer_id)
            .ok_or_else(|| BillingError::NoSubscription(subject_id.to_string()))?;

        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::ProcessorApi(format!("Invalid customer ID: {}", e)))?;

        let return_url = format!("{}/billing", self.stripe.config().app_base_url);

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            subject_id = %subject_id,
            customer_id = %session.customer,
            "Created billing portal session"
        );

        Ok(session.into())
    }
}

/// Response for creating a portal session
#[derive(Debug, serde::Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}

impl From<BillingPortalSession> for PortalResponse {
    fn from(session: BillingPortalSession) -> Self {
        Self {
            portal_url: session.url,
        }
    }
}
