//! Subscription views and product-initiated lifecycle actions

use stripe::{SubscriptionId, UpdateSubscription};
use trackly_shared::{Subscription, SubscriptionStatus};
use uuid::Uuid;

use crate::catalog::{Plan, PlanCatalog};
use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::local_event_id;
use crate::reconcile::{ApplyOutcome, AuditKind, DomainEvent, ReconciliationEngine};
use crate::store::SubscriptionStore;

/// Read model for `GetSubscription`
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionView {
    /// The subject's current subscription, or None when they ride the free plan
    pub subscription: Option<Subscription>,
    /// Effective plan (the free plan when `subscription` is None)
    pub plan: Plan,
    pub is_free: bool,
}

/// A subject is reactivatable only while a cancellation is pending
pub fn ensure_reactivatable(
    subject_id: Uuid,
    current: Option<&Subscription>,
) -> BillingResult<&Subscription> {
    match current {
        Some(sub) if sub.status_enum() == SubscriptionStatus::Cancelling => Ok(sub),
        _ => Err(BillingError::NoCancellationScheduled(subject_id.to_string())),
    }
}

/// Subscription service: read views plus the reactivation action
pub struct SubscriptionService {
    stripe: StripeClient,
    store: SubscriptionStore,
    catalog: PlanCatalog,
    engine: ReconciliationEngine,
    email: BillingEmailService,
}

impl SubscriptionService {
    pub fn new(
        stripe: StripeClient,
        store: SubscriptionStore,
        catalog: PlanCatalog,
        engine: ReconciliationEngine,
        email: BillingEmailService,
    ) -> Self {
        Self {
            stripe,
            store,
            catalog,
            engine,
            email,
        }
    }

    /// Current subscription state for a subject.
    ///
    /// Subjects without a current subscription (never subscribed, or fully
    /// cancelled) resolve to the designated free plan.
    pub async fn get_subscription(&self, subject_id: Uuid) -> BillingResult<SubscriptionView> {
        let current = self.store.load_current(subject_id).await?;

        match current {
            Some(sub) => {
                let plan = match self.catalog.lookup(&sub.plan_name).await? {
                    Some(plan) => plan,
                    None => {
                        tracing::error!(
                            subject_id = %subject_id,
                            plan = %sub.plan_name,
                            "Subscribed plan missing from catalog"
                        );
                        self.catalog.free_plan().await?
                    }
                };
                let is_free = plan.is_free();
                Ok(SubscriptionView {
                    subscription: Some(sub),
                    plan,
                    is_free,
                })
            }
            None => Ok(SubscriptionView {
                subscription: None,
                plan: self.catalog.free_plan().await?,
                is_free: true,
            }),
        }
    }

    /// Remove a pending cancellation.
    ///
    /// The processor is told first; local state only transitions after the
    /// processor acknowledges, so the stored record never claims a state the
    /// processor does not have. A timeout or transport failure surfaces as
    /// `ExternalCallIndeterminate` — the caller retries, and the operation is
    /// idempotent on the processor side.
    pub async fn reactivate(&self, subject_id: Uuid) -> BillingResult<()> {
        let current = self.store.load_current(subject_id).await?;
        let sub = ensure_reactivatable(subject_id, current.as_ref())?;

        let processor_id = sub.processor_subscription_id.clone().ok_or_else(|| {
            BillingError::Internal(format!(
                "cancelling subscription {} has no processor id",
                sub.id
            ))
        })?;

        let parsed_id = processor_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::ProcessorApi(format!("Invalid subscription ID: {}", e)))?;

        // External call first; classify indeterminate outcomes so callers
        // know a retry is safe
        let params = UpdateSubscription {
            cancel_at_period_end: Some(false),
            ..Default::default()
        };
        stripe::Subscription::update(self.stripe.inner(), &parsed_id, params)
            .await
            .map_err(|e| match e {
                // A definitive API rejection: the processor saw and refused it
                stripe::StripeError::Stripe(_) => BillingError::ProcessorApi(e.to_string()),
                // Transport/timeout failures: outcome unknown, do not commit
                other => BillingError::ExternalCallIndeterminate(other.to_string()),
            })?;

        let event = DomainEvent::SubscriptionReactivated {
            processor_subscription_id: processor_id.clone(),
        };

        match self
            .engine
            .apply(&local_event_id("reactivate"), &event)
            .await?
        {
            ApplyOutcome::Applied { subject_id, .. } => {
                if let Err(e) = self
                    .email
                    .send_lifecycle(subject_id, AuditKind::SubscriptionReactivated)
                    .await
                {
                    tracing::error!(
                        subject_id = %subject_id,
                        error = %e,
                        "Failed to send reactivation email"
                    );
                }
            }
            // The processor's own notification won the race; nothing left to do
            ApplyOutcome::Duplicate | ApplyOutcome::StaleNoop => {}
        }

        tracing::info!(
            subject_id = %subject_id,
            processor_subscription_id = %processor_id,
            "Subscription reactivated"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(status: SubscriptionStatus) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            subject_type: "user".to_string(),
            plan_name: "pro".to_string(),
            billing_cycle: "monthly".to_string(),
            status: status.to_string(),
            processor_customer_id: Some("cus_1".to_string()),
            processor_subscription_id: Some("sub_1".to_string()),
            cancel_at_period_end: status == SubscriptionStatus::Cancelling,
            current_period_start: Some(datetime!(2026-03-01 00:00:00 UTC)),
            current_period_end: Some(datetime!(2026-04-01 00:00:00 UTC)),
            previous_subscription_id: None,
            version: 1,
            created_at: datetime!(2026-03-01 00:00:00 UTC),
            updated_at: datetime!(2026-03-01 00:00:00 UTC),
        }
    }

    #[test]
    fn reactivation_requires_pending_cancellation() {
        let subject = Uuid::new_v4();

        let cancelling = record(SubscriptionStatus::Cancelling);
        assert!(ensure_reactivatable(subject, Some(&cancelling)).is_ok());

        let active = record(SubscriptionStatus::Active);
        assert!(matches!(
            ensure_reactivatable(subject, Some(&active)),
            Err(BillingError::NoCancellationScheduled(_))
        ));

        assert!(matches!(
            ensure_reactivatable(subject, None),
            Err(BillingError::NoCancellationScheduled(_))
        ));
    }
}
