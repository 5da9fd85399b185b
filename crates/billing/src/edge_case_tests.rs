//! Lifecycle edge-case tests
//!
//! Drives the pure state machine through the scenarios that matter in
//! production: full subscribe/cancel/reactivate arcs, out-of-order and
//! duplicated deliveries, plan changes, and fresh cycles after a terminal
//! cancellation. DB-backed behavior (idempotency claims, quota races) is
//! covered by the `#[ignore]` integration tests at the bottom.

use time::macros::datetime;
use time::OffsetDateTime;
use trackly_shared::{BillingCycle, SubjectKind, Subscription, SubscriptionStatus};
use uuid::Uuid;

use crate::error::BillingError;
use crate::reconcile::{plan_transition, AuditKind, DomainEvent, Transition};
use crate::store::NewSubscription;
use crate::subscriptions::ensure_reactivatable;

const NOW: OffsetDateTime = datetime!(2026-03-15 12:00:00 UTC);

/// Materialize a transition against an in-memory record, the way the store
/// would against a row
fn step(current: Option<Subscription>, transition: Transition) -> (Option<Subscription>, Option<AuditKind>) {
    match transition {
        Transition::Insert { new, audit } => (Some(materialize(new)), Some(audit)),
        Transition::Update { patch, audit, .. } => {
            let mut sub = current.expect("update without a record");
            sub.status = patch.status.to_string();
            sub.plan_name = patch.plan_name;
            sub.billing_cycle = patch.billing_cycle;
            sub.processor_customer_id = patch.processor_customer_id;
            sub.processor_subscription_id = patch.processor_subscription_id;
            sub.cancel_at_period_end = patch.cancel_at_period_end;
            sub.current_period_start = patch.current_period_start;
            sub.current_period_end = patch.current_period_end;
            sub.previous_subscription_id = patch.previous_subscription_id;
            sub.version += 1;
            (Some(sub), Some(audit))
        }
        Transition::Stale { .. } => (current, None),
    }
}

fn materialize(new: NewSubscription) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        subject_id: new.subject_id,
        subject_type: new.subject_type,
        plan_name: new.plan_name,
        billing_cycle: new.billing_cycle,
        status: new.status.to_string(),
        processor_customer_id: new.processor_customer_id,
        processor_subscription_id: new.processor_subscription_id,
        cancel_at_period_end: false,
        current_period_start: new.current_period_start,
        current_period_end: new.current_period_end,
        previous_subscription_id: new.previous_subscription_id,
        version: 1,
        created_at: NOW,
        updated_at: NOW,
    }
}

fn checkout_event(subject: Uuid, plan: &str, sub_id: &str) -> DomainEvent {
    DomainEvent::CheckoutCompleted {
        subject_id: subject,
        subject_kind: SubjectKind::User,
        plan_name: plan.to_string(),
        cycle: BillingCycle::Monthly,
        processor_subscription_id: sub_id.to_string(),
        processor_customer_id: "cus_edge".to_string(),
        period_start: datetime!(2026-03-01 00:00:00 UTC),
        period_end: datetime!(2026-04-01 00:00:00 UTC),
    }
}

#[test]
fn full_lifecycle_subscribe_cancel_reactivate() {
    let subject = Uuid::new_v4();

    // Checkout completes: None -> Active on plan "pro"
    let t = plan_transition(None, None, &checkout_event(subject, "pro", "sub_a"), NOW).unwrap();
    let (record, audit) = step(None, t);
    let sub = record.clone().unwrap();
    assert_eq!(sub.status_enum(), SubscriptionStatus::Active);
    assert_eq!(sub.plan_name, "pro");
    assert_eq!(audit, Some(AuditKind::SubscriptionCreated));

    // Cancellation scheduled at period end: Active -> Cancelling
    let cancel = DomainEvent::SubscriptionCancelled {
        processor_subscription_id: "sub_a".to_string(),
        effective_at: datetime!(2026-04-01 00:00:00 UTC),
    };
    let t = plan_transition(record.as_ref(), None, &cancel, NOW).unwrap();
    let (record, audit) = step(record, t);
    let sub = record.clone().unwrap();
    assert_eq!(sub.status_enum(), SubscriptionStatus::Cancelling);
    assert!(sub.cancel_at_period_end);
    assert_eq!(audit, Some(AuditKind::SubscriptionCancelScheduled));

    // Product reactivation is permitted from exactly this state
    assert!(ensure_reactivatable(subject, record.as_ref()).is_ok());

    // Reactivated: Cancelling -> Active, flag cleared
    let reactivate = DomainEvent::SubscriptionReactivated {
        processor_subscription_id: "sub_a".to_string(),
    };
    let t = plan_transition(record.as_ref(), None, &reactivate, NOW).unwrap();
    let (record, audit) = step(record, t);
    let sub = record.unwrap();
    assert_eq!(sub.status_enum(), SubscriptionStatus::Active);
    assert!(!sub.cancel_at_period_end);
    assert_eq!(audit, Some(AuditKind::SubscriptionReactivated));
}

#[test]
fn cancellation_finalizes_when_period_lapses() {
    let subject = Uuid::new_v4();
    let t = plan_transition(None, None, &checkout_event(subject, "pro", "sub_b"), NOW).unwrap();
    let (record, _) = step(None, t);

    let cancel = DomainEvent::SubscriptionCancelled {
        processor_subscription_id: "sub_b".to_string(),
        effective_at: datetime!(2026-04-01 00:00:00 UTC),
    };
    let t = plan_transition(record.as_ref(), None, &cancel, NOW).unwrap();
    let (record, _) = step(record, t);

    // Period end passes with no renewal; the worker re-applies the
    // cancellation at its effective time
    let after_period = datetime!(2026-04-02 00:00:00 UTC);
    let t = plan_transition(record.as_ref(), None, &cancel, after_period).unwrap();
    let (record, audit) = step(record, t);
    let sub = record.unwrap();
    assert_eq!(sub.status_enum(), SubscriptionStatus::Cancelled);
    assert_eq!(audit, Some(AuditKind::SubscriptionCancelled));
}

#[test]
fn fresh_cycle_after_terminal_cancellation_links_history() {
    let subject = Uuid::new_v4();
    let old_row_id = Uuid::new_v4();

    // Cancelled rows are not "current", so the engine sees None and passes
    // the superseded row id for the audit back-reference
    let t = plan_transition(
        None,
        Some(old_row_id),
        &checkout_event(subject, "team", "sub_new"),
        NOW,
    )
    .unwrap();
    let (record, audit) = step(None, t);
    let sub = record.unwrap();
    assert_eq!(sub.status_enum(), SubscriptionStatus::Active);
    assert_eq!(sub.previous_subscription_id, Some(old_row_id));
    assert_eq!(audit, Some(AuditKind::SubscriptionCreated));
}

#[test]
fn plan_change_keeps_one_row_and_emits_plan_changed() {
    let subject = Uuid::new_v4();
    let t = plan_transition(None, None, &checkout_event(subject, "pro", "sub_c"), NOW).unwrap();
    let (record, _) = step(None, t);
    let original_id = record.as_ref().unwrap().id;

    // Upgrade checkout for a different plan under a new processor subscription
    let upgrade = DomainEvent::CheckoutCompleted {
        subject_id: subject,
        subject_kind: SubjectKind::User,
        plan_name: "team".to_string(),
        cycle: BillingCycle::Yearly,
        processor_subscription_id: "sub_c2".to_string(),
        processor_customer_id: "cus_edge".to_string(),
        period_start: datetime!(2026-03-15 00:00:00 UTC),
        period_end: datetime!(2027-03-15 00:00:00 UTC),
    };
    let t = plan_transition(record.as_ref(), None, &upgrade, NOW).unwrap();
    let (record, audit) = step(record, t);
    let sub = record.unwrap();

    assert_eq!(sub.id, original_id); // replaced in place, no second row
    assert_eq!(sub.plan_name, "team");
    assert_eq!(sub.billing_cycle, "yearly");
    assert_eq!(sub.status_enum(), SubscriptionStatus::Active);
    assert_eq!(audit, Some(AuditKind::SubscriptionPlanChanged));
}

#[test]
fn out_of_order_renewal_never_regresses_period() {
    let subject = Uuid::new_v4();
    let t = plan_transition(None, None, &checkout_event(subject, "pro", "sub_d"), NOW).unwrap();
    let (record, _) = step(None, t);

    // April renewal arrives first
    let april = DomainEvent::SubscriptionRenewed {
        processor_subscription_id: "sub_d".to_string(),
        new_period_start: datetime!(2026-04-01 00:00:00 UTC),
        new_period_end: datetime!(2026-05-01 00:00:00 UTC),
    };
    let t = plan_transition(record.as_ref(), None, &april, NOW).unwrap();
    let (record, _) = step(record, t);

    // The (late) March renewal is accepted as a no-op
    let march = DomainEvent::SubscriptionRenewed {
        processor_subscription_id: "sub_d".to_string(),
        new_period_start: datetime!(2026-03-01 00:00:00 UTC),
        new_period_end: datetime!(2026-04-01 00:00:00 UTC),
    };
    let t = plan_transition(record.as_ref(), None, &march, NOW).unwrap();
    assert!(matches!(t, Transition::Stale { .. }));

    let sub = record.unwrap();
    assert_eq!(
        sub.current_period_end,
        Some(datetime!(2026-05-01 00:00:00 UTC))
    );
}

#[test]
fn past_due_then_recovery_round_trip() {
    let subject = Uuid::new_v4();
    let t = plan_transition(None, None, &checkout_event(subject, "pro", "sub_e"), NOW).unwrap();
    let (record, _) = step(None, t);

    let past_due = DomainEvent::SubscriptionPastDue {
        processor_subscription_id: "sub_e".to_string(),
    };
    let t = plan_transition(record.as_ref(), None, &past_due, NOW).unwrap();
    let (record, audit) = step(record, t);
    assert_eq!(
        record.as_ref().unwrap().status_enum(),
        SubscriptionStatus::PastDue
    );
    assert_eq!(audit, Some(AuditKind::SubscriptionPastDue));

    let renewal = DomainEvent::SubscriptionRenewed {
        processor_subscription_id: "sub_e".to_string(),
        new_period_start: datetime!(2026-04-01 00:00:00 UTC),
        new_period_end: datetime!(2026-05-01 00:00:00 UTC),
    };
    let t = plan_transition(record.as_ref(), None, &renewal, NOW).unwrap();
    let (record, audit) = step(record, t);
    assert_eq!(
        record.unwrap().status_enum(),
        SubscriptionStatus::Active
    );
    assert_eq!(audit, Some(AuditKind::SubscriptionRecovered));
}

#[test]
fn reactivation_without_pending_cancellation_fails() {
    let subject = Uuid::new_v4();

    // From None
    assert!(matches!(
        ensure_reactivatable(subject, None),
        Err(BillingError::NoCancellationScheduled(_))
    ));

    // From Active
    let t = plan_transition(None, None, &checkout_event(subject, "pro", "sub_f"), NOW).unwrap();
    let (record, _) = step(None, t);
    assert!(matches!(
        ensure_reactivatable(subject, record.as_ref()),
        Err(BillingError::NoCancellationScheduled(_))
    ));
}

// =============================================================================
// DB-backed integration tests
// =============================================================================

mod integration {
    use super::*;
    use crate::email::BillingEmailService;
    use crate::ingest::{IngestionPipeline, ProcessorNotification};
    use crate::reconcile::{ApplyOutcome, ReconciliationEngine};

    async fn engine() -> (sqlx::PgPool, ReconciliationEngine) {
        #[allow(clippy::expect_used)]
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        #[allow(clippy::expect_used)]
        let pool = trackly_shared::create_pool(&url).await.expect("pool");
        let engine = ReconciliationEngine::new(pool.clone());
        (pool, engine)
    }

    // Idempotence: replaying the same event id yields identical stored state
    #[tokio::test]
    #[ignore] // Requires database
    async fn replayed_event_id_applies_once() {
        let (_pool, engine) = engine().await;
        let subject = Uuid::new_v4();
        let event = checkout_event(subject, "pro", &format!("sub_{}", Uuid::new_v4()));
        let event_id = format!("evt_replay_{}", Uuid::new_v4());

        let first = engine.apply(&event_id, &event).await.unwrap();
        assert!(matches!(first, ApplyOutcome::Applied { .. }));

        let second = engine.apply(&event_id, &event).await.unwrap();
        assert_eq!(second, ApplyOutcome::Duplicate);

        let stored = engine.store().load_current(subject).await.unwrap().unwrap();
        assert_eq!(stored.version, 1); // one application, one version
    }

    // After every transition the single-current invariant holds
    #[tokio::test]
    #[ignore] // Requires database
    async fn single_current_row_per_subject() {
        let (_pool, engine) = engine().await;
        let subject = Uuid::new_v4();
        let sub_id = format!("sub_{}", Uuid::new_v4());

        engine
            .apply(
                &crate::events::local_event_id("test"),
                &checkout_event(subject, "pro", &sub_id),
            )
            .await
            .unwrap();
        engine
            .apply(
                &crate::events::local_event_id("test"),
                &DomainEvent::SubscriptionCancelled {
                    processor_subscription_id: sub_id,
                    effective_at: OffsetDateTime::now_utc() + time::Duration::days(10),
                },
            )
            .await
            .unwrap();

        // load_current errors if the invariant is broken
        let current = engine.store().load_current(subject).await.unwrap().unwrap();
        assert_eq!(current.status_enum(), SubscriptionStatus::Cancelling);
    }

    // Unrecognized notifications are parked, not failed
    #[tokio::test]
    #[ignore] // Requires database
    async fn unknown_notification_is_queued() {
        let (pool, engine) = engine().await;
        let pipeline = IngestionPipeline::new(
            pool.clone(),
            engine,
            BillingEmailService::from_env(pool),
        );

        let raw = format!(
            r#"{{"id": "evt_{}", "type": "charge.dispute.created", "created": 1767225600, "data": {{"object": {{}}}}}}"#,
            Uuid::new_v4()
        );
        let notification = ProcessorNotification::parse(&raw).unwrap();
        let outcome = pipeline.ingest(&notification).await.unwrap();
        assert_eq!(outcome, crate::ingest::IngestOutcome::Queued);
    }
}
