//! Reconciliation engine
//!
//! The subscription lifecycle state machine. Every mutation of a subscription
//! row — whether triggered by a processor notification or a product action —
//! flows through [`ReconciliationEngine::apply`], which:
//!
//! 1. computes the next state with the pure [`plan_transition`] function,
//! 2. claims the event id in the audit log (idempotency),
//! 3. writes the new state with a versioned compare-and-set,
//!
//! all inside one transaction, retried a bounded number of times when a
//! concurrent worker moved the row first.
//!
//! The processor is the source of truth for period boundaries: events whose
//! period information is older than the stored period end are accepted as
//! no-ops (still recorded in the audit log) rather than rejected, so replays
//! and out-of-order delivery can never regress state.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use trackly_shared::{BillingCycle, SubjectKind, Subscription, SubscriptionStatus};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{local_event_id, AuditEntry, SubscriptionEventLog};
use crate::store::{NewSubscription, RecordPatch, SubscriptionStore};

/// Bounded attempts for the compare-and-set loop before surfacing
/// `ConcurrentModification` to the caller
const MAX_CAS_ATTEMPTS: usize = 4;

/// Normalized lifecycle events consumed by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    CheckoutCompleted {
        subject_id: Uuid,
        subject_kind: SubjectKind,
        plan_name: String,
        cycle: BillingCycle,
        processor_subscription_id: String,
        processor_customer_id: String,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    },
    SubscriptionRenewed {
        processor_subscription_id: String,
        new_period_start: OffsetDateTime,
        new_period_end: OffsetDateTime,
    },
    SubscriptionPastDue {
        processor_subscription_id: String,
    },
    SubscriptionCancelled {
        processor_subscription_id: String,
        effective_at: OffsetDateTime,
    },
    SubscriptionReactivated {
        processor_subscription_id: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout_completed",
            Self::SubscriptionRenewed { .. } => "subscription_renewed",
            Self::SubscriptionPastDue { .. } => "subscription_past_due",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
            Self::SubscriptionReactivated { .. } => "subscription_reactivated",
        }
    }

    /// Processor subscription id for events addressed by it
    pub fn processor_subscription_id(&self) -> Option<&str> {
        match self {
            Self::CheckoutCompleted {
                processor_subscription_id,
                ..
            }
            | Self::SubscriptionRenewed {
                processor_subscription_id,
                ..
            }
            | Self::SubscriptionPastDue {
                processor_subscription_id,
            }
            | Self::SubscriptionCancelled {
                processor_subscription_id,
                ..
            }
            | Self::SubscriptionReactivated {
                processor_subscription_id,
            } => Some(processor_subscription_id),
        }
    }
}

/// Audit entry emitted by a successful transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    SubscriptionCreated,
    SubscriptionRenewed,
    SubscriptionPastDue,
    SubscriptionRecovered,
    SubscriptionCancelScheduled,
    SubscriptionReactivated,
    SubscriptionCancelled,
    SubscriptionPlanChanged,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "subscription_created",
            Self::SubscriptionRenewed => "subscription_renewed",
            Self::SubscriptionPastDue => "subscription_past_due",
            Self::SubscriptionRecovered => "subscription_recovered",
            Self::SubscriptionCancelScheduled => "subscription_cancel_scheduled",
            Self::SubscriptionReactivated => "subscription_reactivated",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::SubscriptionPlanChanged => "subscription_plan_changed",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the state machine decided for one event against one stored record
#[derive(Debug, Clone)]
pub enum Transition {
    /// Create a fresh subscription row (None/Cancelled -> Active)
    Insert {
        new: NewSubscription,
        audit: AuditKind,
    },
    /// Conditionally replace an existing row
    Update {
        id: Uuid,
        subject_id: Uuid,
        expected_version: i64,
        patch: RecordPatch,
        audit: AuditKind,
    },
    /// Event is older than stored state; record it, change nothing
    Stale { reason: &'static str },
}

/// Result of applying an event through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State moved; the named audit entry was emitted
    Applied { audit: AuditKind, subject_id: Uuid },
    /// Reordering guard fired; audit row written, no mutation
    StaleNoop,
    /// Event id was already applied; absorbed silently
    Duplicate,
}

/// Compute the next state for a stored record and an incoming event.
///
/// Pure: no I/O, no clock reads. `current` is the subject's single current
/// row (or None), `previous_id` the most recent superseded row for the audit
/// back-reference on fresh inserts.
pub fn plan_transition(
    current: Option<&Subscription>,
    previous_id: Option<Uuid>,
    event: &DomainEvent,
    now: OffsetDateTime,
) -> BillingResult<Transition> {
    match event {
        DomainEvent::CheckoutCompleted {
            subject_id,
            subject_kind,
            plan_name,
            cycle,
            processor_subscription_id,
            processor_customer_id,
            period_start,
            period_end,
        } => {
            if period_end <= period_start {
                return Err(BillingError::Validation(format!(
                    "period end {} is not after period start {}",
                    period_end, period_start
                )));
            }

            let Some(sub) = current else {
                // Fresh None -> Active cycle
                return Ok(Transition::Insert {
                    new: NewSubscription {
                        subject_id: *subject_id,
                        subject_type: subject_kind.to_string(),
                        plan_name: plan_name.clone(),
                        billing_cycle: cycle.to_string(),
                        status: SubscriptionStatus::Active,
                        processor_customer_id: Some(processor_customer_id.clone()),
                        processor_subscription_id: Some(processor_subscription_id.clone()),
                        current_period_start: Some(*period_start),
                        current_period_end: Some(*period_end),
                        previous_subscription_id: previous_id,
                    },
                    audit: AuditKind::SubscriptionCreated,
                });
            };

            // Reordering guard: a checkout older than the stored period is a
            // replay and must not regress state
            if let Some(stored_end) = sub.current_period_end {
                if *period_end < stored_end {
                    return Ok(Transition::Stale {
                        reason: "checkout period older than stored period",
                    });
                }
            }

            if sub.processor_subscription_id.as_deref() == Some(processor_subscription_id.as_str())
                && sub.plan_name == *plan_name
            {
                return Ok(Transition::Stale {
                    reason: "checkout already applied for this subscription",
                });
            }

            // Plan change (or re-checkout under a new processor subscription):
            // replace plan/cycle/ids in place on the current row
            let audit = if sub.plan_name != *plan_name {
                AuditKind::SubscriptionPlanChanged
            } else {
                AuditKind::SubscriptionCreated
            };

            let mut patch = RecordPatch::from_record(sub);
            patch.status = SubscriptionStatus::Active;
            patch.plan_name = plan_name.clone();
            patch.billing_cycle = cycle.to_string();
            patch.processor_subscription_id = Some(processor_subscription_id.clone());
            patch.processor_customer_id = Some(processor_customer_id.clone());
            patch.cancel_at_period_end = false;
            patch.current_period_start = Some(*period_start);
            patch.current_period_end = Some(*period_end);

            Ok(Transition::Update {
                id: sub.id,
                subject_id: sub.subject_id,
                expected_version: sub.version,
                patch,
                audit,
            })
        }

        DomainEvent::SubscriptionRenewed {
            processor_subscription_id,
            new_period_start,
            new_period_end,
        } => {
            if new_period_end <= new_period_start {
                return Err(BillingError::Validation(format!(
                    "period end {} is not after period start {}",
                    new_period_end, new_period_start
                )));
            }

            let sub = require_record(current, processor_subscription_id)?;

            if let Some(stored_end) = sub.current_period_end {
                if *new_period_end <= stored_end {
                    return Ok(Transition::Stale {
                        reason: "renewal period not newer than stored period",
                    });
                }
            }

            let status = sub.status_enum();
            let (next_status, audit) = match status {
                SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                    (SubscriptionStatus::Active, AuditKind::SubscriptionRenewed)
                }
                SubscriptionStatus::PastDue => {
                    // Payment recovered with the renewal
                    (SubscriptionStatus::Active, AuditKind::SubscriptionRecovered)
                }
                // Renewal while a cancellation is pending advances the paid
                // window but does not clear the scheduled cancellation
                SubscriptionStatus::Cancelling => {
                    (SubscriptionStatus::Cancelling, AuditKind::SubscriptionRenewed)
                }
                SubscriptionStatus::Cancelled | SubscriptionStatus::None => {
                    return Ok(Transition::Stale {
                        reason: "renewal for a subscription that is no longer current",
                    });
                }
            };

            let mut patch = RecordPatch::from_record(sub);
            patch.status = next_status;
            patch.current_period_start = Some(*new_period_start);
            patch.current_period_end = Some(*new_period_end);

            Ok(Transition::Update {
                id: sub.id,
                subject_id: sub.subject_id,
                expected_version: sub.version,
                patch,
                audit,
            })
        }

        DomainEvent::SubscriptionPastDue {
            processor_subscription_id,
        } => {
            let sub = require_record(current, processor_subscription_id)?;

            match sub.status_enum() {
                SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                    let mut patch = RecordPatch::from_record(sub);
                    patch.status = SubscriptionStatus::PastDue;
                    Ok(Transition::Update {
                        id: sub.id,
                        subject_id: sub.subject_id,
                        expected_version: sub.version,
                        patch,
                        audit: AuditKind::SubscriptionPastDue,
                    })
                }
                _ => Ok(Transition::Stale {
                    reason: "past-due notification for a non-active subscription",
                }),
            }
        }

        DomainEvent::SubscriptionCancelled {
            processor_subscription_id,
            effective_at,
        } => {
            let sub = require_record(current, processor_subscription_id)?;
            let status = sub.status_enum();

            if status == SubscriptionStatus::Cancelled {
                return Ok(Transition::Stale {
                    reason: "subscription already cancelled",
                });
            }

            if *effective_at <= now {
                // Period end reached (or immediate deletion): terminal for
                // this subscription instance
                let mut patch = RecordPatch::from_record(sub);
                patch.status = SubscriptionStatus::Cancelled;
                return Ok(Transition::Update {
                    id: sub.id,
                    subject_id: sub.subject_id,
                    expected_version: sub.version,
                    patch,
                    audit: AuditKind::SubscriptionCancelled,
                });
            }

            if status == SubscriptionStatus::Cancelling {
                return Ok(Transition::Stale {
                    reason: "cancellation already scheduled",
                });
            }

            let mut patch = RecordPatch::from_record(sub);
            patch.status = SubscriptionStatus::Cancelling;
            patch.cancel_at_period_end = true;
            Ok(Transition::Update {
                id: sub.id,
                subject_id: sub.subject_id,
                expected_version: sub.version,
                patch,
                audit: AuditKind::SubscriptionCancelScheduled,
            })
        }

        DomainEvent::SubscriptionReactivated {
            processor_subscription_id,
        } => {
            let sub = require_record(current, processor_subscription_id)?;

            match sub.status_enum() {
                SubscriptionStatus::Cancelling => {
                    let mut patch = RecordPatch::from_record(sub);
                    patch.status = SubscriptionStatus::Active;
                    patch.cancel_at_period_end = false;
                    Ok(Transition::Update {
                        id: sub.id,
                        subject_id: sub.subject_id,
                        expected_version: sub.version,
                        patch,
                        audit: AuditKind::SubscriptionReactivated,
                    })
                }
                // Replays after the reactivation landed, or after a terminal
                // cancel, change nothing
                _ => Ok(Transition::Stale {
                    reason: "no cancellation pending on this subscription",
                }),
            }
        }
    }
}

fn require_record<'a>(
    current: Option<&'a Subscription>,
    processor_subscription_id: &str,
) -> BillingResult<&'a Subscription> {
    current.ok_or_else(|| {
        BillingError::SubscriptionNotFound(processor_subscription_id.to_string())
    })
}

/// The reconciliation engine: owns all subscription mutations
#[derive(Clone)]
pub struct ReconciliationEngine {
    pool: PgPool,
    store: SubscriptionStore,
    event_log: SubscriptionEventLog,
}

impl ReconciliationEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            event_log: SubscriptionEventLog::new(pool.clone()),
            pool,
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn event_log(&self) -> &SubscriptionEventLog {
        &self.event_log
    }

    /// Apply a domain event under the given idempotency key.
    ///
    /// Retries a bounded number of times when a concurrent worker moved the
    /// subject's row between read and write, then surfaces
    /// `ConcurrentModification` as a transient error.
    pub async fn apply(&self, event_id: &str, event: &DomainEvent) -> BillingResult<ApplyOutcome> {
        let mut backoff =
            ExponentialBackoff::from_millis(20).max_delay(std::time::Duration::from_millis(250));

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.try_apply(event_id, event).await {
                Err(BillingError::ConcurrentModification(reason)) => {
                    if attempt == MAX_CAS_ATTEMPTS {
                        return Err(BillingError::ConcurrentModification(reason));
                    }
                    tracing::debug!(
                        event_id = %event_id,
                        attempt = attempt,
                        "Compare-and-set lost the race, retrying"
                    );
                    tokio::time::sleep(backoff.next().unwrap_or_default()).await;
                }
                other => return other,
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "gave up applying event {} after {} attempts",
            event_id, MAX_CAS_ATTEMPTS
        )))
    }

    async fn try_apply(&self, event_id: &str, event: &DomainEvent) -> BillingResult<ApplyOutcome> {
        let now = OffsetDateTime::now_utc();

        // Resolve the subject's current record. Checkout events address the
        // subject directly; everything else is addressed by the processor
        // subscription id.
        let (current, previous_id) = match event {
            DomainEvent::CheckoutCompleted { subject_id, .. } => {
                let current = self.store.load_current(*subject_id).await?;
                let previous_id = if current.is_none() {
                    self.store.load_latest(*subject_id).await?.map(|s| s.id)
                } else {
                    None
                };
                (current, previous_id)
            }
            _ => {
                let sub_id = event
                    .processor_subscription_id()
                    .ok_or_else(|| BillingError::Internal("event without address".to_string()))?;
                (self.store.load_by_processor_id(sub_id).await?, None)
            }
        };

        let decision = plan_transition(current.as_ref(), previous_id, event, now)?;

        let subject_for_audit = match (&decision, &current, event) {
            (_, Some(sub), _) => Some(sub.subject_id),
            (_, None, DomainEvent::CheckoutCompleted { subject_id, .. }) => Some(*subject_id),
            _ => None,
        };

        let mut tx = self.pool.begin().await?;

        let entry = AuditEntry {
            event_id: event_id.to_string(),
            subject_id: subject_for_audit,
            event_type: match &decision {
                Transition::Insert { audit, .. } | Transition::Update { audit, .. } => {
                    audit.as_str().to_string()
                }
                Transition::Stale { .. } => event.name().to_string(),
            },
            event_data: audit_data(event, &decision),
            processor_subscription_id: event.processor_subscription_id().map(String::from),
        };

        if !self.event_log.claim(&mut *tx, &entry).await? {
            tracing::info!(
                event_id = %event_id,
                event = event.name(),
                "Duplicate event absorbed"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        match decision {
            Transition::Stale { reason } => {
                // Stale events keep their audit row (idempotency) but touch
                // no subscription state
                tx.commit().await?;
                tracing::info!(
                    event_id = %event_id,
                    event = event.name(),
                    reason = reason,
                    "Stale event recorded as no-op"
                );
                Ok(ApplyOutcome::StaleNoop)
            }
            Transition::Insert { new, audit } => {
                let subject_id = new.subject_id;
                self.store.insert(&mut *tx, &new).await?;
                tx.commit().await?;
                tracing::info!(
                    subject_id = %subject_id,
                    event_id = %event_id,
                    audit = %audit,
                    "Subscription created"
                );
                Ok(ApplyOutcome::Applied { audit, subject_id })
            }
            Transition::Update {
                id,
                subject_id,
                expected_version,
                patch,
                audit,
            } => {
                let updated = self
                    .store
                    .update_cas(&mut *tx, id, expected_version, &patch)
                    .await?;
                if !updated {
                    // Another worker moved the row; roll back (dropping the
                    // audit claim with it) and let the caller retry
                    tx.rollback().await?;
                    return Err(BillingError::ConcurrentModification(format!(
                        "subscription {} changed since read (expected version {})",
                        id, expected_version
                    )));
                }
                tx.commit().await?;
                tracing::info!(
                    subject_id = %subject_id,
                    event_id = %event_id,
                    audit = %audit,
                    "Subscription transitioned"
                );
                Ok(ApplyOutcome::Applied { audit, subject_id })
            }
        }
    }

    /// Finalize cancellations whose paid period lapsed without a renewal:
    /// CancelPending -> Cancelled. Invoked periodically by the worker.
    pub async fn finalize_due_cancellations(&self, limit: i64) -> BillingResult<usize> {
        let now = OffsetDateTime::now_utc();
        let due = self.store.list_expired_cancelling(now, limit).await?;
        let mut finalized = 0usize;

        for sub in due {
            let Some(processor_id) = sub.processor_subscription_id.clone() else {
                tracing::warn!(subscription_id = %sub.id, "Cancelling row without processor id");
                continue;
            };
            let Some(effective_at) = sub.current_period_end else {
                continue;
            };

            let event = DomainEvent::SubscriptionCancelled {
                processor_subscription_id: processor_id,
                effective_at,
            };

            match self
                .apply(&local_event_id("finalize_cancellation"), &event)
                .await
            {
                Ok(ApplyOutcome::Applied { .. }) => finalized += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to finalize lapsed cancellation"
                    );
                }
            }
        }

        if finalized > 0 {
            tracing::info!(count = finalized, "Finalized lapsed cancellations");
        }
        Ok(finalized)
    }
}

fn audit_data(event: &DomainEvent, decision: &Transition) -> serde_json::Value {
    let mut data = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    if let Transition::Stale { reason } = decision {
        if let Some(map) = data.as_object_mut() {
            map.insert("stale".to_string(), serde_json::json!(true));
            map.insert("reason".to_string(), serde_json::json!(reason));
        }
    }
    data
}
