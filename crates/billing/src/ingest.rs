//! Processor event ingestion
//!
//! Entry point for verified lifecycle notifications from the payment
//! processor. Signature verification happens upstream — this module receives
//! payloads already known to be authentic, translates each into a domain
//! event, and hands it to the reconciliation engine.
//!
//! Payloads that cannot be translated (unknown type, missing fields) and
//! events whose subscription has not been seen yet (delivered ahead of their
//! checkout) are parked in `processor_event_queue`; the worker retries them
//! with bounded attempts and dead-letters what never becomes applicable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use trackly_shared::{BillingCycle, SubjectKind};
use uuid::Uuid;

use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{ApplyOutcome, AuditKind, DomainEvent, ReconciliationEngine};

/// Verified notification envelope as delivered by the processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorNotification {
    /// Processor-assigned event id — the idempotency key
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix timestamp the processor created the event
    pub created: i64,
    pub data: NotificationData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationData {
    pub object: Value,
    #[serde(default)]
    pub previous_attributes: Option<Value>,
}

impl ProcessorNotification {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload)
            .map_err(|e| BillingError::UnrecognizedEvent(format!("malformed envelope: {}", e)))
    }
}

/// What happened to one ingested notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Translated and applied; state moved
    Applied(AuditKind),
    /// Event id seen before; absorbed
    Duplicate,
    /// Reordering guard fired; recorded, no mutation
    Stale,
    /// Not yet translatable/applicable; parked for the worker
    Queued,
}

/// Translate a verified notification into a domain event. Pure.
pub fn translate(notification: &ProcessorNotification) -> BillingResult<DomainEvent> {
    let object = &notification.data.object;

    match notification.kind.as_str() {
        "checkout.session.completed" | "customer.subscription.created" => {
            let metadata = object.get("metadata").and_then(Value::as_object);
            let subject_id = metadata
                .and_then(|m| m.get("subject_id"))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| unrecognized(notification, "missing metadata.subject_id"))?;
            let subject_kind: SubjectKind = metadata
                .and_then(|m| m.get("subject_kind"))
                .and_then(Value::as_str)
                .unwrap_or("user")
                .parse()
                .map_err(|_| unrecognized(notification, "bad metadata.subject_kind"))?;
            let plan_name = metadata
                .and_then(|m| m.get("plan"))
                .and_then(Value::as_str)
                .ok_or_else(|| unrecognized(notification, "missing metadata.plan"))?
                .to_string();
            let cycle = metadata
                .and_then(|m| m.get("billing_cycle"))
                .and_then(Value::as_str)
                .and_then(BillingCycle::from_str)
                .ok_or_else(|| unrecognized(notification, "missing metadata.billing_cycle"))?;

            // Checkout sessions reference the subscription; subscription
            // objects are the subscription
            let processor_subscription_id = object
                .get("subscription")
                .and_then(Value::as_str)
                .or_else(|| {
                    if notification.kind == "customer.subscription.created" {
                        object.get("id").and_then(Value::as_str)
                    } else {
                        None
                    }
                })
                .ok_or_else(|| unrecognized(notification, "missing subscription id"))?
                .to_string();
            let processor_customer_id = object
                .get("customer")
                .and_then(Value::as_str)
                .ok_or_else(|| unrecognized(notification, "missing customer id"))?
                .to_string();

            let period_start = timestamp_field(object, "current_period_start")
                .ok_or_else(|| unrecognized(notification, "missing current_period_start"))?;
            let period_end = timestamp_field(object, "current_period_end")
                .ok_or_else(|| unrecognized(notification, "missing current_period_end"))?;

            Ok(DomainEvent::CheckoutCompleted {
                subject_id,
                subject_kind,
                plan_name,
                cycle,
                processor_subscription_id,
                processor_customer_id,
                period_start,
                period_end,
            })
        }

        "invoice.paid" => {
            let processor_subscription_id = object
                .get("subscription")
                .and_then(Value::as_str)
                .ok_or_else(|| unrecognized(notification, "invoice without subscription"))?
                .to_string();
            let new_period_start = timestamp_field(object, "period_start")
                .ok_or_else(|| unrecognized(notification, "missing period_start"))?;
            let new_period_end = timestamp_field(object, "period_end")
                .ok_or_else(|| unrecognized(notification, "missing period_end"))?;

            Ok(DomainEvent::SubscriptionRenewed {
                processor_subscription_id,
                new_period_start,
                new_period_end,
            })
        }

        "invoice.payment_failed" => {
            let processor_subscription_id = object
                .get("subscription")
                .and_then(Value::as_str)
                .ok_or_else(|| unrecognized(notification, "invoice without subscription"))?
                .to_string();

            Ok(DomainEvent::SubscriptionPastDue {
                processor_subscription_id,
            })
        }

        "customer.subscription.deleted" => {
            let processor_subscription_id = object
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| unrecognized(notification, "missing subscription id"))?
                .to_string();
            // Deletion is effective when the processor says the period ended,
            // falling back to the event's own timestamp
            let effective_at = timestamp_field(object, "current_period_end")
                .or_else(|| OffsetDateTime::from_unix_timestamp(notification.created).ok())
                .ok_or_else(|| unrecognized(notification, "no usable effective time"))?;

            Ok(DomainEvent::SubscriptionCancelled {
                processor_subscription_id,
                effective_at,
            })
        }

        "customer.subscription.updated" => {
            let processor_subscription_id = object
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| unrecognized(notification, "missing subscription id"))?
                .to_string();
            let status = object.get("status").and_then(Value::as_str).unwrap_or("");
            let cancel_at_period_end = object
                .get("cancel_at_period_end")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            if status == "past_due" {
                return Ok(DomainEvent::SubscriptionPastDue {
                    processor_subscription_id,
                });
            }

            if cancel_at_period_end {
                let effective_at = timestamp_field(object, "current_period_end")
                    .ok_or_else(|| unrecognized(notification, "missing current_period_end"))?;
                return Ok(DomainEvent::SubscriptionCancelled {
                    processor_subscription_id,
                    effective_at,
                });
            }

            // cancel_at_period_end flipped back to false: portal reactivation
            let was_cancelling = notification
                .data
                .previous_attributes
                .as_ref()
                .and_then(|p| p.get("cancel_at_period_end"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if was_cancelling {
                return Ok(DomainEvent::SubscriptionReactivated {
                    processor_subscription_id,
                });
            }

            // Ordinary update: treat as a renewal; the engine's reordering
            // guard turns non-advancing periods into no-ops
            let new_period_start = timestamp_field(object, "current_period_start")
                .ok_or_else(|| unrecognized(notification, "missing current_period_start"))?;
            let new_period_end = timestamp_field(object, "current_period_end")
                .ok_or_else(|| unrecognized(notification, "missing current_period_end"))?;

            Ok(DomainEvent::SubscriptionRenewed {
                processor_subscription_id,
                new_period_start,
                new_period_end,
            })
        }

        other => Err(BillingError::UnrecognizedEvent(format!(
            "unsupported notification type: {}",
            other
        ))),
    }
}

fn unrecognized(notification: &ProcessorNotification, reason: &str) -> BillingError {
    BillingError::UnrecognizedEvent(format!(
        "{} ({}): {}",
        notification.kind, notification.id, reason
    ))
}

fn timestamp_field(object: &Value, field: &str) -> Option<OffsetDateTime> {
    object
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// Ingestion pipeline: translation + engine application + dead-letter queue
#[derive(Clone)]
pub struct IngestionPipeline {
    pool: PgPool,
    engine: ReconciliationEngine,
    email: BillingEmailService,
}

impl IngestionPipeline {
    pub fn new(pool: PgPool, engine: ReconciliationEngine, email: BillingEmailService) -> Self {
        Self {
            pool,
            engine,
            email,
        }
    }

    /// Ingest one verified notification.
    ///
    /// Never fails ingestion for translation problems — those are parked for
    /// the worker. Only store-level failures propagate.
    pub async fn ingest(&self, notification: &ProcessorNotification) -> BillingResult<IngestOutcome> {
        // Cheap pre-check to avoid parking replays of already-applied events
        if self.engine.event_log().contains(&notification.id).await? {
            tracing::info!(event_id = %notification.id, "Duplicate notification absorbed");
            return Ok(IngestOutcome::Duplicate);
        }

        let event = match translate(notification) {
            Ok(event) => event,
            Err(BillingError::UnrecognizedEvent(reason)) => {
                tracing::warn!(
                    event_id = %notification.id,
                    kind = %notification.kind,
                    reason = %reason,
                    "Unrecognized notification, parking for retry"
                );
                self.enqueue(notification, &reason).await?;
                return Ok(IngestOutcome::Queued);
            }
            Err(e) => return Err(e),
        };

        match self.engine.apply(&notification.id, &event).await {
            Ok(ApplyOutcome::Applied { audit, subject_id }) => {
                self.notify(subject_id, audit).await;
                Ok(IngestOutcome::Applied(audit))
            }
            Ok(ApplyOutcome::Duplicate) => Ok(IngestOutcome::Duplicate),
            Ok(ApplyOutcome::StaleNoop) => Ok(IngestOutcome::Stale),
            // Delivered ahead of the checkout that creates the record; the
            // worker retries until the record exists or attempts run out
            Err(BillingError::SubscriptionNotFound(reason)) => {
                tracing::warn!(
                    event_id = %notification.id,
                    reason = %reason,
                    "Event precedes its subscription, parking for retry"
                );
                self.enqueue(notification, "subscription not found yet").await?;
                Ok(IngestOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    /// Park a notification in the retry queue
    async fn enqueue(
        &self,
        notification: &ProcessorNotification,
        reason: &str,
    ) -> BillingResult<()> {
        let payload = serde_json::to_value(notification)
            .map_err(|e| BillingError::Internal(format!("failed to serialize payload: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO processor_event_queue
                (id, event_id, payload, status, attempts, max_attempts, last_error)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&notification.id)
        .bind(&payload)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retry parked notifications. Invoked by the worker loop.
    ///
    /// Rows are claimed with FOR UPDATE SKIP LOCKED so concurrent workers
    /// never double-process; rows that exhaust `max_attempts` are marked
    /// dead-lettered and left for operator inspection.
    pub async fn process_queue(&self, limit: i64) -> BillingResult<QueueStats> {
        let rows: Vec<(Uuid, Value, i32, i32)> = sqlx::query_as(
            r#"
            SELECT id, payload, attempts, max_attempts
            FROM processor_event_queue
            WHERE status = 'pending'
              AND (last_attempt_at IS NULL OR last_attempt_at < NOW() - INTERVAL '5 minutes')
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();

        for (queue_id, payload, attempts, max_attempts) in rows {
            let attempts = attempts + 1;

            let result = match serde_json::from_value::<ProcessorNotification>(payload) {
                Ok(notification) => self.retry_one(&notification).await,
                Err(e) => Err(BillingError::UnrecognizedEvent(format!(
                    "queued payload no longer parses: {}",
                    e
                ))),
            };

            match result {
                Ok(()) => {
                    sqlx::query(
                        r#"
                        UPDATE processor_event_queue
                        SET status = 'completed', attempts = $2,
                            last_attempt_at = NOW(), processed_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(queue_id)
                    .bind(attempts)
                    .execute(&self.pool)
                    .await?;
                    stats.completed += 1;
                }
                Err(e) => {
                    let dead = attempts >= max_attempts;
                    let status = if dead { "dead_lettered" } else { "pending" };
                    sqlx::query(
                        r#"
                        UPDATE processor_event_queue
                        SET status = $2, attempts = $3, last_error = $4, last_attempt_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(queue_id)
                    .bind(status)
                    .bind(attempts)
                    .bind(e.to_string())
                    .execute(&self.pool)
                    .await?;

                    if dead {
                        tracing::error!(
                            queue_id = %queue_id,
                            attempts = attempts,
                            error = %e,
                            "Notification dead-lettered after max retries"
                        );
                        stats.dead_lettered += 1;
                    } else {
                        tracing::warn!(
                            queue_id = %queue_id,
                            attempts = attempts,
                            max_attempts = max_attempts,
                            error = %e,
                            "Queued notification failed, will retry"
                        );
                        stats.retried += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    async fn retry_one(&self, notification: &ProcessorNotification) -> BillingResult<()> {
        let event = translate(notification)?;
        match self.engine.apply(&notification.id, &event).await? {
            ApplyOutcome::Applied { audit, subject_id } => {
                self.notify(subject_id, audit).await;
                Ok(())
            }
            ApplyOutcome::Duplicate | ApplyOutcome::StaleNoop => Ok(()),
        }
    }

    /// Best-effort lifecycle notification; failures never affect processing
    async fn notify(&self, subject_id: Uuid, audit: AuditKind) {
        if let Err(e) = self.email.send_lifecycle(subject_id, audit).await {
            tracing::error!(
                subject_id = %subject_id,
                audit = %audit,
                error = %e,
                "Failed to send lifecycle email"
            );
        }
    }
}

/// Bounded retry budget for parked notifications
const DEFAULT_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(kind: &str, object: Value) -> ProcessorNotification {
        ProcessorNotification {
            id: "evt_test_1".to_string(),
            kind: kind.to_string(),
            created: 1_767_225_600, // 2026-01-01
            data: NotificationData {
                object,
                previous_attributes: None,
            },
        }
    }

    #[test]
    fn parses_envelope() {
        let payload = r#"{
            "id": "evt_1",
            "type": "invoice.paid",
            "created": 1767225600,
            "data": { "object": { "subscription": "sub_1",
                                   "period_start": 1767225600,
                                   "period_end": 1769904000 } }
        }"#;
        let n = ProcessorNotification::parse(payload).unwrap();
        assert_eq!(n.id, "evt_1");
        assert_eq!(n.kind, "invoice.paid");
    }

    #[test]
    fn malformed_envelope_is_unrecognized() {
        assert!(matches!(
            ProcessorNotification::parse("{\"nope\": true}"),
            Err(BillingError::UnrecognizedEvent(_))
        ));
    }

    #[test]
    fn translates_checkout_completed() {
        let subject = Uuid::new_v4();
        let n = notification(
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "current_period_start": 1767225600,
                "current_period_end": 1769904000,
                "metadata": {
                    "subject_id": subject.to_string(),
                    "subject_kind": "team",
                    "plan": "pro",
                    "billing_cycle": "monthly"
                }
            }),
        );

        match translate(&n).unwrap() {
            DomainEvent::CheckoutCompleted {
                subject_id,
                subject_kind,
                plan_name,
                processor_subscription_id,
                ..
            } => {
                assert_eq!(subject_id, subject);
                assert_eq!(subject_kind, SubjectKind::Team);
                assert_eq!(plan_name, "pro");
                assert_eq!(processor_subscription_id, "sub_1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn checkout_without_subject_metadata_is_unrecognized() {
        let n = notification(
            "checkout.session.completed",
            json!({
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": { "plan": "pro" }
            }),
        );
        assert!(matches!(
            translate(&n),
            Err(BillingError::UnrecognizedEvent(_))
        ));
    }

    #[test]
    fn translates_invoice_paid_to_renewal() {
        let n = notification(
            "invoice.paid",
            json!({
                "subscription": "sub_1",
                "period_start": 1767225600,
                "period_end": 1769904000
            }),
        );
        assert!(matches!(
            translate(&n).unwrap(),
            DomainEvent::SubscriptionRenewed { .. }
        ));
    }

    #[test]
    fn translates_payment_failed_to_past_due() {
        let n = notification("invoice.payment_failed", json!({ "subscription": "sub_1" }));
        assert!(matches!(
            translate(&n).unwrap(),
            DomainEvent::SubscriptionPastDue { .. }
        ));
    }

    #[test]
    fn translates_scheduled_cancellation() {
        let n = notification(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "status": "active",
                "cancel_at_period_end": true,
                "current_period_start": 1767225600,
                "current_period_end": 1769904000
            }),
        );
        match translate(&n).unwrap() {
            DomainEvent::SubscriptionCancelled { effective_at, .. } => {
                assert_eq!(effective_at.unix_timestamp(), 1_769_904_000);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn translates_portal_reactivation() {
        let mut n = notification(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "status": "active",
                "cancel_at_period_end": false,
                "current_period_start": 1767225600,
                "current_period_end": 1769904000
            }),
        );
        n.data.previous_attributes = Some(json!({ "cancel_at_period_end": true }));

        assert!(matches!(
            translate(&n).unwrap(),
            DomainEvent::SubscriptionReactivated { .. }
        ));
    }

    #[test]
    fn translates_deletion_to_immediate_cancellation() {
        let n = notification(
            "customer.subscription.deleted",
            json!({
                "id": "sub_1",
                "current_period_end": 1769904000
            }),
        );
        assert!(matches!(
            translate(&n).unwrap(),
            DomainEvent::SubscriptionCancelled { .. }
        ));
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        let n = notification("charge.dispute.created", json!({}));
        assert!(matches!(
            translate(&n),
            Err(BillingError::UnrecognizedEvent(_))
        ));
    }
}
