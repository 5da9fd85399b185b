//! Subscription event log
//!
//! Append-only audit trail for the billing system. Every processor
//! notification and every internally originated action lands here exactly
//! once; the unique index on `event_id` is what makes event application
//! idempotent under concurrent ingestion workers. Rows are never mutated or
//! deleted.
//!
//! The log also backs support/debugging queries:
//! - "why is this subject on this plan?"
//! - "what happened to this processor subscription?"

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use trackly_shared::SubscriptionEvent;
use uuid::Uuid;

use crate::error::BillingResult;

/// Prefix for event ids generated for internally originated events
/// (reactivation commands, worker finalizations). Processor ids keep their
/// own `evt_` prefix.
pub const LOCAL_EVENT_PREFIX: &str = "local";

/// Generate an event id for an internally originated event
pub fn local_event_id(action: &str) -> String {
    format!("{}:{}:{}", LOCAL_EVENT_PREFIX, action, Uuid::new_v4())
}

/// An audit entry waiting to be appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Idempotency key: processor event id or `local:` id
    pub event_id: String,
    pub subject_id: Option<Uuid>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processor_subscription_id: Option<String>,
}

/// Service for appending and querying subscription events
#[derive(Clone)]
pub struct SubscriptionEventLog {
    pool: PgPool,
}

impl SubscriptionEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim an event id inside the caller's transaction.
    ///
    /// INSERT .. ON CONFLICT DO NOTHING RETURNING ensures only one concurrent
    /// worker appends a given event id; a `false` return means the id was
    /// already applied (or is being applied in a transaction that will
    /// commit first). Because the claim shares the engine's transaction, a
    /// crash between state mutation and audit append cannot happen — both
    /// commit or neither does.
    pub async fn claim(
        &self,
        conn: &mut PgConnection,
        entry: &AuditEntry,
    ) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscription_events
                (id, event_id, subject_id, event_type, event_data, processor_subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.event_id)
        .bind(entry.subject_id)
        .bind(&entry.event_type)
        .bind(&entry.event_data)
        .bind(&entry.processor_subscription_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(claimed.is_some())
    }

    /// Whether an event id has already been applied
    pub async fn contains(&self, event_id: &str) -> BillingResult<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM subscription_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    /// Recent events for a subject, newest first
    pub async fn events_for_subject(
        &self,
        subject_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionEvent>> {
        let events: Vec<SubscriptionEvent> = sqlx::query_as(
            r#"
            SELECT id, event_id, subject_id, event_type, event_data,
                   processor_subscription_id, created_at
            FROM subscription_events
            WHERE subject_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subject_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Events related to a specific processor subscription, newest first
    pub async fn events_for_processor_subscription(
        &self,
        processor_subscription_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionEvent>> {
        let events: Vec<SubscriptionEvent> = sqlx::query_as(
            r#"
            SELECT id, event_id, subject_id, event_type, event_data,
                   processor_subscription_id, created_at
            FROM subscription_events
            WHERE processor_subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(processor_subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_event_id_is_unique() {
        let a = local_event_id("reactivate");
        let b = local_event_id("reactivate");
        assert_ne!(a, b);
        assert!(a.starts_with("local:reactivate:"));
    }
}
