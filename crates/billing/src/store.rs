//! Subscription Record Store
//!
//! Durable access layer for subscription rows. All mutations go through the
//! reconciliation engine; this module only exposes the primitives the engine
//! needs: loads, inserts, and a versioned compare-and-set update. Rows are
//! never deleted, only transitioned to `cancelled`.

use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use trackly_shared::{Subscription, SubscriptionStatus};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Field values for a brand-new subscription row
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subject_id: Uuid,
    pub subject_type: String,
    pub plan_name: String,
    pub billing_cycle: String,
    pub status: SubscriptionStatus,
    pub processor_customer_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub previous_subscription_id: Option<Uuid>,
}

/// Full replacement values for an existing row (engine computes the next
/// record; the store writes it conditionally on the version it read)
#[derive(Debug, Clone)]
pub struct RecordPatch {
    pub status: SubscriptionStatus,
    pub plan_name: String,
    pub billing_cycle: String,
    pub processor_customer_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub previous_subscription_id: Option<Uuid>,
}

impl RecordPatch {
    /// Start from the stored row, then override what the transition changes
    pub fn from_record(sub: &Subscription) -> Self {
        Self {
            status: sub.status_enum(),
            plan_name: sub.plan_name.clone(),
            billing_cycle: sub.billing_cycle.clone(),
            processor_customer_id: sub.processor_customer_id.clone(),
            processor_subscription_id: sub.processor_subscription_id.clone(),
            cancel_at_period_end: sub.cancel_at_period_end,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            previous_subscription_id: sub.previous_subscription_id,
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    id, subject_id, subject_type, plan_name, billing_cycle, status,
    processor_customer_id, processor_subscription_id, cancel_at_period_end,
    current_period_start, current_period_end, previous_subscription_id,
    version, created_at, updated_at
"#;

/// Store for subscription rows
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load the subject's current subscription: the single row with status in
    /// {active, trialing, past_due, cancelling}.
    ///
    /// Finding more than one such row is a `StateInvariantViolation` — fatal
    /// to the operation, never silently repaired.
    pub async fn load_current(&self, subject_id: Uuid) -> BillingResult<Option<Subscription>> {
        let rows: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM subscriptions
            WHERE subject_id = $1
              AND status IN ('active', 'trialing', 'past_due', 'cancelling')
            ORDER BY created_at DESC
            "#
        ))
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            tracing::error!(
                subject_id = %subject_id,
                count = rows.len(),
                "Subject has multiple current subscriptions"
            );
            return Err(BillingError::StateInvariantViolation(format!(
                "subject {} has {} current subscriptions, expected at most 1",
                subject_id,
                rows.len()
            )));
        }

        Ok(rows.into_iter().next())
    }

    /// Load the most recent subscription row for a subject regardless of
    /// status (used by read views; a cancelled row is still shown for audit)
    pub async fn load_latest(&self, subject_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM subscriptions
            WHERE subject_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Load the latest row carrying a processor subscription id
    pub async fn load_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM subscriptions
            WHERE processor_subscription_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(processor_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Insert a new subscription row inside the engine's transaction
    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        new: &NewSubscription,
    ) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                id, subject_id, subject_type, plan_name, billing_cycle, status,
                processor_customer_id, processor_subscription_id,
                cancel_at_period_end, current_period_start, current_period_end,
                previous_subscription_id, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, $9, $10, $11, 1)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.subject_id)
        .bind(&new.subject_type)
        .bind(&new.plan_name)
        .bind(&new.billing_cycle)
        .bind(new.status.to_string())
        .bind(&new.processor_customer_id)
        .bind(&new.processor_subscription_id)
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .bind(new.previous_subscription_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            // Unique violation on the single-current partial index: another
            // worker inserted the subject's current row first. Surfaced as
            // ConcurrentModification so the engine re-reads and retries.
            if let sqlx::Error::Database(db) = &e {
                if db.code().as_deref() == Some("23505") {
                    return BillingError::ConcurrentModification(format!(
                        "subject {} gained a current subscription concurrently",
                        new.subject_id
                    ));
                }
            }
            BillingError::from(e)
        })?;

        Ok(id.0)
    }

    /// Compare-and-set update inside the engine's transaction
    ///
    /// Returns false when the row moved since it was read (version mismatch),
    /// in which case the caller rolls back and retries from a fresh read.
    pub async fn update_cas(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        expected_version: i64,
        patch: &RecordPatch,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $1,
                plan_name = $2,
                billing_cycle = $3,
                processor_customer_id = $4,
                processor_subscription_id = $5,
                cancel_at_period_end = $6,
                current_period_start = $7,
                current_period_end = $8,
                previous_subscription_id = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $10 AND version = $11
            "#,
        )
        .bind(patch.status.to_string())
        .bind(&patch.plan_name)
        .bind(&patch.billing_cycle)
        .bind(&patch.processor_customer_id)
        .bind(&patch.processor_subscription_id)
        .bind(patch.cancel_at_period_end)
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.previous_subscription_id)
        .bind(id)
        .bind(expected_version)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancelling rows whose paid period has lapsed with no renewal.
    /// The worker finalizes these into `cancelled`.
    pub async fn list_expired_cancelling(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM subscriptions
            WHERE status = 'cancelling'
              AND current_period_end IS NOT NULL
              AND current_period_end < $1
            ORDER BY current_period_end ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
