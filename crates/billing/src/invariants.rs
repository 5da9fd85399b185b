//! Billing Invariants Module
//!
//! Runnable consistency checks for the billing system. The worker runs the
//! full sweep periodically; individual checks can be run after a webhook
//! replay or a support investigation.
//!
//! Checks only read, never write. A violation found at mutation time is
//! surfaced as `StateInvariantViolation` by the engine instead and is never
//! silently repaired.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subject(s) affected
    pub subject_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - subjects may be billed or entitled incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    subject_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BadPeriodRow {
    sub_id: Uuid,
    subject_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeCounterRow {
    subject_id: Uuid,
    period_start: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UnauditedSubRow {
    sub_id: Uuid,
    subject_id: Uuid,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_subscription().await?);
        violations.extend(self.check_period_end_after_start().await?);
        violations.extend(self.check_cancelled_has_period_end().await?);
        violations.extend(self.check_subscriptions_audited().await?);
        violations.extend(self.check_counters_non_negative().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one current subscription per subject
    ///
    /// Two current rows would mean double-billing and ambiguous entitlements.
    async fn check_single_current_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT subject_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due', 'cancelling')
            GROUP BY subject_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_subscription".to_string(),
                subject_ids: vec![row.subject_id],
                description: format!(
                    "Subject has {} current subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: period end is strictly after period start
    async fn check_period_end_after_start(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadPeriodRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, subject_id, status
            FROM subscriptions
            WHERE current_period_start IS NOT NULL
              AND current_period_end IS NOT NULL
              AND current_period_end <= current_period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "period_end_after_start".to_string(),
                subject_ids: vec![row.subject_id],
                description: "Subscription period end is not after period start".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: cancelled subscriptions have a period end
    ///
    /// Without it there is no record of when access lapsed.
    async fn check_cancelled_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadPeriodRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, subject_id, status
            FROM subscriptions
            WHERE status = 'cancelled'
              AND current_period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_period_end".to_string(),
                subject_ids: vec![row.subject_id],
                description: "Cancelled subscription has no period end".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: every subscription row has audit coverage
    ///
    /// Rows only come into existence through the engine, which appends an
    /// event in the same transaction — a row with no events means someone
    /// wrote around the engine.
    async fn check_subscriptions_audited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnauditedSubRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.subject_id
            FROM subscriptions s
            WHERE NOT EXISTS (
                SELECT 1 FROM subscription_events e
                WHERE e.subject_id = s.subject_id
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscriptions_audited".to_string(),
                subject_ids: vec![row.subject_id],
                description: "Subscription exists with no audit events".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: usage counters never go negative
    async fn check_counters_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeCounterRow> = sqlx::query_as(
            r#"
            SELECT subject_id, period_start
            FROM usage_periods
            WHERE messages < 0 OR tasks < 0 OR exports < 0 OR api_calls < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "counters_non_negative".to_string(),
                subject_ids: vec![row.subject_id],
                description: "Usage period contains a negative counter".to_string(),
                context: serde_json::json!({
                    "period_start": row.period_start.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_subscription" => self.check_single_current_subscription().await,
            "period_end_after_start" => self.check_period_end_after_start().await,
            "cancelled_has_period_end" => self.check_cancelled_has_period_end().await,
            "subscriptions_audited" => self.check_subscriptions_audited().await,
            "counters_non_negative" => self.check_counters_non_negative().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_subscription",
            "period_end_after_start",
            "cancelled_has_period_end",
            "subscriptions_audited",
            "counters_non_negative",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_current_subscription"));
        assert!(checks.contains(&"period_end_after_start"));
    }
}
