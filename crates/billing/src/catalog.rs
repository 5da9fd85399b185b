//! Plan Catalog accessor
//!
//! Read-only lookups over the administered set of subscription plans. Plans
//! are created and edited through an external admin surface; nothing in this
//! crate mutates them.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use trackly_shared::{BillingCycle, UsageCounter};

use crate::error::{BillingError, BillingResult};

/// Name of the designated free plan every subject falls back to
pub const FREE_PLAN: &str = "free";

/// A subscription plan and its entitlements
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    /// Unique name, the lookup key ("free", "pro", "team", ...)
    pub name: String,
    pub display_name: String,
    /// Zero for the free tier
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    /// Processor price ids; NULL for the free tier
    pub processor_price_id_monthly: Option<String>,
    pub processor_price_id_yearly: Option<String>,
    /// Per-counter monthly quotas; NULL means unlimited
    pub quota_messages: Option<i64>,
    pub quota_tasks: Option<i64>,
    pub quota_exports: Option<i64>,
    pub quota_api_calls: Option<i64>,
    pub active: bool,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.name == FREE_PLAN
    }

    /// Quota for a counter; None means unlimited
    pub fn quota_for(&self, counter: UsageCounter) -> Option<i64> {
        match counter {
            UsageCounter::Messages => self.quota_messages,
            UsageCounter::Tasks => self.quota_tasks,
            UsageCounter::Exports => self.quota_exports,
            UsageCounter::ApiCalls => self.quota_api_calls,
        }
    }

    /// Processor price id for a billing cycle
    pub fn price_id_for_cycle(&self, cycle: BillingCycle) -> Option<&str> {
        match cycle {
            BillingCycle::Monthly => self.processor_price_id_monthly.as_deref(),
            BillingCycle::Yearly => self.processor_price_id_yearly.as_deref(),
        }
    }
}

/// Read-only plan catalog backed by the `plans` table
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up an active plan by name
    ///
    /// Fails with `PlanNotFound` for unknown names and `PlanInactive` for
    /// plans that exist but have been retired.
    pub async fn get(&self, name: &str) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT name, display_name, monthly_price_cents, yearly_price_cents,
                   processor_price_id_monthly, processor_price_id_yearly,
                   quota_messages, quota_tasks, quota_exports, quota_api_calls,
                   active
            FROM plans
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let plan = plan.ok_or_else(|| BillingError::PlanNotFound(name.to_string()))?;
        if !plan.active {
            return Err(BillingError::PlanInactive(name.to_string()));
        }
        Ok(plan)
    }

    /// Look up a plan regardless of its active flag.
    ///
    /// Quota enforcement uses this: retiring a plan from sale must not strip
    /// entitlements from subjects still subscribed to it.
    pub async fn lookup(&self, name: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT name, display_name, monthly_price_cents, yearly_price_cents,
                   processor_price_id_monthly, processor_price_id_yearly,
                   quota_messages, quota_tasks, quota_exports, quota_api_calls,
                   active
            FROM plans
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    /// The designated free plan
    ///
    /// Absence of the free plan row is a deployment error, not a caller error.
    pub async fn free_plan(&self) -> BillingResult<Plan> {
        self.get(FREE_PLAN).await.map_err(|e| match e {
            BillingError::PlanNotFound(_) | BillingError::PlanInactive(_) => {
                BillingError::Config("free plan is not seeded in the plans table".to_string())
            }
            other => other,
        })
    }

    /// Resolve a plan name from a processor price id (either cycle)
    pub async fn plan_for_price_id(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT name, display_name, monthly_price_cents, yearly_price_cents,
                   processor_price_id_monthly, processor_price_id_yearly,
                   quota_messages, quota_tasks, quota_exports, quota_api_calls,
                   active
            FROM plans
            WHERE processor_price_id_monthly = $1 OR processor_price_id_yearly = $1
            "#,
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }
}

#[cfg(test)]
pub(crate) mod test_plans {
    use super::*;

    /// Free plan fixture matching the seeded catalog
    pub fn free() -> Plan {
        Plan {
            name: "free".to_string(),
            display_name: "Free".to_string(),
            monthly_price_cents: 0,
            yearly_price_cents: 0,
            processor_price_id_monthly: None,
            processor_price_id_yearly: None,
            quota_messages: Some(200),
            quota_tasks: Some(50),
            quota_exports: Some(5),
            quota_api_calls: Some(1_000),
            active: true,
        }
    }

    pub fn pro() -> Plan {
        Plan {
            name: "pro".to_string(),
            display_name: "Pro".to_string(),
            monthly_price_cents: 1_900,
            yearly_price_cents: 18_000,
            processor_price_id_monthly: Some("price_pro_monthly".to_string()),
            processor_price_id_yearly: Some("price_pro_yearly".to_string()),
            quota_messages: Some(10_000),
            quota_tasks: Some(2_500),
            quota_exports: Some(100),
            quota_api_calls: Some(50_000),
            active: true,
        }
    }

    pub fn team() -> Plan {
        Plan {
            name: "team".to_string(),
            display_name: "Team".to_string(),
            monthly_price_cents: 4_900,
            yearly_price_cents: 46_800,
            processor_price_id_monthly: Some("price_team_monthly".to_string()),
            // Yearly pricing not yet configured for team
            processor_price_id_yearly: None,
            quota_messages: None,
            quota_tasks: None,
            quota_exports: Some(1_000),
            quota_api_calls: None,
            active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_plan_has_no_price_ids() {
        let plan = test_plans::free();
        assert!(plan.is_free());
        assert!(plan.price_id_for_cycle(BillingCycle::Monthly).is_none());
        assert!(plan.price_id_for_cycle(BillingCycle::Yearly).is_none());
    }

    #[test]
    fn test_quota_for_counter() {
        let plan = test_plans::pro();
        assert_eq!(plan.quota_for(UsageCounter::Tasks), Some(2_500));
        assert_eq!(plan.quota_for(UsageCounter::Messages), Some(10_000));
    }

    #[test]
    fn test_unlimited_quota_is_none() {
        let plan = test_plans::team();
        assert_eq!(plan.quota_for(UsageCounter::Messages), None);
        assert_eq!(plan.quota_for(UsageCounter::Exports), Some(1_000));
    }

    #[test]
    fn test_price_id_per_cycle() {
        let plan = test_plans::team();
        assert_eq!(
            plan.price_id_for_cycle(BillingCycle::Monthly),
            Some("price_team_monthly")
        );
        assert!(plan.price_id_for_cycle(BillingCycle::Yearly).is_none());
    }
}
