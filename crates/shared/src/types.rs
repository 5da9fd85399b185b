//! Common types used across Trackly

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Subject ID wrapper — the unit of subscription ownership (a user or a team)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub Uuid);

impl SubjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubjectId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// What kind of entity owns a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Team,
}

impl Default for SubjectKind {
    fn default() -> Self {
        Self::User
    }
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Team => write!(f, "team"),
        }
    }
}

impl std::str::FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "team" => Ok(Self::Team),
            _ => Err(format!("Invalid subject kind: {}", s)),
        }
    }
}

/// Subscription status
///
/// `None` means the subject has never completed a checkout (or its previous
/// subscription instance was fully cancelled and superseded). `Cancelling`
/// is a scheduled cancellation: the subscription stays usable until the
/// current period ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    Trialing,
    PastDue,
    Cancelling,
    Cancelled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::None
    }
}

impl SubscriptionStatus {
    /// Statuses that count toward the "at most one current subscription per
    /// subject" invariant.
    pub fn is_current(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }

    /// Whether the subject still has paid entitlements in this status
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Trialing | Self::PastDue | Self::Cancelling
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "cancelling" => Ok(Self::Cancelling),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// Billing cycle for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Yearly,
}

impl BillingCycle {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "annual" | "year" => Some(Self::Yearly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

/// Usage counter names — the fixed enumerated set measured per period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageCounter {
    Messages,
    Tasks,
    Exports,
    ApiCalls,
}

impl UsageCounter {
    pub const ALL: [UsageCounter; 4] = [
        UsageCounter::Messages,
        UsageCounter::Tasks,
        UsageCounter::Exports,
        UsageCounter::ApiCalls,
    ];

    /// Column name in `usage_periods`
    pub fn column(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Tasks => "tasks",
            Self::Exports => "exports",
            Self::ApiCalls => "api_calls",
        }
    }
}

impl std::fmt::Display for UsageCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.column())
    }
}

impl std::str::FromStr for UsageCounter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "messages" => Ok(Self::Messages),
            "tasks" => Ok(Self::Tasks),
            "exports" => Ok(Self::Exports),
            "api_calls" => Ok(Self::ApiCalls),
            _ => Err(format!("Invalid usage counter: {}", s)),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Subscription model — the durable record of a subject's current plan
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub subject_type: String,
    pub plan_name: String,
    pub billing_cycle: String,
    pub status: String,
    pub processor_customer_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// Audit back-reference set on plan changes; never an ownership edge
    pub previous_subscription_id: Option<Uuid>,
    /// Optimistic-concurrency version, bumped on every engine mutation
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn status_enum(&self) -> SubscriptionStatus {
        self.status.parse().unwrap_or_default()
    }

    pub fn cycle_enum(&self) -> BillingCycle {
        BillingCycle::from_str(&self.billing_cycle).unwrap_or_default()
    }
}

/// Subscription event model — append-only audit log row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    /// Processor-assigned event id, or a generated `local:` id for
    /// internally originated events. Unique — the idempotency key.
    pub event_id: String,
    pub subject_id: Option<Uuid>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processor_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Usage period model — one row per subject + calendar-month period
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsagePeriod {
    pub subject_id: Uuid,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub messages: i64,
    pub tasks: i64,
    pub exports: i64,
    pub api_calls: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UsagePeriod {
    pub fn count(&self, counter: UsageCounter) -> i64 {
        match counter {
            UsageCounter::Messages => self.messages,
            UsageCounter::Tasks => self.tasks,
            UsageCounter::Exports => self.exports,
            UsageCounter::ApiCalls => self.api_calls,
        }
    }
}

// =============================================================================
// Period arithmetic
// =============================================================================

/// Truncate a timestamp to the start of its calendar month (UTC midnight).
/// Usage quotas are measured over calendar months in this system.
pub fn month_start(ts: OffsetDateTime) -> OffsetDateTime {
    // day 1 always exists, so replace_day cannot fail here
    ts.replace_day(1)
        .unwrap_or(ts)
        .replace_time(time::Time::MIDNIGHT)
}

/// Exclusive end of the calendar month containing `ts`
pub fn month_end(ts: OffsetDateTime) -> OffsetDateTime {
    let start = month_start(ts);
    let (next_year, next_month) = match start.month() {
        time::Month::December => (start.year() + 1, time::Month::January),
        m => (start.year(), m.next()),
    };
    start
        .replace_year(next_year)
        .and_then(|d| d.replace_month(next_month))
        .unwrap_or(start)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_subscription_status_default() {
        assert_eq!(SubscriptionStatus::default(), SubscriptionStatus::None);
    }

    #[test]
    fn test_subscription_status_is_current() {
        assert!(SubscriptionStatus::Active.is_current());
        assert!(SubscriptionStatus::Trialing.is_current());
        assert!(SubscriptionStatus::PastDue.is_current());
        assert!(!SubscriptionStatus::None.is_current());
        assert!(!SubscriptionStatus::Cancelling.is_current());
        assert!(!SubscriptionStatus::Cancelled.is_current());
    }

    #[test]
    fn test_subscription_status_is_entitled() {
        assert!(SubscriptionStatus::Cancelling.is_entitled());
        assert!(!SubscriptionStatus::Cancelled.is_entitled());
        assert!(!SubscriptionStatus::None.is_entitled());
    }

    #[test]
    fn test_subscription_status_display_and_parse() {
        assert_eq!(SubscriptionStatus::PastDue.to_string(), "past_due");
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            "CANCELLED".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Cancelled
        );
        assert!("invalid".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_billing_cycle_from_str() {
        assert_eq!(BillingCycle::from_str("monthly"), Some(BillingCycle::Monthly));
        assert_eq!(BillingCycle::from_str("annual"), Some(BillingCycle::Yearly));
        assert_eq!(BillingCycle::from_str("YEAR"), Some(BillingCycle::Yearly));
        assert_eq!(BillingCycle::from_str("weekly"), None);
    }

    #[test]
    fn test_usage_counter_parse_roundtrip() {
        for counter in UsageCounter::ALL {
            assert_eq!(counter.column().parse::<UsageCounter>().unwrap(), counter);
        }
        assert!("bandwidth".parse::<UsageCounter>().is_err());
    }

    #[test]
    fn test_month_start_truncates() {
        let ts = datetime!(2026-03-17 15:42:11 UTC);
        assert_eq!(month_start(ts), datetime!(2026-03-01 00:00:00 UTC));
    }

    #[test]
    fn test_month_end_rolls_over_year() {
        let ts = datetime!(2026-12-09 08:00:00 UTC);
        assert_eq!(month_end(ts), datetime!(2027-01-01 00:00:00 UTC));
    }

    #[test]
    fn test_month_end_strictly_after_start() {
        let ts = datetime!(2026-02-28 23:59:59 UTC);
        assert!(month_end(ts) > month_start(ts));
    }

    #[test]
    fn test_subject_kind_parse() {
        assert_eq!("team".parse::<SubjectKind>().unwrap(), SubjectKind::Team);
        assert!("org".parse::<SubjectKind>().is_err());
    }

    #[test]
    fn test_subject_id_new() {
        let id1 = SubjectId::new();
        let id2 = SubjectId::new();
        assert_ne!(id1, id2); // Each new ID should be unique
    }
}
