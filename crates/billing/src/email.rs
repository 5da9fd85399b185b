//! Email notifications for billing events
//!
//! Sends transactional emails via the Resend API for subscription lifecycle
//! changes. Delivery is best-effort: a failed send is logged and swallowed so
//! it can never fail event processing.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::reconcile::AuditKind;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Trackly <noreply@trackly.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Trackly".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://trackly.app".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
    pool: PgPool,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig, pool: PgPool) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            pool,
        }
    }

    /// Create from environment variables
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(EmailConfig::from_env(), pool)
    }

    /// Send a lifecycle notification to the subject's billing contact.
    ///
    /// Only a subset of audit kinds produce mail; the rest are silent.
    pub async fn send_lifecycle(&self, subject_id: Uuid, audit: AuditKind) -> BillingResult<bool> {
        let (subject_line, body) = match audit {
            AuditKind::SubscriptionCancelScheduled => (
                format!("{}: your subscription will end at period close", self.config.app_name),
                format!(
                    r#"<p>Your subscription is scheduled to cancel at the end of the current billing period. You keep full access until then.</p>
<p><a href="{}/billing" style="color: #6366f1;">Reactivate any time before the period ends</a></p>"#,
                    self.config.dashboard_url
                ),
            ),
            AuditKind::SubscriptionPastDue => (
                format!("{}: payment past due", self.config.app_name),
                format!(
                    r#"<p>We could not collect your latest payment. Please update your payment method to keep your plan.</p>
<p><a href="{}/billing" style="color: #6366f1;">Update payment method</a></p>"#,
                    self.config.dashboard_url
                ),
            ),
            AuditKind::SubscriptionReactivated => (
                format!("{}: subscription reactivated", self.config.app_name),
                "<p>Your scheduled cancellation has been removed. Your subscription continues as before.</p>".to_string(),
            ),
            AuditKind::SubscriptionCancelled => (
                format!("{}: subscription ended", self.config.app_name),
                format!(
                    r#"<p>Your subscription has ended and your workspace is now on the free plan.</p>
<p><a href="{}/billing" style="color: #6366f1;">Resubscribe</a></p>"#,
                    self.config.dashboard_url
                ),
            ),
            // Creation, renewals, recoveries and plan changes are visible in
            // the dashboard; no mail
            _ => return Ok(false),
        };

        let Some(to) = self.contact_email(subject_id).await? else {
            tracing::warn!(subject_id = %subject_id, "No billing contact on file, skipping email");
            return Ok(false);
        };

        self.send_email(&to, &subject_line, &body).await
    }

    /// Billing contact for a subject, maintained by the account layer
    async fn contact_email(&self, subject_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT email FROM billing_contacts WHERE subject_id = $1")
                .bind(subject_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(email,)| email))
    }

    /// Send an email via Resend API
    ///
    /// Returns `Ok(true)` if the email was sent successfully,
    /// `Ok(false)` if sending failed (non-fatal - doesn't propagate error),
    /// `Err` only for store lookups failing upstream of the send.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }
}
