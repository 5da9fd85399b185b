//! Processor webhook ingestion route
//!
//! Signature verification lives at the edge (the gateway rejects anything
//! unsigned before it reaches this service), so the body arriving here is an
//! authenticated notification. The route only parses, hands off to the
//! ingestion pipeline, and acknowledges — duplicates and stale deliveries
//! are absorbed, unrecognized payloads are parked for the worker.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use trackly_billing::{BillingError, IngestOutcome, ProcessorNotification};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub received: bool,
    pub outcome: &'static str,
}

pub async fn ingest_processor_event(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<IngestResponse>, StatusCode> {
    let notification = match ProcessorNotification::parse(&body) {
        Ok(n) => n,
        Err(e) => {
            // Malformed envelopes cannot be parked (no event id to key on);
            // reject so the processor redelivers
            tracing::error!(error = %e, "Unparseable processor notification");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let event_id = notification.id.clone();
    let kind = notification.kind.clone();

    match state.billing.ingest.ingest(&notification).await {
        Ok(outcome) => {
            let outcome_str = match outcome {
                IngestOutcome::Applied(_) => "applied",
                IngestOutcome::Duplicate => "duplicate",
                IngestOutcome::Stale => "stale",
                IngestOutcome::Queued => "queued",
            };
            tracing::info!(
                event_id = %event_id,
                kind = %kind,
                outcome = outcome_str,
                "Processor notification ingested"
            );
            Ok(Json(IngestResponse {
                received: true,
                outcome: outcome_str,
            }))
        }
        Err(e @ BillingError::ConcurrentModification(_)) => {
            // Ask the processor to redeliver; the retry will win the race
            tracing::warn!(event_id = %event_id, error = %e, "Ingestion contention, requesting redelivery");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => {
            tracing::error!(event_id = %event_id, error = %e, "Ingestion failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
