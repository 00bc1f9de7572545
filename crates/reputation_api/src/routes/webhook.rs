//! Delivery-failure webhook ingest.
//!
//! The upstream MTA batches failure events; each event carries a globally
//! unique id that doubles as the deduplication fingerprint, so replayed
//! deliveries are silently absorbed and still acknowledged.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::{DateTime, Utc};
use reputation_core::model::NewFailureEvent;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::api_handler::{ApiError, ApiResult};
use crate::config::AppConfig;
use crate::AppState;

const DELIVERY_FAILURE_TYPE: &str = "smtp.delivery.failure";

/// One webhook event from the MTA.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "createdAt")]
    pub created_at: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: EventData,
}

/// Failure details inside a webhook event.
#[derive(Debug, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub smtp_code: i32,
    #[serde(default)]
    pub enhanced_code: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub mx: String,
    #[serde(default)]
    pub attempt_number: i32,
}

/// Complete webhook payload.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

/// Ingest acknowledgement.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
}

/// POST /webhook/delivery-failure
///
/// Processes `smtp.delivery.failure` events; everything else in the batch
/// is ignored. Duplicate fingerprints count as processed. A storage outage
/// is surfaced as 503 only after the rest of the batch was attempted.
#[instrument(skip_all, fields(events = payload.events.len()))]
pub async fn delivery_failure_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> ApiResult<WebhookResponse> {
    authorize_webhook(&state.config, &headers)?;

    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut storage_errors = 0usize;

    for event in &payload.events {
        if event.kind != DELIVERY_FAILURE_TYPE {
            continue;
        }

        if event.id.is_empty()
            || event.data.ip.trim().is_empty()
            || event.data.recipient.trim().is_empty()
        {
            debug!(event_id = %event.id, "skipping event with missing fields");
            failed += 1;
            continue;
        }

        let occurred_at = parse_event_timestamp(&event.created_at);
        let failure = NewFailureEvent::new(
            event.data.ip.trim(),
            event.data.recipient.trim(),
            event.data.smtp_code,
            event.data.enhanced_code.clone(),
            event.data.reason.clone(),
            event.data.mx.clone(),
            occurred_at,
            event.id.clone(),
            event.data.attempt_number.max(1),
        );

        match state.events.record_failure(&failure).await {
            Ok(inserted) => {
                // A duplicate delivery looks exactly like a success to the
                // sender.
                processed += 1;
                debug!(
                    event_id = %event.id,
                    ip = %failure.sending_ip,
                    enhanced_code = %failure.enhanced_code,
                    inserted,
                    "delivery failure recorded"
                );
            }
            Err(err) => {
                error!(event_id = %event.id, error = %err, "failed to record delivery failure");
                failed += 1;
                storage_errors += 1;
            }
        }
    }

    if storage_errors > 0 {
        return Err(ApiError::StorageUnavailable(format!(
            "{storage_errors} of {} events could not be stored",
            payload.events.len()
        )));
    }

    Ok(Json(WebhookResponse {
        processed,
        failed,
        total: payload.events.len(),
    }))
}

/// Enforce the optional shared-secret bearer token.
fn authorize_webhook(config: &AppConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(token) = config.server.webhook_token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(());
    };

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if presented != format!("Bearer {token}") {
        return Err(ApiError::Unauthorized(
            "missing or invalid webhook token".to_string(),
        ));
    }
    Ok(())
}

/// The MTA's `createdAt` is RFC3339 when present; anything else falls back
/// to receipt time.
fn parse_event_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
