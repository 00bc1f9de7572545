//! Liveness, metrics, and the manual retention hook.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Duration, Utc};
use reputation_core::model::IpStatus;
use serde::Serialize;
use tracing::info;

use crate::api_handler::ApiResult;
use crate::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

/// GET /metrics
///
/// Plain-text gauge exposition: tracked IPs per status and aggregation
/// worker counters.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    let states = state.reputation.list_states(None).await.unwrap_or_default();
    let count = |wanted: IpStatus| {
        states
            .iter()
            .filter(|s| s.status == wanted)
            .count()
    };
    let stats = state.aggregator.stats();

    let mut per_ip_gauges = String::new();
    for s in &states {
        per_ip_gauges.push_str(&format!(
            "ip_reputation_status{{ip=\"{}\"}} {}\n",
            s.ip,
            s.status.gauge_value()
        ));
    }

    let metrics = format!(
        "# HELP ip_reputation_status_total Tracked IPs per reputation status\n\
         # TYPE ip_reputation_status_total gauge\n\
         ip_reputation_status_total{{status=\"healthy\"}} {}\n\
         ip_reputation_status_total{{status=\"warning\"}} {}\n\
         ip_reputation_status_total{{status=\"quarantine\"}} {}\n\
         ip_reputation_status_total{{status=\"blacklisted\"}} {}\n\
         \n\
         # HELP ip_aggregation_ticks_total Completed aggregation ticks\n\
         # TYPE ip_aggregation_ticks_total counter\n\
         ip_aggregation_ticks_total {}\n\
         \n\
         # HELP ip_aggregation_ips_processed_total IPs processed by the aggregator\n\
         # TYPE ip_aggregation_ips_processed_total counter\n\
         ip_aggregation_ips_processed_total {}\n\
         \n\
         # HELP ip_aggregation_errors_total Per-IP aggregation failures\n\
         # TYPE ip_aggregation_errors_total counter\n\
         ip_aggregation_errors_total {}\n\
         \n\
         # HELP ip_aggregation_last_run_duration_ms Duration of the last tick\n\
         # TYPE ip_aggregation_last_run_duration_ms gauge\n\
         ip_aggregation_last_run_duration_ms {}\n\
         \n\
         # HELP ip_reputation_status Per-IP status (1=healthy, 2=warning, 3=quarantine, 4=blacklisted)\n\
         # TYPE ip_reputation_status gauge\n\
         {}\n\
         # HELP ip_reputation_build_info Build information\n\
         # TYPE ip_reputation_build_info gauge\n\
         ip_reputation_build_info{{version=\"{}\"}} 1\n",
        count(IpStatus::Healthy),
        count(IpStatus::Warning),
        count(IpStatus::Quarantine),
        count(IpStatus::Blacklisted),
        stats.ticks,
        stats.ips_processed,
        stats.errors,
        stats.last_duration_ms,
        per_ip_gauges,
        env!("CARGO_PKG_VERSION"),
    );

    (StatusCode::OK, metrics)
}

/// Purge summary.
#[derive(Serialize)]
pub struct PurgeResponse {
    pub purged: u64,
    pub cutoff: DateTime<Utc>,
}

/// POST /admin/events/purge
///
/// Removes failure events older than the configured retention. Nothing
/// runs this on a schedule; retention is an operator decision.
pub async fn purge_events_handler(State(state): State<Arc<AppState>>) -> ApiResult<PurgeResponse> {
    let cutoff = Utc::now() - Duration::days(state.config.aggregation.retention_days as i64);
    let purged = state.events.purge_older_than(cutoff).await?;

    info!(purged, %cutoff, "old failure events purged");
    Ok(Json(PurgeResponse { purged, cutoff }))
}
