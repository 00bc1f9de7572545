//! Per-IP reputation reads, manual actions, and the dashboard rollup.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use reputation_core::classifier::{recommended_actions, status_summary, HealthSnapshot};
use reputation_core::dnsbl::{probe_and_store, DnsblProbe};
use reputation_core::model::{
    ActionKind, DnsblCheckRecord, FailureEvent, IpAction, IpReputation, IpStatus, NewIpAction,
    NewIpReputation, TriggerSource,
};
use reputation_core::store::ReputationStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::api_handler::{ApiError, ApiResult};
use crate::AppState;

/// Full reputation view of one IP.
#[derive(Debug, Serialize)]
pub struct IpReputationResponse {
    pub ip: String,
    pub status: IpStatus,
    pub metrics: IpReputation,
    pub latest_dnsbl_check: Option<DnsblCheckRecord>,
    pub recent_actions: Vec<IpAction>,
    pub summary: String,
    pub recommendations: Vec<String>,
}

/// Rebuild a classifier snapshot from the persisted state, enough for the
/// human-readable summary.
fn snapshot_from_state(state: &IpReputation) -> HealthSnapshot {
    let throttle_count = state
        .metadata
        .0
        .get("throttle_count")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let domain_counts = state
        .metadata
        .0
        .get("domain_counts")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    HealthSnapshot {
        ip: state.ip.clone(),
        total_sent: state.total_sent.max(0) as u64,
        total_rejected: state.total_rejected.max(0) as u64,
        rejection_ratio: state.rejection_ratio,
        unique_domains_rejected: state.unique_domains_rejected.max(0) as usize,
        major_providers: state.major_providers_rejecting.0.clone(),
        reason_counts: state.reason_counts.0.clone(),
        throttle_count,
        domain_counts,
    }
}

/// Rebuild an upsert payload from a stored row, with a forced status.
fn forced_status_update(state: &IpReputation, status: IpStatus) -> NewIpReputation {
    NewIpReputation {
        ip: state.ip.clone(),
        window_start: state.window_start,
        window_end: state.window_end,
        total_sent: state.total_sent,
        total_rejected: state.total_rejected,
        rejection_ratio: state.rejection_ratio,
        unique_domains_rejected: state.unique_domains_rejected,
        reason_counts: state.reason_counts.0.clone(),
        major_providers_rejecting: state.major_providers_rejecting.0.clone(),
        status,
        last_updated: Utc::now(),
        metadata: state.metadata.0.clone(),
    }
}

/// GET /ips/{ip}/reputation
pub async fn get_reputation_handler(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> ApiResult<IpReputationResponse> {
    let reputation = state
        .reputation
        .get_state(&ip)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no reputation data for {ip}")))?;

    // Both are enrichment; their absence never fails the read.
    let latest_dnsbl_check = state.reputation.latest_dnsbl_check(&ip).await.ok().flatten();
    let recent_actions = state
        .reputation
        .recent_actions(&ip, 10)
        .await
        .unwrap_or_default();

    let snapshot = snapshot_from_state(&reputation);
    let status = reputation.status;

    Ok(Json(IpReputationResponse {
        ip,
        status,
        summary: status_summary(status, &snapshot),
        recommendations: recommended_actions(status)
            .iter()
            .map(|s| s.to_string())
            .collect(),
        metrics: reputation,
        latest_dnsbl_check,
        recent_actions,
    }))
}

/// Query parameters for the failure listing.
#[derive(Debug, Deserialize)]
pub struct FailuresQuery {
    /// Look-back window such as `15m`, `1h`, `24h`
    pub window: Option<String>,
}

/// GET /ips/{ip}/failures?window=15m
pub async fn get_failures_handler(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
    Query(query): Query<FailuresQuery>,
) -> ApiResult<Vec<FailureEvent>> {
    let window = query.window.as_deref().unwrap_or("15m");
    let window = humantime::parse_duration(window)
        .map_err(|_| ApiError::BadRequest(format!("invalid time window: {window}")))?;
    let window = chrono::Duration::from_std(window)
        .map_err(|_| ApiError::BadRequest("time window too large".to_string()))?;

    let since: DateTime<Utc> = Utc::now() - window;
    let failures = state.events.failures_for_ip_since(&ip, since).await?;
    Ok(Json(failures))
}

/// Acknowledgement of a manual quarantine.
#[derive(Debug, Serialize)]
pub struct QuarantineResponse {
    pub status: &'static str,
    pub ip: String,
    pub message: String,
}

/// POST /ips/{ip}/quarantine
///
/// Re-aggregates the IP so the stored snapshot is fresh, forces the status
/// to quarantine, records the manual action, and probes the blocklists in
/// the background.
#[instrument(skip(state), fields(ip = %ip))]
pub async fn quarantine_handler(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> ApiResult<QuarantineResponse> {
    let current = state.aggregator.aggregate_ip(&ip, None).await?;

    state
        .reputation
        .upsert_state(&forced_status_update(&current, IpStatus::Quarantine))
        .await?;

    state
        .reputation
        .append_action(&NewIpAction {
            ip: ip.clone(),
            action: ActionKind::ManualQuarantine,
            previous_status: None,
            new_status: IpStatus::Quarantine,
            reason: "Manually quarantined via API".to_string(),
            trigger: TriggerSource::Manual,
            metadata: json!({}),
            created_at: Utc::now(),
        })
        .await?;

    state.aggregator.dispatch_probe(&ip);

    info!("IP manually quarantined");
    Ok(Json(QuarantineResponse {
        status: "success",
        message: format!("IP {ip} has been quarantined"),
        ip,
    }))
}

/// POST /ips/{ip}/dnsbl-check
///
/// Synchronous probe; the result is persisted before it is returned.
pub async fn dnsbl_check_handler(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> ApiResult<DnsblProbe> {
    let probe = probe_and_store(state.prober.as_ref(), state.reputation.as_ref(), &ip).await?;
    Ok(Json(probe))
}

/// Query parameters for the dashboard.
#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    pub status: Option<String>,
}

/// Dashboard rollup across all tracked IPs.
#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub timestamp: DateTime<Utc>,
    pub total_ips: usize,
    pub healthy_ips: usize,
    pub warning_ips: usize,
    pub quarantine_ips: usize,
    pub blacklisted_ips: usize,
    pub ip_details: Vec<IpReputation>,
}

/// GET /dashboard/ip-health?status=warning
pub async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<DashboardResponse> {
    let filter = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<IpStatus>()
                .map_err(|_| ApiError::BadRequest(format!("invalid status filter: {raw}")))?,
        ),
    };

    let states = state.reputation.list_states(filter).await?;

    let count = |wanted: IpStatus| states.iter().filter(|s| s.status == wanted).count();
    Ok(Json(DashboardResponse {
        timestamp: Utc::now(),
        total_ips: states.len(),
        healthy_ips: count(IpStatus::Healthy),
        warning_ips: count(IpStatus::Warning),
        quarantine_ips: count(IpStatus::Quarantine),
        blacklisted_ips: count(IpStatus::Blacklisted),
        ip_details: states,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use reputation_core::testutil::seed_failure;

    #[tokio::test]
    async fn reputation_read_includes_summary_and_recommendations() {
        let (state, events, _) = test_state();
        for i in 0..10 {
            events
                .push(seed_failure("203.0.113.50", "gmail.com", "5.7.1", i))
                .await;
        }
        state
            .aggregator
            .aggregate_ip("203.0.113.50", Some(200))
            .await
            .unwrap();

        let response = get_reputation_handler(
            State(Arc::clone(&state)),
            Path("203.0.113.50".to_string()),
        )
        .await
        .unwrap();

        assert_eq!(response.0.status, IpStatus::Quarantine);
        assert!(response.0.summary.contains("QUARANTINED"));
        assert_eq!(
            response.0.recommendations[0],
            "reduce_traffic_50_percent".to_string()
        );
    }

    #[tokio::test]
    async fn reputation_read_of_unknown_ip_is_not_found() {
        let (state, _, _) = test_state();
        let result =
            get_reputation_handler(State(state), Path("198.51.100.200".to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn failures_listing_honors_window() {
        let (state, events, _) = test_state();
        events.push(seed_failure("203.0.113.51", "gmail.com", "5.7.1", 2)).await;
        events.push(seed_failure("203.0.113.51", "gmail.com", "5.7.1", 90)).await;

        let recent = get_failures_handler(
            State(Arc::clone(&state)),
            Path("203.0.113.51".to_string()),
            Query(FailuresQuery {
                window: Some("15m".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(recent.0.len(), 1);

        let wide = get_failures_handler(
            State(Arc::clone(&state)),
            Path("203.0.113.51".to_string()),
            Query(FailuresQuery {
                window: Some("2h".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(wide.0.len(), 2);

        let bad = get_failures_handler(
            State(state),
            Path("203.0.113.51".to_string()),
            Query(FailuresQuery {
                window: Some("soon".to_string()),
            }),
        )
        .await;
        assert!(matches!(bad, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn manual_quarantine_forces_status_and_records_action() {
        let (state, _, reputation) = test_state();

        quarantine_handler(State(Arc::clone(&state)), Path("203.0.113.52".to_string()))
            .await
            .unwrap();

        let stored = reputation.get_state("203.0.113.52").await.unwrap().unwrap();
        assert_eq!(stored.status, IpStatus::Quarantine);

        let actions = reputation.actions().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, ActionKind::ManualQuarantine);
        assert_eq!(actions[0].trigger, TriggerSource::Manual);
        assert_eq!(actions[0].new_status, stored.status);
    }

    #[tokio::test]
    async fn dashboard_counts_by_status() {
        let (state, events, _) = test_state();
        // One quarantined IP, one healthy IP.
        for i in 0..10 {
            events
                .push(seed_failure("203.0.113.53", "gmail.com", "5.7.1", i))
                .await;
        }
        state
            .aggregator
            .aggregate_ip("203.0.113.53", Some(200))
            .await
            .unwrap();
        state
            .aggregator
            .aggregate_ip("203.0.113.54", Some(500))
            .await
            .unwrap();

        let all = dashboard_handler(
            State(Arc::clone(&state)),
            Query(DashboardQuery { status: None }),
        )
        .await
        .unwrap();
        assert_eq!(all.0.total_ips, 2);
        assert_eq!(all.0.quarantine_ips, 1);
        assert_eq!(all.0.healthy_ips, 1);

        let filtered = dashboard_handler(
            State(Arc::clone(&state)),
            Query(DashboardQuery {
                status: Some("quarantine".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(filtered.0.total_ips, 1);
        assert_eq!(filtered.0.ip_details[0].ip, "203.0.113.53");

        let invalid = dashboard_handler(
            State(state),
            Query(DashboardQuery {
                status: Some("meh".to_string()),
            }),
        )
        .await;
        assert!(matches!(invalid, Err(ApiError::BadRequest(_))));
    }
}
