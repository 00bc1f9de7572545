//! Reserved-IP lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use reputation_core::provisioner::{QuotaInfo, ReserveOutcome};
use reputation_core::model::{ReservedIp, ReservedIpStatus};
use reputation_core::store::{ReservationStatistics, ReservedIpFilter};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::api_handler::{ApiError, ApiResult};
use crate::AppState;

/// Request body for reserving IPs.
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub count: u32,
    pub location: Option<String>,
}

/// POST /ips/reserve
#[instrument(skip(state), fields(count = request.count))]
pub async fn reserve_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ReserveOutcome>), ApiError> {
    info!(location = ?request.location, "received IP reservation request");

    let outcome = state
        .provisioner
        .reserve_clean_ips(request.count, request.location.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Query parameters for the reserved-IP listing.
#[derive(Debug, Deserialize)]
pub struct ListReservedQuery {
    pub status: Option<String>,
    pub blacklisted: Option<bool>,
    pub location: Option<String>,
}

/// Reserved-IP listing.
#[derive(Debug, Serialize)]
pub struct ListReservedResponse {
    pub count: usize,
    pub ips: Vec<ReservedIp>,
}

/// GET /ips/reserved?status=&blacklisted=&location=
pub async fn list_reserved_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListReservedQuery>,
) -> ApiResult<ListReservedResponse> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(parse_reserved_status(raw)?),
    };

    let filter = ReservedIpFilter {
        status,
        is_blacklisted: query.blacklisted,
        location: query.location.filter(|l| !l.is_empty()),
    };
    let ips = state.inventory.list_reserved_ips(&filter).await?;

    Ok(Json(ListReservedResponse {
        count: ips.len(),
        ips,
    }))
}

/// GET /ips/reserved/{id}
pub async fn get_reserved_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<ReservedIp> {
    let ip = state
        .inventory
        .reserved_ip_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("reserved IP {id}")))?;
    Ok(Json(ip))
}

/// Request body for a status update.
#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub assigned_to: Option<String>,
}

/// PUT /ips/reserved/{id}/status
pub async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<ReservedIp> {
    let status = parse_reserved_status(&request.status)?;

    info!(id, status = %status, assigned_to = ?request.assigned_to, "updating reserved IP status");
    state
        .inventory
        .update_status(id, status, request.assigned_to.as_deref())
        .await?;

    let updated = state
        .inventory
        .reserved_ip_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("reserved IP {id}")))?;
    Ok(Json(updated))
}

/// POST /ips/reserved/{id}/recheck
pub async fn recheck_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<ReservedIp> {
    let updated = state.provisioner.recheck_blacklist(id).await?;
    Ok(Json(updated))
}

/// Acknowledgement of a deletion.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: &'static str,
    pub id: i64,
}

/// DELETE /ips/reserved/{id}
///
/// Removes the inventory row; the backing upstream block is deleted on a
/// best-effort basis first.
pub async fn delete_reserved_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<DeleteResponse> {
    let ip = state
        .inventory
        .reserved_ip_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("reserved IP {id}")))?;

    if !ip.block_id.is_empty() {
        state.provisioner.release_block(&ip.block_id).await;
    } else {
        warn!(id, "reserved IP has no block id, skipping upstream deletion");
    }

    state.inventory.delete_reserved_ip(id).await?;

    info!(id, ip = %ip.ip_address, "reserved IP deleted");
    Ok(Json(DeleteResponse {
        status: "deleted",
        id,
    }))
}

/// GET /ips/quota
pub async fn quota_handler(State(state): State<Arc<AppState>>) -> ApiResult<QuotaInfo> {
    let quota = state.provisioner.check_quota().await?;
    Ok(Json(quota))
}

/// Cleanup summary.
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted_count: u32,
}

/// POST /ips/cleanup
pub async fn cleanup_handler(State(state): State<Arc<AppState>>) -> ApiResult<CleanupResponse> {
    let deleted_count = state.provisioner.cleanup_single_ip_blocks().await?;
    Ok(Json(CleanupResponse { deleted_count }))
}

/// GET /ips/statistics
pub async fn statistics_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<ReservationStatistics> {
    let statistics = state.inventory.statistics().await?;
    Ok(Json(statistics))
}

fn parse_reserved_status(raw: &str) -> Result<ReservedIpStatus, ApiError> {
    raw.parse::<ReservedIpStatus>().map_err(|_| {
        ApiError::BadRequest(
            "invalid status, must be one of: reserved, in_use, released, quarantined".to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state_with_upstream;
    use reputation_core::store::InventoryStore;
    use reputation_core::testutil::{make_block, FakeUpstream};

    #[tokio::test]
    async fn reserve_vets_and_persists_ips() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.enqueue(make_block("blk-r1", 1, &["198.51.100.60"])).await;
        let ((state, _, _), inventory) = test_state_with_upstream(Arc::clone(&upstream));

        let (status, outcome) = reserve_handler(
            State(Arc::clone(&state)),
            Json(ReserveRequest {
                count: 1,
                location: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(outcome.0.success_count, 1);
        assert_eq!(inventory.attempts().await.len(), 1);

        let listed = list_reserved_handler(
            State(Arc::clone(&state)),
            Query(ListReservedQuery {
                status: Some("reserved".to_string()),
                blacklisted: Some(false),
                location: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(listed.0.count, 1);
        assert_eq!(listed.0.ips[0].ip_address, "198.51.100.60");
    }

    #[tokio::test]
    async fn invalid_count_is_rejected() {
        let ((state, _, _), _) = test_state_with_upstream(Arc::new(FakeUpstream::default()));
        let result = reserve_handler(
            State(state),
            Json(ReserveRequest {
                count: 0,
                location: None,
            }),
        )
        .await;
        assert!(matches!(
            result,
            Err(ApiError::Engine(
                reputation_core::ReputationError::InvalidInput(_)
            ))
        ));
    }

    #[tokio::test]
    async fn status_update_round_trips() {
        let ((state, _, _), inventory) = test_state_with_upstream(Arc::new(FakeUpstream::default()));
        let id = inventory
            .seed_reserved("198.51.100.61", "blk-61", ReservedIpStatus::Reserved)
            .await;

        let updated = update_status_handler(
            State(Arc::clone(&state)),
            Path(id),
            Json(UpdateStatusRequest {
                status: "in_use".to_string(),
                assigned_to: Some("mailer-3".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.0.status, ReservedIpStatus::InUse);
        assert_eq!(updated.0.assigned_to.as_deref(), Some("mailer-3"));

        let invalid = update_status_handler(
            State(state),
            Path(id),
            Json(UpdateStatusRequest {
                status: "parked".to_string(),
                assigned_to: None,
            }),
        )
        .await;
        assert!(matches!(invalid, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn delete_releases_block_and_removes_row() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.seed_block(make_block("blk-62", 1, &["198.51.100.62"])).await;
        let ((state, _, _), inventory) = test_state_with_upstream(Arc::clone(&upstream));
        let id = inventory
            .seed_reserved("198.51.100.62", "blk-62", ReservedIpStatus::Released)
            .await;

        let response = delete_reserved_handler(State(Arc::clone(&state)), Path(id))
            .await
            .unwrap();
        assert_eq!(response.0.status, "deleted");
        assert_eq!(upstream.deleted().await, vec!["blk-62".to_string()]);
        assert!(inventory.reserved_ip_by_id(id).await.unwrap().is_none());

        let missing = delete_reserved_handler(State(state), Path(id)).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn statistics_reflect_inventory() {
        let ((state, _, _), inventory) = test_state_with_upstream(Arc::new(FakeUpstream::default()));
        inventory
            .seed_reserved("198.51.100.63", "blk-63", ReservedIpStatus::Reserved)
            .await;
        inventory
            .seed_reserved("198.51.100.64", "blk-64", ReservedIpStatus::InUse)
            .await;

        let stats = statistics_handler(State(state)).await.unwrap();
        assert_eq!(stats.0.total_count, 2);
        assert_eq!(stats.0.by_status.get("reserved"), Some(&1));
        assert_eq!(stats.0.by_status.get("in_use"), Some(&1));
        assert_eq!(stats.0.blacklisted_count, 0);
    }
}
