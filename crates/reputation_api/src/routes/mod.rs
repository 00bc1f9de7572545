//! API Routes Module
//!
//! Endpoint groups:
//! - `webhook`: delivery-failure ingest from the upstream MTA
//! - `reputation`: per-IP reputation reads, quarantine, DNSBL checks,
//!   dashboard rollup
//! - `reservation`: reserved-IP lifecycle against the upstream block API
//! - `testing`: failure simulation and the scenario catalogue
//! - `health`: liveness, metrics, and the manual retention hook

pub mod health;
pub mod reputation;
pub mod reservation;
pub mod testing;
pub mod webhook;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;

use crate::AppState;

/// Build all API routes and return a configured Router.
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        // Ingest
        .route(
            "/webhook/delivery-failure",
            post(webhook::delivery_failure_handler),
        )
        // Reputation queries and actions
        .route("/ips/{ip}/reputation", get(reputation::get_reputation_handler))
        .route("/ips/{ip}/failures", get(reputation::get_failures_handler))
        .route("/ips/{ip}/quarantine", post(reputation::quarantine_handler))
        .route("/ips/{ip}/dnsbl-check", post(reputation::dnsbl_check_handler))
        .route("/dashboard/ip-health", get(reputation::dashboard_handler))
        // Reserved IP lifecycle
        .route("/ips/reserve", post(reservation::reserve_handler))
        .route("/ips/reserved", get(reservation::list_reserved_handler))
        .route(
            "/ips/reserved/{id}",
            get(reservation::get_reserved_handler).delete(reservation::delete_reserved_handler),
        )
        .route(
            "/ips/reserved/{id}/status",
            put(reservation::update_status_handler),
        )
        .route(
            "/ips/reserved/{id}/recheck",
            post(reservation::recheck_handler),
        )
        .route("/ips/quota", get(reservation::quota_handler))
        .route("/ips/cleanup", post(reservation::cleanup_handler))
        .route("/ips/statistics", get(reservation::statistics_handler))
        // Testing surface
        .route(
            "/testing/simulate-failures",
            post(testing::simulate_failures_handler),
        )
        .route("/testing/test-cases", get(testing::list_test_cases_handler))
        .route(
            "/testing/test-cases/{id}/run",
            post(testing::run_test_case_handler),
        )
        .route("/testing/test-suite/run", post(testing::run_test_suite_handler))
        // Operational endpoints
        .route("/health", get(health::health_handler))
        .route("/metrics", get(health::metrics_handler))
        .route("/admin/events/purge", post(health::purge_events_handler))
        .with_state(state)
}
