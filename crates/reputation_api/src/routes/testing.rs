//! Failure simulation and the scenario catalogue.
//!
//! These endpoints back the operator test harness: synthesize a window of
//! failures for a synthetic IP, aggregate it with the declared send
//! volume, and compare the resulting status with the catalogue's
//! expectation.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Duration, Utc};
use reputation_core::classifier::{recommended_actions, status_summary, HealthSnapshot};
use reputation_core::model::{IpReputation, NewFailureEvent};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::api_handler::{ApiError, ApiResult};
use crate::AppState;

/// One batch of identical failures in a simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSpec {
    pub code: String,
    pub domain: String,
    pub count: u32,
    #[serde(default)]
    pub reason: String,
}

/// Request body for POST /testing/simulate-failures.
#[derive(Debug, Deserialize)]
pub struct SimulateFailuresRequest {
    pub ip: String,
    pub total_sent: u64,
    pub failures: Vec<FailureSpec>,
}

/// Simulation outcome.
#[derive(Debug, Serialize)]
pub struct SimulateFailuresResponse {
    pub status: &'static str,
    pub failures_created: u32,
    pub ip_status: String,
    pub metrics: IpReputation,
    pub summary: String,
    pub recommendations: Vec<String>,
}

/// A predefined test scenario.
#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub ip: &'static str,
    pub total_sent: u64,
    pub failures: Vec<FailureSpec>,
    pub expected_status: &'static str,
    pub category: &'static str,
}

/// Result of one executed scenario.
#[derive(Debug, Serialize)]
pub struct TestCaseResult {
    pub test_id: String,
    pub test_name: String,
    pub expected_status: String,
    pub actual_status: String,
    pub passed: bool,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub rejection_ratio: f64,
    pub failure_count: u32,
}

/// Aggregate result of the whole suite.
#[derive(Debug, Serialize)]
pub struct TestSuiteResult {
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<TestCaseResult>,
}

fn spec(code: &str, domain: &str, count: u32, reason: &str) -> FailureSpec {
    FailureSpec {
        code: code.to_string(),
        domain: domain.to_string(),
        count,
        reason: reason.to_string(),
    }
}

/// The seed scenario catalogue.
pub fn seed_test_cases() -> Vec<TestCase> {
    vec![
        TestCase {
            id: "test-1",
            name: "Healthy IP - Normal Operations",
            description: "IP with minimal failures - should remain healthy",
            ip: "203.0.113.10",
            total_sent: 500,
            failures: vec![
                spec("5.1.1", "unknown-domain.com", 1, "Recipient not found"),
                spec("4.2.2", "example.com", 1, "Mailbox full"),
            ],
            expected_status: "healthy",
            category: "normal",
        },
        TestCase {
            id: "test-2",
            name: "Warning State - Elevated Rejections",
            description: "IP with elevated rejection rate from major providers",
            ip: "203.0.113.11",
            total_sent: 300,
            failures: vec![
                spec("5.7.1", "gmail.com", 3, "IP reputation"),
                spec("5.7.1", "outlook.com", 2, "Policy reject"),
                spec("5.1.1", "various.com", 3, "Unknown user"),
            ],
            expected_status: "warning",
            category: "escalation",
        },
        TestCase {
            id: "test-3",
            name: "Quarantine - Multiple Major Providers Rejecting",
            description: "Multiple major providers rejecting - should quarantine",
            ip: "203.0.113.12",
            total_sent: 400,
            failures: vec![
                spec("5.7.1", "gmail.com", 7, "IP reputation"),
                spec("5.7.1", "outlook.com", 5, "Policy reject"),
                spec("4.7.0", "yahoo.com", 3, "Temporarily deferred"),
            ],
            expected_status: "quarantine",
            category: "escalation",
        },
        TestCase {
            id: "test-4",
            name: "Blacklisted - Critical Reputation Damage",
            description: "High rejection rate across multiple major providers",
            ip: "203.0.113.13",
            total_sent: 500,
            failures: vec![
                spec("5.7.1", "gmail.com", 12, "IP reputation"),
                spec("5.7.1", "outlook.com", 10, "Blocked by policy"),
                spec("5.7.1", "yahoo.com", 8, "Spam detected"),
                spec("5.7.1", "aol.com", 5, "IP on blocklist"),
            ],
            expected_status: "blacklisted",
            category: "critical",
        },
        TestCase {
            id: "test-5",
            name: "Low Volume - Insufficient Data",
            description: "Low volume with failures - should stay healthy due to insufficient data",
            ip: "203.0.113.14",
            total_sent: 20,
            failures: vec![
                spec("5.7.1", "gmail.com", 2, "IP reputation"),
                spec("5.1.1", "example.com", 1, "Unknown user"),
            ],
            expected_status: "healthy",
            category: "edge-case",
        },
        TestCase {
            id: "test-6",
            name: "Temporary Throttling - 4xx Codes",
            description: "Mostly temporary failures - should trigger warning",
            ip: "203.0.113.15",
            total_sent: 600,
            failures: vec![
                spec("4.7.0", "gmail.com", 12, "Rate limited"),
                spec("4.2.1", "outlook.com", 4, "Mailbox busy"),
                spec("5.7.1", "yahoo.com", 2, "Policy"),
            ],
            expected_status: "warning",
            category: "throttling",
        },
        TestCase {
            id: "test-7",
            name: "SPF/DKIM Failures - Configuration Issue",
            description: "Authentication failures - should quarantine for investigation",
            ip: "203.0.113.16",
            total_sent: 300,
            failures: vec![
                spec("5.7.23", "gmail.com", 15, "SPF validation failed"),
                spec("5.7.1", "outlook.com", 10, "DKIM fail"),
            ],
            expected_status: "quarantine",
            category: "configuration",
        },
        TestCase {
            id: "test-8",
            name: "PTR Record Missing - DNS Issue",
            description: "Reverse DNS failures - should quarantine",
            ip: "203.0.113.17",
            total_sent: 200,
            failures: vec![
                spec("5.7.25", "gmail.com", 8, "PTR record required"),
                spec("5.7.25", "outlook.com", 4, "Reverse DNS lookup failed"),
            ],
            expected_status: "quarantine",
            category: "configuration",
        },
        TestCase {
            id: "test-9",
            name: "Mixed Signals - Hard to Classify",
            description: "Mixed error types - should trigger warning",
            ip: "203.0.113.18",
            total_sent: 450,
            failures: vec![
                spec("5.1.1", "example1.com", 5, "Unknown user"),
                spec("5.7.1", "gmail.com", 3, "Policy"),
                spec("4.2.2", "example2.com", 3, "Mailbox full"),
            ],
            expected_status: "warning",
            category: "mixed",
        },
        TestCase {
            id: "test-10",
            name: "Gradual Decay - Early Stage",
            description: "Initial healthy state with minimal failures",
            ip: "203.0.113.19",
            total_sent: 300,
            failures: vec![spec("5.1.1", "example.com", 3, "Unknown user")],
            expected_status: "healthy",
            category: "progression",
        },
        TestCase {
            id: "test-11",
            name: "Microsoft Reputation Block - 5.7.606",
            description: "Microsoft-specific access denied - critical reputation damage",
            ip: "203.0.113.20",
            total_sent: 400,
            failures: vec![
                spec("5.7.606", "outlook.com", 8, "Access denied, bad reputation"),
                spec("5.7.606", "hotmail.com", 6, "Sender blocked"),
                spec("5.7.1", "live.com", 4, "Policy block"),
            ],
            expected_status: "quarantine",
            category: "critical",
        },
        TestCase {
            id: "test-12",
            name: "Content Spam Detection - 5.7.512",
            description: "Message content rejected as spam - critical issue",
            ip: "203.0.113.21",
            total_sent: 350,
            failures: vec![
                spec("5.7.512", "gmail.com", 5, "Message content rejected"),
                spec("5.7.512", "outlook.com", 4, "Spam detected"),
                spec("5.7.1", "yahoo.com", 3, "Content policy violation"),
            ],
            expected_status: "quarantine",
            category: "critical",
        },
        TestCase {
            id: "test-13",
            name: "Infrastructure Issues - Multiple DNS Problems",
            description: "MX/DNS/PTR combined infrastructure failures",
            ip: "203.0.113.22",
            total_sent: 250,
            failures: vec![
                spec("5.7.27", "enterprise.com", 5, "Sender address has null MX"),
                spec("5.7.7", "business.net", 4, "Domain has no MX record"),
                spec("5.1.8", "corporate.org", 4, "Bad sender's system address"),
            ],
            expected_status: "quarantine",
            category: "configuration",
        },
        TestCase {
            id: "test-14",
            name: "DKIM/ARC Authentication Failure - 5.7.26",
            description: "Sender authentication required (ARC/DKIM failures)",
            ip: "203.0.113.23",
            total_sent: 300,
            failures: vec![
                spec("5.7.26", "gmail.com", 12, "ARC validation failed"),
                spec("5.7.26", "yahoo.com", 8, "DKIM signature required"),
            ],
            expected_status: "quarantine",
            category: "configuration",
        },
        TestCase {
            id: "test-15",
            name: "Policy Rejections - Temporary Issues",
            description: "Mixed temporary policy rejections and recipient issues",
            ip: "203.0.113.24",
            total_sent: 500,
            failures: vec![
                spec("4.7.1", "gmail.com", 8, "Temporary policy rejection"),
                spec("5.7.510", "outlook.com", 6, "Recipient address rejected"),
                spec("5.4.1", "yahoo.com", 4, "Recipient address no longer available"),
            ],
            expected_status: "warning",
            category: "policy",
        },
    ]
}

/// Insert the synthesized failures for a scenario: timestamps one minute
/// apart walking back from now, fingerprints unique per run.
async fn insert_simulated_failures(
    state: &AppState,
    ip: &str,
    failures: &[FailureSpec],
    run_id: &str,
) -> Result<u32, ApiError> {
    let mut inserted = 0u32;
    let mut sequence = 0i64;

    for failure in failures {
        // Timestamps walk back one minute per repetition of each failure
        // kind, so every synthesized event stays inside the assessment
        // window.
        for minute in 0..failure.count {
            let event = NewFailureEvent::new(
                ip,
                format!("test@{}", failure.domain),
                smtp_code_for(&failure.code),
                failure.code.clone(),
                failure.reason.clone(),
                format!("mx.{}", failure.domain),
                Utc::now() - Duration::minutes(minute as i64),
                format!("sim-{run_id}-{sequence}"),
                1,
            );
            if state
                .events
                .record_failure(&event)
                .await
                .map_err(ApiError::from)?
            {
                inserted += 1;
            }
            sequence += 1;
        }
    }

    Ok(inserted)
}

fn smtp_code_for(enhanced: &str) -> i32 {
    match enhanced.chars().next() {
        Some('2') => 200,
        Some('4') => 400,
        Some('5') => 500,
        _ => 550,
    }
}

/// POST /testing/simulate-failures
#[instrument(skip(state, request), fields(ip = %request.ip))]
pub async fn simulate_failures_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SimulateFailuresRequest>,
) -> ApiResult<SimulateFailuresResponse> {
    if request.ip.trim().is_empty() || request.total_sent == 0 || request.failures.is_empty() {
        return Err(ApiError::BadRequest(
            "required fields: ip, total_sent, failures".to_string(),
        ));
    }

    let run_id = Uuid::new_v4().simple().to_string();
    let failures_created =
        insert_simulated_failures(&state, &request.ip, &request.failures, &run_id).await?;

    // The declared volume is authoritative for a simulation; the built-in
    // estimator would pin the ratio and defeat the point.
    let metrics = state
        .aggregator
        .aggregate_ip(&request.ip, Some(request.total_sent))
        .await?;

    let snapshot = snapshot_for_summary(&metrics);
    info!(
        failures_created,
        status = %metrics.status,
        "failure simulation complete"
    );

    Ok(Json(SimulateFailuresResponse {
        status: "success",
        failures_created,
        ip_status: metrics.status.to_string(),
        summary: status_summary(metrics.status, &snapshot),
        recommendations: recommended_actions(metrics.status)
            .iter()
            .map(|s| s.to_string())
            .collect(),
        metrics,
    }))
}

fn snapshot_for_summary(metrics: &IpReputation) -> HealthSnapshot {
    HealthSnapshot {
        ip: metrics.ip.clone(),
        total_sent: metrics.total_sent.max(0) as u64,
        total_rejected: metrics.total_rejected.max(0) as u64,
        rejection_ratio: metrics.rejection_ratio,
        unique_domains_rejected: metrics.unique_domains_rejected.max(0) as usize,
        major_providers: metrics.major_providers_rejecting.0.clone(),
        reason_counts: metrics.reason_counts.0.clone(),
        throttle_count: 0,
        domain_counts: Default::default(),
    }
}

/// GET /testing/test-cases
pub async fn list_test_cases_handler() -> Json<Vec<TestCase>> {
    Json(seed_test_cases())
}

/// Execute one scenario and compare against its expectation.
async fn execute_test_case(state: &AppState, case: &TestCase) -> TestCaseResult {
    let started = std::time::Instant::now();
    let mut result = TestCaseResult {
        test_id: case.id.to_string(),
        test_name: case.name.to_string(),
        expected_status: case.expected_status.to_string(),
        actual_status: String::new(),
        passed: false,
        execution_time_ms: 0.0,
        timestamp: Utc::now(),
        error_message: None,
        rejection_ratio: 0.0,
        failure_count: 0,
    };

    let run_id = Uuid::new_v4().simple().to_string();
    match insert_simulated_failures(state, case.ip, &case.failures, &run_id).await {
        Ok(count) => result.failure_count = count,
        Err(err) => {
            result.error_message = Some(format!("failed to insert failures: {err:?}"));
            result.execution_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
            return result;
        }
    }

    match state
        .aggregator
        .aggregate_ip(case.ip, Some(case.total_sent))
        .await
    {
        Ok(metrics) => {
            result.actual_status = metrics.status.to_string();
            result.rejection_ratio = metrics.rejection_ratio;
            result.passed = result.actual_status == result.expected_status;
        }
        Err(err) => {
            result.error_message = Some(format!("aggregation failed: {err}"));
        }
    }

    result.execution_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
    result
}

/// POST /testing/test-cases/{id}/run
pub async fn run_test_case_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TestCaseResult> {
    let cases = seed_test_cases();
    let case = cases
        .iter()
        .find(|c| c.id == id)
        .ok_or_else(|| ApiError::NotFound(format!("test case {id}")))?;

    let result = execute_test_case(&state, case).await;
    info!(
        test_id = %result.test_id,
        passed = result.passed,
        expected = %result.expected_status,
        actual = %result.actual_status,
        "test case executed"
    );
    Ok(Json(result))
}

/// POST /testing/test-suite/run
pub async fn run_test_suite_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<TestSuiteResult> {
    let started = std::time::Instant::now();
    let cases = seed_test_cases();

    let mut results = Vec::with_capacity(cases.len());
    for case in &cases {
        results.push(execute_test_case(&state, case).await);
    }

    let passed_tests = results.iter().filter(|r| r.passed).count();
    let suite = TestSuiteResult {
        total_tests: results.len(),
        passed_tests,
        failed_tests: results.len() - passed_tests,
        execution_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
        timestamp: Utc::now(),
        results,
    };

    info!(
        total = suite.total_tests,
        passed = suite.passed_tests,
        failed = suite.failed_tests,
        "test suite executed"
    );
    Ok(Json(suite))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use reputation_core::model::IpStatus;
    use reputation_core::store::ReputationStore;

    #[test]
    fn catalogue_has_fifteen_cases_with_unique_ips() {
        let cases = seed_test_cases();
        assert_eq!(cases.len(), 15);

        let mut ips: Vec<&str> = cases.iter().map(|c| c.ip).collect();
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 15);

        for case in &cases {
            assert!(!case.failures.is_empty(), "{} has no failures", case.id);
            assert!(
                ["healthy", "warning", "quarantine", "blacklisted"]
                    .contains(&case.expected_status),
                "{} has invalid expected status",
                case.id
            );
        }
    }

    #[tokio::test]
    async fn simulation_classifies_with_declared_volume() {
        let (state, events, _) = test_state();

        let response = simulate_failures_handler(
            State(Arc::clone(&state)),
            Json(SimulateFailuresRequest {
                ip: "203.0.113.70".to_string(),
                total_sent: 500,
                failures: vec![
                    FailureSpec {
                        code: "5.7.1".to_string(),
                        domain: "gmail.com".to_string(),
                        count: 12,
                        reason: "IP reputation".to_string(),
                    },
                    FailureSpec {
                        code: "5.7.1".to_string(),
                        domain: "outlook.com".to_string(),
                        count: 10,
                        reason: "Policy".to_string(),
                    },
                    FailureSpec {
                        code: "5.7.1".to_string(),
                        domain: "yahoo.com".to_string(),
                        count: 8,
                        reason: "Spam".to_string(),
                    },
                ],
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.0.failures_created, 30);
        assert_eq!(response.0.ip_status, "blacklisted");
        assert_eq!(response.0.metrics.total_sent, 500);
        assert_eq!(events.events().await.len(), 30);
    }

    #[tokio::test]
    async fn simulation_rejects_incomplete_request() {
        let (state, _, _) = test_state();
        let result = simulate_failures_handler(
            State(state),
            Json(SimulateFailuresRequest {
                ip: String::new(),
                total_sent: 100,
                failures: vec![],
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn single_case_run_reports_match() {
        let (state, _, reputation) = test_state();

        let result = run_test_case_handler(State(Arc::clone(&state)), Path("test-4".to_string()))
            .await
            .unwrap();

        assert_eq!(result.0.test_id, "test-4");
        assert_eq!(result.0.actual_status, "blacklisted");
        assert!(result.0.passed);
        assert_eq!(result.0.failure_count, 35);

        let stored = reputation.get_state("203.0.113.13").await.unwrap().unwrap();
        assert_eq!(stored.status, IpStatus::Blacklisted);

        let missing =
            run_test_case_handler(State(state), Path("test-99".to_string())).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn suite_run_reports_known_divergence_only() {
        let (state, _, _) = test_state();

        let suite = run_test_suite_handler(State(state)).await.unwrap();
        assert_eq!(suite.0.total_tests, 15);

        // Scenario 15 predates the quarantine rule that now captures its
        // inputs; every other scenario matches the decision table.
        assert_eq!(suite.0.passed_tests, 14);
        let divergent: Vec<&TestCaseResult> = suite
            .0
            .results
            .iter()
            .filter(|r| !r.passed)
            .collect();
        assert_eq!(divergent.len(), 1);
        assert_eq!(divergent[0].test_id, "test-15");
        assert_eq!(divergent[0].actual_status, "quarantine");
    }
}
