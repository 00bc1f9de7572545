//! Periodic reputation aggregation.
//!
//! One background task scans the event log for IPs with recent failures,
//! classifies each, and commits the new state. Ticks are serialized by a
//! run-guard; one IP failing never aborts the rest of a tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, issue_type, status_summary, HealthSnapshot};
use crate::dnsbl::{probe_and_store, BlocklistProber};
use crate::model::{ActionKind, NewIpAction, NewIpReputation, IpReputation, TriggerSource};
use crate::store::{EventStore, ReputationStore};
use crate::{ReputationConfig, ReputationError, Result};

/// Failure counts are multiplied by this to estimate attempted volume when
/// no authoritative counter is available. Testing-only accuracy: it couples
/// the ratio's denominator to its numerator, so production deployments must
/// feed a real "messages attempted" signal through the override instead.
const SENT_ESTIMATE_MULTIPLIER: u64 = 20;

/// Cumulative worker counters, exposed on the metrics endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    pub ticks: u64,
    pub ips_processed: u64,
    pub errors: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_duration_ms: u64,
}

/// The aggregation worker.
pub struct Aggregator {
    events: Arc<dyn EventStore>,
    reputation: Arc<dyn ReputationStore>,
    prober: Arc<dyn BlocklistProber>,
    config: ReputationConfig,
    tick_guard: tokio::sync::Mutex<()>,
    stats: Mutex<AggregatorStats>,
}

impl Aggregator {
    pub fn new(
        events: Arc<dyn EventStore>,
        reputation: Arc<dyn ReputationStore>,
        prober: Arc<dyn BlocklistProber>,
        config: ReputationConfig,
    ) -> Self {
        Self {
            events,
            reputation,
            prober,
            config,
            tick_guard: tokio::sync::Mutex::new(()),
            stats: Mutex::new(AggregatorStats::default()),
        }
    }

    /// Start the ticker. The first tick fires immediately; the task exits
    /// once `shutdown` flips, finishing the IP in flight first.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = interval.as_secs(),
                window_minutes = self.config.window_minutes,
                "reputation aggregation worker started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!("reputation aggregation worker stopping");
                        break;
                    }
                }
                self.run_tick(&shutdown).await;
            }
        })
    }

    /// One aggregation pass over every IP with recent activity.
    pub async fn run_tick(&self, shutdown: &watch::Receiver<bool>) {
        // Two ticks must never run concurrently.
        let _guard = self.tick_guard.lock().await;
        let started = std::time::Instant::now();

        let since = Utc::now() - chrono::Duration::minutes(self.config.window_minutes as i64);
        let candidates = match self.events.ips_with_activity_since(since).await {
            Ok(ips) => ips,
            Err(err) => {
                error!(error = %err, "failed to enumerate IPs for aggregation");
                self.stats.lock().unwrap().errors += 1;
                return;
            }
        };

        let mut processed = 0u64;
        let mut errors = 0u64;
        for ip in &candidates {
            if *shutdown.borrow() {
                info!("aggregation tick interrupted by shutdown");
                break;
            }
            match self.aggregate_ip(ip, None).await {
                Ok(state) => {
                    processed += 1;
                    debug!(ip = %ip, status = %state.status, "IP aggregated");
                }
                Err(err) => {
                    errors += 1;
                    error!(ip = %ip, error = %err, "failed to aggregate IP");
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.ticks += 1;
            stats.ips_processed += processed;
            stats.errors += errors;
            stats.last_run = Some(Utc::now());
            stats.last_duration_ms = duration_ms;
        }

        info!(
            candidates = candidates.len(),
            processed, errors, duration_ms, "aggregation tick complete"
        );
    }

    /// Classify one IP over the current window and commit the result.
    ///
    /// `sent_override` replaces the built-in volume estimator when the
    /// caller has an authoritative count of messages attempted.
    pub async fn aggregate_ip(&self, ip: &str, sent_override: Option<u64>) -> Result<IpReputation> {
        let now = Utc::now();
        let window_start = now - chrono::Duration::minutes(self.config.window_minutes as i64);

        let previous_status = self.reputation.get_state(ip).await?.map(|state| state.status);
        let failures = self.events.failures_for_ip_since(ip, window_start).await?;
        let total_sent = sent_override.unwrap_or_else(|| self.estimate_sent(failures.len()));

        let snapshot = HealthSnapshot::from_failures(ip, total_sent, &failures);
        let status = classify(&snapshot, &self.config);

        self.reputation
            .upsert_state(&NewIpReputation {
                ip: ip.to_string(),
                window_start,
                window_end: now,
                total_sent: snapshot.total_sent as i64,
                total_rejected: snapshot.total_rejected as i64,
                rejection_ratio: snapshot.rejection_ratio,
                unique_domains_rejected: snapshot.unique_domains_rejected as i32,
                reason_counts: snapshot.reason_counts.clone(),
                major_providers_rejecting: snapshot.major_providers.clone(),
                status,
                last_updated: now,
                metadata: json!({
                    "throttle_count": snapshot.throttle_count,
                    "domain_counts": snapshot.domain_counts,
                    "issue_type": issue_type(&snapshot).as_str(),
                }),
            })
            .await?;

        // The first observation of an IP is not a transition; recording it
        // would flood the audit log on startup.
        if let Some(previous) = previous_status {
            if previous != status {
                self.reputation
                    .append_action(&NewIpAction {
                        ip: ip.to_string(),
                        action: ActionKind::StatusChange,
                        previous_status: Some(previous),
                        new_status: status,
                        reason: status_summary(status, &snapshot),
                        trigger: TriggerSource::Automated,
                        metadata: json!({
                            "rejection_ratio": snapshot.rejection_ratio,
                            "unique_domains": snapshot.unique_domains_rejected,
                            "major_providers": snapshot.major_providers,
                            "total_rejected": snapshot.total_rejected,
                        }),
                        created_at: now,
                    })
                    .await?;

                info!(
                    ip = %ip,
                    previous = %previous,
                    status = %status,
                    rejection_ratio = snapshot.rejection_ratio,
                    "IP status changed"
                );
                self.dispatch_probe(ip);
            }
        }

        self.reputation
            .get_state(ip)
            .await?
            .ok_or_else(|| ReputationError::NotFound(format!("reputation state for {ip}")))
    }

    /// Fire-and-forget DNSBL probe; failures are logged, never propagated.
    pub fn dispatch_probe(&self, ip: &str) {
        let prober = Arc::clone(&self.prober);
        let store = Arc::clone(&self.reputation);
        let ip = ip.to_string();
        tokio::spawn(async move {
            if let Err(err) = probe_and_store(prober.as_ref(), store.as_ref(), &ip).await {
                warn!(ip = %ip, error = %err, "post-transition DNSBL probe failed");
            }
        });
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Estimate messages attempted from the failure count, clamped so a
    /// handful of failures cannot be ratio-amplified into an assessment.
    fn estimate_sent(&self, failure_count: usize) -> u64 {
        let estimated = failure_count as u64 * SENT_ESTIMATE_MULTIPLIER;
        estimated.max(self.config.min_volume_for_assessment)
    }
}
