//! In-memory fakes for the store, prober and upstream seams.
//!
//! These mirror the contracts of the production implementations closely
//! enough for worker and handler tests to run without PostgreSQL, DNS or
//! the upstream API. They are compiled for this crate's tests and, via the
//! `testutil` feature, for dependent crates' tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::types::Json;
use tokio::sync::Mutex;

use crate::dnsbl::{BlocklistProber, DnsblProbe};
use crate::model::{
    DnsblCheckRecord, FailureEvent, IpAction, IpReputation, IpStatus, NewBlacklistHistory,
    NewDnsblCheck, NewFailureEvent, NewIpAction, NewIpReputation, NewQuotaSnapshot,
    NewReservationAttempt, NewReservedIp, BlacklistHistoryEntry, QuotaSnapshot,
    ReservationAttempt, ReservedIp, ReservedIpStatus,
};
use crate::store::{
    EventStore, InventoryStore, ReputationStore, ReservationStatistics, ReservedIpFilter,
};
use crate::upstream::{IpBlock, IpBlockProperties, UpstreamClient};
use crate::{ReputationError, Result};

static FINGERPRINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A failure event `minutes_ago` minutes in the past with a unique
/// fingerprint.
pub fn seed_failure(ip: &str, domain: &str, code: &str, minutes_ago: i64) -> NewFailureEvent {
    let n = FINGERPRINT_COUNTER.fetch_add(1, Ordering::Relaxed);
    NewFailureEvent::new(
        ip,
        format!("test@{domain}"),
        if code.starts_with('4') { 421 } else { 550 },
        code,
        "synthesized failure",
        format!("mx.{domain}"),
        Utc::now() - Duration::minutes(minutes_ago),
        format!("seed-{n}"),
        1,
    )
}

/// Build an upstream block for tests.
pub fn make_block(id: &str, size: u32, ips: &[&str]) -> IpBlock {
    IpBlock {
        id: id.to_string(),
        properties: IpBlockProperties {
            name: format!("block-{id}"),
            location: "dc1".into(),
            size,
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
        },
    }
}

/// Event log fake with fingerprint deduplication.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<FailureEvent>>,
    next_id: AtomicI64,
    fail_reads: Mutex<HashSet<String>>,
    fail_writes: Mutex<bool>,
}

impl MemoryEventStore {
    pub async fn push(&self, event: NewFailureEvent) {
        let _ = self.record_failure(&event).await;
    }

    /// Make reads for one IP fail, to exercise per-IP error isolation.
    pub async fn fail_reads_for(&self, ip: &str) {
        self.fail_reads.lock().await.insert(ip.to_string());
    }

    /// Make every write fail, to exercise storage-unavailable paths.
    pub async fn fail_writes(&self) {
        *self.fail_writes.lock().await = true;
    }

    pub async fn events(&self) -> Vec<FailureEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn record_failure(&self, event: &NewFailureEvent) -> Result<bool> {
        if *self.fail_writes.lock().await {
            return Err(ReputationError::Internal(anyhow!("injected write failure")));
        }

        let mut events = self.events.lock().await;
        if events.iter().any(|e| e.fingerprint == event.fingerprint) {
            return Ok(false);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        events.push(FailureEvent {
            id,
            sending_ip: event.sending_ip.clone(),
            recipient_email: event.recipient_email.clone(),
            recipient_domain: event.recipient_domain.clone(),
            smtp_code: event.smtp_code,
            enhanced_code: event.enhanced_code.clone(),
            reason: event.reason.clone(),
            mx_host: event.mx_host.clone(),
            occurred_at: event.occurred_at,
            fingerprint: event.fingerprint.clone(),
            attempt_number: event.attempt_number,
        });
        Ok(true)
    }

    async fn failures_for_ip_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailureEvent>> {
        if self.fail_reads.lock().await.contains(ip) {
            return Err(ReputationError::Internal(anyhow!("injected read failure")));
        }

        let mut matching: Vec<FailureEvent> = self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| e.sending_ip == ip && e.occurred_at >= since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(matching)
    }

    async fn ips_with_activity_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let mut ips: Vec<String> = self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| e.occurred_at >= since)
            .map(|e| e.sending_ip.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ips.sort();
        Ok(ips)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|e| e.occurred_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

/// Reputation state fake.
#[derive(Default)]
pub struct MemoryReputationStore {
    states: Mutex<HashMap<String, IpReputation>>,
    actions: Mutex<Vec<IpAction>>,
    checks: Mutex<Vec<DnsblCheckRecord>>,
    next_id: AtomicI64,
}

impl MemoryReputationStore {
    pub async fn actions(&self) -> Vec<IpAction> {
        self.actions.lock().await.clone()
    }
}

#[async_trait]
impl ReputationStore for MemoryReputationStore {
    async fn get_state(&self, ip: &str) -> Result<Option<IpReputation>> {
        Ok(self.states.lock().await.get(ip).cloned())
    }

    async fn upsert_state(&self, state: &NewIpReputation) -> Result<()> {
        let mut states = self.states.lock().await;
        let id = states
            .get(&state.ip)
            .map(|existing| existing.id)
            .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        states.insert(
            state.ip.clone(),
            IpReputation {
                id,
                ip: state.ip.clone(),
                window_start: state.window_start,
                window_end: state.window_end,
                total_sent: state.total_sent,
                total_rejected: state.total_rejected,
                rejection_ratio: state.rejection_ratio,
                unique_domains_rejected: state.unique_domains_rejected,
                reason_counts: Json(state.reason_counts.clone()),
                major_providers_rejecting: Json(state.major_providers_rejecting.clone()),
                status: state.status,
                last_updated: state.last_updated,
                metadata: Json(state.metadata.clone()),
            },
        );
        Ok(())
    }

    async fn list_states(&self, status: Option<IpStatus>) -> Result<Vec<IpReputation>> {
        let mut states: Vec<IpReputation> = self
            .states
            .lock()
            .await
            .values()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect();
        states.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(states)
    }

    async fn append_action(&self, action: &NewIpAction) -> Result<()> {
        let mut actions = self.actions.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        actions.push(IpAction {
            id,
            ip: action.ip.clone(),
            action: action.action,
            previous_status: action.previous_status,
            new_status: action.new_status,
            reason: action.reason.clone(),
            trigger: action.trigger,
            metadata: Json(action.metadata.clone()),
            created_at: action.created_at,
        });
        Ok(())
    }

    async fn recent_actions(&self, ip: &str, limit: i64) -> Result<Vec<IpAction>> {
        let mut actions: Vec<IpAction> = self
            .actions
            .lock()
            .await
            .iter()
            .filter(|a| a.ip == ip)
            .cloned()
            .collect();
        actions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        actions.truncate(limit as usize);
        Ok(actions)
    }

    async fn insert_dnsbl_check(&self, check: &NewDnsblCheck) -> Result<()> {
        let mut checks = self.checks.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        checks.push(DnsblCheckRecord {
            id,
            ip: check.ip.clone(),
            checked_at: check.checked_at,
            listed: check.listed,
            listings: Json(check.listings.clone()),
            duration_ms: check.duration_ms,
            metadata: Json(check.metadata.clone()),
        });
        Ok(())
    }

    async fn latest_dnsbl_check(&self, ip: &str) -> Result<Option<DnsblCheckRecord>> {
        Ok(self
            .checks
            .lock()
            .await
            .iter()
            .filter(|c| c.ip == ip)
            .max_by_key(|c| c.checked_at)
            .cloned())
    }
}

/// Inventory fake.
#[derive(Default)]
pub struct MemoryInventoryStore {
    reserved: Mutex<Vec<ReservedIp>>,
    attempts: Mutex<Vec<ReservationAttempt>>,
    history: Mutex<Vec<BlacklistHistoryEntry>>,
    snapshots: Mutex<Vec<QuotaSnapshot>>,
    next_id: AtomicI64,
}

impl MemoryInventoryStore {
    fn next(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn attempts(&self) -> Vec<ReservationAttempt> {
        self.attempts.lock().await.clone()
    }

    pub async fn history(&self) -> Vec<BlacklistHistoryEntry> {
        self.history.lock().await.clone()
    }

    pub async fn snapshots(&self) -> Vec<QuotaSnapshot> {
        self.snapshots.lock().await.clone()
    }

    /// Seed a reserved IP row directly; returns its id.
    pub async fn seed_reserved(
        &self,
        ip_address: &str,
        block_id: &str,
        status: ReservedIpStatus,
    ) -> i64 {
        let now = Utc::now();
        let id = self.next();
        self.reserved.lock().await.push(ReservedIp {
            id,
            ip_address: ip_address.to_string(),
            block_id: block_id.to_string(),
            uid: format!("uid-{id}"),
            location: "dc1".into(),
            status,
            is_blacklisted: false,
            blacklist_details: Json(Vec::new()),
            reserved_at: now,
            last_checked_at: None,
            released_at: None,
            assigned_to: None,
            usage_count: 0,
            metadata: Json(json!({})),
            notes: None,
            created_at: now,
            updated_at: now,
        });
        id
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn insert_reserved_ip(&self, ip: &NewReservedIp) -> Result<ReservedIp> {
        let mut reserved = self.reserved.lock().await;
        if reserved.iter().any(|r| r.ip_address == ip.ip_address) {
            return Err(ReputationError::Internal(anyhow!(
                "duplicate reserved IP {}",
                ip.ip_address
            )));
        }

        let now = Utc::now();
        let row = ReservedIp {
            id: self.next(),
            ip_address: ip.ip_address.clone(),
            block_id: ip.block_id.clone(),
            uid: ip.uid.clone(),
            location: ip.location.clone(),
            status: ip.status,
            is_blacklisted: ip.is_blacklisted,
            blacklist_details: Json(ip.blacklist_details.clone()),
            reserved_at: ip.reserved_at,
            last_checked_at: None,
            released_at: None,
            assigned_to: None,
            usage_count: 0,
            metadata: Json(ip.metadata.clone()),
            notes: None,
            created_at: now,
            updated_at: now,
        };
        reserved.push(row.clone());
        Ok(row)
    }

    async fn reserved_ip_by_id(&self, id: i64) -> Result<Option<ReservedIp>> {
        Ok(self
            .reserved
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn reserved_ip_by_address(&self, address: &str) -> Result<Option<ReservedIp>> {
        Ok(self
            .reserved
            .lock()
            .await
            .iter()
            .find(|r| r.ip_address == address)
            .cloned())
    }

    async fn list_reserved_ips(&self, filter: &ReservedIpFilter) -> Result<Vec<ReservedIp>> {
        let mut rows: Vec<ReservedIp> = self
            .reserved
            .lock()
            .await
            .iter()
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| filter.is_blacklisted.is_none_or(|b| r.is_blacklisted == b))
            .filter(|r| {
                filter
                    .location
                    .as_ref()
                    .is_none_or(|loc| &r.location == loc)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at));
        Ok(rows)
    }

    async fn update_status(
        &self,
        id: i64,
        status: ReservedIpStatus,
        assigned_to: Option<&str>,
    ) -> Result<()> {
        let mut reserved = self.reserved.lock().await;
        let row = reserved
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ReputationError::NotFound(format!("reserved IP {id}")))?;
        row.status = status;
        row.assigned_to = assigned_to.map(str::to_string);
        if status == ReservedIpStatus::Released && row.released_at.is_none() {
            row.released_at = Some(Utc::now());
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn update_blacklist_status(
        &self,
        id: i64,
        is_blacklisted: bool,
        zones: &[String],
    ) -> Result<()> {
        let mut reserved = self.reserved.lock().await;
        let row = reserved
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ReputationError::NotFound(format!("reserved IP {id}")))?;
        row.is_blacklisted = is_blacklisted;
        row.blacklist_details = Json(zones.to_vec());
        row.last_checked_at = Some(Utc::now());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_reserved_ip(&self, id: i64) -> Result<()> {
        let mut reserved = self.reserved.lock().await;
        let before = reserved.len();
        reserved.retain(|r| r.id != id);
        if reserved.len() == before {
            return Err(ReputationError::NotFound(format!("reserved IP {id}")));
        }
        Ok(())
    }

    async fn record_attempt(&self, attempt: &NewReservationAttempt) -> Result<()> {
        let id = self.next();
        self.attempts.lock().await.push(ReservationAttempt {
            id,
            attempt_uid: attempt.attempt_uid.clone(),
            block_id: attempt.block_id.clone(),
            ip_address: attempt.ip_address.clone(),
            location: attempt.location.clone(),
            success: attempt.success,
            failure_reason: attempt.failure_reason.clone(),
            was_blacklisted: attempt.was_blacklisted,
            blacklists_found: Json(attempt.blacklists_found.clone()),
            attempted_at: attempt.attempted_at,
            completed_at: attempt.completed_at,
            duration_ms: attempt.duration_ms,
            action_taken: attempt.action_taken,
            metadata: Json(attempt.metadata.clone()),
        });
        Ok(())
    }

    async fn record_blacklist_history(&self, entry: &NewBlacklistHistory) -> Result<()> {
        let id = self.next();
        self.history.lock().await.push(BlacklistHistoryEntry {
            id,
            reserved_ip_id: entry.reserved_ip_id,
            ip_address: entry.ip_address.clone(),
            checked_at: entry.checked_at,
            was_blacklisted: entry.was_blacklisted,
            blacklists_found: Json(entry.blacklists_found.clone()),
            check_duration_ms: entry.check_duration_ms,
            metadata: Json(entry.metadata.clone()),
        });
        Ok(())
    }

    async fn record_quota_snapshot(&self, snapshot: &NewQuotaSnapshot) -> Result<()> {
        let id = self.next();
        self.snapshots.lock().await.push(QuotaSnapshot {
            id,
            total_blocks: snapshot.total_blocks,
            estimated_limit: snapshot.estimated_limit,
            remaining: snapshot.remaining,
            protected_blocks: snapshot.protected_blocks,
            single_ip_blocks: snapshot.single_ip_blocks,
            location: snapshot.location.clone(),
            snapshot_at: snapshot.snapshot_at,
            metadata: Json(snapshot.metadata.clone()),
        });
        Ok(())
    }

    async fn block_ids_in_use(&self) -> Result<HashSet<String>> {
        Ok(self
            .reserved
            .lock()
            .await
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    ReservedIpStatus::Reserved | ReservedIpStatus::InUse
                )
            })
            .map(|r| r.block_id.clone())
            .collect())
    }

    async fn statistics(&self) -> Result<ReservationStatistics> {
        let reserved = self.reserved.lock().await;
        let mut by_status = std::collections::BTreeMap::new();
        for row in reserved.iter() {
            *by_status.entry(row.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(ReservationStatistics {
            by_status,
            blacklisted_count: reserved.iter().filter(|r| r.is_blacklisted).count() as i64,
            total_count: reserved.len() as i64,
        })
    }
}

/// Prober fake answering from a fixed table.
#[derive(Default)]
pub struct StaticProber {
    default_listings: Vec<String>,
    per_ip: HashMap<String, Vec<String>>,
    fail: bool,
}

impl StaticProber {
    /// Never listed.
    pub fn clean() -> Self {
        Self::default()
    }

    /// Every probed IP is listed on `zones`.
    pub fn listed(zones: &[&str]) -> Self {
        Self {
            default_listings: zones.iter().map(|z| z.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Every probe fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Override the answer for one IP.
    pub fn with_listing(mut self, ip: &str, zones: &[&str]) -> Self {
        self.per_ip
            .insert(ip.to_string(), zones.iter().map(|z| z.to_string()).collect());
        self
    }
}

#[async_trait]
impl BlocklistProber for StaticProber {
    async fn probe(&self, ip: &str) -> Result<DnsblProbe> {
        if self.fail {
            return Err(ReputationError::ProbeTimeout);
        }

        let listings = self
            .per_ip
            .get(ip)
            .cloned()
            .unwrap_or_else(|| self.default_listings.clone());
        Ok(DnsblProbe {
            ip: ip.to_string(),
            listed: !listings.is_empty(),
            listings,
            duration_ms: 1,
            checked_at: Utc::now(),
            zones_checked: 12,
            zones_failed: 0,
        })
    }
}

/// Upstream fake: reservations pop a queue, the account inventory is a
/// plain list, deletions are recorded.
#[derive(Default)]
pub struct FakeUpstream {
    queue: Mutex<VecDeque<IpBlock>>,
    blocks: Mutex<Vec<IpBlock>>,
    refetched: Mutex<HashMap<String, IpBlock>>,
    deleted: Mutex<Vec<String>>,
    failing_reserves: Mutex<u32>,
}

impl FakeUpstream {
    /// Next reservation calls will return this block.
    pub async fn enqueue(&self, block: IpBlock) {
        self.queue.lock().await.push_back(block);
    }

    /// Pre-existing account inventory (visible to list/get, not handed out
    /// by reservations).
    pub async fn seed_block(&self, block: IpBlock) {
        self.blocks.lock().await.push(block);
    }

    /// Answer for `get_block` after a block was handed out without IPs.
    pub async fn set_block_after_refetch(&self, id: &str, block: IpBlock) {
        self.refetched.lock().await.insert(id.to_string(), block);
    }

    /// The next `n` reservation calls fail.
    pub async fn fail_reserves(&self, n: u32) {
        *self.failing_reserves.lock().await = n;
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstream {
    async fn reserve_block(&self, _location: &str, _size: u32, _name: &str) -> Result<IpBlock> {
        {
            let mut failing = self.failing_reserves.lock().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(ReputationError::Upstream("injected reserve failure".into()));
            }
        }

        let block = self
            .queue
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ReputationError::Upstream("no blocks available".into()))?;
        self.blocks.lock().await.push(block.clone());
        Ok(block)
    }

    async fn get_block(&self, id: &str) -> Result<IpBlock> {
        if let Some(block) = self.refetched.lock().await.get(id) {
            return Ok(block.clone());
        }
        self.blocks
            .lock()
            .await
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| ReputationError::NotFound(format!("block {id}")))
    }

    async fn list_blocks(&self) -> Result<Vec<IpBlock>> {
        Ok(self.blocks.lock().await.clone())
    }

    async fn delete_block(&self, id: &str) -> Result<()> {
        self.blocks.lock().await.retain(|b| b.id != id);
        self.deleted.lock().await.push(id.to_string());
        Ok(())
    }
}
