//! Reservation-and-vet workflow against the upstream block API.
//!
//! Ordering an IP is a loop: reserve a single-IP block, probe it against
//! the blocklists, keep it if clean, delete it if listed, and try again.
//! The loop is bounded by `count × 5` attempts so a run of dirty upstream
//! inventory cannot spin forever. Every attempt is recorded whether it
//! succeeds or not.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dnsbl::BlocklistProber;
use crate::model::{
    ActionTaken, NewBlacklistHistory, NewQuotaSnapshot, NewReservationAttempt, NewReservedIp,
    ReservedIp, ReservedIpStatus,
};
use crate::store::InventoryStore;
use crate::upstream::{IpBlock, UpstreamClient};
use crate::{ProvisionerConfig, ReputationError, Result};

/// Blocks of this declared size are never deleted by cleanup, regardless of
/// what the inventory database says about them.
const PROTECTED_BLOCK_SIZE: u32 = 11;

/// Largest number of IPs a single reservation request may order.
pub const MAX_RESERVE_COUNT: u32 = 50;

/// How long to wait before re-fetching a block that arrived without IPs.
const IP_ASSIGNMENT_WAIT: Duration = Duration::from_secs(5);

/// Result of a reservation run.
#[derive(Debug, Serialize)]
pub struct ReserveOutcome {
    pub success_count: u32,
    pub failure_count: u32,
    pub blacklisted_count: u32,
    pub reserved_ips: Vec<ReservedIp>,
    pub attempts: u32,
}

/// Upstream quota usage derived from the block listing.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaInfo {
    pub total_blocks: u32,
    pub protected_blocks: u32,
    pub single_ip_blocks: u32,
    pub estimated_limit: u32,
    pub remaining: i64,
}

fn is_protected_block(block: &IpBlock) -> bool {
    block.properties.size == PROTECTED_BLOCK_SIZE
        || block.properties.ips.len() == PROTECTED_BLOCK_SIZE as usize
}

/// Cleanup predicate: an unprotected single-IP block that no live
/// reservation references.
fn is_deletable_single_ip_block(block: &IpBlock, referenced: &HashSet<String>) -> bool {
    if is_protected_block(block) {
        return false;
    }
    if referenced.contains(&block.id) {
        return false;
    }
    block.properties.size == 1 || block.properties.ips.len() == 1
}

enum VetOutcome {
    Kept(ReservedIp),
    Blacklisted,
}

/// Drives acquisition, vetting and cleanup of reserved IPs.
pub struct Provisioner {
    upstream: Arc<dyn UpstreamClient>,
    prober: Arc<dyn BlocklistProber>,
    inventory: Arc<dyn InventoryStore>,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        prober: Arc<dyn BlocklistProber>,
        inventory: Arc<dyn InventoryStore>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            upstream,
            prober,
            inventory,
            config,
        }
    }

    /// Reserve `count` clean IPs, retrying past blacklisted inventory up to
    /// `count × 5` attempts.
    pub async fn reserve_clean_ips(
        &self,
        count: u32,
        location: Option<&str>,
    ) -> Result<ReserveOutcome> {
        if count == 0 || count > MAX_RESERVE_COUNT {
            return Err(ReputationError::InvalidInput(format!(
                "count must be between 1 and {MAX_RESERVE_COUNT}"
            )));
        }
        let location = location.unwrap_or(&self.config.default_location).to_string();

        let quota = self.check_quota().await?;
        if quota.remaining < count as i64 {
            return Err(ReputationError::QuotaExceeded {
                requested: count,
                remaining: quota.remaining,
            });
        }

        info!(count, location = %location, "starting IP reservation run");

        let mut outcome = ReserveOutcome {
            success_count: 0,
            failure_count: 0,
            blacklisted_count: 0,
            reserved_ips: Vec::new(),
            attempts: 0,
        };
        let max_attempts = count * 5;

        while outcome.success_count < count && outcome.attempts < max_attempts {
            outcome.attempts += 1;

            match self.reserve_single(&location).await {
                Ok(VetOutcome::Kept(reserved)) => {
                    outcome.success_count += 1;
                    outcome.reserved_ips.push(reserved);
                }
                Ok(VetOutcome::Blacklisted) => outcome.blacklisted_count += 1,
                Err(err) => {
                    warn!(error = %err, attempt = outcome.attempts, "reservation attempt failed");
                    outcome.failure_count += 1;
                }
            }

            // Upstream rate-limit hygiene between attempts.
            if outcome.success_count < count && outcome.attempts < max_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.inter_attempt_delay_ms)).await;
            }
        }

        info!(
            success = outcome.success_count,
            blacklisted = outcome.blacklisted_count,
            failures = outcome.failure_count,
            attempts = outcome.attempts,
            "IP reservation run complete"
        );
        Ok(outcome)
    }

    /// Reserve one block, vet its IP, and keep or drop it.
    async fn reserve_single(&self, location: &str) -> Result<VetOutcome> {
        let started = std::time::Instant::now();
        let attempted_at = Utc::now();
        let uid = Uuid::new_v4().simple().to_string()[..8].to_string();
        let block_name = format!("ip-reserve-{uid}");

        let mut attempt = NewReservationAttempt {
            attempt_uid: uid.clone(),
            block_id: None,
            ip_address: None,
            location: location.to_string(),
            success: false,
            failure_reason: None,
            was_blacklisted: false,
            blacklists_found: Vec::new(),
            attempted_at,
            completed_at: None,
            duration_ms: None,
            action_taken: None,
            metadata: json!({}),
        };

        let block = match self
            .upstream
            .reserve_block(location, self.config.default_block_size, &block_name)
            .await
        {
            Ok(block) => block,
            Err(err) => {
                self.finish_attempt(&mut attempt, started, Some(err.to_string()), None)
                    .await;
                return Err(err);
            }
        };
        attempt.block_id = Some(block.id.clone());

        // Some orders come back before the address is assigned; give the
        // provider one chance to catch up.
        let block = if block.properties.ips.is_empty() {
            info!(block_id = %block.id, "block has no IPs yet, waiting for assignment");
            tokio::time::sleep(IP_ASSIGNMENT_WAIT).await;
            match self.upstream.get_block(&block.id).await {
                Ok(refreshed) => refreshed,
                Err(err) => {
                    self.finish_attempt(
                        &mut attempt,
                        started,
                        Some(format!("failed to re-fetch block: {err}")),
                        None,
                    )
                    .await;
                    return Err(err);
                }
            }
        } else {
            block
        };

        let Some(ip_address) = block.properties.ips.first().cloned() else {
            self.finish_attempt(
                &mut attempt,
                started,
                Some("no IPs assigned to block".into()),
                None,
            )
            .await;
            return Err(ReputationError::Upstream(format!(
                "no IPs assigned to block {}",
                block.id
            )));
        };
        attempt.ip_address = Some(ip_address.clone());

        info!(ip = %ip_address, block_id = %block.id, "block reserved, vetting against blocklists");

        // A failed probe never kills the reservation; the IP is assumed
        // clean and the uncertainty is flagged on the attempt.
        let (listed, listings, probe_failed) = match self.prober.probe(&ip_address).await {
            Ok(probe) => (probe.listed, probe.listings, false),
            Err(err) => {
                warn!(ip = %ip_address, error = %err, "blocklist vetting failed, assuming clean");
                (false, Vec::new(), true)
            }
        };
        if probe_failed {
            attempt.metadata = json!({ "probe_failed": true });
        }
        attempt.was_blacklisted = listed;
        attempt.blacklists_found = listings.clone();

        if listed {
            warn!(ip = %ip_address, zones = ?listings, "reserved IP is blacklisted, dropping block");
            if let Err(err) = self.upstream.delete_block(&block.id).await {
                warn!(block_id = %block.id, error = %err, "failed to delete blacklisted block");
            }
            self.finish_attempt(&mut attempt, started, None, Some(ActionTaken::Deleted))
                .await;
            return Ok(VetOutcome::Blacklisted);
        }

        let reserved = match self
            .inventory
            .insert_reserved_ip(&NewReservedIp {
                ip_address: ip_address.clone(),
                block_id: block.id.clone(),
                uid,
                location: location.to_string(),
                status: ReservedIpStatus::Reserved,
                is_blacklisted: false,
                blacklist_details: Vec::new(),
                reserved_at: attempted_at,
                metadata: attempt.metadata.clone(),
            })
            .await
        {
            Ok(reserved) => reserved,
            Err(err) => {
                self.finish_attempt(
                    &mut attempt,
                    started,
                    Some(format!("inventory write failed: {err}")),
                    Some(ActionTaken::KeptButNotStored),
                )
                .await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .inventory
            .record_blacklist_history(&NewBlacklistHistory {
                reserved_ip_id: reserved.id,
                ip_address: ip_address.clone(),
                checked_at: Utc::now(),
                was_blacklisted: false,
                blacklists_found: Vec::new(),
                check_duration_ms: started.elapsed().as_millis() as i64,
                metadata: json!({}),
            })
            .await
        {
            warn!(ip = %ip_address, error = %err, "failed to record blacklist history");
        }

        attempt.success = true;
        self.finish_attempt(&mut attempt, started, None, Some(ActionTaken::Kept))
            .await;

        info!(ip = %ip_address, block_id = %reserved.block_id, "clean IP reserved");
        Ok(VetOutcome::Kept(reserved))
    }

    /// Stamp completion fields and persist the attempt; audit-write
    /// failures are logged, never propagated.
    async fn finish_attempt(
        &self,
        attempt: &mut NewReservationAttempt,
        started: std::time::Instant,
        failure_reason: Option<String>,
        action_taken: Option<ActionTaken>,
    ) {
        attempt.failure_reason = failure_reason;
        attempt.action_taken = action_taken;
        attempt.completed_at = Some(Utc::now());
        attempt.duration_ms = Some(started.elapsed().as_millis() as i64);

        if let Err(err) = self.inventory.record_attempt(attempt).await {
            warn!(attempt_uid = %attempt.attempt_uid, error = %err, "failed to record reservation attempt");
        }
    }

    /// Derive quota usage from the upstream block listing and snapshot it.
    pub async fn check_quota(&self) -> Result<QuotaInfo> {
        let blocks = self.upstream.list_blocks().await?;

        let mut quota = QuotaInfo {
            total_blocks: blocks.len() as u32,
            protected_blocks: 0,
            single_ip_blocks: 0,
            estimated_limit: self.config.estimated_quota,
            remaining: 0,
        };
        for block in &blocks {
            if is_protected_block(block) {
                quota.protected_blocks += 1;
            } else if block.properties.size == 1 || block.properties.ips.len() == 1 {
                quota.single_ip_blocks += 1;
            }
        }
        quota.remaining = quota.estimated_limit as i64 - quota.total_blocks as i64;

        if let Err(err) = self
            .inventory
            .record_quota_snapshot(&NewQuotaSnapshot {
                total_blocks: quota.total_blocks as i32,
                estimated_limit: quota.estimated_limit as i32,
                remaining: quota.remaining as i32,
                protected_blocks: quota.protected_blocks as i32,
                single_ip_blocks: quota.single_ip_blocks as i32,
                location: None,
                snapshot_at: Utc::now(),
                metadata: json!({}),
            })
            .await
        {
            warn!(error = %err, "failed to record quota snapshot");
        }

        Ok(quota)
    }

    /// Delete unreferenced single-IP blocks upstream. Size-11 blocks are
    /// invariantly skipped.
    pub async fn cleanup_single_ip_blocks(&self) -> Result<u32> {
        let blocks = self.upstream.list_blocks().await?;
        let referenced = self.inventory.block_ids_in_use().await?;

        let mut deleted = 0u32;
        for block in &blocks {
            if !is_deletable_single_ip_block(block, &referenced) {
                continue;
            }

            info!(block_id = %block.id, name = %block.properties.name, "deleting orphaned single-IP block");
            match self.upstream.delete_block(&block.id).await {
                Ok(()) => {
                    deleted += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.cleanup_delete_delay_ms))
                        .await;
                }
                Err(err) => {
                    warn!(block_id = %block.id, error = %err, "failed to delete block");
                }
            }
        }

        info!(deleted, "single-IP block cleanup complete");
        Ok(deleted)
    }

    /// Re-probe a reserved IP and update its blacklist state and history.
    pub async fn recheck_blacklist(&self, id: i64) -> Result<ReservedIp> {
        let reserved = self
            .inventory
            .reserved_ip_by_id(id)
            .await?
            .ok_or_else(|| ReputationError::NotFound(format!("reserved IP {id}")))?;

        info!(ip = %reserved.ip_address, "rechecking blocklist status");
        let probe = self.prober.probe(&reserved.ip_address).await?;

        self.inventory
            .update_blacklist_status(id, probe.listed, &probe.listings)
            .await?;

        if let Err(err) = self
            .inventory
            .record_blacklist_history(&NewBlacklistHistory {
                reserved_ip_id: id,
                ip_address: reserved.ip_address.clone(),
                checked_at: probe.checked_at,
                was_blacklisted: probe.listed,
                blacklists_found: probe.listings.clone(),
                check_duration_ms: probe.duration_ms as i64,
                metadata: json!({}),
            })
            .await
        {
            warn!(ip = %reserved.ip_address, error = %err, "failed to record blacklist history");
        }

        self.inventory
            .reserved_ip_by_id(id)
            .await?
            .ok_or_else(|| ReputationError::NotFound(format!("reserved IP {id}")))
    }

    /// Best-effort upstream deletion used when a reservation row is removed.
    pub async fn release_block(&self, block_id: &str) {
        if let Err(err) = self.upstream.delete_block(block_id).await {
            warn!(block_id = %block_id, error = %err, "failed to delete upstream block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_block, FakeUpstream, MemoryInventoryStore, StaticProber};
    use proptest::prelude::*;

    fn test_config() -> ProvisionerConfig {
        ProvisionerConfig {
            inter_attempt_delay_ms: 0,
            cleanup_delete_delay_ms: 0,
            ..ProvisionerConfig::default()
        }
    }

    fn provisioner(
        upstream: Arc<FakeUpstream>,
        prober: StaticProber,
        inventory: Arc<MemoryInventoryStore>,
    ) -> Provisioner {
        Provisioner::new(upstream, Arc::new(prober), inventory, test_config())
    }

    #[tokio::test]
    async fn reserves_clean_ips_and_records_audit_trail() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.enqueue(make_block("blk-1", 1, &["198.51.100.1"])).await;
        upstream.enqueue(make_block("blk-2", 1, &["198.51.100.2"])).await;
        let inventory = Arc::new(MemoryInventoryStore::default());

        let prov = provisioner(Arc::clone(&upstream), StaticProber::clean(), Arc::clone(&inventory));
        let outcome = prov.reserve_clean_ips(2, None).await.unwrap();

        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failure_count, 0);
        assert_eq!(outcome.blacklisted_count, 0);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.reserved_ips.len(), 2);
        assert_eq!(outcome.reserved_ips[0].status, ReservedIpStatus::Reserved);

        let attempts = inventory.attempts().await;
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.success));
        assert!(attempts
            .iter()
            .all(|a| a.action_taken == Some(ActionTaken::Kept)));
        assert_eq!(inventory.history().await.len(), 2);
    }

    #[tokio::test]
    async fn blacklisted_ip_is_deleted_and_retried() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.enqueue(make_block("blk-dirty", 1, &["198.51.100.9"])).await;
        upstream.enqueue(make_block("blk-clean", 1, &["198.51.100.10"])).await;
        let inventory = Arc::new(MemoryInventoryStore::default());

        let prober = StaticProber::clean().with_listing("198.51.100.9", &["zen.spamhaus.org"]);
        let prov = provisioner(Arc::clone(&upstream), prober, Arc::clone(&inventory));
        let outcome = prov.reserve_clean_ips(1, Some("dc2")).await.unwrap();

        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.blacklisted_count, 1);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.reserved_ips[0].ip_address, "198.51.100.10");
        assert_eq!(upstream.deleted().await, vec!["blk-dirty".to_string()]);

        let attempts = inventory.attempts().await;
        assert_eq!(attempts[0].action_taken, Some(ActionTaken::Deleted));
        assert!(attempts[0].was_blacklisted);
        assert_eq!(attempts[1].action_taken, Some(ActionTaken::Kept));
    }

    #[tokio::test]
    async fn quota_exhaustion_aborts_before_reserving() {
        let upstream = Arc::new(FakeUpstream::default());
        for i in 0..50 {
            upstream
                .seed_block(make_block(&format!("blk-{i}"), 1, &[]))
                .await;
        }
        let inventory = Arc::new(MemoryInventoryStore::default());

        let prov = provisioner(Arc::clone(&upstream), StaticProber::clean(), inventory);
        match prov.reserve_clean_ips(1, None).await {
            Err(ReputationError::QuotaExceeded { requested, remaining }) => {
                assert_eq!(requested, 1);
                assert_eq!(remaining, 0);
            }
            other => panic!("expected quota exceeded, got {other:?}"),
        }
        assert!(upstream.deleted().await.is_empty());
    }

    #[tokio::test]
    async fn attempt_budget_bounds_upstream_churn() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.fail_reserves(100).await;
        let inventory = Arc::new(MemoryInventoryStore::default());

        let prov = provisioner(Arc::clone(&upstream), StaticProber::clean(), Arc::clone(&inventory));
        let outcome = prov.reserve_clean_ips(2, None).await.unwrap();

        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.attempts, 10);
        assert_eq!(outcome.failure_count, 10);
        assert_eq!(inventory.attempts().await.len(), 10);
        assert!(inventory
            .attempts()
            .await
            .iter()
            .all(|a| !a.success && a.failure_reason.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_ip_assignment_is_refetched_once() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.enqueue(make_block("blk-slow", 1, &[])).await;
        upstream
            .set_block_after_refetch("blk-slow", make_block("blk-slow", 1, &["198.51.100.20"]))
            .await;
        let inventory = Arc::new(MemoryInventoryStore::default());

        let prov = provisioner(Arc::clone(&upstream), StaticProber::clean(), Arc::clone(&inventory));
        let outcome = prov.reserve_clean_ips(1, None).await.unwrap();

        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.reserved_ips[0].ip_address, "198.51.100.20");
    }

    #[tokio::test]
    async fn cleanup_deletes_only_orphaned_single_ip_blocks() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.seed_block(make_block("blk-orphan", 1, &["198.51.100.30"])).await;
        upstream.seed_block(make_block("blk-live", 1, &["198.51.100.31"])).await;
        upstream.seed_block(make_block("blk-protected", 11, &[])).await;
        upstream.seed_block(make_block("blk-wide", 4, &[])).await;

        let inventory = Arc::new(MemoryInventoryStore::default());
        inventory
            .seed_reserved("198.51.100.31", "blk-live", ReservedIpStatus::InUse)
            .await;

        let prov = provisioner(Arc::clone(&upstream), StaticProber::clean(), inventory);
        let deleted = prov.cleanup_single_ip_blocks().await.unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(upstream.deleted().await, vec!["blk-orphan".to_string()]);
    }

    #[tokio::test]
    async fn recheck_updates_state_and_history() {
        let upstream = Arc::new(FakeUpstream::default());
        let inventory = Arc::new(MemoryInventoryStore::default());
        let id = inventory
            .seed_reserved("198.51.100.40", "blk-40", ReservedIpStatus::Reserved)
            .await;

        let prober = StaticProber::clean().with_listing("198.51.100.40", &["bl.spamcop.net"]);
        let prov = provisioner(upstream, prober, Arc::clone(&inventory));
        let updated = prov.recheck_blacklist(id).await.unwrap();

        assert!(updated.is_blacklisted);
        assert_eq!(updated.blacklist_details.0, vec!["bl.spamcop.net".to_string()]);
        assert!(updated.last_checked_at.is_some());

        let history = inventory.history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].was_blacklisted);
    }

    #[tokio::test]
    async fn recheck_of_missing_ip_is_not_found() {
        let prov = provisioner(
            Arc::new(FakeUpstream::default()),
            StaticProber::clean(),
            Arc::new(MemoryInventoryStore::default()),
        );
        assert!(matches!(
            prov.recheck_blacklist(404).await,
            Err(ReputationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn count_bounds_are_enforced() {
        let prov = provisioner(
            Arc::new(FakeUpstream::default()),
            StaticProber::clean(),
            Arc::new(MemoryInventoryStore::default()),
        );
        for count in [0u32, 51] {
            let result = prov.reserve_clean_ips(count, None).await;
            assert!(matches!(result, Err(ReputationError::InvalidInput(_))));
        }
    }

    fn arb_block() -> impl Strategy<Value = IpBlock> {
        (
            "[a-z0-9]{4,10}",
            0u32..16,
            proptest::collection::vec("[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}", 0..13),
        )
            .prop_map(|(id, size, ips)| {
                make_block(&id, size, &ips.iter().map(String::as_str).collect::<Vec<_>>())
            })
    }

    proptest! {
        // The protected-block rule holds for every inventory shape: no
        // size-11 block is ever deletable, referenced or not.
        #[test]
        fn protected_blocks_never_deletable(
            blocks in proptest::collection::vec(arb_block(), 0..20),
            referenced_mask in proptest::collection::vec(any::<bool>(), 0..20)
        ) {
            let referenced: HashSet<String> = blocks
                .iter()
                .zip(referenced_mask.iter().chain(std::iter::repeat(&false)))
                .filter(|(_, include)| **include)
                .map(|(block, _)| block.id.clone())
                .collect();

            for block in &blocks {
                let deletable = is_deletable_single_ip_block(block, &referenced);
                if block.properties.size == 11 || block.properties.ips.len() == 11 {
                    prop_assert!(!deletable, "protected block {} was deletable", block.id);
                }
                if referenced.contains(&block.id) {
                    prop_assert!(!deletable, "referenced block {} was deletable", block.id);
                }
                if deletable {
                    prop_assert!(
                        block.properties.size == 1 || block.properties.ips.len() == 1
                    );
                }
            }
        }
    }
}
