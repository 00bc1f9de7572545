//! Persistence layer.
//!
//! Each trait matches one ownership boundary: the event log, the reputation
//! state (plus its audits and probe results), and the reservation
//! inventory. Workers and handlers depend on the traits; the `Pg*` types
//! are the production PostgreSQL bindings.

mod events;
mod inventory;
mod reputation;

pub use events::PgEventStore;
pub use inventory::PgInventoryStore;
pub use reputation::PgReputationStore;

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{
    DnsblCheckRecord, FailureEvent, IpAction, IpReputation, IpStatus, NewBlacklistHistory,
    NewDnsblCheck, NewFailureEvent, NewIpAction, NewIpReputation, NewQuotaSnapshot,
    NewReservationAttempt, NewReservedIp, ReservedIp, ReservedIpStatus,
};
use crate::Result;

/// Append-only log of delivery failures, deduplicated by fingerprint.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a failure event. Returns `false` when the fingerprint was
    /// already recorded; duplicates are never an error.
    async fn record_failure(&self, event: &NewFailureEvent) -> Result<bool>;

    /// Failures for one IP since `since`, newest first.
    async fn failures_for_ip_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailureEvent>>;

    /// Distinct sending IPs with at least one failure since `since`.
    async fn ips_with_activity_since(&self, since: DateTime<Utc>) -> Result<Vec<String>>;

    /// Remove events older than `cutoff`; returns the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Per-IP reputation state, its action audit, and persisted probe results.
#[async_trait]
pub trait ReputationStore: Send + Sync {
    async fn get_state(&self, ip: &str) -> Result<Option<IpReputation>>;

    /// Atomic replace keyed by IP.
    async fn upsert_state(&self, state: &NewIpReputation) -> Result<()>;

    /// All states, optionally filtered by status, newest `last_updated`
    /// first.
    async fn list_states(&self, status: Option<IpStatus>) -> Result<Vec<IpReputation>>;

    async fn append_action(&self, action: &NewIpAction) -> Result<()>;

    async fn recent_actions(&self, ip: &str, limit: i64) -> Result<Vec<IpAction>>;

    async fn insert_dnsbl_check(&self, check: &NewDnsblCheck) -> Result<()>;

    async fn latest_dnsbl_check(&self, ip: &str) -> Result<Option<DnsblCheckRecord>>;
}

/// List filter for reserved IPs.
#[derive(Debug, Clone, Default)]
pub struct ReservedIpFilter {
    pub status: Option<ReservedIpStatus>,
    pub is_blacklisted: Option<bool>,
    pub location: Option<String>,
}

/// Aggregate reservation statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ReservationStatistics {
    pub by_status: BTreeMap<String, i64>,
    pub blacklisted_count: i64,
    pub total_count: i64,
}

/// Lifecycle state for externally reserved IP blocks.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn insert_reserved_ip(&self, ip: &NewReservedIp) -> Result<ReservedIp>;

    async fn reserved_ip_by_id(&self, id: i64) -> Result<Option<ReservedIp>>;

    async fn reserved_ip_by_address(&self, address: &str) -> Result<Option<ReservedIp>>;

    async fn list_reserved_ips(&self, filter: &ReservedIpFilter) -> Result<Vec<ReservedIp>>;

    /// Update lifecycle status; `released` also stamps `released_at`.
    async fn update_status(
        &self,
        id: i64,
        status: ReservedIpStatus,
        assigned_to: Option<&str>,
    ) -> Result<()>;

    /// Update blacklist verdict and bump `last_checked_at`.
    async fn update_blacklist_status(
        &self,
        id: i64,
        is_blacklisted: bool,
        zones: &[String],
    ) -> Result<()>;

    async fn delete_reserved_ip(&self, id: i64) -> Result<()>;

    async fn record_attempt(&self, attempt: &NewReservationAttempt) -> Result<()>;

    async fn record_blacklist_history(&self, entry: &NewBlacklistHistory) -> Result<()>;

    async fn record_quota_snapshot(&self, snapshot: &NewQuotaSnapshot) -> Result<()>;

    /// Provider block ids referenced by `reserved` or `in_use` rows; the
    /// cleanup routine must not touch these.
    async fn block_ids_in_use(&self) -> Result<HashSet<String>>;

    async fn statistics(&self) -> Result<ReservationStatistics>;
}
