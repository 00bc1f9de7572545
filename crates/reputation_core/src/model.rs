//! Persisted entities of the reputation engine.
//!
//! Row types derive `sqlx::FromRow` and map 1:1 onto the tables created by
//! the API crate's migrations. Insert payloads are separate `New*` structs
//! so ids and database-assigned timestamps never travel in the wrong
//! direction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Reputation status of a sending IP, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "ip_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IpStatus {
    Healthy,
    Warning,
    Quarantine,
    Blacklisted,
}

impl IpStatus {
    /// Numeric mapping for status gauges; the `unknown` sentinel maps to 0.
    pub fn gauge_value(self) -> u8 {
        match self {
            IpStatus::Healthy => 1,
            IpStatus::Warning => 2,
            IpStatus::Quarantine => 3,
            IpStatus::Blacklisted => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IpStatus::Healthy => "healthy",
            IpStatus::Warning => "warning",
            IpStatus::Quarantine => "quarantine",
            IpStatus::Blacklisted => "blacklisted",
        }
    }
}

impl std::fmt::Display for IpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(IpStatus::Healthy),
            "warning" => Ok(IpStatus::Warning),
            "quarantine" => Ok(IpStatus::Quarantine),
            "blacklisted" => Ok(IpStatus::Blacklisted),
            other => Err(format!("unknown ip status: {other}")),
        }
    }
}

/// Lifecycle state of an externally reserved IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reserved_ip_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservedIpStatus {
    Reserved,
    InUse,
    Released,
    Quarantined,
}

impl ReservedIpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservedIpStatus::Reserved => "reserved",
            ReservedIpStatus::InUse => "in_use",
            ReservedIpStatus::Released => "released",
            ReservedIpStatus::Quarantined => "quarantined",
        }
    }
}

impl std::fmt::Display for ReservedIpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservedIpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservedIpStatus::Reserved),
            "in_use" => Ok(ReservedIpStatus::InUse),
            "released" => Ok(ReservedIpStatus::Released),
            "quarantined" => Ok(ReservedIpStatus::Quarantined),
            other => Err(format!("unknown reserved ip status: {other}")),
        }
    }
}

/// What the audit trail records about an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ActionKind {
    StatusChange,
    ManualQuarantine,
    DnsblProbeTriggered,
}

/// Who caused an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TriggerSource {
    Automated,
    Manual,
}

/// Fate of a single upstream reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ActionTaken {
    Kept,
    Deleted,
    Quarantined,
    KeptButNotStored,
}

/// Extract the recipient domain from an address: everything after the final
/// `@`, lower-cased. Inputs without `@` are treated as bare domains.
pub fn extract_domain(address: &str) -> String {
    match address.rfind('@') {
        Some(at) => address[at + 1..].to_lowercase(),
        None => address.to_lowercase(),
    }
}

/// A single SMTP delivery failure, immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailureEvent {
    pub id: i64,
    pub sending_ip: String,
    pub recipient_email: String,
    pub recipient_domain: String,
    pub smtp_code: i32,
    pub enhanced_code: String,
    pub reason: String,
    pub mx_host: String,
    pub occurred_at: DateTime<Utc>,
    /// Externally supplied unique id; sole basis of deduplication
    pub fingerprint: String,
    pub attempt_number: i32,
}

/// Insert payload for [`FailureEvent`].
#[derive(Debug, Clone)]
pub struct NewFailureEvent {
    pub sending_ip: String,
    pub recipient_email: String,
    pub recipient_domain: String,
    pub smtp_code: i32,
    pub enhanced_code: String,
    pub reason: String,
    pub mx_host: String,
    pub occurred_at: DateTime<Utc>,
    pub fingerprint: String,
    pub attempt_number: i32,
}

impl NewFailureEvent {
    /// Build an event, deriving the recipient domain from the address.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sending_ip: impl Into<String>,
        recipient_email: impl Into<String>,
        smtp_code: i32,
        enhanced_code: impl Into<String>,
        reason: impl Into<String>,
        mx_host: impl Into<String>,
        occurred_at: DateTime<Utc>,
        fingerprint: impl Into<String>,
        attempt_number: i32,
    ) -> Self {
        let recipient_email = recipient_email.into();
        let recipient_domain = extract_domain(&recipient_email);
        Self {
            sending_ip: sending_ip.into(),
            recipient_email,
            recipient_domain,
            smtp_code,
            enhanced_code: enhanced_code.into(),
            reason: reason.into(),
            mx_host: mx_host.into(),
            occurred_at,
            fingerprint: fingerprint.into(),
            attempt_number,
        }
    }
}

/// Current rolling-window reputation state of one sending IP.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IpReputation {
    pub id: i64,
    pub ip: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_sent: i64,
    pub total_rejected: i64,
    pub rejection_ratio: f64,
    pub unique_domains_rejected: i32,
    pub reason_counts: Json<BTreeMap<String, i64>>,
    pub major_providers_rejecting: Json<Vec<String>>,
    pub status: IpStatus,
    pub last_updated: DateTime<Utc>,
    pub metadata: Json<serde_json::Value>,
}

/// Upsert payload for [`IpReputation`], keyed by IP.
#[derive(Debug, Clone)]
pub struct NewIpReputation {
    pub ip: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_sent: i64,
    pub total_rejected: i64,
    pub rejection_ratio: f64,
    pub unique_domains_rejected: i32,
    pub reason_counts: BTreeMap<String, i64>,
    pub major_providers_rejecting: Vec<String>,
    pub status: IpStatus,
    pub last_updated: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Append-only audit record of an action taken on an IP.
///
/// `previous_status` is NULL for entries that do not describe a transition
/// from a previously known state (manual interventions, probe triggers).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IpAction {
    pub id: i64,
    pub ip: String,
    pub action: ActionKind,
    pub previous_status: Option<IpStatus>,
    pub new_status: IpStatus,
    pub reason: String,
    pub trigger: TriggerSource,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for [`IpAction`].
#[derive(Debug, Clone)]
pub struct NewIpAction {
    pub ip: String,
    pub action: ActionKind,
    pub previous_status: Option<IpStatus>,
    pub new_status: IpStatus,
    pub reason: String,
    pub trigger: TriggerSource,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Persisted result of a DNSBL probe.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DnsblCheckRecord {
    pub id: i64,
    pub ip: String,
    pub checked_at: DateTime<Utc>,
    pub listed: bool,
    pub listings: Json<Vec<String>>,
    pub duration_ms: i64,
    pub metadata: Json<serde_json::Value>,
}

/// Insert payload for [`DnsblCheckRecord`].
#[derive(Debug, Clone)]
pub struct NewDnsblCheck {
    pub ip: String,
    pub checked_at: DateTime<Utc>,
    pub listed: bool,
    pub listings: Vec<String>,
    pub duration_ms: i64,
    pub metadata: serde_json::Value,
}

/// An IP block reserved upstream that passed DNSBL vetting at creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReservedIp {
    pub id: i64,
    pub ip_address: String,
    /// Provider-side block id; stable for the lifetime of the IP
    pub block_id: String,
    pub uid: String,
    pub location: String,
    pub status: ReservedIpStatus,
    pub is_blacklisted: bool,
    pub blacklist_details: Json<Vec<String>>,
    pub reserved_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub assigned_to: Option<String>,
    pub usage_count: i32,
    pub metadata: Json<serde_json::Value>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for [`ReservedIp`].
#[derive(Debug, Clone)]
pub struct NewReservedIp {
    pub ip_address: String,
    pub block_id: String,
    pub uid: String,
    pub location: String,
    pub status: ReservedIpStatus,
    pub is_blacklisted: bool,
    pub blacklist_details: Vec<String>,
    pub reserved_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Append-only record of one upstream reservation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReservationAttempt {
    pub id: i64,
    pub attempt_uid: String,
    pub block_id: Option<String>,
    pub ip_address: Option<String>,
    pub location: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub was_blacklisted: bool,
    pub blacklists_found: Json<Vec<String>>,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub action_taken: Option<ActionTaken>,
    pub metadata: Json<serde_json::Value>,
}

/// Insert payload for [`ReservationAttempt`].
#[derive(Debug, Clone)]
pub struct NewReservationAttempt {
    pub attempt_uid: String,
    pub block_id: Option<String>,
    pub ip_address: Option<String>,
    pub location: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub was_blacklisted: bool,
    pub blacklists_found: Vec<String>,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub action_taken: Option<ActionTaken>,
    pub metadata: serde_json::Value,
}

/// Append-only blacklist check history for a reserved IP.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BlacklistHistoryEntry {
    pub id: i64,
    pub reserved_ip_id: i64,
    pub ip_address: String,
    pub checked_at: DateTime<Utc>,
    pub was_blacklisted: bool,
    pub blacklists_found: Json<Vec<String>>,
    pub check_duration_ms: i64,
    pub metadata: Json<serde_json::Value>,
}

/// Insert payload for [`BlacklistHistoryEntry`].
#[derive(Debug, Clone)]
pub struct NewBlacklistHistory {
    pub reserved_ip_id: i64,
    pub ip_address: String,
    pub checked_at: DateTime<Utc>,
    pub was_blacklisted: bool,
    pub blacklists_found: Vec<String>,
    pub check_duration_ms: i64,
    pub metadata: serde_json::Value,
}

/// Point-in-time snapshot of upstream quota usage.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaSnapshot {
    pub id: i64,
    pub total_blocks: i32,
    pub estimated_limit: i32,
    pub remaining: i32,
    pub protected_blocks: i32,
    pub single_ip_blocks: i32,
    pub location: Option<String>,
    pub snapshot_at: DateTime<Utc>,
    pub metadata: Json<serde_json::Value>,
}

/// Insert payload for [`QuotaSnapshot`].
#[derive(Debug, Clone)]
pub struct NewQuotaSnapshot {
    pub total_blocks: i32,
    pub estimated_limit: i32,
    pub remaining: i32,
    pub protected_blocks: i32,
    pub single_ip_blocks: i32,
    pub location: Option<String>,
    pub snapshot_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction_lowercases_and_takes_last_at() {
        assert_eq!(extract_domain("local@DoMaIn.TLD"), "domain.tld");
        assert_eq!(extract_domain("a@b@gmail.com"), "gmail.com");
        assert_eq!(extract_domain("user@Example.COM"), "example.com");
        assert_eq!(extract_domain("Example.com"), "example.com");
        assert_eq!(extract_domain("trailing@"), "");
    }

    #[test]
    fn status_ordering_tracks_severity() {
        assert!(IpStatus::Healthy < IpStatus::Warning);
        assert!(IpStatus::Warning < IpStatus::Quarantine);
        assert!(IpStatus::Quarantine < IpStatus::Blacklisted);
    }

    #[test]
    fn status_gauge_values() {
        assert_eq!(IpStatus::Healthy.gauge_value(), 1);
        assert_eq!(IpStatus::Warning.gauge_value(), 2);
        assert_eq!(IpStatus::Quarantine.gauge_value(), 3);
        assert_eq!(IpStatus::Blacklisted.gauge_value(), 4);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            IpStatus::Healthy,
            IpStatus::Warning,
            IpStatus::Quarantine,
            IpStatus::Blacklisted,
        ] {
            assert_eq!(status.as_str().parse::<IpStatus>().unwrap(), status);
        }
        for status in [
            ReservedIpStatus::Reserved,
            ReservedIpStatus::InUse,
            ReservedIpStatus::Released,
            ReservedIpStatus::Quarantined,
        ] {
            assert_eq!(status.as_str().parse::<ReservedIpStatus>().unwrap(), status);
        }
        assert!("banana".parse::<IpStatus>().is_err());
    }

    #[test]
    fn new_failure_event_derives_domain() {
        let event = NewFailureEvent::new(
            "203.0.113.7",
            "someone@Gmail.com",
            550,
            "5.7.1",
            "blocked",
            "gmail-smtp-in.l.google.com",
            Utc::now(),
            "evt-1",
            1,
        );
        assert_eq!(event.recipient_domain, "gmail.com");
    }
}
