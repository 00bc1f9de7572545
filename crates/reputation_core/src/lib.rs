//! # reputation_core
//!
//! Deliverability reputation engine for outbound sending IPs: ingestion of
//! SMTP delivery failures, rolling-window health classification, DNSBL
//! probing, and the lifecycle of externally reserved IP blocks.
//!
//! ## Features
//!
//! - **Pure, code-aware classifier** mapping a window of failures to a
//!   status tier (`healthy` → `warning` → `quarantine` → `blacklisted`)
//! - **Aggregation worker** folding raw failure events into per-IP state
//!   with transition auditing
//! - **DNSBL prober** with bounded fan-out, per-zone timeouts and an
//!   ignore-list for zones known to produce noise
//! - **Provisioner** driving an acquire-vet-commit loop against an upstream
//!   block-reservation API
//! - **PostgreSQL stores** behind repository traits so workers stay
//!   testable without a live database
//!
//! ## Example
//!
//! ```rust
//! use reputation_core::classifier::{classify, HealthSnapshot};
//! use reputation_core::ReputationConfig;
//!
//! let config = ReputationConfig::default();
//! let snapshot = HealthSnapshot::from_failures("203.0.113.10", 500, &[]);
//! let status = classify(&snapshot, &config);
//! println!("status: {status}");
//! ```

pub mod aggregator;
pub mod classifier;
pub mod dnsbl;
pub mod model;
pub mod provisioner;
pub mod store;
pub mod upstream;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Thresholds driving the reputation classifier and the aggregation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Rolling assessment window in minutes
    pub window_minutes: u32,
    /// Below this estimated send volume an IP is never assessed
    pub min_volume_for_assessment: u64,
    /// Rejection ratio above which blacklisting is considered
    pub blacklist_rejection_ratio: f64,
    /// Minimum distinct rejecting domains for blacklisting
    pub blacklist_min_domains: usize,
    /// Minimum distinct rejecting major providers for blacklisting
    pub blacklist_min_major_providers: usize,
    /// Rejection ratio above which quarantine is considered
    pub quarantine_rejection_ratio: f64,
    /// Minimum distinct rejecting domains for the quarantine fallback rule
    pub quarantine_min_domains: usize,
    /// Rejection ratio at which a warning is raised
    pub warning_rejection_ratio: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            window_minutes: 15,
            min_volume_for_assessment: 50,
            blacklist_rejection_ratio: 0.05,
            blacklist_min_domains: 3,
            blacklist_min_major_providers: 2,
            quarantine_rejection_ratio: 0.03,
            quarantine_min_domains: 2,
            warning_rejection_ratio: 0.02,
        }
    }
}

/// DNSBL prober configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsblConfig {
    /// Zones queried for every probe
    pub zones: Vec<String>,
    /// Zones whose positive answers are discarded before aggregation
    pub ignored: Vec<String>,
    /// Per-zone lookup timeout in milliseconds
    pub per_zone_timeout_ms: u64,
    /// Shared deadline for a whole probe in milliseconds
    pub overall_timeout_ms: u64,
    /// Maximum concurrently probed IPs in a batch
    pub batch_concurrency: usize,
}

impl Default for DnsblConfig {
    fn default() -> Self {
        Self {
            zones: vec![
                "zen.spamhaus.org".into(),
                "b.barracudacentral.org".into(),
                "bl.spamcop.net".into(),
                "cbl.abuseat.org".into(),
                "dyna.spamrats.com".into(),
                "noptr.spamrats.com".into(),
                "spam.spamrats.com".into(),
                "ix.dnsbl.manitu.net".into(),
                "dnsbl.sorbs.net".into(),
                "psbl.surriel.com".into(),
                "ubl.unsubscore.com".into(),
                "dnsbl.dronebl.org".into(),
            ],
            ignored: vec![
                "dnsbl-1.uceprotect.net".into(),
                "dnsbl-2.uceprotect.net".into(),
                "dnsbl-3.uceprotect.net".into(),
                "sip.invaluement.com".into(),
                "sip24.invaluement.com".into(),
            ],
            per_zone_timeout_ms: 2_000,
            overall_timeout_ms: 5_000,
            batch_concurrency: 8,
        }
    }
}

/// Provisioner and upstream block-API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Datacenter location used when a request does not name one
    pub default_location: String,
    /// Block size requested from the upstream API
    pub default_block_size: u32,
    /// Assumed per-account block limit (the API exposes no real quota)
    pub estimated_quota: u32,
    /// Delay between reservation attempts in milliseconds
    pub inter_attempt_delay_ms: u64,
    /// Delay between cleanup deletions in milliseconds
    pub cleanup_delete_delay_ms: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            default_location: "dc1".into(),
            default_block_size: 1,
            estimated_quota: 50,
            inter_attempt_delay_ms: 1_000,
            cleanup_delete_delay_ms: 300,
        }
    }
}

/// Errors surfaced by the reputation engine.
///
/// Duplicate event fingerprints are deliberately not represented here: a
/// repeated webhook delivery is a normal outcome, reported as a boolean by
/// [`store::EventStore::record_failure`].
#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("upstream API error: {0}")]
    Upstream(String),

    #[error("upstream API rate limited")]
    UpstreamRateLimited,

    #[error("quota exceeded: requested {requested}, remaining {remaining}")]
    QuotaExceeded { requested: u32, remaining: i64 },

    #[error("no blocklist zone answered before the deadline")]
    ProbeTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ReputationError {
    /// Stable kind identifier used in API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReputationError::InvalidInput(_) => "invalid_input",
            ReputationError::NotFound(_) => "not_found",
            ReputationError::Storage(_) => "storage_unavailable",
            ReputationError::Upstream(_) => "upstream_unavailable",
            ReputationError::UpstreamRateLimited => "upstream_rate_limited",
            ReputationError::QuotaExceeded { .. } => "quota_exceeded",
            ReputationError::ProbeTimeout => "probe_timeout",
            ReputationError::Cancelled => "cancelled",
            ReputationError::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReputationError>;

// Re-export the types nearly every consumer needs.
pub use aggregator::Aggregator;
pub use classifier::HealthSnapshot;
pub use dnsbl::{BlocklistProber, DnsblProber};
pub use model::{IpStatus, ReservedIpStatus};
pub use provisioner::Provisioner;
