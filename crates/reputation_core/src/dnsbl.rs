//! DNSBL probing with bounded fan-out.
//!
//! A probe reverses the IPv4 octets and queries `d.c.b.a.<zone>` against
//! every configured zone in parallel. Any A record answer means "listed on
//! this zone"; NXDOMAIN and timeouts mean "not listed". Zones on the
//! ignore-list are dropped from the result even when they answer.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::{system_conf, TokioAsyncResolver};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::model::NewDnsblCheck;
use crate::store::ReputationStore;
use crate::{DnsblConfig, ReputationError, Result};

/// Severity of a set of blocklist listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsblSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Outcome of probing one IP across the configured zone set.
#[derive(Debug, Clone, Serialize)]
pub struct DnsblProbe {
    pub ip: String,
    pub listed: bool,
    /// Sorted zone names after ignore-filtering
    pub listings: Vec<String>,
    pub duration_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub zones_checked: usize,
    pub zones_failed: usize,
}

impl DnsblProbe {
    pub fn severity(&self) -> DnsblSeverity {
        listing_severity(&self.listings)
    }
}

/// Severity is a pure function of the listing set: Spamhaus presence is
/// always critical, otherwise the count decides.
pub fn listing_severity(listings: &[String]) -> DnsblSeverity {
    if listings.is_empty() {
        return DnsblSeverity::None;
    }
    if listings.iter().any(|zone| zone.contains("spamhaus")) {
        return DnsblSeverity::Critical;
    }
    match listings.len() {
        n if n >= 3 => DnsblSeverity::High,
        2 => DnsblSeverity::Medium,
        _ => DnsblSeverity::Low,
    }
}

/// Drop zones matching the ignore-list before aggregation.
pub(crate) fn filter_ignored(listings: Vec<String>, ignored: &[String]) -> Vec<String> {
    listings
        .into_iter()
        .filter(|zone| !ignored.iter().any(|ig| zone.contains(ig.as_str())))
        .collect()
}

/// Reverse the octets of an IPv4 address for a DNSBL query.
fn reverse_octets(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{d}.{c}.{b}.{a}")
}

/// Anything that can answer "is this IP listed".
#[async_trait]
pub trait BlocklistProber: Send + Sync {
    async fn probe(&self, ip: &str) -> Result<DnsblProbe>;
}

enum ZoneOutcome {
    Listed(String),
    Clear,
    Failed,
}

/// DNSBL prober backed by a shared async resolver.
pub struct DnsblProber {
    resolver: TokioAsyncResolver,
    zones: Vec<String>,
    ignored: Vec<String>,
    per_zone_timeout: Duration,
    overall_timeout: Duration,
}

impl DnsblProber {
    /// Build a prober from configuration, preferring the system resolver
    /// (public recursors are commonly refused by blocklist operators).
    pub fn new(config: &DnsblConfig) -> Self {
        let (resolver_config, mut opts) = match system_conf::read_system_conf() {
            Ok((conf, opts)) => (conf, opts),
            Err(err) => {
                warn!(error = %err, "failed to read system resolver config, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = Duration::from_millis(config.per_zone_timeout_ms);
        opts.attempts = 1;
        opts.negative_min_ttl = Some(Duration::from_secs(30));

        let resolver = TokioAsyncResolver::tokio(resolver_config, opts);

        Self {
            resolver,
            zones: config.zones.clone(),
            ignored: config.ignored.clone(),
            per_zone_timeout: Duration::from_millis(config.per_zone_timeout_ms),
            overall_timeout: Duration::from_millis(config.overall_timeout_ms),
        }
    }

    async fn query_zone(&self, reversed: &str, zone: &str) -> ZoneOutcome {
        let query = format!("{reversed}.{zone}.");
        match tokio::time::timeout(self.per_zone_timeout, self.resolver.ipv4_lookup(query.as_str()))
            .await
        {
            Ok(Ok(answer)) if answer.iter().next().is_some() => {
                debug!(zone, query, "listed on blocklist zone");
                ZoneOutcome::Listed(zone.to_string())
            }
            Ok(Ok(_)) => ZoneOutcome::Clear,
            Ok(Err(err)) => match err.kind() {
                // NXDOMAIN is the normal "not listed" answer
                ResolveErrorKind::NoRecordsFound { .. } => ZoneOutcome::Clear,
                _ => {
                    debug!(zone, error = %err, "blocklist zone lookup failed");
                    ZoneOutcome::Failed
                }
            },
            Err(_) => {
                debug!(zone, "blocklist zone lookup timed out");
                ZoneOutcome::Failed
            }
        }
    }
}

#[async_trait]
impl BlocklistProber for DnsblProber {
    async fn probe(&self, ip: &str) -> Result<DnsblProbe> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| ReputationError::InvalidInput(format!("invalid IP address: {ip}")))?;
        let v4 = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => {
                return Err(ReputationError::InvalidInput(format!(
                    "IPv6 addresses are not probed: {ip}"
                )))
            }
        };

        let reversed = reverse_octets(v4);
        let started = std::time::Instant::now();
        let checked_at = Utc::now();

        // All zones in flight at once for a single IP, joined under a
        // shared deadline. Zones still pending at the deadline count as
        // not listed.
        let lookups: Vec<_> = self
            .zones
            .iter()
            .map(|zone| self.query_zone(&reversed, zone))
            .collect();
        let mut pending = stream::iter(lookups).buffer_unordered(self.zones.len().max(1));
        let deadline = tokio::time::Instant::now() + self.overall_timeout;

        let mut raw_listings = Vec::new();
        let mut failed = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(ZoneOutcome::Listed(zone))) => raw_listings.push(zone),
                Ok(Some(ZoneOutcome::Clear)) => {}
                Ok(Some(ZoneOutcome::Failed)) => failed += 1,
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if !self.zones.is_empty() && failed == self.zones.len() {
            return Err(ReputationError::ProbeTimeout);
        }

        let mut listings = filter_ignored(raw_listings, &self.ignored);
        listings.sort();
        listings.dedup();

        Ok(DnsblProbe {
            ip: ip.trim().to_string(),
            listed: !listings.is_empty(),
            listings,
            duration_ms: started.elapsed().as_millis() as u64,
            checked_at,
            zones_checked: self.zones.len(),
            zones_failed: failed,
        })
    }
}

/// Probe an IP and persist the result. Persistence failure is logged and
/// does not discard the probe outcome.
pub async fn probe_and_store(
    prober: &dyn BlocklistProber,
    store: &dyn ReputationStore,
    ip: &str,
) -> Result<DnsblProbe> {
    let probe = prober.probe(ip).await?;

    let check = NewDnsblCheck {
        ip: probe.ip.clone(),
        checked_at: probe.checked_at,
        listed: probe.listed,
        listings: probe.listings.clone(),
        duration_ms: probe.duration_ms as i64,
        metadata: json!({
            "zones_checked": probe.zones_checked,
            "zones_failed": probe.zones_failed,
            "severity": probe.severity(),
        }),
    };
    if let Err(err) = store.insert_dnsbl_check(&check).await {
        error!(ip = %probe.ip, error = %err, "failed to persist DNSBL check result");
    }

    Ok(probe)
}

/// Probe many IPs with a bounded number in flight.
pub async fn probe_batch(
    prober: Arc<dyn BlocklistProber>,
    ips: Vec<String>,
    concurrency: usize,
) -> Vec<(String, Result<DnsblProbe>)> {
    stream::iter(ips.into_iter().map(|ip| {
        let prober = Arc::clone(&prober);
        async move {
            let outcome = prober.probe(&ip).await;
            (ip, outcome)
        }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await
}
