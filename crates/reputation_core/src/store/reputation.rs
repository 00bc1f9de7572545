//! PostgreSQL reputation state, action audit, and DNSBL check log.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;

use super::ReputationStore;
use crate::model::{
    DnsblCheckRecord, IpAction, IpReputation, IpStatus, NewDnsblCheck, NewIpAction,
    NewIpReputation,
};
use crate::Result;

/// Reputation store backed by `ip_reputation`, `ip_actions` and
/// `dnsbl_checks`.
#[derive(Clone)]
pub struct PgReputationStore {
    pool: PgPool,
}

impl PgReputationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const REPUTATION_COLUMNS: &str = "id, ip, window_start, window_end, total_sent, total_rejected, \
     rejection_ratio, unique_domains_rejected, reason_counts, \
     major_providers_rejecting, status, last_updated, metadata";

#[async_trait]
impl ReputationStore for PgReputationStore {
    async fn get_state(&self, ip: &str) -> Result<Option<IpReputation>> {
        let state = sqlx::query_as::<_, IpReputation>(&format!(
            "SELECT {REPUTATION_COLUMNS} FROM ip_reputation WHERE ip = $1"
        ))
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        Ok(state)
    }

    async fn upsert_state(&self, state: &NewIpReputation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ip_reputation (
                ip, window_start, window_end, total_sent, total_rejected,
                rejection_ratio, unique_domains_rejected, reason_counts,
                major_providers_rejecting, status, last_updated, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (ip) DO UPDATE SET
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                total_sent = EXCLUDED.total_sent,
                total_rejected = EXCLUDED.total_rejected,
                rejection_ratio = EXCLUDED.rejection_ratio,
                unique_domains_rejected = EXCLUDED.unique_domains_rejected,
                reason_counts = EXCLUDED.reason_counts,
                major_providers_rejecting = EXCLUDED.major_providers_rejecting,
                status = EXCLUDED.status,
                last_updated = EXCLUDED.last_updated,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&state.ip)
        .bind(state.window_start)
        .bind(state.window_end)
        .bind(state.total_sent)
        .bind(state.total_rejected)
        .bind(state.rejection_ratio)
        .bind(state.unique_domains_rejected)
        .bind(Json(&state.reason_counts))
        .bind(Json(&state.major_providers_rejecting))
        .bind(state.status)
        .bind(state.last_updated)
        .bind(Json(&state.metadata))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_states(&self, status: Option<IpStatus>) -> Result<Vec<IpReputation>> {
        let states = match status {
            Some(status) => {
                sqlx::query_as::<_, IpReputation>(&format!(
                    "SELECT {REPUTATION_COLUMNS} FROM ip_reputation \
                     WHERE status = $1 ORDER BY last_updated DESC"
                ))
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, IpReputation>(&format!(
                    "SELECT {REPUTATION_COLUMNS} FROM ip_reputation \
                     ORDER BY last_updated DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(states)
    }

    async fn append_action(&self, action: &NewIpAction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ip_actions (
                ip, action, previous_status, new_status, reason, trigger,
                metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&action.ip)
        .bind(action.action)
        .bind(action.previous_status)
        .bind(action.new_status)
        .bind(&action.reason)
        .bind(action.trigger)
        .bind(Json(&action.metadata))
        .bind(action.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_actions(&self, ip: &str, limit: i64) -> Result<Vec<IpAction>> {
        let actions = sqlx::query_as::<_, IpAction>(
            r#"
            SELECT id, ip, action, previous_status, new_status, reason,
                   trigger, metadata, created_at
            FROM ip_actions
            WHERE ip = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(ip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(actions)
    }

    async fn insert_dnsbl_check(&self, check: &NewDnsblCheck) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dnsbl_checks (ip, checked_at, listed, listings, duration_ms, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&check.ip)
        .bind(check.checked_at)
        .bind(check.listed)
        .bind(Json(&check.listings))
        .bind(check.duration_ms)
        .bind(Json(&check.metadata))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_dnsbl_check(&self, ip: &str) -> Result<Option<DnsblCheckRecord>> {
        let check = sqlx::query_as::<_, DnsblCheckRecord>(
            r#"
            SELECT id, ip, checked_at, listed, listings, duration_ms, metadata
            FROM dnsbl_checks
            WHERE ip = $1
            ORDER BY checked_at DESC
            LIMIT 1
            "#,
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        Ok(check)
    }
}
