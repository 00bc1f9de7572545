//! PostgreSQL reservation inventory.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;

use super::{InventoryStore, ReservationStatistics, ReservedIpFilter};
use crate::model::{
    NewBlacklistHistory, NewQuotaSnapshot, NewReservationAttempt, NewReservedIp, ReservedIp,
    ReservedIpStatus,
};
use crate::{ReputationError, Result};

/// Inventory store backed by `reserved_ips` and its audit tables.
#[derive(Clone)]
pub struct PgInventoryStore {
    pool: PgPool,
}

impl PgInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RESERVED_IP_COLUMNS: &str = "id, ip_address, block_id, uid, location, status, is_blacklisted, \
     blacklist_details, reserved_at, last_checked_at, released_at, assigned_to, \
     usage_count, metadata, notes, created_at, updated_at";

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn insert_reserved_ip(&self, ip: &NewReservedIp) -> Result<ReservedIp> {
        let inserted = sqlx::query_as::<_, ReservedIp>(&format!(
            r#"
            INSERT INTO reserved_ips (
                ip_address, block_id, uid, location, status, is_blacklisted,
                blacklist_details, reserved_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {RESERVED_IP_COLUMNS}
            "#
        ))
        .bind(&ip.ip_address)
        .bind(&ip.block_id)
        .bind(&ip.uid)
        .bind(&ip.location)
        .bind(ip.status)
        .bind(ip.is_blacklisted)
        .bind(Json(&ip.blacklist_details))
        .bind(ip.reserved_at)
        .bind(Json(&ip.metadata))
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn reserved_ip_by_id(&self, id: i64) -> Result<Option<ReservedIp>> {
        let row = sqlx::query_as::<_, ReservedIp>(&format!(
            "SELECT {RESERVED_IP_COLUMNS} FROM reserved_ips WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn reserved_ip_by_address(&self, address: &str) -> Result<Option<ReservedIp>> {
        let row = sqlx::query_as::<_, ReservedIp>(&format!(
            "SELECT {RESERVED_IP_COLUMNS} FROM reserved_ips WHERE ip_address = $1"
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_reserved_ips(&self, filter: &ReservedIpFilter) -> Result<Vec<ReservedIp>> {
        // Optional filters as NULL-or-match predicates keeps this a single
        // prepared statement for every filter combination.
        let rows = sqlx::query_as::<_, ReservedIp>(&format!(
            r#"
            SELECT {RESERVED_IP_COLUMNS}
            FROM reserved_ips
            WHERE ($1::reserved_ip_status IS NULL OR status = $1)
              AND ($2::boolean IS NULL OR is_blacklisted = $2)
              AND ($3::text IS NULL OR location = $3)
            ORDER BY reserved_at DESC
            "#
        ))
        .bind(filter.status)
        .bind(filter.is_blacklisted)
        .bind(filter.location.as_deref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn update_status(
        &self,
        id: i64,
        status: ReservedIpStatus,
        assigned_to: Option<&str>,
    ) -> Result<()> {
        let released_at = (status == ReservedIpStatus::Released).then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE reserved_ips
            SET status = $1,
                assigned_to = $2,
                released_at = COALESCE($3, released_at),
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(status)
        .bind(assigned_to)
        .bind(released_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReputationError::NotFound(format!("reserved IP {id}")));
        }
        Ok(())
    }

    async fn update_blacklist_status(
        &self,
        id: i64,
        is_blacklisted: bool,
        zones: &[String],
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reserved_ips
            SET is_blacklisted = $1,
                blacklist_details = $2,
                last_checked_at = NOW(),
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(is_blacklisted)
        .bind(Json(zones))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReputationError::NotFound(format!("reserved IP {id}")));
        }
        Ok(())
    }

    async fn delete_reserved_ip(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM reserved_ips WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReputationError::NotFound(format!("reserved IP {id}")));
        }
        Ok(())
    }

    async fn record_attempt(&self, attempt: &NewReservationAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ip_reservation_attempts (
                attempt_uid, block_id, ip_address, location, success,
                failure_reason, was_blacklisted, blacklists_found,
                attempted_at, completed_at, duration_ms, action_taken, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&attempt.attempt_uid)
        .bind(attempt.block_id.as_deref())
        .bind(attempt.ip_address.as_deref())
        .bind(&attempt.location)
        .bind(attempt.success)
        .bind(attempt.failure_reason.as_deref())
        .bind(attempt.was_blacklisted)
        .bind(Json(&attempt.blacklists_found))
        .bind(attempt.attempted_at)
        .bind(attempt.completed_at)
        .bind(attempt.duration_ms)
        .bind(attempt.action_taken)
        .bind(Json(&attempt.metadata))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_blacklist_history(&self, entry: &NewBlacklistHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reserved_ip_blacklist_history (
                reserved_ip_id, ip_address, checked_at, was_blacklisted,
                blacklists_found, check_duration_ms, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.reserved_ip_id)
        .bind(&entry.ip_address)
        .bind(entry.checked_at)
        .bind(entry.was_blacklisted)
        .bind(Json(&entry.blacklists_found))
        .bind(entry.check_duration_ms)
        .bind(Json(&entry.metadata))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_quota_snapshot(&self, snapshot: &NewQuotaSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_snapshots (
                total_blocks, estimated_limit, remaining, protected_blocks,
                single_ip_blocks, location, snapshot_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(snapshot.total_blocks)
        .bind(snapshot.estimated_limit)
        .bind(snapshot.remaining)
        .bind(snapshot.protected_blocks)
        .bind(snapshot.single_ip_blocks)
        .bind(snapshot.location.as_deref())
        .bind(snapshot.snapshot_at)
        .bind(Json(&snapshot.metadata))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn block_ids_in_use(&self) -> Result<HashSet<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT block_id FROM reserved_ips WHERE status IN ('reserved', 'in_use')",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn statistics(&self) -> Result<ReservationStatistics> {
        let status_rows = sqlx::query_as::<_, (ReservedIpStatus, i64)>(
            "SELECT status, COUNT(*) FROM reserved_ips GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_status = BTreeMap::new();
        for (status, count) in status_rows {
            by_status.insert(status.as_str().to_string(), count);
        }

        let blacklisted_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM reserved_ips WHERE is_blacklisted",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM reserved_ips")
            .fetch_one(&self.pool)
            .await?;

        Ok(ReservationStatistics {
            by_status,
            blacklisted_count,
            total_count,
        })
    }
}
