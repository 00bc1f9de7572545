//! PostgreSQL event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::EventStore;
use crate::model::{FailureEvent, NewFailureEvent};
use crate::Result;

/// Event store backed by the `smtp_failures` table.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn record_failure(&self, event: &NewFailureEvent) -> Result<bool> {
        // Deduplication lives in the unique index, not in application-side
        // check-then-insert.
        let result = sqlx::query(
            r#"
            INSERT INTO smtp_failures (
                sending_ip, recipient_email, recipient_domain, smtp_code,
                enhanced_code, reason, mx_host, occurred_at, fingerprint,
                attempt_number
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(&event.sending_ip)
        .bind(&event.recipient_email)
        .bind(&event.recipient_domain)
        .bind(event.smtp_code)
        .bind(&event.enhanced_code)
        .bind(&event.reason)
        .bind(&event.mx_host)
        .bind(event.occurred_at)
        .bind(&event.fingerprint)
        .bind(event.attempt_number)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn failures_for_ip_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailureEvent>> {
        let events = sqlx::query_as::<_, FailureEvent>(
            r#"
            SELECT id, sending_ip, recipient_email, recipient_domain, smtp_code,
                   enhanced_code, reason, mx_host, occurred_at, fingerprint,
                   attempt_number
            FROM smtp_failures
            WHERE sending_ip = $1 AND occurred_at >= $2
            ORDER BY occurred_at DESC
            "#,
        )
        .bind(ip)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn ips_with_activity_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let ips = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT sending_ip FROM smtp_failures WHERE occurred_at >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(ips)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM smtp_failures WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
