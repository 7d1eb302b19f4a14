//! Spam event repository

use chrono::{DateTime, Utc};
use embermail_common::types::{MailboxId, SpamEventId};
use embermail_common::{Error, Result};
use sqlx::PgPool;

use crate::models::{CreateSpamEvent, SpamCounts, SpamEvent};

/// Spam event repository
#[derive(Clone)]
pub struct SpamEventRepository {
    pool: PgPool,
}

impl SpamEventRepository {
    /// Create a new spam event repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find the event tracking one spam placement
    pub async fn find(
        &self,
        recipient_id: MailboxId,
        provider_msg_id: &str,
    ) -> Result<Option<SpamEvent>> {
        sqlx::query_as::<_, SpamEvent>(
            "SELECT * FROM spam_events WHERE recipient_id = $1 AND provider_msg_id = $2",
        )
        .bind(recipient_id)
        .bind(provider_msg_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Record a detection, reusing the existing event for the same
    /// placement if one exists. The (recipient, provider message) unique
    /// key guarantees at most one open event per placement.
    pub async fn record_detected(&self, input: CreateSpamEvent) -> Result<SpamEvent> {
        sqlx::query_as::<_, SpamEvent>(
            r#"
            INSERT INTO spam_events (
                message_id, sender_id, recipient_id, provider_msg_id,
                subject, detected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (recipient_id, provider_msg_id)
            DO UPDATE SET updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(input.message_id)
        .bind(input.sender_id)
        .bind(input.recipient_id)
        .bind(&input.provider_msg_id)
        .bind(&input.subject)
        .bind(input.detected_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Mark an event recovered
    pub async fn mark_recovered(&self, id: SpamEventId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE spam_events SET
                status = 'recovered',
                recovered_at = $2,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Record a failed recovery attempt
    pub async fn mark_failed(&self, id: SpamEventId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE spam_events SET
                status = 'failed',
                error = $2,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Detected / recovered counts for one sender since a cutoff
    pub async fn spam_counts(
        &self,
        sender_id: MailboxId,
        since: DateTime<Utc>,
    ) -> Result<SpamCounts> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'recovered')
            FROM spam_events
            WHERE sender_id = $1 AND detected_at >= $2
            "#,
        )
        .bind(sender_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(SpamCounts {
            detected: row.0,
            recovered: row.1,
        })
    }
}
