//! Message repository
//!
//! Engagement stamps (`processed_at`, `opened_at`, `starred_at`,
//! `replied_at`) are written with conditional single-row UPDATEs on the
//! corresponding column being NULL, which is what makes every engagement
//! draw happen exactly once per message.

use chrono::{DateTime, Utc};
use embermail_common::types::{MailboxId, MessageId};
use embermail_common::{Error, Result};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{CreateMessage, EngagementCounts, Message};

/// Message repository
#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    /// Create a new message repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a sent message inside the dispatch transaction
    pub async fn create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        input: CreateMessage,
    ) -> Result<Message> {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (
                plan_entry_id, sender_id, recipient_id, recipient_address,
                subject, body_html, provider_msg_id, provider_thread_id,
                tracking_id, open_rate_target, reply_rate_target, sent_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(input.plan_entry_id)
        .bind(input.sender_id)
        .bind(input.recipient_id)
        .bind(&input.recipient_address)
        .bind(&input.subject)
        .bind(&input.body_html)
        .bind(&input.provider_msg_id)
        .bind(&input.provider_thread_id)
        .bind(input.tracking_id)
        .bind(input.open_rate_target)
        .bind(input.reply_rate_target)
        .bind(input.sent_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Get a message by ID
    pub async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Messages to a recipient whose open draw has not happened yet and
    /// that are old enough to be looked at
    pub async fn undecided_for_recipient(
        &self,
        recipient_id: MailboxId,
        sent_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE recipient_id = $1
              AND processed_at IS NULL
              AND open_due_at IS NULL
              AND sent_at < $2
            ORDER BY sent_at ASC
            LIMIT $3
            "#,
        )
        .bind(recipient_id)
        .bind(sent_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Record that the open draw happened without opening the message
    pub async fn mark_processed(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET processed_at = $2
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist a positive open draw and the instant the open falls due.
    /// Conditional on no prior decision, so the draw happens exactly once.
    pub async fn record_open_intent(
        &self,
        id: MessageId,
        open_due_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET open_due_at = $2
            WHERE id = $1 AND processed_at IS NULL AND open_due_at IS NULL
            "#,
        )
        .bind(id)
        .bind(open_due_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Messages whose recorded open instant has arrived
    pub async fn due_opens(
        &self,
        recipient_id: MailboxId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE recipient_id = $1
              AND open_due_at IS NOT NULL
              AND open_due_at <= $2
              AND opened_at IS NULL
            ORDER BY open_due_at ASC
            "#,
        )
        .bind(recipient_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Mark a message opened, recording the star and reply intents whose
    /// delays were sampled at this decision point
    pub async fn mark_opened(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
        star_due_at: Option<DateTime<Utc>>,
        reply_due_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                opened_at = $2,
                processed_at = $2,
                star_due_at = $3,
                reply_due_at = $4
            WHERE id = $1 AND opened_at IS NULL AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(star_due_at)
        .bind(reply_due_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Opened messages whose star delay has elapsed
    pub async fn due_stars(
        &self,
        recipient_id: MailboxId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE recipient_id = $1
              AND star_due_at IS NOT NULL
              AND star_due_at <= $2
              AND starred_at IS NULL
            ORDER BY star_due_at ASC
            "#,
        )
        .bind(recipient_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Stamp the star
    pub async fn mark_starred(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET starred_at = $2 WHERE id = $1 AND starred_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Opened messages whose reply delay has elapsed
    pub async fn due_replies(
        &self,
        recipient_id: MailboxId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE recipient_id = $1
              AND reply_due_at IS NOT NULL
              AND reply_due_at <= $2
              AND replied_at IS NULL
            ORDER BY reply_due_at ASC
            "#,
        )
        .bind(recipient_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Stamp the reply. Idempotent: both the engagement simulator and the
    /// reply matcher may race to this and only the first write wins.
    pub async fn mark_replied(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET replied_at = $2 WHERE id = $1 AND replied_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Find an outbound message by provider thread
    pub async fn by_thread(
        &self,
        sender_id: MailboxId,
        provider_thread_id: &str,
    ) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE sender_id = $1 AND provider_thread_id = $2
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
        )
        .bind(sender_id)
        .bind(provider_thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Find an outbound message by provider message ID
    pub async fn by_provider_msg_id(
        &self,
        sender_id: MailboxId,
        provider_msg_id: &str,
    ) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE sender_id = $1 AND provider_msg_id = $2",
        )
        .bind(sender_id)
        .bind(provider_msg_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Recent unreplied messages from a sender to one recipient address,
    /// newest first. Subject-fallback matching pool for the reply matcher.
    pub async fn unreplied_to(
        &self,
        sender_id: MailboxId,
        recipient_address: &str,
        limit: i64,
    ) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE sender_id = $1
              AND recipient_address = $2
              AND replied_at IS NULL
            ORDER BY sent_at DESC
            LIMIT $3
            "#,
        )
        .bind(sender_id)
        .bind(recipient_address)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Sent / opened / replied counts for one sender since a cutoff
    pub async fn engagement_counts(
        &self,
        sender_id: MailboxId,
        since: DateTime<Utc>,
    ) -> Result<EngagementCounts> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE opened_at IS NOT NULL),
                COUNT(*) FILTER (WHERE replied_at IS NOT NULL)
            FROM messages
            WHERE sender_id = $1 AND sent_at >= $2
            "#,
        )
        .bind(sender_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(EngagementCounts {
            sent: row.0,
            opened: row.1,
            replied: row.2,
        })
    }

    /// Number of messages a sender sent since a cutoff
    pub async fn sent_since(&self, sender_id: MailboxId, since: DateTime<Utc>) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE sender_id = $1 AND sent_at >= $2")
                .bind(sender_id)
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }
}
