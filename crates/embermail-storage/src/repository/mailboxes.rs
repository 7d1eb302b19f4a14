//! Mailbox repository

use chrono::{DateTime, NaiveDate, Utc};
use embermail_common::types::{MailboxId, MailboxRole, OauthTokens};
use embermail_common::{Error, Result};
use sqlx::PgPool;

use crate::models::{CreateMailbox, Mailbox};

/// Mailbox repository
#[derive(Clone)]
pub struct MailboxRepository {
    pool: PgPool,
}

impl MailboxRepository {
    /// Create a new mailbox repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new mailbox
    pub async fn create(&self, input: CreateMailbox) -> Result<Mailbox> {
        let credentials = input.credentials.to_value()?;

        sqlx::query_as::<_, Mailbox>(
            r#"
            INSERT INTO mailboxes (
                email, provider, role, credentials, tz,
                target, open_rate_target, reply_rate_target
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&input.email)
        .bind(input.provider.to_string())
        .bind(input.role.to_string())
        .bind(&credentials)
        .bind(&input.tz)
        .bind(input.target)
        .bind(input.open_rate_target)
        .bind(input.reply_rate_target)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Get a mailbox by ID
    pub async fn get(&self, id: MailboxId) -> Result<Option<Mailbox>> {
        sqlx::query_as::<_, Mailbox>("SELECT * FROM mailboxes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Get a mailbox by email address
    pub async fn get_by_email(&self, email: &str) -> Result<Option<Mailbox>> {
        sqlx::query_as::<_, Mailbox>("SELECT * FROM mailboxes WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// List active mailboxes with the given role
    pub async fn list_active(&self, role: MailboxRole) -> Result<Vec<Mailbox>> {
        sqlx::query_as::<_, Mailbox>(
            "SELECT * FROM mailboxes WHERE role = $1 AND active ORDER BY email ASC",
        )
        .bind(role.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Distinct timezones of dispatchable senders
    pub async fn active_sender_zones(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT tz FROM mailboxes
            WHERE role = 'sender' AND active AND NOT needs_reauth
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(tz,)| tz).collect())
    }

    /// Dispatchable senders in one timezone
    pub async fn active_senders_in_zone(&self, tz: &str) -> Result<Vec<Mailbox>> {
        sqlx::query_as::<_, Mailbox>(
            r#"
            SELECT * FROM mailboxes
            WHERE role = 'sender' AND active AND NOT needs_reauth AND tz = $1
            ORDER BY email ASC
            "#,
        )
        .bind(tz)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Persist a refreshed credential bundle
    pub async fn update_credentials(&self, id: MailboxId, tokens: &OauthTokens) -> Result<()> {
        let credentials = tokens.to_value()?;
        sqlx::query(
            r#"
            UPDATE mailboxes SET
                credentials = $2,
                needs_reauth = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&credentials)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Flag a mailbox as needing re-authorization; it becomes invisible to
    /// planning and dispatch until its credentials change.
    pub async fn set_needs_reauth(&self, id: MailboxId) -> Result<()> {
        sqlx::query("UPDATE mailboxes SET needs_reauth = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Pause or resume a mailbox
    pub async fn set_active(&self, id: MailboxId, active: bool) -> Result<()> {
        sqlx::query("UPDATE mailboxes SET active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Advance the warmup day, at most once per local calendar day.
    ///
    /// Compare-and-swap on (warmup_day, last_advance_date): returns false if
    /// another tick advanced the mailbox first.
    pub async fn advance_day(
        &self,
        id: MailboxId,
        from_day: i32,
        to_day: i32,
        new_limit: i32,
        local_date: NaiveDate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mailboxes SET
                warmup_day = $3,
                daily_limit = $4,
                last_advance_date = $5,
                updated_at = NOW()
            WHERE id = $1
              AND warmup_day = $2
              AND (last_advance_date IS NULL OR last_advance_date < $5)
            "#,
        )
        .bind(id)
        .bind(from_day)
        .bind(to_day)
        .bind(new_limit)
        .bind(local_date)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Store a freshly computed reputation score
    pub async fn update_score(&self, id: MailboxId, score: f64) -> Result<()> {
        sqlx::query("UPDATE mailboxes SET score = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(score)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Record the reply matcher's poll cursor
    pub async fn touch_reply_poll(&self, id: MailboxId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE mailboxes SET last_reply_poll_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
