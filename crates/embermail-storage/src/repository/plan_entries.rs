//! Plan entry repository
//!
//! Plan entries carry the precomputed send instants for one sender on one
//! local calendar day. Status transitions are one-way and every terminal
//! transition is a conditional UPDATE on `status = 'pending'`, so a lost
//! race shows up as zero rows affected rather than a double dispatch.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use embermail_common::types::{Band, MailboxId, MessageId, PlanEntryId};
use embermail_common::{Error, Result};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::PlanEntry;

/// One planned send produced by the schedule planner
#[derive(Debug, Clone, Copy)]
pub struct NewPlanEntry {
    pub fire_at: DateTime<Utc>,
    pub band: Band,
}

/// Plan entry repository
#[derive(Clone)]
pub struct PlanEntryRepository {
    pool: PgPool,
}

impl PlanEntryRepository {
    /// Create a new plan entry repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write a day's plan, replacing any existing PENDING plan for the same
    /// (sender, date).
    ///
    /// Replacement is refused once any entry of the plan has transitioned to
    /// SENT; use [`replace_pending`](Self::replace_pending) to regenerate
    /// only the remainder of a partially dispatched day.
    pub async fn upsert_plan(
        &self,
        sender_id: MailboxId,
        local_date: NaiveDate,
        entries: &[NewPlanEntry],
    ) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let sent: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM plan_entries
            WHERE sender_id = $1 AND local_date = $2 AND status = 'sent'
            "#,
        )
        .bind(sender_id)
        .bind(local_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if sent.0 > 0 {
            return Err(Error::InvalidPlan(format!(
                "Plan for sender {} on {} already has {} sent entries",
                sender_id, local_date, sent.0
            )));
        }

        let written = Self::replace_pending_in_tx(&mut tx, sender_id, local_date, entries).await?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(written)
    }

    /// Replace only the PENDING entries of a (sender, date), leaving
    /// terminal entries untouched. Used by mid-day regeneration.
    pub async fn replace_pending(
        &self,
        sender_id: MailboxId,
        local_date: NaiveDate,
        entries: &[NewPlanEntry],
    ) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let written = Self::replace_pending_in_tx(&mut tx, sender_id, local_date, entries).await?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(written)
    }

    async fn replace_pending_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        sender_id: MailboxId,
        local_date: NaiveDate,
        entries: &[NewPlanEntry],
    ) -> Result<u64> {
        sqlx::query(
            r#"
            DELETE FROM plan_entries
            WHERE sender_id = $1 AND local_date = $2 AND status = 'pending'
            "#,
        )
        .bind(sender_id)
        .bind(local_date)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut written = 0u64;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO plan_entries (sender_id, local_date, fire_at, band)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(sender_id)
            .bind(local_date)
            .bind(entry.fire_at)
            .bind(entry.band.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            written += result.rows_affected();
        }

        Ok(written)
    }

    /// List a day's plan in firing order
    pub async fn list_for_date(
        &self,
        sender_id: MailboxId,
        local_date: NaiveDate,
    ) -> Result<Vec<PlanEntry>> {
        sqlx::query_as::<_, PlanEntry>(
            r#"
            SELECT * FROM plan_entries
            WHERE sender_id = $1 AND local_date = $2
            ORDER BY fire_at ASC
            "#,
        )
        .bind(sender_id)
        .bind(local_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Lock and return the due PENDING entries of one timezone.
    ///
    /// Due means `fire_at` in `(now - grace, now + window]`. Runs inside the
    /// caller's dispatch transaction with FOR UPDATE SKIP LOCKED so that
    /// concurrent dispatcher workers never see the same entry.
    pub async fn lock_due(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tz: &str,
        now: DateTime<Utc>,
        grace: Duration,
        window: Duration,
    ) -> Result<Vec<PlanEntry>> {
        sqlx::query_as::<_, PlanEntry>(
            r#"
            SELECT p.* FROM plan_entries p
            JOIN mailboxes m ON m.id = p.sender_id
            WHERE p.status = 'pending'
              AND p.fire_at > $2
              AND p.fire_at <= $3
              AND m.tz = $1
              AND m.active
              AND NOT m.needs_reauth
              AND m.role = 'sender'
            ORDER BY p.fire_at ASC
            FOR UPDATE OF p SKIP LOCKED
            "#,
        )
        .bind(tz)
        .bind(now - grace)
        .bind(now + window)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Mark an entry SENT, linking the message it produced
    pub async fn mark_sent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: PlanEntryId,
        message_id: MessageId,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE plan_entries SET
                status = 'sent',
                message_id = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(message_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark an entry FAILED and record the error
    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: PlanEntryId,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE plan_entries SET
                status = 'failed',
                attempts = attempts + 1,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark an entry SKIPPED (poisoned or no longer dispatchable)
    pub async fn mark_skipped(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: PlanEntryId,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE plan_entries SET
                status = 'skipped',
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Skip every PENDING entry of a sender from `from` onward.
    ///
    /// Used when a mailbox loses authorization: nothing further may be
    /// dispatched until its credentials change.
    pub async fn skip_future(
        &self,
        sender_id: MailboxId,
        from: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE plan_entries SET
                status = 'skipped',
                last_error = $3,
                updated_at = NOW()
            WHERE sender_id = $1 AND status = 'pending' AND fire_at >= $2
            "#,
        )
        .bind(sender_id)
        .bind(from)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Total entries for a (sender, date), any status
    pub async fn count_for_date(
        &self,
        sender_id: MailboxId,
        local_date: NaiveDate,
    ) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM plan_entries WHERE sender_id = $1 AND local_date = $2",
        )
        .bind(sender_id)
        .bind(local_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }

    /// Entries for a (sender, date) in one status
    pub async fn count_by_status(
        &self,
        sender_id: MailboxId,
        local_date: NaiveDate,
        status: &str,
    ) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM plan_entries
            WHERE sender_id = $1 AND local_date = $2 AND status = $3
            "#,
        )
        .bind(sender_id)
        .bind(local_date)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }

    /// Sum of attempts recorded on a day's FAILED entries
    pub async fn failed_attempts(
        &self,
        sender_id: MailboxId,
        local_date: NaiveDate,
    ) -> Result<i64> {
        let sum: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(attempts)::BIGINT FROM plan_entries
            WHERE sender_id = $1 AND local_date = $2 AND status = 'failed'
            "#,
        )
        .bind(sender_id)
        .bind(local_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(sum.0.unwrap_or(0))
    }

    /// Delete terminal entries older than the retention window
    pub async fn purge(&self, older_than: NaiveDate) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM plan_entries
            WHERE local_date < $1 AND status IN ('sent', 'failed', 'skipped')
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
