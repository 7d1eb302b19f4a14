//! Database models

use chrono::{DateTime, NaiveDate, Utc};
use embermail_common::types::{
    Band, MailboxId, MailboxRole, MessageId, OauthTokens, PlanEntryId, PlanStatus, Provider,
    SpamEventId, SpamStatus,
};
use embermail_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Mailbox model
///
/// One row per email account the system controls. Senders carry warmup
/// state; recipients only engage.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub email: String,
    pub provider: String,
    pub role: String,
    pub credentials: serde_json::Value,
    pub active: bool,
    pub needs_reauth: bool,
    pub tz: String,
    pub target: i32,
    pub warmup_day: i32,
    pub daily_limit: i32,
    pub open_rate_target: f64,
    pub reply_rate_target: f64,
    pub score: f64,
    pub last_advance_date: Option<NaiveDate>,
    pub last_reply_poll_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mailbox {
    /// Get the provider enum
    pub fn provider_enum(&self) -> Result<Provider> {
        self.provider.parse()
    }

    /// Get the role enum
    pub fn role_enum(&self) -> Result<MailboxRole> {
        self.role.parse()
    }

    /// Parse the stored credential bundle
    pub fn oauth_tokens(&self) -> Result<OauthTokens> {
        OauthTokens::from_value(&self.credentials)
    }
}

/// Plan entry model - one intended send
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: PlanEntryId,
    pub sender_id: MailboxId,
    pub local_date: NaiveDate,
    pub fire_at: DateTime<Utc>,
    pub band: String,
    pub status: String,
    pub message_id: Option<MessageId>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanEntry {
    pub fn band_enum(&self) -> Result<Band> {
        self.band.parse()
    }

    pub fn status_enum(&self) -> Result<PlanStatus> {
        self.status.parse()
    }
}

/// Message model - a sent warmup email
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub plan_entry_id: PlanEntryId,
    pub sender_id: MailboxId,
    pub recipient_id: MailboxId,
    pub recipient_address: String,
    pub subject: String,
    pub body_html: String,
    pub provider_msg_id: String,
    pub provider_thread_id: String,
    pub tracking_id: Uuid,
    pub open_rate_target: f64,
    pub reply_rate_target: f64,
    pub sent_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub open_due_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub star_due_at: Option<DateTime<Utc>>,
    pub starred_at: Option<DateTime<Utc>>,
    pub reply_due_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Spam event model - one detection of warmup mail in a spam folder
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SpamEvent {
    pub id: SpamEventId,
    pub message_id: Option<MessageId>,
    pub sender_id: MailboxId,
    pub recipient_id: MailboxId,
    pub provider_msg_id: String,
    pub subject: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub error: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SpamEvent {
    pub fn status_enum(&self) -> Result<SpamStatus> {
        self.status.parse()
    }
}

/// Create mailbox input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMailbox {
    pub email: String,
    pub provider: Provider,
    pub role: MailboxRole,
    pub credentials: OauthTokens,
    pub tz: String,
    pub target: i32,
    pub open_rate_target: f64,
    pub reply_rate_target: f64,
}

/// Create message input
#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub plan_entry_id: PlanEntryId,
    pub sender_id: MailboxId,
    pub recipient_id: MailboxId,
    pub recipient_address: String,
    pub subject: String,
    pub body_html: String,
    pub provider_msg_id: String,
    pub provider_thread_id: String,
    pub tracking_id: Uuid,
    pub open_rate_target: f64,
    pub reply_rate_target: f64,
    pub sent_at: DateTime<Utc>,
}

/// Create spam event input
#[derive(Debug, Clone)]
pub struct CreateSpamEvent {
    pub message_id: Option<MessageId>,
    pub sender_id: MailboxId,
    pub recipient_id: MailboxId,
    pub provider_msg_id: String,
    pub subject: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Aggregate engagement counts for one sender over a stats window
#[derive(Debug, Clone, Copy, Default)]
pub struct EngagementCounts {
    pub sent: i64,
    pub opened: i64,
    pub replied: i64,
}

/// Aggregate spam counts for one sender over a stats window
#[derive(Debug, Clone, Copy, Default)]
pub struct SpamCounts {
    pub detected: i64,
    pub recovered: i64,
}
