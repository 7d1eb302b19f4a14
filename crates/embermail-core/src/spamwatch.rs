//! Spam recovery - rescues warmup mail from recipient spam folders
//!
//! Every few hours, checks each recipient's spam folder for mail from the
//! active senders, records a spam event per placement, unmarks the mail
//! and restores it to the inbox. Recovery attempts per placement are
//! bounded; the recovered rate feeds the reputation score.

use embermail_common::types::MailboxRole;
use embermail_common::Result;
use embermail_storage::db::DatabasePool;
use embermail_storage::models::{CreateSpamEvent, Mailbox};
use embermail_storage::repository::{MailboxRepository, MessageRepository, SpamEventRepository};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::mail::{bare_address, MailClient, MailClientRegistry};

/// Recovery attempts allowed per spam placement
const MAX_RECOVERY_ATTEMPTS: i32 = 3;

/// Spam recovery worker
pub struct SpamRecovery {
    mailboxes: MailboxRepository,
    messages: MessageRepository,
    spam_events: SpamEventRepository,
    registry: MailClientRegistry,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
}

impl SpamRecovery {
    pub fn new(
        pool: DatabasePool,
        registry: MailClientRegistry,
        clock: Arc<dyn Clock>,
        interval_secs: u64,
    ) -> Self {
        let pg = pool.pool().clone();
        Self {
            mailboxes: MailboxRepository::new(pg.clone()),
            messages: MessageRepository::new(pg.clone()),
            spam_events: SpamEventRepository::new(pg),
            registry,
            clock,
            interval_secs,
        }
    }

    /// Run the recovery loop until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.interval_secs));
        info!(interval_secs = self.interval_secs, "Spam recovery started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Spam recovery tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Spam recovery stopping");
                    break;
                }
            }
        }
    }

    /// One spam sweep over every active recipient
    pub async fn tick(&self) -> Result<()> {
        let senders = self.mailboxes.list_active(MailboxRole::Sender).await?;
        if senders.is_empty() {
            return Ok(());
        }
        let sender_addresses: Vec<String> = senders.iter().map(|s| s.email.clone()).collect();
        let sender_ids: HashMap<String, i64> =
            senders.iter().map(|s| (s.email.clone(), s.id)).collect();

        let recipients = self.mailboxes.list_active(MailboxRole::Recipient).await?;
        for recipient in recipients {
            if let Err(e) = self
                .sweep_recipient(&recipient, &sender_addresses, &sender_ids)
                .await
            {
                error!(mailbox = %recipient.email, "Spam sweep failed: {}", e);
            }
        }

        Ok(())
    }

    async fn sweep_recipient(
        &self,
        recipient: &Mailbox,
        sender_addresses: &[String],
        sender_ids: &HashMap<String, i64>,
    ) -> Result<()> {
        let provider = match recipient.provider_enum() {
            Ok(provider) => provider,
            Err(_) => return Ok(()),
        };
        let Ok(client) = self.registry.for_provider(provider) else {
            return Ok(());
        };
        let creds = match recipient.oauth_tokens() {
            Ok(creds) => creds,
            Err(e) => {
                warn!(mailbox = %recipient.email, "Credential bundle unreadable: {}", e);
                return Ok(());
            }
        };

        let spam = match client.list_spam_from(&creds, sender_addresses).await {
            Ok(spam) => spam,
            Err(e) => {
                warn!(mailbox = %recipient.email, "list_spam_from failed: {}", e);
                return Ok(());
            }
        };

        if spam.is_empty() {
            debug!(mailbox = %recipient.email, "Spam folder clean");
            return Ok(());
        }
        info!(
            mailbox = %recipient.email,
            found = spam.len(),
            "Found warmup mail in spam folder"
        );

        let now = self.clock.now_utc();
        for mail in spam {
            let from = bare_address(&mail.from);
            let Some(&sender_id) = sender_ids.get(&from) else {
                debug!(from = %from, "Spam mail from unmanaged sender");
                continue;
            };

            // Existing event for this placement: done if recovered,
            // abandoned once the retry budget is spent.
            if let Some(existing) = self
                .spam_events
                .find(recipient.id, &mail.provider_msg_id)
                .await?
            {
                if existing.status == "recovered" {
                    continue;
                }
                if existing.attempts >= MAX_RECOVERY_ATTEMPTS {
                    debug!(event = existing.id, "Recovery attempts exhausted");
                    continue;
                }
            }

            // Resolve the message row when the provider id is known to us;
            // header-only detections stay unlinked.
            let message = self
                .messages
                .by_provider_msg_id(sender_id, &mail.provider_msg_id)
                .await?;

            let event = self
                .spam_events
                .record_detected(CreateSpamEvent {
                    message_id: message.as_ref().map(|m| m.id),
                    sender_id,
                    recipient_id: recipient.id,
                    provider_msg_id: mail.provider_msg_id.clone(),
                    subject: Some(mail.subject.clone()),
                    detected_at: now,
                })
                .await?;

            match client.unspam(&creds, &mail.provider_msg_id).await {
                Ok(()) => {
                    self.spam_events.mark_recovered(event.id, now).await?;
                    info!(
                        mailbox = %recipient.email,
                        from = %from,
                        event = event.id,
                        "Recovered warmup mail from spam"
                    );
                }
                Err(e) => {
                    self.spam_events.mark_failed(event.id, &e.to_string()).await?;
                    warn!(
                        mailbox = %recipient.email,
                        event = event.id,
                        "Spam recovery failed: {}",
                        e
                    );
                }
            }
        }

        Ok(())
    }
}
