//! Reply matcher - detects replies arriving at sender mailboxes
//!
//! Polls each active sender's inbox for unread mail from the recipient
//! pool, matches it against outbound messages by provider thread (with a
//! normalized-subject fallback), and stamps `replied_at`. The stamp is a
//! conditional update, so re-seeing the same inbound mail is harmless.

use chrono::Duration as ChronoDuration;
use embermail_common::types::MailboxRole;
use embermail_common::Result;
use embermail_storage::db::DatabasePool;
use embermail_storage::models::{Mailbox, Message};
use embermail_storage::repository::{MailboxRepository, MessageRepository};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::mail::{bare_address, InboundMessage, MailClient, MailClientRegistry};

/// How far back the first poll of a mailbox looks
const INITIAL_LOOKBACK_HOURS: i64 = 24;

/// Strip any number of leading `Re:` prefixes and trim
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    while let Some(prefix) = s.get(..3) {
        if prefix.eq_ignore_ascii_case("re:") {
            s = s[3..].trim_start();
        } else {
            break;
        }
    }
    s.to_string()
}

/// Reply matcher worker
pub struct ReplyMatcher {
    mailboxes: MailboxRepository,
    messages: MessageRepository,
    registry: MailClientRegistry,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
}

impl ReplyMatcher {
    pub fn new(
        pool: DatabasePool,
        registry: MailClientRegistry,
        clock: Arc<dyn Clock>,
        interval_secs: u64,
    ) -> Self {
        let pg = pool.pool().clone();
        Self {
            mailboxes: MailboxRepository::new(pg.clone()),
            messages: MessageRepository::new(pg),
            registry,
            clock,
            interval_secs,
        }
    }

    /// Run the polling loop until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.interval_secs));
        info!(interval_secs = self.interval_secs, "Reply matcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Reply poll failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reply matcher stopping");
                    break;
                }
            }
        }
    }

    /// One poll over every active sender
    pub async fn tick(&self) -> Result<()> {
        let senders = self.mailboxes.list_active(MailboxRole::Sender).await?;
        let recipients = self.mailboxes.list_active(MailboxRole::Recipient).await?;
        let recipient_addresses: Vec<String> =
            recipients.iter().map(|r| r.email.clone()).collect();

        for sender in senders {
            if let Err(e) = self.poll_sender(&sender, &recipient_addresses).await {
                error!(mailbox = %sender.email, "Reply poll failed: {}", e);
            }
        }

        Ok(())
    }

    async fn poll_sender(&self, sender: &Mailbox, recipient_addresses: &[String]) -> Result<()> {
        let provider = match sender.provider_enum() {
            Ok(provider) => provider,
            Err(_) => return Ok(()),
        };
        let Ok(client) = self.registry.for_provider(provider) else {
            return Ok(());
        };
        let creds = match sender.oauth_tokens() {
            Ok(creds) => creds,
            Err(e) => {
                warn!(mailbox = %sender.email, "Credential bundle unreadable: {}", e);
                return Ok(());
            }
        };

        let now = self.clock.now_utc();
        let since = sender
            .last_reply_poll_at
            .unwrap_or(now - ChronoDuration::hours(INITIAL_LOOKBACK_HOURS));

        let inbound = match client.list_unread_to(&creds, since).await {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(mailbox = %sender.email, "list_unread_to failed: {}", e);
                return Ok(());
            }
        };

        let mut matched = 0u32;
        for mail in &inbound {
            let from = bare_address(&mail.from);
            if !recipient_addresses.iter().any(|addr| addr == &from) {
                continue;
            }

            let Some(message) = self.match_outbound(sender, mail, &from).await? else {
                debug!(mailbox = %sender.email, "Inbound mail matched no outbound message");
                continue;
            };

            if self.messages.mark_replied(message.id, now).await? {
                matched += 1;
                info!(
                    mailbox = %sender.email,
                    message = message.id,
                    from = %from,
                    "Matched inbound reply"
                );
            }
            if let Err(e) = client.mark_read(&creds, &mail.provider_msg_id).await {
                warn!(mailbox = %sender.email, "mark_read on reply failed: {}", e);
            }
        }

        if matched > 0 {
            info!(mailbox = %sender.email, matched, "Recorded new replies");
        }
        self.mailboxes.touch_reply_poll(sender.id, now).await?;

        Ok(())
    }

    /// Thread-id match first; normalized-subject fallback second
    async fn match_outbound(
        &self,
        sender: &Mailbox,
        mail: &InboundMessage,
        from: &str,
    ) -> Result<Option<Message>> {
        if let Some(message) = self
            .messages
            .by_thread(sender.id, &mail.provider_thread_id)
            .await?
        {
            return Ok(Some(message));
        }

        let wanted = normalize_subject(&mail.subject);
        let candidates = self.messages.unreplied_to(sender.id, from, 20).await?;
        Ok(candidates
            .into_iter()
            .find(|candidate| normalize_subject(&candidate.subject) == wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("Re: Hello"), "Hello");
        assert_eq!(normalize_subject("RE: re: Hello"), "Hello");
        assert_eq!(normalize_subject("  Re:Hello  "), "Hello");
        assert_eq!(normalize_subject("Hello"), "Hello");
        assert_eq!(normalize_subject("Regarding the plan"), "Regarding the plan");
        assert_eq!(normalize_subject(""), "");
    }
}
