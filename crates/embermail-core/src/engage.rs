//! Engagement simulator - recipient-side opens, stars and replies
//!
//! Runs every few minutes over the recipient pool. Decisions use the
//! engagement policy snapshotted onto each message at send time, so an
//! operator changing a sender's rates never affects mail already in
//! flight. Every draw is persisted the moment it is made: a no-open draw
//! stamps `processed_at`, a positive one stamps `open_due_at` with the
//! sampled open instant, and later ticks only execute what is already
//! decided. That is what guarantees each message is drawn exactly once.
//! Mail that loses the open draw stays unread at the provider.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use embermail_common::config::EngagementConfig;
use embermail_common::types::{MailboxRole, OauthTokens};
use embermail_common::Result;
use embermail_storage::db::DatabasePool;
use embermail_storage::models::Mailbox;
use embermail_storage::repository::{MailboxRepository, MessageRepository};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::content::{ContentGenerator, ContentKind};
use crate::mail::{MailClient, MailClientRegistry, MailError};

/// Messages examined per recipient per tick
const BATCH_SIZE: i64 = 50;

/// Engagement simulator worker
pub struct EngagementSimulator {
    mailboxes: MailboxRepository,
    messages: MessageRepository,
    registry: MailClientRegistry,
    content: Arc<dyn ContentGenerator>,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    cfg: EngagementConfig,
    interval_secs: u64,
}

impl EngagementSimulator {
    pub fn new(
        pool: DatabasePool,
        registry: MailClientRegistry,
        content: Arc<dyn ContentGenerator>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
        cfg: EngagementConfig,
        interval_secs: u64,
    ) -> Self {
        let pg = pool.pool().clone();
        Self {
            mailboxes: MailboxRepository::new(pg.clone()),
            messages: MessageRepository::new(pg),
            registry,
            content,
            clock,
            rng,
            cfg,
            interval_secs,
        }
    }

    /// Run the engagement loop until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.interval_secs));
        info!(interval_secs = self.interval_secs, "Engagement simulator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Engagement tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Engagement simulator stopping");
                    break;
                }
            }
        }
    }

    /// One engagement pass over every active recipient
    pub async fn tick(&mut self) -> Result<()> {
        let recipients = self.mailboxes.list_active(MailboxRole::Recipient).await?;
        let mut sender_cache: HashMap<i64, Mailbox> = HashMap::new();

        for recipient in recipients {
            if let Err(e) = self.process_recipient(&recipient, &mut sender_cache).await {
                error!(mailbox = %recipient.email, "Recipient engagement failed: {}", e);
            }
        }

        Ok(())
    }

    async fn process_recipient(
        &mut self,
        recipient: &Mailbox,
        sender_cache: &mut HashMap<i64, Mailbox>,
    ) -> Result<()> {
        let provider = match recipient.provider_enum() {
            Ok(provider) => provider,
            Err(_) => {
                self.mailboxes.set_active(recipient.id, false).await?;
                warn!(mailbox = %recipient.email, "Unknown provider; mailbox paused");
                return Ok(());
            }
        };
        let client = match self.registry.for_provider(provider) {
            Ok(client) => client,
            Err(e) => {
                self.mailboxes.set_active(recipient.id, false).await?;
                warn!(mailbox = %recipient.email, "No adapter: {}; mailbox paused", e);
                return Ok(());
            }
        };

        let Some(creds) = self.usable_credentials(client.as_ref(), recipient).await? else {
            return Ok(());
        };

        let now = self.clock.now_utc();
        self.decide_undecided(recipient, now).await?;
        self.process_due_opens(client.as_ref(), recipient, &creds, now)
            .await?;
        self.process_due_stars(client.as_ref(), recipient, &creds, now)
            .await?;
        self.process_due_replies(client.as_ref(), recipient, &creds, now, sender_cache)
            .await?;

        Ok(())
    }

    /// Parse, and if necessary refresh, the recipient's credentials
    async fn usable_credentials(
        &mut self,
        client: &dyn MailClient,
        mailbox: &Mailbox,
    ) -> Result<Option<OauthTokens>> {
        let creds = match mailbox.oauth_tokens() {
            Ok(creds) => creds,
            Err(e) => {
                warn!(mailbox = %mailbox.email, "Credential bundle unreadable: {}", e);
                return Ok(None);
            }
        };

        if !creds.is_expired(self.clock.now_utc()) {
            return Ok(Some(creds));
        }

        match client.refresh(&creds).await {
            Ok(fresh) => {
                self.mailboxes.update_credentials(mailbox.id, &fresh).await?;
                info!(mailbox = %mailbox.email, "Refreshed OAuth credentials");
                Ok(Some(fresh))
            }
            Err(MailError::PermanentAuth(reason)) => {
                error!(mailbox = %mailbox.email, "Authorization lost: {}", reason);
                self.mailboxes.set_needs_reauth(mailbox.id).await?;
                Ok(None)
            }
            Err(e) => {
                warn!(mailbox = %mailbox.email, "Credential refresh failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Draw open / no-open exactly once for messages past the minimum
    /// open delay, persisting the outcome either way
    async fn decide_undecided(&mut self, recipient: &Mailbox, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - ChronoDuration::seconds(self.cfg.open_delay_min_secs as i64);
        let undecided = self
            .messages
            .undecided_for_recipient(recipient.id, cutoff, BATCH_SIZE)
            .await?;

        for message in undecided {
            let roll: f64 = self.rng.gen();
            if roll >= message.open_rate_target {
                // Not opening. The mail stays unread at the provider; only
                // the decision is recorded.
                self.messages.mark_processed(message.id, now).await?;
                debug!(
                    message = message.id,
                    target = message.open_rate_target,
                    "Leaving message unopened"
                );
                continue;
            }

            // Positive draw: fix the open instant now and act when it
            // falls due, possibly on a later tick.
            let open_due = message.sent_at + self.sample_open_delay();
            self.messages.record_open_intent(message.id, open_due).await?;
            debug!(message = message.id, due = %open_due, "Scheduled open");
        }

        Ok(())
    }

    /// Open messages whose recorded open instant has arrived
    async fn process_due_opens(
        &mut self,
        client: &dyn MailClient,
        recipient: &Mailbox,
        creds: &OauthTokens,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for message in self.messages.due_opens(recipient.id, now).await? {
            if let Err(e) = client.mark_read(creds, &message.provider_msg_id).await {
                warn!(message = message.id, "mark_read failed: {}", e);
                continue;
            }

            let star_due = if self.rng.gen::<f64>() < self.cfg.star_probability {
                let delay = self
                    .rng
                    .gen_range(self.cfg.star_delay_min_secs..=self.cfg.star_delay_max_secs);
                Some(now + ChronoDuration::seconds(delay as i64))
            } else {
                None
            };

            let reply_due = if self.rng.gen::<f64>() < message.reply_rate_target {
                let delay = self
                    .rng
                    .gen_range(self.cfg.reply_delay_min_secs..=self.cfg.reply_delay_max_secs);
                Some(now + ChronoDuration::seconds(delay as i64))
            } else {
                None
            };

            if self
                .messages
                .mark_opened(message.id, now, star_due, reply_due)
                .await?
            {
                info!(
                    message = message.id,
                    mailbox = %recipient.email,
                    star = star_due.is_some(),
                    reply = reply_due.is_some(),
                    "Opened warmup email"
                );
            }
        }

        Ok(())
    }

    /// Star messages whose sampled delay has elapsed
    async fn process_due_stars(
        &mut self,
        client: &dyn MailClient,
        recipient: &Mailbox,
        creds: &OauthTokens,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for message in self.messages.due_stars(recipient.id, now).await? {
            if let Err(e) = client.mark_important(creds, &message.provider_msg_id).await {
                warn!(message = message.id, "mark_important failed: {}", e);
                continue;
            }
            if self.messages.mark_starred(message.id, now).await? {
                info!(message = message.id, mailbox = %recipient.email, "Starred warmup email");
            }
        }
        Ok(())
    }

    /// Send replies whose sampled delay has elapsed
    async fn process_due_replies(
        &mut self,
        client: &dyn MailClient,
        recipient: &Mailbox,
        creds: &OauthTokens,
        now: DateTime<Utc>,
        sender_cache: &mut HashMap<i64, Mailbox>,
    ) -> Result<()> {
        for message in self.messages.due_replies(recipient.id, now).await? {
            let sender = match sender_cache.get(&message.sender_id) {
                Some(sender) => sender.clone(),
                None => match self.mailboxes.get(message.sender_id).await? {
                    Some(sender) => {
                        sender_cache.insert(sender.id, sender.clone());
                        sender
                    }
                    None => {
                        warn!(message = message.id, "Reply target sender vanished");
                        continue;
                    }
                },
            };

            let content = match self.content.generate(ContentKind::Reply).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(message = message.id, "Reply content generation failed: {}", e);
                    continue;
                }
            };

            let result = client
                .send_reply(
                    creds,
                    &recipient.email,
                    &sender.email,
                    &message.provider_thread_id,
                    &message.provider_msg_id,
                    &message.subject,
                    &content.body_html,
                )
                .await;

            match result {
                Ok(_) => {
                    if self.messages.mark_replied(message.id, now).await? {
                        info!(
                            message = message.id,
                            mailbox = %recipient.email,
                            sender = %sender.email,
                            "Replied to warmup email"
                        );
                    }
                }
                Err(e) => {
                    warn!(message = message.id, "send_reply failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Beta(2,5)-shaped open delay scaled to the configured range: most
    /// opens come quickly, a tail takes longer.
    fn sample_open_delay(&mut self) -> ChronoDuration {
        let beta = Beta::new(2.0, 5.0).expect("valid beta distribution");
        let factor: f64 = beta.sample(&mut self.rng);
        let min = self.cfg.open_delay_min_secs as f64;
        let max = self.cfg.open_delay_max_secs as f64;
        ChronoDuration::seconds((min + (max - min) * factor) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_open_delay_stays_in_range() {
        let beta = Beta::new(2.0, 5.0).unwrap();
        let mut rng = StdRng::seed_from_u64(13);
        let cfg = EngagementConfig::default();
        for _ in 0..1000 {
            let factor: f64 = beta.sample(&mut rng);
            let secs = cfg.open_delay_min_secs as f64
                + (cfg.open_delay_max_secs - cfg.open_delay_min_secs) as f64 * factor;
            assert!(secs >= cfg.open_delay_min_secs as f64);
            assert!(secs <= cfg.open_delay_max_secs as f64);
        }
    }

    #[test]
    fn test_open_delay_skews_early() {
        // Beta(2,5) has mean 2/7; the scaled mean should sit well below
        // the midpoint of the range.
        let beta = Beta::new(2.0, 5.0).unwrap();
        let mut rng = StdRng::seed_from_u64(29);
        let samples: Vec<f64> = (0..5000).map(|_| beta.sample(&mut rng)).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!(mean < 0.4, "mean {} not skewed early", mean);
        assert!(mean > 0.2, "mean {} implausibly low", mean);
    }
}
