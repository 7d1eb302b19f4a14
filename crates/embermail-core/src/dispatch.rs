//! Dispatcher - converts due plan entries into sent messages
//!
//! Runs every couple of minutes. Each tick groups active senders by
//! timezone, lazily plans any sender that has no entries for its local
//! date, then processes the due entries of every zone currently inside
//! business hours. A zone's entries are claimed and resolved inside a
//! single transaction so a database failure rolls the whole tick back and
//! concurrent workers never double-send.

use chrono::Duration as ChronoDuration;
use chrono_tz::Tz;
use embermail_common::config::{BandsConfig, BusinessHoursConfig, PlanConfig};
use embermail_common::types::{Band, MailboxId, OauthTokens};
use embermail_common::{Error, Result};
use embermail_storage::db::DatabasePool;
use embermail_storage::models::{CreateMessage, Mailbox, PlanEntry};
use embermail_storage::repository::{
    MailboxRepository, MessageRepository, NewPlanEntry, PlanEntryRepository,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use sqlx::{Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{is_business_hours, now_in, parse_tz, Clock};
use crate::content::{ContentGenerator, ContentKind};
use crate::mail::{MailClient, MailClientRegistry, MailError};
use crate::planner;

/// How one due entry was resolved
enum DispatchOutcome {
    Sent,
    Failed(String),
    Skipped(String),
    /// The sender lost authorization; no further entries for it this tick
    AuthLost(String),
}

/// Dispatcher worker
pub struct Dispatcher {
    pool: DatabasePool,
    mailboxes: MailboxRepository,
    plans: PlanEntryRepository,
    messages: MessageRepository,
    registry: MailClientRegistry,
    content: Arc<dyn ContentGenerator>,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    hours: BusinessHoursConfig,
    bands: BandsConfig,
    plan_cfg: PlanConfig,
    interval_secs: u64,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DatabasePool,
        registry: MailClientRegistry,
        content: Arc<dyn ContentGenerator>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
        hours: BusinessHoursConfig,
        bands: BandsConfig,
        plan_cfg: PlanConfig,
        interval_secs: u64,
    ) -> Self {
        let pg = pool.pool().clone();
        Self {
            pool,
            mailboxes: MailboxRepository::new(pg.clone()),
            plans: PlanEntryRepository::new(pg.clone()),
            messages: MessageRepository::new(pg),
            registry,
            content,
            clock,
            rng,
            hours,
            bands,
            plan_cfg,
            interval_secs,
        }
    }

    /// Run the dispatch loop until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.interval_secs));
        let stop_flag = shutdown.clone();
        info!(interval_secs = self.interval_secs, "Dispatcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&stop_flag).await {
                        error!("Dispatch tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Dispatcher stopping");
                    break;
                }
            }
        }
    }

    /// One dispatch pass over every zone
    pub async fn tick(&mut self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let zones = self.mailboxes.active_sender_zones().await?;
        if zones.is_empty() {
            return Ok(());
        }

        let recipients = self
            .mailboxes
            .list_active(embermail_common::types::MailboxRole::Recipient)
            .await?;

        for zone in zones {
            if *shutdown.borrow() {
                break;
            }

            let tz = match parse_tz(&zone) {
                Ok(tz) => tz,
                Err(_) => {
                    warn!(zone = %zone, "Skipping senders with unparseable timezone");
                    continue;
                }
            };

            let local = now_in(self.clock.as_ref(), tz);
            if !is_business_hours(&local, &self.hours) {
                continue;
            }

            let local_date = local.date_naive();
            if let Err(e) = self.ensure_plans(&zone, tz, local_date).await {
                error!(zone = %zone, "Plan generation failed: {}", e);
            }

            if let Err(e) = self
                .dispatch_zone(&zone, tz, local_date, &recipients, shutdown)
                .await
            {
                error!(zone = %zone, "Zone dispatch failed: {}", e);
            }
        }

        Ok(())
    }

    /// Produce plans for senders that have none for the local date
    async fn ensure_plans(
        &mut self,
        zone: &str,
        tz: Tz,
        local_date: chrono::NaiveDate,
    ) -> Result<()> {
        let senders = self.mailboxes.active_senders_in_zone(zone).await?;

        for sender in senders {
            if sender.warmup_day <= 0 || sender.daily_limit <= 0 {
                continue;
            }
            if self.plans.count_for_date(sender.id, local_date).await? > 0 {
                continue;
            }

            let plan = planner::plan_day(
                &mut self.rng,
                tz,
                local_date,
                sender.daily_limit as u32,
                &self.hours,
                &self.bands,
            );
            if plan.is_empty() {
                continue;
            }

            let entries: Vec<NewPlanEntry> = plan
                .iter()
                .map(|p| NewPlanEntry {
                    fire_at: p.fire_at,
                    band: p.band,
                })
                .collect();

            let written = self.plans.upsert_plan(sender.id, local_date, &entries).await?;

            let count = |band: Band| plan.iter().filter(|p| p.band == band).count();
            info!(
                mailbox = %sender.email,
                date = %local_date,
                total = written,
                peak = count(Band::Peak),
                normal = count(Band::Normal),
                low = count(Band::Low),
                "Generated daily send plan"
            );
        }

        Ok(())
    }

    /// Claim and resolve the due entries of one zone inside a transaction
    async fn dispatch_zone(
        &mut self,
        zone: &str,
        tz: Tz,
        local_date: chrono::NaiveDate,
        recipients: &[Mailbox],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let now = self.clock.now_utc();
        let grace = ChronoDuration::seconds(self.plan_cfg.grace_window_secs as i64);
        let window = ChronoDuration::seconds(self.plan_cfg.fire_window_secs as i64);

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let due = self
            .plans
            .lock_due(&mut tx, zone, now, grace, window)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(zone = %zone, due = due.len(), "Processing due plan entries");

        let mut senders: HashMap<MailboxId, Mailbox> = HashMap::new();
        for sender in self.mailboxes.active_senders_in_zone(zone).await? {
            senders.insert(sender.id, sender);
        }

        let mut lost_auth: HashSet<MailboxId> = HashSet::new();
        let mut had_failures: HashSet<MailboxId> = HashSet::new();

        for entry in &due {
            if *shutdown.borrow() {
                break;
            }
            if lost_auth.contains(&entry.sender_id) {
                self.plans
                    .mark_failed(&mut tx, entry.id, "Sender awaiting re-authorization")
                    .await?;
                continue;
            }

            let Some(sender) = senders.get(&entry.sender_id).cloned() else {
                self.plans
                    .mark_skipped(&mut tx, entry.id, "Sender no longer dispatchable")
                    .await?;
                continue;
            };

            let outcome = self
                .dispatch_entry(&mut tx, entry, &sender, tz, recipients, &mut senders)
                .await?;

            match outcome {
                DispatchOutcome::Sent => {}
                DispatchOutcome::Failed(reason) => {
                    warn!(mailbox = %sender.email, entry = entry.id, "Send failed: {}", reason);
                    self.plans.mark_failed(&mut tx, entry.id, &reason).await?;
                    had_failures.insert(sender.id);
                }
                DispatchOutcome::Skipped(reason) => {
                    warn!(mailbox = %sender.email, entry = entry.id, "Entry skipped: {}", reason);
                    self.plans.mark_skipped(&mut tx, entry.id, &reason).await?;
                }
                DispatchOutcome::AuthLost(reason) => {
                    error!(mailbox = %sender.email, "Authorization lost: {}", reason);
                    self.plans.mark_failed(&mut tx, entry.id, &reason).await?;
                    lost_auth.insert(sender.id);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // Outside the dispatch transaction: flag mailboxes that lost
        // authorization and retire their future plans.
        for sender_id in &lost_auth {
            self.mailboxes.set_needs_reauth(*sender_id).await?;
            let skipped = self
                .plans
                .skip_future(*sender_id, now, "Mailbox needs re-authorization")
                .await?;
            info!(sender = sender_id, skipped, "Skipped future plan entries");
        }

        // Regenerate the remainder of the day for senders whose failures
        // crossed the threshold this tick.
        for sender_id in had_failures {
            if let Some(sender) = senders.get(&sender_id) {
                if let Err(e) = self.maybe_replan(sender, tz, local_date).await {
                    error!(mailbox = %sender.email, "Replan failed: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Resolve a single due entry. Terminal plan-entry transitions for the
    /// success path happen here; failure paths are mapped by the caller.
    async fn dispatch_entry(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &PlanEntry,
        sender: &Mailbox,
        tz: Tz,
        recipients: &[Mailbox],
        senders: &mut HashMap<MailboxId, Mailbox>,
    ) -> Result<DispatchOutcome> {
        // A fire time that no longer projects into business hours (DST
        // shift since planning) is poisoned.
        if !planner::is_dispatchable(entry.fire_at, tz, entry.local_date, &self.hours) {
            return Ok(DispatchOutcome::Skipped(
                "Fire time outside business hours".to_string(),
            ));
        }

        let provider = match sender.provider_enum() {
            Ok(provider) => provider,
            Err(_) => {
                self.mailboxes.set_active(sender.id, false).await?;
                warn!(mailbox = %sender.email, provider = %sender.provider, "Unknown provider; mailbox paused");
                return Ok(DispatchOutcome::Skipped(format!(
                    "Unknown provider {}",
                    sender.provider
                )));
            }
        };
        let client = match self.registry.for_provider(provider) {
            Ok(client) => client,
            Err(e) => {
                self.mailboxes.set_active(sender.id, false).await?;
                return Ok(DispatchOutcome::Skipped(e.to_string()));
            }
        };

        let Some(recipient) = recipients.choose(&mut self.rng).cloned() else {
            return Ok(DispatchOutcome::Failed(
                "No active recipient mailboxes".to_string(),
            ));
        };

        let content = match self.content.generate(ContentKind::General).await {
            Ok(content) => content,
            Err(e) => return Ok(DispatchOutcome::Failed(format!("Content generator: {}", e))),
        };

        let mut creds = match sender.oauth_tokens() {
            Ok(creds) => creds,
            Err(e) => return Ok(DispatchOutcome::Failed(format!("Credential bundle: {}", e))),
        };

        let now = self.clock.now_utc();
        if creds.is_expired(now) {
            match self.refresh_credentials(client.as_ref(), sender, &creds, senders).await? {
                Ok(fresh) => creds = fresh,
                Err(outcome) => return Ok(outcome),
            }
        }

        let sent = match client
            .send(
                &creds,
                &sender.email,
                &recipient.email,
                &content.subject,
                &content.body_html,
            )
            .await
        {
            Ok(sent) => sent,
            Err(MailError::PermanentAuth(_)) => {
                // The provider rejected a token we believed valid: refresh
                // once and retry within the tick.
                match self.refresh_credentials(client.as_ref(), sender, &creds, senders).await? {
                    Ok(fresh) => match client
                        .send(
                            &fresh,
                            &sender.email,
                            &recipient.email,
                            &content.subject,
                            &content.body_html,
                        )
                        .await
                    {
                        Ok(sent) => sent,
                        Err(MailError::PermanentAuth(reason)) => {
                            return Ok(DispatchOutcome::AuthLost(reason))
                        }
                        Err(e) => return Ok(DispatchOutcome::Failed(e.to_string())),
                    },
                    Err(outcome) => return Ok(outcome),
                }
            }
            Err(e) => return Ok(DispatchOutcome::Failed(e.to_string())),
        };

        let message = self
            .messages
            .create(
                tx,
                CreateMessage {
                    plan_entry_id: entry.id,
                    sender_id: sender.id,
                    recipient_id: recipient.id,
                    recipient_address: recipient.email.clone(),
                    subject: content.subject.clone(),
                    body_html: content.body_html,
                    provider_msg_id: sent.provider_msg_id,
                    provider_thread_id: sent.provider_thread_id,
                    tracking_id: Uuid::new_v4(),
                    open_rate_target: sender.open_rate_target,
                    reply_rate_target: sender.reply_rate_target,
                    sent_at: now,
                },
            )
            .await?;

        let marked = self.plans.mark_sent(tx, entry.id, message.id).await?;
        if !marked {
            // Another worker resolved this entry first; conditional UPDATE
            // returned no rows. Skip silently.
            debug!(entry = entry.id, "Duplicate dispatch suppressed");
            return Ok(DispatchOutcome::Sent);
        }

        info!(
            mailbox = %sender.email,
            recipient = %recipient.email,
            band = %entry.band,
            "Dispatched warmup email"
        );

        Ok(DispatchOutcome::Sent)
    }

    /// Refresh the credential bundle and persist the result. The outer
    /// `Result` is a database error; the inner one distinguishes a usable
    /// fresh bundle from a dispatch outcome to report.
    async fn refresh_credentials(
        &self,
        client: &dyn MailClient,
        sender: &Mailbox,
        creds: &OauthTokens,
        senders: &mut HashMap<MailboxId, Mailbox>,
    ) -> Result<std::result::Result<OauthTokens, DispatchOutcome>> {
        match client.refresh(creds).await {
            Ok(fresh) => {
                self.mailboxes.update_credentials(sender.id, &fresh).await?;
                if let Some(cached) = senders.get_mut(&sender.id) {
                    cached.credentials = fresh.to_value()?;
                }
                info!(mailbox = %sender.email, "Refreshed OAuth credentials");
                Ok(Ok(fresh))
            }
            Err(MailError::PermanentAuth(reason)) => Ok(Err(DispatchOutcome::AuthLost(reason))),
            Err(e) => Ok(Err(DispatchOutcome::Failed(format!(
                "Credential refresh: {}",
                e
            )))),
        }
    }

    /// Regenerate the rest of the day once accumulated failures cross the
    /// configured threshold
    async fn maybe_replan(
        &mut self,
        sender: &Mailbox,
        tz: Tz,
        local_date: chrono::NaiveDate,
    ) -> Result<()> {
        let attempts = self.plans.failed_attempts(sender.id, local_date).await?;
        if attempts <= i64::from(self.plan_cfg.replan_attempt_threshold) {
            return Ok(());
        }

        let sent = self
            .plans
            .count_by_status(sender.id, local_date, "sent")
            .await?;
        let remaining = i64::from(sender.daily_limit) - sent;
        if remaining <= 0 {
            return Ok(());
        }

        let now = self.clock.now_utc();
        let plan = planner::plan_remaining(
            &mut self.rng,
            tz,
            local_date,
            remaining as u32,
            now,
            &self.hours,
            &self.bands,
        );

        let entries: Vec<NewPlanEntry> = plan
            .iter()
            .map(|p| NewPlanEntry {
                fire_at: p.fire_at,
                band: p.band,
            })
            .collect();

        let written = self
            .plans
            .replace_pending(sender.id, local_date, &entries)
            .await?;

        info!(
            mailbox = %sender.email,
            date = %local_date,
            failed_attempts = attempts,
            regenerated = written,
            "Regenerated remaining plan after repeated failures"
        );

        Ok(())
    }
}
