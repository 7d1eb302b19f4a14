//! Day advancer - moves each sender's warmup day forward at local midnight
//!
//! Runs hourly so that every timezone's midnight is caught within the
//! hour. The advance itself is a compare-and-swap on the mailbox row, so
//! however often the tick fires, a mailbox moves at most once per local
//! calendar day. Plan retention cleanup rides along on the same cadence.

use chrono::Duration as ChronoDuration;
use embermail_common::config::PlanConfig;
use embermail_common::types::MailboxRole;
use embermail_common::Result;
use embermail_storage::db::DatabasePool;
use embermail_storage::models::Mailbox;
use embermail_storage::repository::{MailboxRepository, PlanEntryRepository};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info};

use crate::clock::{now_in, parse_tz, Clock};
use crate::phase;

/// Day advancer worker
pub struct DayAdvancer {
    mailboxes: MailboxRepository,
    plans: PlanEntryRepository,
    clock: Arc<dyn Clock>,
    plan_cfg: PlanConfig,
    interval_secs: u64,
}

impl DayAdvancer {
    pub fn new(
        pool: DatabasePool,
        clock: Arc<dyn Clock>,
        plan_cfg: PlanConfig,
        interval_secs: u64,
    ) -> Self {
        let pg = pool.pool().clone();
        Self {
            mailboxes: MailboxRepository::new(pg.clone()),
            plans: PlanEntryRepository::new(pg),
            clock,
            plan_cfg,
            interval_secs,
        }
    }

    /// Run the advance loop until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.interval_secs));
        info!(interval_secs = self.interval_secs, "Day advancer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Day advance tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Day advancer stopping");
                    break;
                }
            }
        }
    }

    /// One advance pass over every active sender, plus retention cleanup
    pub async fn tick(&self) -> Result<()> {
        let senders = self.mailboxes.list_active(MailboxRole::Sender).await?;
        let mut advanced = 0u32;

        for sender in &senders {
            match self.advance_sender(sender).await {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(e) => error!(mailbox = %sender.email, "Day advance failed: {}", e),
            }
        }

        if advanced > 0 {
            info!(advanced, "Advanced warmup days");
        }

        self.purge_old_plans().await?;

        Ok(())
    }

    /// Advance one sender if its local date has rolled over
    async fn advance_sender(&self, sender: &Mailbox) -> Result<bool> {
        let tz = parse_tz(&sender.tz)?;
        let local_today = now_in(self.clock.as_ref(), tz).date_naive();

        if let Some(last) = sender.last_advance_date {
            if local_today <= last {
                return Ok(false);
            }
        }

        let old_day = sender.warmup_day;
        let new_day = old_day + 1;
        let old_limit = sender.daily_limit;
        let new_limit = phase::daily_limit(new_day, sender.target);

        let advanced = self
            .mailboxes
            .advance_day(sender.id, old_day, new_day, new_limit, local_today)
            .await?;
        if !advanced {
            // Another tick won the compare-and-swap.
            debug!(mailbox = %sender.email, "Warmup day already advanced today");
            return Ok(false);
        }

        info!(
            mailbox = %sender.email,
            from_day = old_day,
            to_day = new_day,
            daily_limit = new_limit,
            "Advanced warmup day"
        );

        if phase::is_phase_boundary(new_day) {
            let from_phase = phase::phase_for(old_day).map(|p| p.number).unwrap_or(0);
            let to_phase = phase::phase_for(new_day).map(|p| p.number).unwrap_or(0);
            info!(
                mailbox = %sender.email,
                from_phase,
                to_phase,
                old_limit,
                new_limit,
                "Warmup phase transition"
            );
        }

        Ok(true)
    }

    /// Drop terminal plan entries older than the retention window
    async fn purge_old_plans(&self) -> Result<()> {
        let cutoff = (self.clock.now_utc()
            - ChronoDuration::days(i64::from(self.plan_cfg.retention_days)))
        .date_naive();

        let purged = self.plans.purge(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged old plan entries");
        }
        Ok(())
    }
}
