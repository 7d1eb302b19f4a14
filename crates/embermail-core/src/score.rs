//! Score engine - 0-100 reputation summary per sender
//!
//! Recomputed every few hours from the last 30 days of messages and spam
//! events. Four weighted sub-scores: open rate 40%, reply rate 30%, phase
//! progress 20%, spam 10%. The numeric score lands on the mailbox row; the
//! full report with component breakdown and a status line is returned for
//! the analytics path.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Weekday};
use embermail_common::config::ScoreConfig;
use embermail_common::types::MailboxRole;
use embermail_common::Result;
use embermail_storage::db::DatabasePool;
use embermail_storage::models::{EngagementCounts, Mailbox, SpamCounts};
use embermail_storage::repository::{MailboxRepository, MessageRepository, SpamEventRepository};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{error, info};

use crate::clock::{now_in, parse_tz, Clock};
use crate::phase;

const WEIGHT_OPEN: f64 = 0.40;
const WEIGHT_REPLY: f64 = 0.30;
const WEIGHT_PHASE: f64 = 0.20;
const WEIGHT_SPAM: f64 = 0.10;

/// Open-rate sub-score. Rate is a fraction in [0, 1].
pub fn open_sub_score(open_rate: f64) -> f64 {
    if open_rate >= 0.60 {
        100.0
    } else if open_rate >= 0.40 {
        80.0
    } else if open_rate >= 0.20 {
        60.0
    } else {
        (open_rate / 0.20) * 60.0
    }
}

/// Reply-rate sub-score
pub fn reply_sub_score(reply_rate: f64) -> f64 {
    if reply_rate >= 0.25 {
        100.0
    } else if reply_rate >= 0.15 {
        85.0
    } else if reply_rate >= 0.05 {
        70.0
    } else {
        (reply_rate / 0.05) * 70.0
    }
}

/// Phase-progress sub-score: the phase's base score, adjusted for how
/// closely actual volume tracks the phase target.
pub fn phase_sub_score(warmup_day: i32, phase_target: f64, phase_actual: f64) -> f64 {
    let Some(current) = phase::phase_for(warmup_day) else {
        return 0.0;
    };

    let ratio = if phase_target > 0.0 {
        phase_actual / phase_target
    } else {
        0.0
    };

    let mut score = current.base_score;
    if ratio >= 0.9 {
        score += 10.0;
    } else if ratio < 0.5 {
        score -= 15.0;
    }

    score.clamp(0.0, 100.0)
}

/// Spam sub-score: spam rate penalty plus a recovery-rate adjustment
pub fn spam_sub_score(sent: i64, spam_detected: i64, spam_recovered: i64) -> f64 {
    if sent == 0 {
        return 100.0;
    }

    let spam_rate = spam_detected as f64 / sent as f64;
    let mut score = if spam_rate <= 0.02 {
        100.0
    } else if spam_rate <= 0.05 {
        85.0
    } else if spam_rate <= 0.10 {
        60.0
    } else {
        (100.0 - spam_rate * 100.0 * 8.0).max(0.0)
    };

    if spam_detected > 0 {
        let recovery_rate = spam_recovered as f64 / spam_detected as f64;
        if recovery_rate >= 0.8 {
            score += 10.0;
        } else if recovery_rate < 0.5 {
            score -= 10.0;
        }
    }

    score.clamp(0.0, 100.0)
}

/// Weighted total, rounded to one decimal and clamped to [0, 100]
pub fn total_score(s_open: f64, s_reply: f64, s_phase: f64, s_spam: f64) -> f64 {
    let total = s_open * WEIGHT_OPEN + s_reply * WEIGHT_REPLY + s_phase * WEIGHT_PHASE
        + s_spam * WEIGHT_SPAM;
    ((total * 10.0).round() / 10.0).clamp(0.0, 100.0)
}

/// Letter grade for a score
pub fn grade_for(score: f64) -> &'static str {
    if score >= 90.0 {
        "A+"
    } else if score >= 80.0 {
        "A"
    } else if score >= 70.0 {
        "B"
    } else if score >= 60.0 {
        "C"
    } else if score >= 50.0 {
        "D"
    } else {
        "F"
    }
}

fn status_for(score: f64, warmup_day: i32) -> String {
    if score >= 90.0 {
        if warmup_day >= 29 {
            "Warmup complete; reputation is excellent and ready for full volume".to_string()
        } else {
            "Reputation is excellent; keep the current pace".to_string()
        }
    } else if score >= 80.0 {
        "Strong deliverability; nearly at peak trust".to_string()
    } else if score >= 70.0 {
        "Good progress; engagement could be a little higher".to_string()
    } else if score >= 60.0 {
        "Fair; improve engagement and watch the spam rate".to_string()
    } else if score >= 50.0 {
        "Poor; deliverability needs attention before scaling up".to_string()
    } else {
        "Critical; pause sending and investigate deliverability".to_string()
    }
}

/// One weighted component of the report
#[derive(Debug, Clone, Serialize)]
pub struct ComponentScore {
    /// The underlying rate or ratio, as observed
    pub value: f64,
    /// Sub-score out of 100
    pub score: f64,
    /// Weighted contribution to the total
    pub contribution: f64,
    /// Weight in percent
    pub weight: u32,
}

/// Full score report for one sender
#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub score: f64,
    pub grade: &'static str,
    pub status: String,
    pub warmup_day: i32,
    pub phase: u8,
    pub open: ComponentScore,
    pub reply: ComponentScore,
    pub phase_progress: ComponentScore,
    pub spam: ComponentScore,
    pub sent: i64,
    pub opened: i64,
    pub replied: i64,
    pub spam_detected: i64,
    pub spam_recovered: i64,
}

/// Assemble the report from window statistics
pub fn compute_report(
    warmup_day: i32,
    daily_limit: i32,
    counts: EngagementCounts,
    spam: SpamCounts,
    phase_actual: f64,
) -> ScoreReport {
    let open_rate = if counts.sent > 0 {
        counts.opened as f64 / counts.sent as f64
    } else {
        0.0
    };
    let reply_rate = if counts.sent > 0 {
        counts.replied as f64 / counts.sent as f64
    } else {
        0.0
    };
    let spam_rate = if counts.sent > 0 {
        spam.detected as f64 / counts.sent as f64
    } else {
        0.0
    };

    let s_open = open_sub_score(open_rate);
    let s_reply = reply_sub_score(reply_rate);
    let s_phase = phase_sub_score(warmup_day, f64::from(daily_limit), phase_actual);
    let s_spam = spam_sub_score(counts.sent, spam.detected, spam.recovered);

    let score = total_score(s_open, s_reply, s_phase, s_spam);

    ScoreReport {
        score,
        grade: grade_for(score),
        status: status_for(score, warmup_day),
        warmup_day,
        phase: phase::phase_for(warmup_day).map(|p| p.number).unwrap_or(0),
        open: ComponentScore {
            value: open_rate,
            score: s_open,
            contribution: s_open * WEIGHT_OPEN,
            weight: 40,
        },
        reply: ComponentScore {
            value: reply_rate,
            score: s_reply,
            contribution: s_reply * WEIGHT_REPLY,
            weight: 30,
        },
        phase_progress: ComponentScore {
            value: phase_actual,
            score: s_phase,
            contribution: s_phase * WEIGHT_PHASE,
            weight: 20,
        },
        spam: ComponentScore {
            value: spam_rate,
            score: s_spam,
            contribution: s_spam * WEIGHT_SPAM,
            weight: 10,
        },
        sent: counts.sent,
        opened: counts.opened,
        replied: counts.replied,
        spam_detected: spam.detected,
        spam_recovered: spam.recovered,
    }
}

/// The earliest of the last `count` business days ending at `today`
pub fn business_days_back(today: NaiveDate, count: u32) -> NaiveDate {
    let mut date = today;
    let mut collected = 0u32;
    let mut earliest = today;

    while collected < count {
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            collected += 1;
            earliest = date;
        }
        date -= ChronoDuration::days(1);
    }

    earliest
}

/// Score engine worker
pub struct ScoreEngine {
    mailboxes: MailboxRepository,
    messages: MessageRepository,
    spam_events: SpamEventRepository,
    clock: Arc<dyn Clock>,
    cfg: ScoreConfig,
    interval_secs: u64,
}

impl ScoreEngine {
    pub fn new(
        pool: DatabasePool,
        clock: Arc<dyn Clock>,
        cfg: ScoreConfig,
        interval_secs: u64,
    ) -> Self {
        let pg = pool.pool().clone();
        Self {
            mailboxes: MailboxRepository::new(pg.clone()),
            messages: MessageRepository::new(pg.clone()),
            spam_events: SpamEventRepository::new(pg),
            clock,
            cfg,
            interval_secs,
        }
    }

    /// Run the scoring loop until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TokioDuration::from_secs(self.interval_secs));
        info!(interval_secs = self.interval_secs, "Score engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Score tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Score engine stopping");
                    break;
                }
            }
        }
    }

    /// Recompute and persist the score of every active sender
    pub async fn tick(&self) -> Result<()> {
        let senders = self.mailboxes.list_active(MailboxRole::Sender).await?;

        for sender in senders {
            match self.score_sender(&sender).await {
                Ok(report) => {
                    info!(
                        mailbox = %sender.email,
                        score = report.score,
                        grade = report.grade,
                        "{}",
                        report.status
                    );
                }
                Err(e) => error!(mailbox = %sender.email, "Scoring failed: {}", e),
            }
        }

        Ok(())
    }

    /// Compute, persist and return one sender's report
    pub async fn score_sender(&self, sender: &Mailbox) -> Result<ScoreReport> {
        let now = self.clock.now_utc();
        let window_start = now - ChronoDuration::days(i64::from(self.cfg.window_days));

        let counts = self.messages.engagement_counts(sender.id, window_start).await?;
        let spam = self.spam_events.spam_counts(sender.id, window_start).await?;

        // Average over the last seven business days in the sender's zone.
        let tz = parse_tz(&sender.tz)?;
        let local_today = now_in(self.clock.as_ref(), tz).date_naive();
        let earliest = business_days_back(local_today, 7);
        let since = tz
            .from_local_datetime(&earliest.and_hms_opt(0, 0, 0).expect("midnight exists"))
            .earliest()
            .map(|local| local.with_timezone(&chrono::Utc))
            .unwrap_or(window_start);
        let recent = self.messages.sent_since(sender.id, since).await?;
        let phase_actual = recent as f64 / 7.0;

        let report = compute_report(
            sender.warmup_day,
            sender.daily_limit,
            counts,
            spam,
            phase_actual,
        );

        self.mailboxes.update_score(sender.id, report.score).await?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_sub_score_thresholds() {
        assert_eq!(open_sub_score(0.60), 100.0);
        assert_eq!(open_sub_score(0.75), 100.0);
        assert_eq!(open_sub_score(0.40), 80.0);
        assert_eq!(open_sub_score(0.20), 60.0);
        assert_eq!(open_sub_score(0.10), 30.0);
        assert_eq!(open_sub_score(0.0), 0.0);
    }

    #[test]
    fn test_reply_sub_score_thresholds() {
        assert_eq!(reply_sub_score(0.25), 100.0);
        assert_eq!(reply_sub_score(0.15), 85.0);
        assert_eq!(reply_sub_score(0.05), 70.0);
        assert_eq!(reply_sub_score(0.025), 35.0);
        assert_eq!(reply_sub_score(0.0), 0.0);
    }

    #[test]
    fn test_phase_sub_score_bonus_and_penalty() {
        // Phase 2 base is 65. Meeting 90% of target earns the bonus.
        assert_eq!(phase_sub_score(10, 10.0, 9.5), 75.0);
        // Between 50% and 90%: base only.
        assert_eq!(phase_sub_score(10, 10.0, 7.0), 65.0);
        // Below half target: penalty.
        assert_eq!(phase_sub_score(10, 10.0, 3.0), 50.0);
        // Day 0: no phase, no score.
        assert_eq!(phase_sub_score(0, 10.0, 10.0), 0.0);
        // Phase 5 with bonus clamps at 100.
        assert_eq!(phase_sub_score(30, 50.0, 50.0), 100.0);
    }

    #[test]
    fn test_spam_sub_score_rates() {
        assert_eq!(spam_sub_score(100, 0, 0), 100.0);
        // 2% with full recovery: 100 + 10, clamped.
        assert_eq!(spam_sub_score(100, 2, 2), 100.0);
        // 5% with 80% recovery: 85 + 10.
        assert_eq!(spam_sub_score(100, 5, 4), 95.0);
        // 10% with poor recovery: 60 - 10.
        assert_eq!(spam_sub_score(100, 10, 2), 50.0);
        // 20% spam rate: 100 - 160 floors at 0, recovery cannot rescue much.
        assert_eq!(spam_sub_score(100, 20, 0), 0.0);
        // No mail yet means a clean slate.
        assert_eq!(spam_sub_score(0, 0, 0), 100.0);
    }

    #[test]
    fn test_total_score_weighting() {
        assert_eq!(total_score(100.0, 100.0, 100.0, 100.0), 100.0);
        assert_eq!(total_score(0.0, 0.0, 0.0, 0.0), 0.0);
        // 40 + 15 + 10 + 5
        assert_eq!(total_score(100.0, 50.0, 50.0, 50.0), 70.0);
        assert_eq!(total_score(80.0, 70.0, 65.0, 95.0), 75.5);
    }

    #[test]
    fn test_total_score_monotone_in_each_component() {
        let base = (60.0, 60.0, 60.0, 60.0);
        let total = total_score(base.0, base.1, base.2, base.3);
        assert!(total_score(base.0 + 10.0, base.1, base.2, base.3) > total);
        assert!(total_score(base.0, base.1 + 10.0, base.2, base.3) > total);
        assert!(total_score(base.0, base.1, base.2 + 10.0, base.3) > total);
        assert!(total_score(base.0, base.1, base.2, base.3 + 10.0) > total);
    }

    #[test]
    fn test_grades() {
        assert_eq!(grade_for(95.0), "A+");
        assert_eq!(grade_for(90.0), "A+");
        assert_eq!(grade_for(85.0), "A");
        assert_eq!(grade_for(72.5), "B");
        assert_eq!(grade_for(65.0), "C");
        assert_eq!(grade_for(55.0), "D");
        assert_eq!(grade_for(49.9), "F");
    }

    #[test]
    fn test_compute_report_healthy_sender() {
        let counts = EngagementCounts {
            sent: 100,
            opened: 70,
            replied: 30,
        };
        let spam = SpamCounts {
            detected: 1,
            recovered: 1,
        };
        // Day 10, limit 10, averaging 9.5/day.
        let report = compute_report(10, 10, counts, spam, 9.5);

        assert_eq!(report.open.score, 100.0);
        assert_eq!(report.reply.score, 100.0);
        assert_eq!(report.phase_progress.score, 75.0);
        assert_eq!(report.spam.score, 100.0);
        // 40 + 30 + 15 + 10
        assert_eq!(report.score, 95.0);
        assert_eq!(report.grade, "A+");
        assert_eq!(report.phase, 2);
    }

    #[test]
    fn test_compute_report_fresh_sender() {
        let report = compute_report(0, 0, EngagementCounts::default(), SpamCounts::default(), 0.0);
        // No mail, no phase: only the clean spam slate contributes.
        assert_eq!(report.score, 10.0);
        assert_eq!(report.grade, "F");
        assert_eq!(report.phase, 0);
    }

    #[test]
    fn test_business_days_back() {
        // Friday 2025-10-10: seven business days back lands on Thursday
        // of the previous week.
        let friday = NaiveDate::from_ymd_opt(2025, 10, 10).unwrap();
        assert_eq!(
            business_days_back(friday, 7),
            NaiveDate::from_ymd_opt(2025, 10, 2).unwrap()
        );

        // From a Sunday, the window ends the preceding Friday.
        let sunday = NaiveDate::from_ymd_opt(2025, 10, 12).unwrap();
        assert_eq!(
            business_days_back(sunday, 7),
            NaiveDate::from_ymd_opt(2025, 10, 2).unwrap()
        );

        // One business day back from a Monday is the Monday itself.
        let monday = NaiveDate::from_ymd_opt(2025, 10, 13).unwrap();
        assert_eq!(business_days_back(monday, 1), monday);
    }
}
