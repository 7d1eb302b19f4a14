//! Schedule planner
//!
//! Produces the ordered list of absolute send instants for one sender on
//! one local calendar day. Entries are allocated to activity bands by
//! weight, sampled uniformly over each band's hour ranges, then perturbed
//! so no two days look alike. The caller supplies the random source, which
//! keeps every sampling site seedable.

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use embermail_common::config::{BandsConfig, BusinessHoursConfig};
use embermail_common::types::Band;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::warn;

use crate::clock::band_ranges;

/// Maximum sampling attempts per entry before giving up on it
const MAX_ATTEMPTS: u32 = 64;

/// Minimum spacing between two planned sends, seconds
const MIN_SPACING_SECS: i64 = 60;

/// One planned send instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSend {
    pub fire_at: DateTime<Utc>,
    pub band: Band,
}

/// Allocate a day's entries to bands by weight.
///
/// PEAK and LOW are rounded from their weights; NORMAL takes the
/// remainder, so the counts always sum to `n` whatever the weights.
pub fn band_allocation(n: u32, bands: &BandsConfig) -> (u32, u32, u32) {
    if n == 0 {
        return (0, 0, 0);
    }
    let mut n_peak = (bands.peak_weight * n as f64).round() as u32;
    let mut n_low = (bands.low_weight * n as f64).round() as u32;

    n_peak = n_peak.min(n);
    n_low = n_low.min(n - n_peak);
    let n_normal = n - n_peak - n_low;

    (n_peak, n_normal, n_low)
}

/// Generate the plan for `(tz, date)` with `daily_limit` entries.
///
/// Returns an empty plan on weekends. Every returned instant projects back
/// into business hours on `date`, instants are strictly increasing with at
/// least 60 seconds between neighbours, and the band allocation is a
/// deterministic function of `daily_limit`. The plan may come up short when
/// the sampler exhausts its attempts; the shortfall is logged and
/// `daily_limit` remains an upper bound.
pub fn plan_day<R: Rng + ?Sized>(
    rng: &mut R,
    tz: Tz,
    date: NaiveDate,
    daily_limit: u32,
    hours: &BusinessHoursConfig,
    bands: &BandsConfig,
) -> Vec<PlannedSend> {
    use chrono::Weekday;
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return Vec::new();
    }
    if daily_limit == 0 {
        return Vec::new();
    }

    let (n_peak, n_normal, n_low) = band_allocation(daily_limit, bands);

    let mut plan: Vec<PlannedSend> = Vec::with_capacity(daily_limit as usize);
    for (band, count) in [
        (Band::Peak, n_peak),
        (Band::Normal, n_normal),
        (Band::Low, n_low),
    ] {
        sample_band(rng, tz, date, band, count, hours, &mut plan);
    }

    plan.sort_by_key(|entry| entry.fire_at);

    if plan.len() < daily_limit as usize {
        warn!(
            date = %date,
            wanted = daily_limit,
            got = plan.len(),
            "Planner produced fewer entries than the daily limit"
        );
    }

    plan
}

/// Regenerate the remainder of a partially dispatched day: up to `count`
/// entries, all strictly after `now`.
pub fn plan_remaining<R: Rng + ?Sized>(
    rng: &mut R,
    tz: Tz,
    date: NaiveDate,
    count: u32,
    now: DateTime<Utc>,
    hours: &BusinessHoursConfig,
    bands: &BandsConfig,
) -> Vec<PlannedSend> {
    let mut plan = plan_day(rng, tz, date, count, hours, bands);
    plan.retain(|entry| entry.fire_at > now);
    plan.truncate(count as usize);
    plan
}

fn sample_band<R: Rng + ?Sized>(
    rng: &mut R,
    tz: Tz,
    date: NaiveDate,
    band: Band,
    count: u32,
    hours: &BusinessHoursConfig,
    plan: &mut Vec<PlannedSend>,
) {
    // Clip the band's hour ranges to the configured business window.
    let ranges: Vec<(u32, u32)> = band_ranges(band)
        .iter()
        .map(|&(start, end)| (start.max(hours.start), end.min(hours.end)))
        .filter(|&(start, end)| start < end)
        .collect();

    if ranges.is_empty() {
        return;
    }

    let total_secs: u64 = ranges
        .iter()
        .map(|&(start, end)| u64::from(end - start) * 3600)
        .sum();

    let jitter = Normal::new(0.0f64, 90.0f64).expect("valid normal distribution");

    for _ in 0..count {
        for _ in 0..MAX_ATTEMPTS {
            // Uniform over the union of ranges, weighted by length.
            let mut offset = rng.gen_range(0..total_secs);
            let mut seconds_of_day = 0u64;
            for &(start, end) in &ranges {
                let span = u64::from(end - start) * 3600;
                if offset < span {
                    seconds_of_day = u64::from(start) * 3600 + offset;
                    break;
                }
                offset -= span;
            }

            // Gaussian-ish perturbation capped at three minutes, plus a
            // uniform half-minute wobble.
            let gaussian: f64 = jitter.sample(rng).clamp(-180.0, 180.0);
            let uniform: i64 = rng.gen_range(-30..=30);
            let jittered = seconds_of_day as i64 + gaussian as i64 + uniform;

            if jittered < 0 || jittered >= 24 * 3600 {
                continue;
            }
            let hour = (jittered / 3600) as u32;
            if hour < hours.start || hour >= hours.end {
                continue;
            }

            let naive = match date.and_hms_opt(
                hour,
                ((jittered % 3600) / 60) as u32,
                (jittered % 60) as u32,
            ) {
                Some(naive) => naive,
                None => continue,
            };

            // Project into the zone. A nonexistent local time (DST spring
            // forward) is a rejected sample; an ambiguous one resolves to
            // the earlier offset.
            let local = match tz.from_local_datetime(&naive) {
                LocalResult::Single(local) => local,
                LocalResult::Ambiguous(earliest, _) => earliest,
                LocalResult::None => continue,
            };
            let fire_at = local.with_timezone(&Utc);

            let too_close = plan
                .iter()
                .any(|prior| (prior.fire_at - fire_at).num_seconds().abs() < MIN_SPACING_SECS);
            if too_close {
                continue;
            }

            plan.push(PlannedSend { fire_at, band });
            break;
        }
    }
}

/// Whether a fire instant still projects into business hours on its plan
/// date. Entries that drift out (a DST shift after planning, a narrowed
/// window) are poisoned and must be skipped by the dispatcher.
pub fn is_dispatchable(
    fire_at: DateTime<Utc>,
    tz: Tz,
    local_date: NaiveDate,
    hours: &BusinessHoursConfig,
) -> bool {
    let local = fire_at.with_timezone(&tz);
    local.date_naive() == local_date && crate::clock::is_business_hours(&local, hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn defaults() -> (BusinessHoursConfig, BandsConfig) {
        (BusinessHoursConfig::default(), BandsConfig::default())
    }

    #[test]
    fn test_band_allocation_small_plan() {
        let (_, bands) = defaults();
        // Phase-1 minimum: 5 entries split 3 / 1 / 1.
        assert_eq!(band_allocation(5, &bands), (3, 1, 1));
        assert_eq!(band_allocation(1, &bands), (1, 0, 0));
        assert_eq!(band_allocation(0, &bands), (0, 0, 0));
    }

    #[test]
    fn test_band_allocation_tracks_weights() {
        let (_, bands) = defaults();
        for n in 10..=60u32 {
            let (peak, normal, low) = band_allocation(n, &bands);
            assert_eq!(peak + normal + low, n);
            assert!(
                (f64::from(peak) - 0.6 * f64::from(n)).abs() <= 1.0,
                "peak {} off target for n={}",
                peak,
                n
            );
            assert!(
                (f64::from(low) - 0.1 * f64::from(n)).abs() <= 1.0,
                "low {} off target for n={}",
                low,
                n
            );
        }
    }

    #[test]
    fn test_phase_one_plan_in_kolkata() {
        // Monday 2025-10-06, warmup day 1 with target 50: exactly 5 sends.
        let (hours, bands) = defaults();
        let mut rng = StdRng::seed_from_u64(7);
        let tz = chrono_tz::Asia::Kolkata;
        let date = NaiveDate::from_ymd_opt(2025, 10, 6).unwrap();

        let plan = plan_day(&mut rng, tz, date, 5, &hours, &bands);
        assert_eq!(plan.len(), 5);

        let peak = plan.iter().filter(|e| e.band == Band::Peak).count();
        let normal = plan.iter().filter(|e| e.band == Band::Normal).count();
        let low = plan.iter().filter(|e| e.band == Band::Low).count();
        assert_eq!((peak, normal, low), (3, 1, 1));

        for entry in &plan {
            let local = entry.fire_at.with_timezone(&tz);
            assert_eq!(local.date_naive(), date);
            assert!((9..18).contains(&local.hour()), "outside hours: {}", local);
        }

        for pair in plan.windows(2) {
            let gap = (pair[1].fire_at - pair[0].fire_at).num_seconds();
            assert!(gap >= 60, "spacing {}s below the minimum", gap);
        }
    }

    #[test]
    fn test_weekend_plan_is_empty() {
        let (hours, bands) = defaults();
        let mut rng = StdRng::seed_from_u64(7);
        let saturday = NaiveDate::from_ymd_opt(2025, 10, 11).unwrap();
        let plan = plan_day(
            &mut rng,
            chrono_tz::Asia::Kolkata,
            saturday,
            5,
            &hours,
            &bands,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_bands_match_local_hours() {
        let (hours, bands) = defaults();
        let mut rng = StdRng::seed_from_u64(42);
        let tz = chrono_tz::America::New_York;
        let date = NaiveDate::from_ymd_opt(2025, 10, 7).unwrap();

        let plan = plan_day(&mut rng, tz, date, 30, &hours, &bands);
        assert!(!plan.is_empty());
        for entry in &plan {
            let hour = entry.fire_at.with_timezone(&tz).hour();
            assert_eq!(
                crate::clock::band_for(hour),
                Some(entry.band),
                "hour {} does not match band {:?}",
                hour,
                entry.band
            );
        }
    }

    #[test]
    fn test_plan_survives_dst_shift_week() {
        // The Monday after the US spring-forward transition.
        let (hours, bands) = defaults();
        let mut rng = StdRng::seed_from_u64(11);
        let tz = chrono_tz::America::New_York;
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();

        let plan = plan_day(&mut rng, tz, date, 20, &hours, &bands);
        for entry in &plan {
            assert!(is_dispatchable(entry.fire_at, tz, date, &hours));
        }
    }

    #[test]
    fn test_plan_remaining_is_in_the_future() {
        let (hours, bands) = defaults();
        let mut rng = StdRng::seed_from_u64(3);
        let tz = chrono_tz::Asia::Kolkata;
        let date = NaiveDate::from_ymd_opt(2025, 10, 6).unwrap();

        // Noon IST on the plan date.
        let now = tz
            .from_local_datetime(&date.and_hms_opt(12, 0, 0).unwrap())
            .unwrap()
            .with_timezone(&Utc);

        let plan = plan_remaining(&mut rng, tz, date, 10, now, &hours, &bands);
        assert!(plan.len() <= 10);
        for entry in &plan {
            assert!(entry.fire_at > now);
        }
    }

    #[test]
    fn test_is_dispatchable_rejects_out_of_window_instants() {
        let (hours, _) = defaults();
        let tz = chrono_tz::Asia::Kolkata;
        let date = NaiveDate::from_ymd_opt(2025, 10, 6).unwrap();

        let in_window = tz
            .from_local_datetime(&date.and_hms_opt(10, 30, 0).unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(is_dispatchable(in_window, tz, date, &hours));

        let after_hours = tz
            .from_local_datetime(&date.and_hms_opt(19, 0, 0).unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(!is_dispatchable(after_hours, tz, date, &hours));

        // Right instant, wrong plan date.
        let wrong_date = NaiveDate::from_ymd_opt(2025, 10, 7).unwrap();
        assert!(!is_dispatchable(in_window, tz, wrong_date, &hours));
    }
}
