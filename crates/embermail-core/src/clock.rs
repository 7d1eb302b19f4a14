//! Time-zone-aware clock and calendar predicates
//!
//! Every scheduling decision depends on the mailbox's own zone; there is no
//! global notion of business hours. All `now()` reads go through the
//! [`Clock`] trait so tests can pin time.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use embermail_common::config::BusinessHoursConfig;
use embermail_common::types::Band;
use embermail_common::{Error, Result};

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parse an IANA zone name
pub fn parse_tz(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| Error::InvalidTimezone(name.to_string()))
}

/// The current local time in a zone
pub fn now_in(clock: &dyn Clock, tz: Tz) -> DateTime<Tz> {
    clock.now_utc().with_timezone(&tz)
}

/// Whether a local instant falls on a weekend
pub fn is_weekend<T: TimeZone>(local: &DateTime<T>) -> bool {
    matches!(local.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Whether a local instant falls inside business hours: a weekday with
/// `start <= hour < end`.
pub fn is_business_hours<T: TimeZone>(local: &DateTime<T>, cfg: &BusinessHoursConfig) -> bool {
    if is_weekend(local) {
        return false;
    }
    let hour = local.hour();
    cfg.start <= hour && hour < cfg.end
}

/// Activity band for a local hour, or `None` outside all bands.
///
/// The ranges are fixed: PEAK 9-11 and 14-16, NORMAL 11-12 and 16-18,
/// LOW 12-14.
pub fn band_for(hour: u32) -> Option<Band> {
    match hour {
        9..=10 | 14..=15 => Some(Band::Peak),
        11 | 16..=17 => Some(Band::Normal),
        12..=13 => Some(Band::Low),
        _ => None,
    }
}

/// The hour ranges making up one band
pub fn band_ranges(band: Band) -> &'static [(u32, u32)] {
    match band {
        Band::Peak => &[(9, 11), (14, 16)],
        Band::Normal => &[(11, 12), (16, 18)],
        Band::Low => &[(12, 14)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn kolkata(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        chrono_tz::Asia::Kolkata
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(h, min, 0)
                    .unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn test_business_hours_boundaries() {
        let cfg = BusinessHoursConfig::default();

        // Monday 2025-10-06
        assert!(is_business_hours(&kolkata(2025, 10, 6, 9, 0), &cfg));
        assert!(is_business_hours(&kolkata(2025, 10, 6, 17, 59), &cfg));
        // End is exclusive, start of day is out.
        assert!(!is_business_hours(&kolkata(2025, 10, 6, 18, 0), &cfg));
        assert!(!is_business_hours(&kolkata(2025, 10, 6, 8, 59), &cfg));
    }

    #[test]
    fn test_weekend_is_never_business_hours() {
        let cfg = BusinessHoursConfig::default();
        // Saturday 2025-10-11
        let saturday = kolkata(2025, 10, 11, 10, 0);
        assert!(is_weekend(&saturday));
        assert!(!is_business_hours(&saturday, &cfg));
        // Midnight boundary: Sunday 23:59 is weekend, Monday 00:00 is not.
        assert!(is_weekend(&kolkata(2025, 10, 12, 23, 59)));
        assert!(!is_weekend(&kolkata(2025, 10, 13, 0, 0)));
    }

    #[test]
    fn test_band_ranges() {
        assert_eq!(band_for(9), Some(Band::Peak));
        assert_eq!(band_for(10), Some(Band::Peak));
        assert_eq!(band_for(11), Some(Band::Normal));
        assert_eq!(band_for(12), Some(Band::Low));
        assert_eq!(band_for(13), Some(Band::Low));
        assert_eq!(band_for(14), Some(Band::Peak));
        assert_eq!(band_for(15), Some(Band::Peak));
        assert_eq!(band_for(16), Some(Band::Normal));
        assert_eq!(band_for(17), Some(Band::Normal));
        assert_eq!(band_for(18), None);
        assert_eq!(band_for(8), None);
    }

    #[test]
    fn test_parse_tz() {
        assert!(parse_tz("Asia/Kolkata").is_ok());
        assert!(parse_tz("America/New_York").is_ok());
        assert!(parse_tz("Not/AZone").is_err());
    }
}
