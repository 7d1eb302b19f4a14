//! Configuration for Embermail

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Business-hours window used by planning and dispatch
    #[serde(default)]
    pub business_hours: BusinessHoursConfig,

    /// Activity-band weights for the schedule planner
    #[serde(default)]
    pub bands: BandsConfig,

    /// Periodic worker intervals
    #[serde(default)]
    pub intervals: IntervalsConfig,

    /// Plan lifecycle configuration
    #[serde(default)]
    pub plan: PlanConfig,

    /// Engagement simulation configuration
    #[serde(default)]
    pub engagement: EngagementConfig,

    /// Reputation score configuration
    #[serde(default)]
    pub score: ScoreConfig,

    /// Fixed RNG seed; set only in tests or reproduction runs
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (PostgreSQL)
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Business-hours window, in the mailbox's local timezone
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    /// First business hour (inclusive, 24h clock)
    #[serde(default = "default_business_start")]
    pub start: u32,

    /// End of business hours (exclusive, 24h clock)
    #[serde(default = "default_business_end")]
    pub end: u32,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            start: default_business_start(),
            end: default_business_end(),
        }
    }
}

fn default_business_start() -> u32 {
    9
}

fn default_business_end() -> u32 {
    18
}

/// Share of the daily plan allocated to each activity band
///
/// NORMAL always receives the remainder after PEAK and LOW are rounded,
/// so the three weights are not required to sum to exactly 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandsConfig {
    #[serde(default = "default_peak_weight")]
    pub peak_weight: f64,

    #[serde(default = "default_normal_weight")]
    pub normal_weight: f64,

    #[serde(default = "default_low_weight")]
    pub low_weight: f64,
}

impl Default for BandsConfig {
    fn default() -> Self {
        Self {
            peak_weight: default_peak_weight(),
            normal_weight: default_normal_weight(),
            low_weight: default_low_weight(),
        }
    }
}

fn default_peak_weight() -> f64 {
    0.60
}

fn default_normal_weight() -> f64 {
    0.30
}

fn default_low_weight() -> f64 {
    0.10
}

/// Tick intervals for the periodic workers, in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_secs: u64,

    #[serde(default = "default_engagement_interval")]
    pub engagement_secs: u64,

    #[serde(default = "default_reply_poll_interval")]
    pub reply_poll_secs: u64,

    #[serde(default = "default_spam_recovery_interval")]
    pub spam_recovery_secs: u64,

    #[serde(default = "default_score_interval")]
    pub score_secs: u64,

    #[serde(default = "default_day_advance_interval")]
    pub day_advance_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            dispatch_secs: default_dispatch_interval(),
            engagement_secs: default_engagement_interval(),
            reply_poll_secs: default_reply_poll_interval(),
            spam_recovery_secs: default_spam_recovery_interval(),
            score_secs: default_score_interval(),
            day_advance_secs: default_day_advance_interval(),
        }
    }
}

fn default_dispatch_interval() -> u64 {
    120
}

fn default_engagement_interval() -> u64 {
    180
}

fn default_reply_poll_interval() -> u64 {
    300
}

fn default_spam_recovery_interval() -> u64 {
    6 * 60 * 60
}

fn default_score_interval() -> u64 {
    6 * 60 * 60
}

fn default_day_advance_interval() -> u64 {
    60 * 60
}

/// Plan lifecycle configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlanConfig {
    /// How far past its fire time an entry is still dispatchable, seconds
    #[serde(default = "default_grace_window")]
    pub grace_window_secs: u64,

    /// How far ahead of now the dispatcher looks for due entries, seconds
    #[serde(default = "default_fire_window")]
    pub fire_window_secs: u64,

    /// Terminal plan entries older than this are purged, days
    #[serde(default = "default_plan_retention")]
    pub retention_days: u32,

    /// Accumulated failed attempts on one local date that trigger
    /// regeneration of the remaining plan
    #[serde(default = "default_replan_threshold")]
    pub replan_attempt_threshold: u32,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: default_grace_window(),
            fire_window_secs: default_fire_window(),
            retention_days: default_plan_retention(),
            replan_attempt_threshold: default_replan_threshold(),
        }
    }
}

fn default_grace_window() -> u64 {
    5 * 60
}

fn default_fire_window() -> u64 {
    2 * 60
}

fn default_plan_retention() -> u32 {
    7
}

fn default_replan_threshold() -> u32 {
    5
}

/// Engagement simulation configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngagementConfig {
    /// Minimum delay before a recipient may open a message, seconds
    #[serde(default = "default_open_delay_min")]
    pub open_delay_min_secs: u64,

    /// Maximum open delay, seconds
    #[serde(default = "default_open_delay_max")]
    pub open_delay_max_secs: u64,

    /// Minimum delay between opening and replying, seconds
    #[serde(default = "default_reply_delay_min")]
    pub reply_delay_min_secs: u64,

    /// Maximum reply delay, seconds
    #[serde(default = "default_reply_delay_max")]
    pub reply_delay_max_secs: u64,

    /// Probability an opened message is starred
    #[serde(default = "default_star_probability")]
    pub star_probability: f64,

    /// Minimum delay between opening and starring, seconds
    #[serde(default = "default_star_delay_min")]
    pub star_delay_min_secs: u64,

    /// Maximum star delay, seconds
    #[serde(default = "default_star_delay_max")]
    pub star_delay_max_secs: u64,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            open_delay_min_secs: default_open_delay_min(),
            open_delay_max_secs: default_open_delay_max(),
            reply_delay_min_secs: default_reply_delay_min(),
            reply_delay_max_secs: default_reply_delay_max(),
            star_probability: default_star_probability(),
            star_delay_min_secs: default_star_delay_min(),
            star_delay_max_secs: default_star_delay_max(),
        }
    }
}

fn default_open_delay_min() -> u64 {
    30
}

fn default_open_delay_max() -> u64 {
    10 * 60
}

fn default_reply_delay_min() -> u64 {
    5 * 60
}

fn default_reply_delay_max() -> u64 {
    30 * 60
}

fn default_star_probability() -> f64 {
    0.20
}

fn default_star_delay_min() -> u64 {
    45
}

fn default_star_delay_max() -> u64 {
    100
}

/// Reputation score configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreConfig {
    /// Statistics window, days
    #[serde(default = "default_score_window")]
    pub window_days: u32,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            window_days: default_score_window(),
        }
    }
}

fn default_score_window() -> u32 {
    30
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/embermail/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Sanity-check option ranges
    pub fn validate(&self) -> crate::Result<()> {
        if self.business_hours.start >= self.business_hours.end || self.business_hours.end > 24 {
            return Err(crate::Error::Config(format!(
                "Invalid business hours: {}..{}",
                self.business_hours.start, self.business_hours.end
            )));
        }
        if !(0.0..=1.0).contains(&self.engagement.star_probability) {
            return Err(crate::Error::Config(
                "engagement.star_probability must be in [0, 1]".to_string(),
            ));
        }
        if self.engagement.open_delay_min_secs >= self.engagement.open_delay_max_secs {
            return Err(crate::Error::Config(
                "engagement open delay range is empty".to_string(),
            ));
        }
        if self.engagement.reply_delay_min_secs >= self.engagement.reply_delay_max_secs {
            return Err(crate::Error::Config(
                "engagement reply delay range is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let hours = BusinessHoursConfig::default();
        assert_eq!(hours.start, 9);
        assert_eq!(hours.end, 18);

        let bands = BandsConfig::default();
        assert!((bands.peak_weight - 0.60).abs() < f64::EPSILON);
        assert!((bands.low_weight - 0.10).abs() < f64::EPSILON);

        let intervals = IntervalsConfig::default();
        assert_eq!(intervals.dispatch_secs, 120);
        assert_eq!(intervals.spam_recovery_secs, 21_600);

        let plan = PlanConfig::default();
        assert_eq!(plan.grace_window_secs, 300);
        assert_eq!(plan.fire_window_secs, 120);
        assert_eq!(plan.retention_days, 7);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/embermail"

[business_hours]
start = 8
end = 17

[intervals]
dispatch_secs = 60

[engagement]
star_probability = 0.25
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.database.url, "postgres://localhost/embermail");
        assert_eq!(config.business_hours.start, 8);
        assert_eq!(config.intervals.dispatch_secs, 60);
        // Unset sections take their defaults.
        assert_eq!(config.intervals.engagement_secs, 180);
        assert!((config.engagement.star_probability - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.plan.retention_days, 7);
        assert!(config.rng_seed.is_none());
    }

    #[test]
    fn test_validate_rejects_inverted_hours() {
        let toml = r#"
[database]
url = "postgres://localhost/embermail"

[business_hours]
start = 18
end = 9
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
