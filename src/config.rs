//! Environment configuration.
//!
//! Credentials come from environment variables first and Docker secret files
//! (`/run/secrets/*`) otherwise. They are read on demand so that commands
//! which never touch a provider or the database do not need them.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, NaiveDate, Utc};

use crate::fetch::backoff::RetryPolicy;
use crate::fetch::breaker::BreakerPolicy;
use crate::fetch::limiter::RateLimit;
use crate::fetch::SourcePolicy;
use crate::gate::GateConfig;
use crate::pipeline::PipelineSettings;
use crate::sources::{OddsFeed, RatingsFeed};

const ODDS_API_KEY_SECRET: &str = "/run/secrets/odds_api_key";
const DB_PASSWORD_SECRET: &str = "/run/secrets/db_password";

const MAX_WINDOW_DAYS: u64 = 3650;
const MAX_WINDOW: Duration = Duration::from_secs(MAX_WINDOW_DAYS * DAY_SECS);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY_SECS: u64 = 24 * 3600;

#[derive(Debug, Clone)]
pub struct Config {
    pub sport: String,
    pub sport_key: String,
    pub odds_base_url: String,
    pub ratings_base_url: String,
    pub season: i32,
    pub redis_url: Option<String>,
    pub alias_registry_path: Option<PathBuf>,
    pub fetch_partial_periods: bool,
    pub max_concurrent_fetches: usize,
    pub max_concurrent_writes: usize,

    pub odds_rate_per_minute: u32,
    pub odds_burst: u32,
    pub ratings_rate_per_minute: u32,
    pub ratings_burst: u32,
    pub max_rate_wait: Duration,

    pub fetch_max_attempts: u32,
    pub fetch_base_delay: Duration,
    pub fetch_max_delay: Duration,
    pub fetch_max_elapsed: Duration,

    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub low_quota_threshold: u64,

    pub gate: GateConfig,

    odds_api_key_env: Option<String>,
    database_url_env: Option<String>,
    db_user: String,
    db_name: String,
    db_host: String,
    db_port: String,
}

/// Variable lookup with "unset" and "set but blank" kept apart.
struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn string(&self, key: &str, default: &str) -> String {
        match self.raw(key) {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => default.to_string(),
        }
    }

    fn optional(&self, key: &str) -> Result<Option<String>> {
        match self.raw(key) {
            Some(v) if !v.trim().is_empty() => Ok(Some(v.trim().to_string())),
            Some(_) => Err(anyhow!("{} is set but empty", key)),
            None => Ok(None),
        }
    }

    fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.raw(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// A count of `unit`s, refused when it overflows or exceeds `MAX_WINDOW`.
    fn window(&self, key: &str, default: u64, unit: Duration) -> Result<Duration> {
        let count = self.number(key, default);
        u32::try_from(count)
            .ok()
            .and_then(|n| unit.checked_mul(n))
            .filter(|d| *d <= MAX_WINDOW)
            .ok_or_else(|| anyhow!("{} is too large: {} exceeds {} days", key, count, MAX_WINDOW_DAYS))
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key).map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "true" || v == "1" => true,
            Some(v) if v == "false" || v == "0" => false,
            _ => default,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let v = Vars(vars);
        let sport = v.string("SPORT", "ncaam");
        let gate_defaults = GateConfig::default();

        Ok(Self {
            sport_key: v.string("SPORT_KEY", "basketball_ncaab"),
            odds_base_url: v.string("ODDS_BASE_URL", "https://api.the-odds-api.com/v4"),
            ratings_base_url: v.string("RATINGS_BASE_URL", "https://barttorvik.com"),
            season: v.number("SEASON", current_season(Utc::now().date_naive())),
            redis_url: v.optional("REDIS_URL")?,
            alias_registry_path: v.optional("ALIAS_REGISTRY_PATH")?.map(PathBuf::from),
            fetch_partial_periods: v.flag("FETCH_PARTIAL_PERIODS", false),
            max_concurrent_fetches: v.number("MAX_CONCURRENT_FETCHES", 4),
            max_concurrent_writes: v.number("MAX_CONCURRENT_WRITES", 8),

            odds_rate_per_minute: v.number("ODDS_RATE_PER_MINUTE", 45),
            odds_burst: v.number("ODDS_BURST", 5),
            ratings_rate_per_minute: v.number("RATINGS_RATE_PER_MINUTE", 10),
            ratings_burst: v.number("RATINGS_BURST", 1),
            max_rate_wait: Duration::from_secs(v.number("MAX_RATE_WAIT_SECS", 60)),

            fetch_max_attempts: v.number("FETCH_MAX_ATTEMPTS", 5),
            fetch_base_delay: Duration::from_millis(v.number("FETCH_BASE_DELAY_MS", 1000)),
            fetch_max_delay: Duration::from_millis(v.number("FETCH_MAX_DELAY_MS", 30_000)),
            fetch_max_elapsed: Duration::from_secs(v.number("FETCH_MAX_ELAPSED_SECS", 120)),

            breaker_failure_threshold: v.number("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_cooldown: Duration::from_secs(v.number("BREAKER_COOLDOWN_SECS", 60)),
            low_quota_threshold: v.number("LOW_QUOTA_THRESHOLD", 50),

            gate: GateConfig {
                odds_max_age_full: v.window("ODDS_MAX_AGE_FULL_MINUTES", 45, MINUTE)?,
                odds_max_age_1h: v.window("ODDS_MAX_AGE_1H_MINUTES", 30, MINUTE)?,
                odds_max_age_2h: v.window("ODDS_MAX_AGE_2H_MINUTES", 30, MINUTE)?,
                min_ratings_coverage_pct: v.number(
                    "MIN_RATINGS_COVERAGE_PCT",
                    gate_defaults.min_ratings_coverage_pct,
                ),
                min_odds_coverage_pct: v
                    .number("MIN_ODDS_COVERAGE_PCT", gate_defaults.min_odds_coverage_pct),
                min_resolution_rate_pct: v.number(
                    "MIN_RESOLUTION_RATE_PCT",
                    gate_defaults.min_resolution_rate_pct,
                ),
                resolution_lookback: v.window(
                    "RESOLUTION_LOOKBACK_DAYS",
                    7,
                    Duration::from_secs(DAY_SECS),
                )?,
                ratings_max_age_days: ratings_max_age_days(&v)?,
                scope_horizon: v.window("SCOPE_HORIZON_HOURS", 36, HOUR)?,
            },

            odds_api_key_env: v.optional("THE_ODDS_API_KEY")?,
            database_url_env: v.optional("DATABASE_URL")?,
            db_user: v.string("DB_USER", &sport),
            db_name: v.string("DB_NAME", &sport),
            db_host: v.string("DB_HOST", "postgres"),
            db_port: v.string("DB_PORT", "5432"),
            sport,
        })
    }

    pub fn odds_api_key(&self) -> Result<String> {
        let key = match &self.odds_api_key_env {
            Some(v) => v.clone(),
            None => read_secret_file(ODDS_API_KEY_SECRET, "odds_api_key")?,
        };
        if is_placeholder_key(&key) {
            return Err(anyhow!(
                "THE_ODDS_API_KEY appears to be a placeholder value; replace with your real key"
            ));
        }
        Ok(key)
    }

    /// Sport-parameterized so one image can serve several databases.
    pub fn database_url(&self) -> Result<String> {
        match &self.database_url_env {
            Some(v) => Ok(v.clone()),
            None => {
                let db_password = read_secret_file(DB_PASSWORD_SECRET, "db_password")?;
                Ok(format!(
                    "postgresql://{}:{}@{}:{}/{}",
                    self.db_user, db_password, self.db_host, self.db_port, self.db_name
                ))
            }
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_max_attempts.max(1),
            base_delay: self.fetch_base_delay,
            max_delay: self.fetch_max_delay,
            max_elapsed: self.fetch_max_elapsed,
            ..RetryPolicy::default()
        }
    }

    fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.breaker_failure_threshold.max(1),
            cooldown: self.breaker_cooldown,
        }
    }

    pub fn odds_policy(&self) -> SourcePolicy {
        SourcePolicy {
            rate: RateLimit {
                capacity: self.odds_burst.max(1),
                refill_per_minute: self.odds_rate_per_minute.max(1),
                max_wait: self.max_rate_wait,
            },
            retry: self.retry_policy(),
            breaker: self.breaker_policy(),
            low_quota_threshold: self.low_quota_threshold,
        }
    }

    pub fn ratings_policy(&self) -> SourcePolicy {
        SourcePolicy {
            rate: RateLimit {
                capacity: self.ratings_burst.max(1),
                refill_per_minute: self.ratings_rate_per_minute.max(1),
                max_wait: self.max_rate_wait,
            },
            retry: self.retry_policy(),
            breaker: self.breaker_policy(),
            low_quota_threshold: self.low_quota_threshold,
        }
    }

    pub fn odds_feed(&self) -> Result<OddsFeed> {
        Ok(OddsFeed::new(
            self.odds_base_url.clone(),
            self.sport_key.clone(),
            self.odds_api_key()?,
        ))
    }

    pub fn ratings_feed(&self) -> RatingsFeed {
        RatingsFeed::new(self.ratings_base_url.clone(), self.season)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            dataset: self.sport.clone(),
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            max_concurrent_writes: self.max_concurrent_writes.max(1),
            fetch_partial_periods: self.fetch_partial_periods,
        }
    }
}

fn ratings_max_age_days(v: &Vars<'_>) -> Result<u32> {
    let days: u32 = v.number("RATINGS_MAX_AGE_DAYS", 1);
    if u64::from(days) > MAX_WINDOW_DAYS {
        return Err(anyhow!(
            "RATINGS_MAX_AGE_DAYS is too large: {} exceeds {} days",
            days,
            MAX_WINDOW_DAYS
        ));
    }
    Ok(days)
}

/// Season label as the ratings provider uses it: the season that tips off in
/// November 2026 is "2027".
pub fn current_season(today: NaiveDate) -> i32 {
    if today.month() >= 5 {
        today.year() + 1
    } else {
        today.year()
    }
}

/// Catches sample keys copied from docs or templates.
pub fn is_placeholder_key(key: &str) -> bool {
    let key_lower = key.trim().to_lowercase();
    key_lower.contains("change_me")
        || key_lower.contains("your_")
        || key_lower.starts_with("sample")
        || key_lower == "4a0b80471d1ebeeb74c358fa0fcc4a2"
}

/// Read a secret from a Docker secret file.
fn read_secret_file(file_path: &str, secret_name: &str) -> Result<String> {
    std::fs::read_to_string(file_path)
        .map(|s| s.trim().to_string())
        .context(format!(
            "CRITICAL: Secret file not found at {} ({}). Container must have secrets mounted.",
            file_path, secret_name
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_vars(&HashMap::new()).unwrap();

        assert_eq!(config.sport, "ncaam");
        assert_eq!(config.odds_rate_per_minute, 45);
        assert_eq!(config.odds_burst, 5);
        assert_eq!(config.ratings_rate_per_minute, 10);
        assert_eq!(config.fetch_max_attempts, 5);
        assert_eq!(config.breaker_cooldown, Duration::from_secs(60));
        assert_eq!(config.gate, GateConfig::default());
        assert!(!config.fetch_partial_periods);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let config = Config::from_vars(&vars(&[
            ("ODDS_RATE_PER_MINUTE", "lots"),
            ("MIN_ODDS_COVERAGE_PCT", "70.5"),
            ("ODDS_MAX_AGE_FULL_MINUTES", "-3"),
        ]))
        .unwrap();

        assert_eq!(config.odds_rate_per_minute, 45);
        assert_eq!(config.gate.min_odds_coverage_pct, 70.5);
        assert_eq!(config.gate.odds_max_age_full, Duration::from_secs(45 * 60));
    }

    #[test]
    fn oversized_windows_are_config_errors() {
        for (key, value) in [
            ("RESOLUTION_LOOKBACK_DAYS", "18446744073709551615"),
            ("RESOLUTION_LOOKBACK_DAYS", "3651"),
            ("SCOPE_HORIZON_HOURS", "9000000000000000"),
            ("ODDS_MAX_AGE_1H_MINUTES", "5000000000"),
            ("RATINGS_MAX_AGE_DAYS", "4294967295"),
        ] {
            let err = Config::from_vars(&vars(&[(key, value)])).unwrap_err();
            assert!(err.to_string().contains(key), "{key}={value}: {err}");
        }

        let config = Config::from_vars(&vars(&[
            ("RESOLUTION_LOOKBACK_DAYS", "3650"),
            ("RATINGS_MAX_AGE_DAYS", "30"),
        ]))
        .unwrap();
        assert_eq!(
            config.gate.resolution_lookback,
            Duration::from_secs(3650 * 24 * 3600)
        );
        assert_eq!(config.gate.ratings_max_age_days, 30);
    }

    #[test]
    fn blank_credentials_are_rejected() {
        assert!(Config::from_vars(&vars(&[("THE_ODDS_API_KEY", "  ")])).is_err());
        assert!(Config::from_vars(&vars(&[("DATABASE_URL", "")])).is_err());
    }

    #[test]
    fn placeholder_keys_are_refused() {
        let config =
            Config::from_vars(&vars(&[("THE_ODDS_API_KEY", "your_api_key_here")])).unwrap();
        assert!(config.odds_api_key().is_err());

        let config = Config::from_vars(&vars(&[("THE_ODDS_API_KEY", "a1b2c3d4")])).unwrap();
        assert_eq!(config.odds_api_key().unwrap(), "a1b2c3d4");

        assert!(is_placeholder_key("CHANGE_ME"));
        assert!(is_placeholder_key("sample-key"));
    }

    #[test]
    fn database_url_prefers_env() {
        let config = Config::from_vars(&vars(&[(
            "DATABASE_URL",
            "postgresql://ncaam:pw@localhost:5432/ncaam",
        )]))
        .unwrap();
        assert_eq!(
            config.database_url().unwrap(),
            "postgresql://ncaam:pw@localhost:5432/ncaam"
        );
    }

    #[test]
    fn season_rolls_over_in_may() {
        let april = NaiveDate::from_ymd_opt(2026, 4, 30).unwrap();
        let may = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        assert_eq!(current_season(april), 2026);
        assert_eq!(current_season(may), 2027);
    }

    #[test]
    fn policies_follow_settings() {
        let config = Config::from_vars(&vars(&[
            ("ODDS_BURST", "3"),
            ("FETCH_MAX_ATTEMPTS", "2"),
            ("SPORT", "ncaaw"),
        ]))
        .unwrap();

        let odds = config.odds_policy();
        assert_eq!(odds.rate.capacity, 3);
        assert_eq!(odds.retry.max_attempts, 2);
        assert_eq!(config.ratings_policy().rate.capacity, 1);
        assert_eq!(config.pipeline_settings().dataset, "ncaaw");
    }
}
