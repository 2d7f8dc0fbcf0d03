use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use regvol_adapters::DEFAULT_ECFR_BASE_URL;
use regvol_core::{DateAxis, DEFAULT_MIN_YEAR, DEFAULT_TERMINAL_YEAR};
use regvol_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
    #[error("min_year {min_year} is after terminal_year {terminal_year}")]
    YearRange { min_year: i32, terminal_year: i32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Backfill settings, read once from `REGVOL_*` variables and then passed around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillConfig {
    pub min_year: i32,
    pub terminal_year: i32,
    /// Drop axis dates later than the run's start date.
    pub clip_to_today: bool,
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub requests_per_second: Option<u32>,
    pub user_agent: String,
    pub ecfr_base_url: String,
    pub catalog_path: Option<PathBuf>,
    /// Names or short names; empty means every catalog agency.
    pub agencies: Vec<String>,
    pub skip_completed: bool,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            min_year: DEFAULT_MIN_YEAR,
            terminal_year: DEFAULT_TERMINAL_YEAR,
            clip_to_today: false,
            concurrency: 4,
            fetch_timeout_secs: 60,
            http_timeout_secs: 45,
            max_retries: 3,
            requests_per_second: None,
            user_agent: "regvol-bot/0.1".to_string(),
            ecfr_base_url: DEFAULT_ECFR_BASE_URL.to_string(),
            catalog_path: None,
            agencies: Vec::new(),
            skip_completed: true,
            artifacts_dir: None,
            reports_dir: None,
            scheduler_enabled: false,
            // 03:00 on the first of every month (sec min hour dom month dow).
            schedule_cron: "0 0 3 1 * *".to_string(),
        }
    }
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn non_empty(lookup: Lookup<'_>, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(lookup: Lookup<'_>, var: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty(lookup, var) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(default),
    }
}

fn flag(lookup: Lookup<'_>, var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match non_empty(lookup, var) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { var, value: raw }),
        },
        None => Ok(default),
    }
}

impl BackfillConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup: Lookup<'_> = &lookup;
        let defaults = Self::default();
        let requests_per_second = match non_empty(lookup, "REGVOL_REQUESTS_PER_SECOND") {
            Some(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                var: "REGVOL_REQUESTS_PER_SECOND",
                value: raw,
            })?),
            None => None,
        };

        let config = Self {
            min_year: parsed(lookup, "REGVOL_MIN_YEAR", defaults.min_year)?,
            terminal_year: parsed(lookup, "REGVOL_TERMINAL_YEAR", defaults.terminal_year)?,
            clip_to_today: flag(lookup, "REGVOL_CLIP_TO_TODAY", defaults.clip_to_today)?,
            concurrency: parsed(lookup, "REGVOL_CONCURRENCY", defaults.concurrency)?,
            fetch_timeout_secs: parsed(
                lookup,
                "REGVOL_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout_secs,
            )?,
            http_timeout_secs: parsed(lookup, "REGVOL_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            max_retries: parsed(lookup, "REGVOL_MAX_RETRIES", defaults.max_retries)?,
            requests_per_second,
            user_agent: non_empty(lookup, "REGVOL_USER_AGENT").unwrap_or(defaults.user_agent),
            ecfr_base_url: non_empty(lookup, "REGVOL_ECFR_BASE_URL")
                .unwrap_or(defaults.ecfr_base_url),
            catalog_path: non_empty(lookup, "REGVOL_CATALOG_PATH").map(PathBuf::from),
            agencies: non_empty(lookup, "REGVOL_AGENCIES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            skip_completed: flag(lookup, "REGVOL_SKIP_COMPLETED", defaults.skip_completed)?,
            artifacts_dir: non_empty(lookup, "REGVOL_ARTIFACTS_DIR").map(PathBuf::from),
            reports_dir: non_empty(lookup, "REGVOL_REPORTS_DIR").map(PathBuf::from),
            scheduler_enabled: flag(lookup, "REGVOL_SCHEDULER_ENABLED", defaults.scheduler_enabled)?,
            schedule_cron: non_empty(lookup, "REGVOL_SCHEDULE_CRON")
                .unwrap_or(defaults.schedule_cron),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_year > self.terminal_year {
            return Err(ConfigError::YearRange {
                min_year: self.min_year,
                terminal_year: self.terminal_year,
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Zero("fetch_timeout_secs"));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Zero("http_timeout_secs"));
        }
        if self.requests_per_second == Some(0) {
            return Err(ConfigError::Zero("requests_per_second"));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Quarterly dates for this run, optionally clipped to `today`.
    pub fn dates(&self, today: NaiveDate) -> Result<Vec<NaiveDate>, ConfigError> {
        let axis = DateAxis::new(self.min_year, self.terminal_year).map_err(|_| {
            ConfigError::YearRange {
                min_year: self.min_year,
                terminal_year: self.terminal_year,
            }
        })?;
        Ok(if self.clip_to_today {
            axis.dates_until(today)
        } else {
            axis.dates()
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.concurrency,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
            token_bucket: self.requests_per_second.map(TokenBucketConfig::per_second),
        }
    }
}
