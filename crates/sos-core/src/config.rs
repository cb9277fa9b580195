use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Name of the marker file whose existence means "a refresh job holds the lock".
pub const LOCK_FILE_NAME: &str = "cache.lock";
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_WATCHDOG_DELAY: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_DAILY_HOUR: u32 = 4;
pub const DEFAULT_PERIOD_HOURS: u64 = 24;
pub const MAX_PERIOD_HOURS: u64 = 24 * 365;

/// Top-level config (sos-cache.toml + SOS_CACHE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Refresh stale caches immediately on start (default: true).
    /// Override with env var: SOS_CACHE_CACHE__REFRESH_ON_STARTUP=false
    #[serde(default = "bool_true")]
    pub refresh_on_startup: bool,
    /// A cache file older than this is considered stale.
    #[serde(default = "default_staleness_minutes")]
    pub staleness_minutes: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            refresh_on_startup: true,
            staleness_minutes: default_staleness_minutes(),
        }
    }
}

/// When the recurring full refresh runs: tomorrow at HH:MM local time plus
/// a random jitter, then every `period_hours`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_daily_hour")]
    pub daily_hour: u32,
    #[serde(default)]
    pub daily_minute: u32,
    #[serde(default = "default_jitter_min")]
    pub jitter_min_secs: u64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max_secs: u64,
    #[serde(default = "default_jitter_step")]
    pub jitter_step_secs: u64,
    #[serde(default = "default_period_hours")]
    pub period_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_hour: DEFAULT_DAILY_HOUR,
            daily_minute: 0,
            jitter_min_secs: default_jitter_min(),
            jitter_max_secs: default_jitter_max(),
            jitter_step_secs: default_jitter_step(),
            period_hours: DEFAULT_PERIOD_HOURS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Delay after a job start before the lock is inspected and reclaimed.
    #[serde(default = "default_watchdog_minutes")]
    pub delay_minutes: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            delay_minutes: default_watchdog_minutes(),
        }
    }
}

/// Location of the JSON dump used by the daemon as its backing data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_staleness_minutes() -> u64 {
    DEFAULT_STALENESS.as_secs() / 60
}
fn default_watchdog_minutes() -> u64 {
    DEFAULT_WATCHDOG_DELAY.as_secs() / 60
}
fn default_daily_hour() -> u32 {
    DEFAULT_DAILY_HOUR
}
fn default_jitter_min() -> u64 {
    5
}
fn default_jitter_max() -> u64 {
    25
}
fn default_jitter_step() -> u64 {
    2
}
fn default_period_hours() -> u64 {
    DEFAULT_PERIOD_HOURS
}
fn sos_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".sos")
}
fn default_base_dir() -> PathBuf {
    sos_home().join("cache")
}
fn default_source_path() -> PathBuf {
    sos_home().join("source.json")
}

impl CacheConfig {
    /// Load config from a TOML file with SOS_CACHE_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `SOS_CACHE_WATCHDOG__DELAY_MINUTES=10`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CacheConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SOS_CACHE_").split("__"))
            .extract()
            .map_err(|e| crate::error::SosError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        let s = &self.schedule;
        if s.daily_hour > 23 || s.daily_minute > 59 {
            return Err(crate::error::SosError::Config(format!(
                "invalid daily run time {:02}:{:02}",
                s.daily_hour, s.daily_minute
            )));
        }
        if s.jitter_min_secs > s.jitter_max_secs || s.jitter_step_secs == 0 {
            return Err(crate::error::SosError::Config(format!(
                "invalid jitter range {}..={} step {}",
                s.jitter_min_secs, s.jitter_max_secs, s.jitter_step_secs
            )));
        }
        if s.period_hours == 0 || s.period_hours > MAX_PERIOD_HOURS {
            return Err(crate::error::SosError::Config(format!(
                "schedule period must be between 1 and {MAX_PERIOD_HOURS} hours, got {}",
                s.period_hours
            )));
        }
        Ok(())
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.cache.staleness_minutes.saturating_mul(60))
    }

    pub fn watchdog_delay(&self) -> Duration {
        Duration::from_secs(self.watchdog.delay_minutes.saturating_mul(60))
    }
}

fn default_config_path() -> String {
    sos_home().join("sos-cache.toml").to_string_lossy().into_owned()
}
