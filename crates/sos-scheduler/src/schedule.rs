use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone};
use rand::Rng;
use sos_core::config::ScheduleConfig;

/// Random offset added to the daily run time so co-located processes, each
/// running its own scheduler, do not hit the backing source together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    pub min_secs: u64,
    pub max_secs: u64,
    pub step_secs: u64,
}

impl Jitter {
    /// Uniform pick from `min, min + step, …` not exceeding `max`.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        let step = self.step_secs.max(1);
        let steps = self.max_secs.saturating_sub(self.min_secs) / step;
        let k = rng.random_range(0..=steps);
        Duration::from_secs(self.min_secs + k * step)
    }
}

/// Recurring full refresh: tomorrow at `hour:minute` local time plus jitter,
/// then every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyRule {
    pub hour: u32,
    pub minute: u32,
    pub jitter: Jitter,
    pub period: Duration,
}

impl From<&ScheduleConfig> for DailyRule {
    fn from(cfg: &ScheduleConfig) -> Self {
        Self {
            hour: cfg.daily_hour,
            minute: cfg.daily_minute,
            jitter: Jitter {
                min_secs: cfg.jitter_min_secs,
                max_secs: cfg.jitter_max_secs,
                step_secs: cfg.jitter_step_secs,
            },
            period: Duration::from_secs(cfg.period_hours.saturating_mul(3600)),
        }
    }
}

/// First run of the recurring job: *tomorrow* at the rule's time in `now`'s
/// timezone, plus `jitter`. Today's slot is never used, even if still ahead.
///
/// Returns `None` only for an out-of-range rule time.
pub fn next_daily_run<Tz: TimeZone>(
    now: &DateTime<Tz>,
    rule: &DailyRule,
    jitter: Duration,
) -> Option<DateTime<Tz>> {
    let tomorrow = now.date_naive().succ_opt()?;
    let naive = tomorrow.and_hms_opt(rule.hour, rule.minute, 0)?;
    let tz = now.timezone();

    // Ambiguous (DST fold) → earliest; nonexistent (DST gap) → one hour later.
    let base = tz
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())?;

    Some(base + TimeDelta::from_std(jitter).ok()?)
}

/// Time left until `at`; zero if it already passed.
pub fn delay_until<Tz: TimeZone>(now: &DateTime<Tz>, at: &DateTime<Tz>) -> Duration {
    at.clone()
        .signed_duration_since(now.clone())
        .to_std()
        .unwrap_or(Duration::ZERO)
}
