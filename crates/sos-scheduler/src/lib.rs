//! `sos-scheduler` — drives periodic refreshes of the entity caches.
//!
//! # Overview
//!
//! A [`engine::CacheScheduler`] owns the candidate caches and two timers:
//!
//! | Timer           | Runs                                                   |
//! |-----------------|--------------------------------------------------------|
//! | `cache-update`  | Refresh jobs: one-shot startup job, then the daily job  |
//! | `cache-monitor` | One [`watchdog::Watchdog`] check per started job       |
//!
//! Jobs refresh their candidates sequentially while holding the
//! cross-process [`sos_cache::MutualExclusion`] lock. The watchdog frees that
//! lock unconditionally once its delay elapses, cancelling the job if it is
//! still holding it.
//!
//! The scheduler is constructed once through a [`engine::SchedulerSlot`]
//! owned by the embedding application.

pub mod candidates;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod timer;
pub mod types;
pub mod watchdog;

pub use candidates::CacheSet;
pub use engine::{CacheScheduler, SchedulerConfig, SchedulerContext, SchedulerSlot, SchedulerState};
pub use error::{JobError, Result};
pub use schedule::{DailyRule, Jitter};
pub use timer::{Timer, TimerHandle};
pub use types::{Job, JobKind, JobReport, JobStatus, RunRecord};
pub use watchdog::{Watchdog, WatchdogVerdict, WorkerRegistry};
