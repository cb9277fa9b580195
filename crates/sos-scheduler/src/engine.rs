use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeDelta};
use futures_util::FutureExt;
use sos_cache::{Candidate, FileLock, MutualExclusion, UpdateOutcome};
use sos_core::config::CacheConfig;
use sos_core::{DataSource, DirectoryResolver};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    candidates::CacheSet,
    error::JobError,
    schedule::{delay_until, next_daily_run, DailyRule},
    timer::Timer,
    types::{Job, JobKind, JobReport, JobStatus, RunRecord},
    watchdog::{Watchdog, WorkerRegistration, WorkerRegistry},
};

/// Tunables of a scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub staleness: Duration,
    pub daily: DailyRule,
    pub watchdog_delay: Duration,
}

impl From<&CacheConfig> for SchedulerConfig {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            staleness: cfg.staleness(),
            daily: DailyRule::from(&cfg.schedule),
            watchdog_delay: cfg.watchdog_delay(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

/// Everything a scheduler needs from the embedding application.
pub struct SchedulerContext {
    pub source: Arc<dyn DataSource>,
    pub resolver: Arc<dyn DirectoryResolver>,
    /// Defaults to a [`FileLock`] in the resolver's directory.
    pub lock: Option<Arc<dyn MutualExclusion>>,
    pub config: SchedulerConfig,
    /// If set, every finished job is reported here (non-blocking).
    pub reports: Option<mpsc::Sender<JobReport>>,
}

impl SchedulerContext {
    pub fn new(
        source: Arc<dyn DataSource>,
        resolver: Arc<dyn DirectoryResolver>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            source,
            resolver,
            lock: None,
            config,
            reports: None,
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn MutualExclusion>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_reports(mut self, reports: mpsc::Sender<JobReport>) -> Self {
        self.reports = Some(reports);
        self
    }
}

/// Guarded construct-once holder for the scheduler.
///
/// Owned by the application and passed by reference to whatever triggers
/// refreshes or reads caches.
#[derive(Default)]
pub struct SchedulerSlot {
    cell: OnceLock<Arc<CacheScheduler>>,
}

impl SchedulerSlot {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Construct the scheduler on the first call. Later or concurrent calls
    /// return the existing instance and have no other effect; their context
    /// is dropped unused. Must be called from within a Tokio runtime.
    pub fn init(&self, ctx: SchedulerContext, refresh_on_startup: bool) -> Arc<CacheScheduler> {
        let mut created = false;
        let scheduler = self.cell.get_or_init(|| {
            created = true;
            Arc::new(CacheScheduler::start(ctx, refresh_on_startup))
        });
        if !created {
            debug!("cache scheduler already initialised");
        }
        Arc::clone(scheduler)
    }

    pub fn instance(&self) -> Option<Arc<CacheScheduler>> {
        self.cell.get().cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    JobRunning,
    ShutDown,
}

/// State shared between the scheduler and the tasks its timers run.
struct Shared {
    source: Arc<dyn DataSource>,
    lock: Arc<dyn MutualExclusion>,
    registry: WorkerRegistry,
    watchdog: Watchdog,
    watchdog_delay: Duration,
    monitor: Timer,
    last_run: Mutex<Option<RunRecord>>,
    reports: Option<mpsc::Sender<JobReport>>,
}

/// Periodically refreshes the entity caches.
pub struct CacheScheduler {
    shared: Arc<Shared>,
    caches: CacheSet,
    candidates: Arc<[Arc<dyn Candidate>]>,
    job_timer: Timer,
    update_on_startup: bool,
    startup_refresh: Option<Vec<String>>,
    next_run: DateTime<Local>,
    shut_down: AtomicBool,
}

impl CacheScheduler {
    fn start(ctx: SchedulerContext, refresh_on_startup: bool) -> Self {
        let SchedulerContext {
            source,
            resolver,
            lock,
            config,
            reports,
        } = ctx;

        let caches = CacheSet::open(resolver.as_ref(), config.staleness);
        let candidates: Arc<[Arc<dyn Candidate>]> = caches.candidates().into();
        let lock: Arc<dyn MutualExclusion> = match lock {
            Some(lock) => lock,
            None => Arc::new(FileLock::new(Arc::clone(&resolver))),
        };
        let registry = WorkerRegistry::default();

        let shared = Arc::new(Shared {
            source,
            watchdog: Watchdog::new(Arc::clone(&lock), registry.clone()),
            lock,
            registry,
            watchdog_delay: config.watchdog_delay,
            monitor: Timer::new("cache-monitor"),
            last_run: Mutex::new(None),
            reports,
        });
        let job_timer = Timer::new("cache-update");

        let mut startup_refresh = None;
        if !refresh_on_startup {
            info!("update cache on startup disabled");
        } else {
            let stale: Vec<Arc<dyn Candidate>> = candidates
                .iter()
                .filter(|c| c.requires_update())
                .cloned()
                .collect();
            if stale.is_empty() {
                info!(
                    threshold_minutes = config.staleness.as_secs() / 60,
                    "no cache update required"
                );
            } else {
                let job = Job::new(JobKind::Startup, stale.into());
                info!(job_id = %job.id, candidates = ?job.candidate_names(), "cache update required");
                startup_refresh = Some(job.candidate_names());
                let shared = Arc::clone(&shared);
                job_timer.schedule_once(Duration::ZERO, move || shared.run_job(job));
            }
        }

        let now = Local::now();
        let jitter = config.daily.jitter.sample(&mut rand::rng());
        let next_run = next_daily_run(&now, &config.daily, jitter).unwrap_or_else(|| {
            warn!(
                hour = config.daily.hour,
                minute = config.daily.minute,
                "invalid daily run time, using one period from now"
            );
            now + TimeDelta::from_std(config.daily.period).unwrap_or(TimeDelta::days(1))
        });
        {
            let shared = Arc::clone(&shared);
            let candidates = Arc::clone(&candidates);
            job_timer.schedule_at_fixed_rate(
                delay_until(&now, &next_run),
                config.daily.period,
                move || {
                    let shared = Arc::clone(&shared);
                    let job = Job::new(JobKind::Daily, Arc::clone(&candidates));
                    async move { shared.run_job(job).await }
                },
            );
        }
        info!(next_run = %next_run.to_rfc3339(), "next scheduled cache update");

        Self {
            shared,
            caches,
            candidates,
            job_timer,
            update_on_startup: refresh_on_startup,
            startup_refresh,
            next_run,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Registered candidates in refresh order.
    pub fn candidates(&self) -> &[Arc<dyn Candidate>] {
        &self.candidates
    }

    /// Typed access to the caches for readers.
    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    pub fn is_update_cache_on_startup(&self) -> bool {
        self.update_on_startup
    }

    /// Names of the candidates the startup job was scheduled for, if any.
    pub fn startup_refresh(&self) -> Option<&[String]> {
        self.startup_refresh.as_deref()
    }

    /// First run of the recurring full refresh.
    pub fn next_scheduled_run(&self) -> DateTime<Local> {
        self.next_run
    }

    /// Worker record of the most recent job that acquired the lock.
    pub fn last_run(&self) -> Option<RunRecord> {
        self.shared
            .last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lock(&self) -> &Arc<dyn MutualExclusion> {
        &self.shared.lock
    }

    pub fn state(&self) -> SchedulerState {
        if self.shut_down.load(Ordering::Acquire) {
            SchedulerState::ShutDown
        } else if self.shared.registry.is_empty() {
            SchedulerState::Idle
        } else {
            SchedulerState::JobRunning
        }
    }

    /// Queue an immediate full refresh on the job timer. Returns the job id,
    /// or `None` after shutdown.
    pub fn trigger_refresh(&self) -> Option<Uuid> {
        if self.job_timer.is_cancelled() {
            return None;
        }
        let job = Job::new(JobKind::Manual, Arc::clone(&self.candidates));
        let id = job.id;
        let shared = Arc::clone(&self.shared);
        self.job_timer
            .schedule_once(Duration::ZERO, move || shared.run_job(job));
        Some(id)
    }

    /// Run a full refresh on the job timer and wait for its report.
    ///
    /// Waits behind a job already running on the timer. Returns `None` after
    /// shutdown, or when shutdown abandons the job before it reports.
    pub async fn refresh_now(&self) -> Option<JobReport> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }
        let job = Job::new(JobKind::Manual, Arc::clone(&self.candidates));
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let handle = self.job_timer.schedule_once(Duration::ZERO, move || async move {
            let report = shared.execute(&job).await;
            shared.report(report.clone());
            let _ = tx.send(report);
        });
        if handle.is_cancelled() {
            return None;
        }
        rx.await.ok()
    }

    /// Cancel both timers, abandoning any in-flight job, then release the
    /// lock. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.job_timer.cancel();
        self.shared.monitor.cancel();
        self.job_timer.join().await;
        self.shared.monitor.join().await;

        if let Err(e) = self.shared.lock.release() {
            warn!(error = %e, "could not release cache lock on shutdown");
        }
        info!("cache scheduler shut down");
    }
}

impl Shared {
    async fn run_job(self: Arc<Self>, job: Job) {
        let report = self.execute(&job).await;
        self.report(report);
    }

    /// Job body. Never propagates: every failure ends in a report.
    async fn execute(&self, job: &Job) -> JobReport {
        let started = Instant::now();
        let finish = |status, updated, error: Option<JobError>| JobReport {
            job_id: job.id,
            kind: job.kind,
            status,
            updated,
            error: error.map(|e| e.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        match self.lock.try_acquire() {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job.id, kind = %job.kind, "cache already updating, skipping");
                return finish(JobStatus::Skipped, Vec::new(), None);
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not acquire cache lock, skipping");
                return finish(JobStatus::Skipped, Vec::new(), Some(e.into()));
            }
        }

        let run = RunRecord::for_job(job);
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(run.clone());
        let cancel = CancellationToken::new();
        let worker = self.registry.register(&run, cancel.clone());
        self.schedule_watchdog(run);

        info!(job_id = %job.id, kind = %job.kind, candidates = ?job.candidate_names(), "updating caches");

        let mut updated = Vec::new();
        let outcome = AssertUnwindSafe(self.update_all(job, &worker, &cancel, &mut updated))
            .catch_unwind()
            .await;

        let (status, error) = match outcome {
            Ok(Ok(())) => {
                info!(job_id = %job.id, updated = updated.len(), "all caches updated");
                (JobStatus::Succeeded, None)
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "cache update failed");
                (JobStatus::Failed, Some(e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job.id, panic = %message, "cache update panicked");
                (JobStatus::Failed, Some(JobError::Panicked(message)))
            }
        };

        if let Err(e) = self.lock.release() {
            warn!(job_id = %job.id, error = %e, "could not release cache lock");
        }
        drop(worker);
        finish(status, updated, error)
    }

    /// Refresh candidates in order; the first failure ends the job.
    async fn update_all(
        &self,
        job: &Job,
        worker: &WorkerRegistration,
        cancel: &CancellationToken,
        updated: &mut Vec<String>,
    ) -> Result<(), JobError> {
        for candidate in job.candidates.iter() {
            worker.set_current(candidate.name());
            let outcome = candidate
                .update_cache(self.source.as_ref(), cancel)
                .await
                .map_err(|source| JobError::Cache {
                    candidate: candidate.name().to_string(),
                    source,
                })?;
            match outcome {
                UpdateOutcome::Updated { .. } => updated.push(candidate.name().to_string()),
                UpdateOutcome::AlreadyRunning => {
                    debug!(job_id = %job.id, cache = candidate.name(), "candidate busy, left alone");
                }
            }
        }
        Ok(())
    }

    fn schedule_watchdog(&self, run: RunRecord) {
        let watchdog = self.watchdog.clone();
        self.monitor
            .schedule_once(self.watchdog_delay, move || async move {
                watchdog.check(&run);
            });
    }

    fn report(&self, report: JobReport) {
        if let Some(ref tx) = self.reports {
            // try_send never blocks the job timer.
            if tx.try_send(report).is_err() {
                warn!("job report channel full or closed, report dropped");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
