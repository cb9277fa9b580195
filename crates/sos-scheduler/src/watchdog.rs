//! Liveness check that reclaims the refresh lock from a stuck or abandoned job.
//!
//! One check is scheduled per job start. When it fires it reports on the
//! recorded worker, then tries the lock: if the lock is still held, the job
//! is considered overdue and its worker is asked to cancel. Either way the
//! lock is released, so no job can block future jobs forever. A job that is
//! slow but healthy will be cancelled too; that is the accepted trade-off.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use dashmap::DashMap;
use sos_cache::MutualExclusion;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{JobKind, RunRecord};

/// Live state of one job worker.
#[derive(Debug)]
pub struct WorkerState {
    kind: JobKind,
    started: Instant,
    current: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl WorkerState {
    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Candidate the worker is refreshing right now.
    pub fn current_candidate(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Registry of workers currently executing a job, keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<Uuid, Arc<WorkerState>>>,
}

impl WorkerRegistry {
    /// Register the worker for `run`. It stays registered until the returned
    /// guard is dropped, including when the job future is abandoned.
    pub fn register(&self, run: &RunRecord, cancel: CancellationToken) -> WorkerRegistration {
        let state = Arc::new(WorkerState {
            kind: run.kind,
            started: Instant::now(),
            current: Mutex::new(None),
            cancel,
        });
        self.workers.insert(run.job_id, Arc::clone(&state));
        WorkerRegistration {
            registry: self.clone(),
            job_id: run.job_id,
            state,
        }
    }

    pub fn get(&self, job_id: &Uuid) -> Option<Arc<WorkerState>> {
        self.workers.get(job_id).map(|w| Arc::clone(w.value()))
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }
}

pub struct WorkerRegistration {
    registry: WorkerRegistry,
    job_id: Uuid,
    state: Arc<WorkerState>,
}

impl WorkerRegistration {
    pub fn set_current(&self, candidate: &str) {
        *self
            .state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(candidate.to_string());
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        self.registry.workers.remove(&self.job_id);
    }
}

/// What a watchdog check observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogVerdict {
    /// The recorded worker was still registered.
    pub worker_found: bool,
    /// The lock was still held when the check fired.
    pub lock_was_held: bool,
    /// A cancellation request was sent to the worker.
    pub interrupted: bool,
    /// The final release succeeded.
    pub released: bool,
}

#[derive(Clone)]
pub struct Watchdog {
    lock: Arc<dyn MutualExclusion>,
    registry: WorkerRegistry,
}

impl Watchdog {
    pub fn new(lock: Arc<dyn MutualExclusion>, registry: WorkerRegistry) -> Self {
        Self { lock, registry }
    }

    pub fn check(&self, run: &RunRecord) -> WatchdogVerdict {
        info!(job_id = %run.job_id, kind = %run.kind, "monitoring cache update");

        let worker = self.registry.get(&run.job_id);
        match &worker {
            Some(w) => info!(
                job_id = %run.job_id,
                kind = %w.kind,
                elapsed_secs = w.elapsed_secs(),
                current = ?w.current_candidate(),
                cancelled = w.is_cancelled(),
                "refresh worker still registered"
            ),
            None => warn!(job_id = %run.job_id, "could not locate refresh worker"),
        }

        let lock_was_held = match self.lock.try_acquire() {
            Ok(acquired) => !acquired,
            Err(e) => {
                warn!(job_id = %run.job_id, error = %e, "watchdog could not check cache lock");
                false
            }
        };

        let mut interrupted = false;
        if lock_was_held {
            warn!(
                job_id = %run.job_id,
                "cache update took too long, freeing the lock and cancelling the update"
            );
            if let Some(w) = &worker {
                w.cancel.cancel();
                interrupted = true;
            }
        }

        let released = match self.lock.release() {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %run.job_id, error = %e, "watchdog could not release cache lock");
                false
            }
        };

        WatchdogVerdict {
            worker_found: worker.is_some(),
            lock_was_held,
            interrupted,
            released,
        }
    }
}

#[cfg(test)]
mod tests {
    use sos_cache::{Candidate, FileLock};
    use sos_core::FixedDirectory;

    use super::*;
    use crate::types::Job;

    fn setup() -> (tempfile::TempDir, Arc<FileLock>, Watchdog, WorkerRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let lock = Arc::new(FileLock::new(Arc::new(FixedDirectory::new(tmp.path()))));
        let registry = WorkerRegistry::default();
        let watchdog = Watchdog::new(lock.clone(), registry.clone());
        (tmp, lock, watchdog, registry)
    }

    fn run() -> RunRecord {
        RunRecord::for_job(&Job::new(
            JobKind::Daily,
            Arc::from(Vec::<Arc<dyn Candidate>>::new()),
        ))
    }

    #[test]
    fn finished_job_leaves_nothing_to_do() {
        let (_tmp, lock, watchdog, _registry) = setup();

        let verdict = watchdog.check(&run());

        assert_eq!(
            verdict,
            WatchdogVerdict {
                worker_found: false,
                lock_was_held: false,
                interrupted: false,
                released: true,
            }
        );
        assert!(!lock.is_held().unwrap());
    }

    #[test]
    fn stuck_worker_is_cancelled_and_lock_freed() {
        let (_tmp, lock, watchdog, registry) = setup();
        let run = run();
        let cancel = CancellationToken::new();
        let registration = registry.register(&run, cancel.clone());
        registration.set_current("observation-offerings");
        assert!(lock.try_acquire().unwrap());

        let verdict = watchdog.check(&run);

        assert!(verdict.worker_found);
        assert!(verdict.lock_was_held);
        assert!(verdict.interrupted);
        assert!(cancel.is_cancelled());
        assert!(!lock.is_held().unwrap());
        assert!(lock.try_acquire().unwrap());
    }

    #[test]
    fn foreign_lock_is_freed_without_worker() {
        let (_tmp, lock, watchdog, _registry) = setup();
        assert!(lock.try_acquire().unwrap());

        let verdict = watchdog.check(&run());

        assert!(verdict.lock_was_held);
        assert!(!verdict.interrupted);
        assert!(!lock.is_held().unwrap());
    }

    #[test]
    fn registration_drop_deregisters() {
        let registry = WorkerRegistry::default();
        let run = run();
        {
            let _registration = registry.register(&run, CancellationToken::new());
            assert_eq!(registry.len(), 1);
            assert!(registry.get(&run.job_id).is_some());
        }
        assert!(registry.is_empty());
    }
}
