use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sos_cache::Candidate;
use uuid::Uuid;

/// What caused a job to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Immediate one-shot job over the caches found stale at startup.
    Startup,
    /// Recurring full refresh.
    Daily,
    /// Explicitly requested full refresh.
    Manual,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::Startup => "startup",
            JobKind::Daily => "daily",
            JobKind::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every candidate was processed.
    Succeeded,
    /// A candidate failed or the body panicked; the lock was still released.
    Failed,
    /// The lock was held elsewhere (or unreadable); no candidate was touched.
    Skipped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// One refresh cycle over a fixed, ordered set of candidates.
#[derive(Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub candidates: Arc<[Arc<dyn Candidate>]>,
}

impl Job {
    pub fn new(kind: JobKind, candidates: Arc<[Arc<dyn Candidate>]>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            candidates,
        }
    }

    pub fn candidate_names(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.name().to_string()).collect()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("candidates", &self.candidate_names())
            .finish()
    }
}

/// Identifies the worker executing the most recent job, so the watchdog can
/// find it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            started_at: Utc::now(),
        }
    }
}

/// Outcome of one job, sent on the scheduler's report channel.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Candidates that were actually rebuilt, in refresh order.
    pub updated: Vec<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}
