use sos_cache::{CacheError, LockError};
use thiserror::Error;

/// Why a refresh job ended early. Logged and reported, never propagated.
#[derive(Debug, Error)]
pub enum JobError {
    /// The lock could not even be inspected.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// A candidate failed to refresh; the remaining candidates were skipped.
    #[error("Cache {candidate} failed: {source}")]
    Cache {
        candidate: String,
        #[source]
        source: CacheError,
    },

    /// The job body panicked.
    #[error("Job panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, JobError>;
