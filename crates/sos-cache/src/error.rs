//! Error types for the sos-cache crate.

use std::io;
use std::path::PathBuf;

use sos_core::SourceError;
use thiserror::Error;

/// Errors raised while building, loading or refreshing an entity cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the cache file failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A single entity could not be turned into its record form.
    #[error("Cannot encode {entity}: {reason}")]
    Encode { entity: String, reason: String },

    /// The backing data source failed to deliver the collection.
    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    /// The refresh was cancelled through its cancellation token.
    #[error("Cache update cancelled")]
    Cancelled,

    /// The cache base directory could not be resolved.
    #[error("Cannot resolve cache directory: {0}")]
    Resolve(io::Error),
}

impl CacheError {
    pub(crate) fn encode(entity: &str, reason: impl Into<String>) -> Self {
        CacheError::Encode {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures of the lock primitive. Always recoverable: callers log and go on.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Cannot resolve lock directory: {0}")]
    Resolve(io::Error),

    #[error("Lock file {path} I/O error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A cache line that does not follow the record framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("line ends inside an escape sequence")]
    DanglingEscape,

    #[error("unknown escape sequence \\{0}")]
    UnknownEscape(char),

    #[error("unescaped '@' outside a field separator")]
    StrayToken,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CacheError>;
