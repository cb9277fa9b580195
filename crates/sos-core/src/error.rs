use thiserror::Error;

#[derive(Debug, Error)]
pub enum SosError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SosError {
    /// Short error code string, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            SosError::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Failures reported by a backing [`crate::DataSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be reached at all (connection refused, file gone…).
    #[error("Data source unavailable: {0}")]
    Unavailable(String),

    /// The source answered but the query itself failed.
    #[error("Query failed: {0}")]
    Query(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SosError>;
