//! Collaborators the cache layer is driven through.
//!
//! The backing data source is slow and authoritative; the directory resolver
//! decides where flat-file caches live. Both are supplied by the embedding
//! application.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SourceError;
use crate::types::{ObservationOffering, PropertyUnitMapping};

/// Slow backing store queried to rebuild each cache from scratch.
///
/// Every method returns the *full* current collection; there is no
/// incremental query.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn observation_offerings(&self) -> Result<Vec<ObservationOffering>, SourceError>;

    async fn property_unit_mappings(&self) -> Result<Vec<PropertyUnitMapping>, SourceError>;
}

/// Supplies the base directory holding every cache file and the lock file.
pub trait DirectoryResolver: Send + Sync {
    fn cache_base_dir(&self) -> io::Result<PathBuf>;
}

/// Resolver backed by a configured path. The directory is created on demand.
#[derive(Debug, Clone)]
pub struct FixedDirectory(PathBuf);

impl FixedDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl DirectoryResolver for FixedDirectory {
    fn cache_base_dir(&self) -> io::Result<PathBuf> {
        match std::fs::metadata(&self.0) {
            Ok(meta) if meta.is_dir() => Ok(self.0.clone()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("cache base dir {} is not a directory", self.0.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&self.0)?;
                debug!(path = %self.0.display(), "created cache base dir");
                Ok(self.0.clone())
            }
            Err(e) => Err(e),
        }
    }
}
