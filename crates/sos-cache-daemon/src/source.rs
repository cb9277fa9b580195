//! Data source backed by a JSON export on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use sos_core::{DataSource, ObservationOffering, PropertyUnitMapping, SourceError};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct Export {
    #[serde(default)]
    offerings: Vec<ObservationOffering>,
    #[serde(default)]
    property_unit_mappings: Vec<PropertyUnitMapping>,
}

/// Reads `{ "offerings": [...], "property_unit_mappings": [...] }` from a
/// file. The file is re-read on every query, so edits are picked up by the
/// next refresh.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Export, SourceError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(format!(
                    "{} does not exist",
                    self.path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let export: Export = serde_json::from_slice(&raw)
            .map_err(|e| SourceError::Query(format!("{}: {e}", self.path.display())))?;
        debug!(
            path = %self.path.display(),
            offerings = export.offerings.len(),
            mappings = export.property_unit_mappings.len(),
            "source export read"
        );
        Ok(export)
    }
}

#[async_trait]
impl DataSource for JsonFileSource {
    async fn observation_offerings(&self) -> Result<Vec<ObservationOffering>, SourceError> {
        Ok(self.read().await?.offerings)
    }

    async fn property_unit_mappings(&self) -> Result<Vec<PropertyUnitMapping>, SourceError> {
        Ok(self.read().await?.property_unit_mappings)
    }
}
