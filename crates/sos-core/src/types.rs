use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box of the area an offering observes.
///
/// `lower` and `upper` are `[x, y]` corners expressed in `crs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub crs: String,
    pub lower: [f64; 2],
    pub upper: [f64; 2],
}

/// Closed time interval covered by an offering's observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// A network of sensors exposed as one SOS observation offering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationOffering {
    pub id: String,
    pub name: String,
    /// Identifier of the procedure (sensor network) producing the data.
    pub procedure: String,
    pub observed_area: Envelope,
    pub observed_properties: Vec<String>,
    pub time_extent: TimePeriod,
}

/// Unit of measure as advertised in capabilities documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfMeasure {
    /// UCUM-style code, e.g. `ug/m3`.
    pub code: String,
    pub label: String,
}

/// Maps an observed property to the unit its values are reported in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyUnitMapping {
    pub property: String,
    pub unit: UnitOfMeasure,
}
