//! `sos-core` — shared types for the SOS entity-cache subsystem.
//!
//! Holds the cached domain entities, the collaborator traits the cache layer
//! is driven through ([`source::DataSource`], [`source::DirectoryResolver`]),
//! and the figment-backed [`config::CacheConfig`].

pub mod config;
pub mod error;
pub mod source;
pub mod types;

pub use error::{Result, SosError, SourceError};
pub use source::{DataSource, DirectoryResolver, FixedDirectory};
pub use types::{Envelope, ObservationOffering, PropertyUnitMapping, TimePeriod, UnitOfMeasure};
