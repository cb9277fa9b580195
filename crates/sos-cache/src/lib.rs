//! `sos-cache` — flat-file entity caches and the cross-process refresh lock.
//!
//! # Overview
//!
//! Each cache is an [`entity::EntityCache`] over a [`entity::CachedEntity`]
//! type. The cache owns one file in the base cache directory, knows when that
//! file is stale, and can rebuild it from a [`sos_core::DataSource`].
//! Refresh jobs coordinate through a [`lock::MutualExclusion`]; the
//! single-host implementation is [`lock::FileLock`].
//!
//! # Record format
//!
//! One entity per line, fields joined by `@@`, every field escaped so the
//! separator never appears inside one. See [`record`].

pub mod entity;
pub mod error;
pub mod lock;
pub mod offerings;
pub mod record;
pub mod units;

pub use entity::{CachedEntity, Candidate, EntityCache, UpdateOutcome};
pub use error::{CacheError, FramingError, LockError, Result};
pub use lock::{FileLock, MutualExclusion};
pub use offerings::ObservationOfferingCache;
pub use units::PropertyUnitMappingCache;
