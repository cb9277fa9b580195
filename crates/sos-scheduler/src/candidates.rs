//! Registration of the concrete caches, in dependency order.

use std::sync::Arc;
use std::time::Duration;

use sos_cache::{
    CachedEntity, Candidate, EntityCache, ObservationOfferingCache, PropertyUnitMappingCache,
};
use sos_core::DirectoryResolver;
use tracing::{info, warn};

/// The caches a scheduler refreshes, with typed access for readers.
///
/// A cache that failed to open is `None` for the lifetime of the process.
#[derive(Clone, Default)]
pub struct CacheSet {
    pub property_units: Option<Arc<PropertyUnitMappingCache>>,
    pub offerings: Option<Arc<ObservationOfferingCache>>,
}

impl CacheSet {
    /// Open every cache. Property-unit mappings come first: building the
    /// offerings may consult them.
    pub fn open(resolver: &dyn DirectoryResolver, staleness: Duration) -> Self {
        let property_units = open_candidate(resolver, staleness);
        let offerings = open_candidate(resolver, staleness);
        Self {
            property_units,
            offerings,
        }
    }

    /// Candidates in registration order, skipping caches that failed to open.
    pub fn candidates(&self) -> Vec<Arc<dyn Candidate>> {
        let mut out: Vec<Arc<dyn Candidate>> = Vec::with_capacity(2);
        if let Some(c) = &self.property_units {
            out.push(Arc::clone(c) as Arc<dyn Candidate>);
        }
        if let Some(c) = &self.offerings {
            out.push(Arc::clone(c) as Arc<dyn Candidate>);
        }
        out
    }
}

fn open_candidate<T: CachedEntity>(
    resolver: &dyn DirectoryResolver,
    staleness: Duration,
) -> Option<Arc<EntityCache<T>>> {
    match EntityCache::<T>::open(resolver, staleness) {
        Ok(cache) => {
            info!(cache = T::NAME, path = %cache.file_path().display(), "cache candidate registered");
            Some(Arc::new(cache))
        }
        Err(e) => {
            warn!(cache = T::NAME, error = %e, "cache candidate unavailable, excluded from updates");
            None
        }
    }
}
