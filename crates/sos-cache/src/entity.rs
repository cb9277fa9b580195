//! Generic flat-file entity cache.
//!
//! An [`EntityCache`] owns one cache file and an in-memory snapshot of its
//! entities. Concrete caches only describe their entity through
//! [`CachedEntity`]; everything else (staleness, file I/O, the
//! duplicate-update guard, cancellation) lives here.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use sos_core::{DataSource, DirectoryResolver, SourceError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::record::{encode_record, split_record};

/// An entity type that can live in a flat-file cache.
#[async_trait]
pub trait CachedEntity: Clone + Send + Sync + Sized + 'static {
    /// Stable candidate name used in logs and reports.
    const NAME: &'static str;
    /// File name inside the cache base directory.
    const FILE_NAME: &'static str;
    /// Number of fields in one record, ID included.
    const FIELD_COUNT: usize;

    fn id(&self) -> &str;

    /// Field values in record order; the first one must be [`Self::id`].
    fn encode_fields(&self) -> Result<Vec<String>>;

    /// Rebuild an entity from exactly [`Self::FIELD_COUNT`] fields.
    /// `None` when a field cannot be decoded.
    fn decode_fields(fields: &[String]) -> Option<Self>;

    /// Query the backing source for the full current collection.
    async fn fetch(source: &dyn DataSource) -> std::result::Result<Vec<Self>, SourceError>;
}

/// Result of a single [`EntityCache::update_cache`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Fresh entities were fetched and persisted.
    Updated { count: usize },
    /// Another update of this very cache was already in flight; nothing done.
    AlreadyRunning,
}

/// Object-safe view of an [`EntityCache`] used by refresh jobs.
#[async_trait]
pub trait Candidate: Send + Sync {
    fn name(&self) -> &str;

    fn file_path(&self) -> &Path;

    fn requires_update(&self) -> bool;

    async fn update_cache(
        &self,
        source: &dyn DataSource,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome>;
}

/// Clears the in-flight flag however the update ends.
struct UpdateGuard<'a>(&'a AtomicBool);

impl<'a> UpdateGuard<'a> {
    fn try_new(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct EntityCache<T: CachedEntity> {
    path: PathBuf,
    staleness: Duration,
    /// Candidate-local guard, independent of the cross-process lock.
    updating: AtomicBool,
    /// Replaced wholesale after each successful persist or reload.
    snapshot: RwLock<Arc<HashMap<String, T>>>,
}

impl<T: CachedEntity> EntityCache<T> {
    /// Resolve the cache file location and warm the snapshot from disk.
    ///
    /// Fails only if the base directory cannot be resolved; an unreadable
    /// existing file is logged and leaves the snapshot empty.
    pub fn open(resolver: &dyn DirectoryResolver, staleness: Duration) -> Result<Self> {
        let dir = resolver.cache_base_dir().map_err(CacheError::Resolve)?;
        let cache = Self {
            path: dir.join(T::FILE_NAME),
            staleness,
            updating: AtomicBool::new(false),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        };

        if cache.path.exists() {
            if let Err(e) = cache.reload() {
                warn!(cache = T::NAME, error = %e, "could not warm cache from disk");
            }
        }
        debug!(cache = T::NAME, path = %cache.path.display(), "cache opened");
        Ok(cache)
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    /// True iff the cache file is absent or older than the staleness threshold.
    pub fn requires_update(&self) -> bool {
        match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            // A modification time in the future counts as fresh.
            Ok(mtime) => SystemTime::now()
                .duration_since(mtime)
                .is_ok_and(|age| age > self.staleness),
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(cache = T::NAME, error = %e, "cannot stat cache file, treating as stale");
                true
            }
        }
    }

    /// Parse the cache file. Malformed records, including records that are
    /// not valid UTF-8, become `None` holes keyed by their ID; lines whose
    /// framing is broken are skipped.
    pub fn load(&self) -> Result<HashMap<String, Option<T>>> {
        let content = std::fs::read(&self.path)?;
        let mut result = HashMap::new();

        for (lineno, raw) in content.split(|b| *b == b'\n').enumerate() {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let (line, valid_utf8) = match std::str::from_utf8(raw) {
                Ok(line) => (Cow::Borrowed(line), true),
                Err(_) => (String::from_utf8_lossy(raw), false),
            };
            if line.trim().is_empty() {
                continue;
            }
            let fields = match split_record(&line) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(cache = T::NAME, line = lineno + 1, error = %e, "skipping unframed record");
                    continue;
                }
            };
            if !valid_utf8 {
                warn!(cache = T::NAME, line = lineno + 1, "record is not valid UTF-8");
            }

            let entity = if valid_utf8 && fields.len() == T::FIELD_COUNT {
                T::decode_fields(&fields)
            } else {
                None
            };
            if entity.is_none() {
                debug!(cache = T::NAME, line = lineno + 1, fields = fields.len(), "malformed record");
            }
            // split_record always yields at least one field.
            let id = fields.into_iter().next().unwrap_or_default();
            result.insert(id, entity);
        }
        Ok(result)
    }

    /// Serialize every entity and replace the cache file.
    ///
    /// Encoding happens before any I/O, so an encode failure leaves the old
    /// file untouched. The new content is written to a temp file in the same
    /// directory and renamed over the cache file.
    pub fn persist(&self, entities: &[T]) -> Result<()> {
        let mut body = String::new();
        for entity in entities {
            let fields = entity.encode_fields()?;
            body.push_str(&encode_record(&fields));
            body.push('\n');
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .suffix(".cache")
            .tempfile_in(dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CacheError::Io(e.error))?;

        let map = entities
            .iter()
            .map(|e| (e.id().to_string(), e.clone()))
            .collect();
        self.replace_snapshot(map);
        Ok(())
    }

    /// Re-read the cache file into the in-memory snapshot, dropping holes.
    pub fn reload(&self) -> Result<usize> {
        let map: HashMap<String, T> = self
            .load()?
            .into_iter()
            .filter_map(|(id, entity)| entity.map(|e| (id, e)))
            .collect();
        let count = map.len();
        self.replace_snapshot(map);
        Ok(count)
    }

    /// Current in-memory entities, keyed by ID.
    pub fn entities(&self) -> Arc<HashMap<String, T>> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.entities().get(id).cloned()
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    fn replace_snapshot(&self, map: HashMap<String, T>) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
    }

    /// Rebuild this cache from the backing source.
    ///
    /// A second call while one is in flight is a logged no-op. The
    /// cancellation token is honoured before the query, while awaiting it,
    /// and before the file is written.
    pub async fn update_cache(
        &self,
        source: &dyn DataSource,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        let Some(_guard) = UpdateGuard::try_new(&self.updating) else {
            info!(cache = T::NAME, "cache is currently already updating");
            return Ok(UpdateOutcome::AlreadyRunning);
        };

        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let started = Instant::now();
        let entities = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            fetched = T::fetch(source) => fetched?,
        };

        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.persist(&entities)?;

        info!(
            cache = T::NAME,
            count = entities.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache updated"
        );
        Ok(UpdateOutcome::Updated {
            count: entities.len(),
        })
    }
}

#[async_trait]
impl<T: CachedEntity> Candidate for EntityCache<T> {
    fn name(&self) -> &str {
        T::NAME
    }

    fn file_path(&self) -> &Path {
        &self.path
    }

    fn requires_update(&self) -> bool {
        EntityCache::requires_update(self)
    }

    async fn update_cache(
        &self,
        source: &dyn DataSource,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome> {
        EntityCache::update_cache(self, source, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use filetime::FileTime;
    use sos_core::{FixedDirectory, ObservationOffering, PropertyUnitMapping, UnitOfMeasure};
    use tokio::sync::Notify;

    use super::*;
    use crate::units::PropertyUnitMappingCache;

    fn mapping(property: &str, code: &str) -> PropertyUnitMapping {
        PropertyUnitMapping {
            property: property.to_string(),
            unit: UnitOfMeasure {
                code: code.to_string(),
                label: format!("{code} label"),
            },
        }
    }

    /// Source whose unit query can be held open until released.
    #[derive(Default)]
    struct GatedSource {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    #[async_trait]
    impl DataSource for GatedSource {
        async fn observation_offerings(
            &self,
        ) -> std::result::Result<Vec<ObservationOffering>, SourceError> {
            Ok(Vec::new())
        }

        async fn property_unit_mappings(
            &self,
        ) -> std::result::Result<Vec<PropertyUnitMapping>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(SourceError::Unavailable("database offline".into()));
            }
            Ok(vec![mapping("NO2", "ug/m3"), mapping("O3", "ug/m3")])
        }
    }

    fn open_cache(dir: &Path) -> PropertyUnitMappingCache {
        PropertyUnitMappingCache::open(&FixedDirectory::new(dir), Duration::from_secs(15 * 60))
            .unwrap()
    }

    fn age_file(path: &Path, age: Duration) {
        let mtime = FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_mtime(path, mtime).unwrap();
    }

    #[test]
    fn missing_file_requires_update() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        assert!(cache.requires_update());
    }

    #[test]
    fn staleness_follows_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        cache.persist(&[mapping("NO2", "ug/m3")]).unwrap();
        assert!(!cache.requires_update());

        age_file(cache.file_path(), Duration::from_secs(5 * 60));
        assert!(!cache.requires_update());

        age_file(cache.file_path(), Duration::from_secs(20 * 60));
        assert!(cache.requires_update());
    }

    #[test]
    fn persist_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        let entities = vec![
            mapping("NO2", "ug/m3"),
            mapping("weird@@prop\nname", "m\\s"),
        ];
        cache.persist(&entities).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.len(), 2);
        for e in &entities {
            assert_eq!(loaded[&e.property].as_ref(), Some(e));
        }
    }

    #[test]
    fn malformed_record_becomes_hole() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        std::fs::write(
            cache.file_path(),
            "NO2@@ug/m3@@micrograms\nPM10@@only-two\n\nbroken@line\n",
        )
        .unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded["NO2"].is_some());
        assert!(loaded["PM10"].is_none());

        assert_eq!(cache.reload().unwrap(), 1);
        assert!(cache.get("PM10").is_none());
    }

    #[test]
    fn invalid_utf8_record_becomes_hole() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        std::fs::write(
            cache.file_path(),
            b"NO2@@ug/m3@@micrograms\r\nO3@@\xff\xfe@@bad\n",
        )
        .unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["NO2"].as_ref().map(|m| m.unit.label.as_str()), Some("micrograms"));
        assert!(loaded["O3"].is_none());

        let reopened = open_cache(tmp.path());
        assert_eq!(reopened.entities().len(), 1);
    }

    #[test]
    fn snapshot_warmed_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        open_cache(tmp.path())
            .persist(&[mapping("NO2", "ug/m3")])
            .unwrap();

        let reopened = open_cache(tmp.path());
        assert_eq!(reopened.get("NO2"), Some(mapping("NO2", "ug/m3")));
    }

    #[test]
    fn unresolvable_directory_fails_construction() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain-file");
        std::fs::write(&file, "x").unwrap();

        let result = PropertyUnitMappingCache::open(&FixedDirectory::new(&file), Duration::ZERO);
        assert!(matches!(result, Err(CacheError::Resolve(_))));
    }

    #[tokio::test]
    async fn update_cache_fetches_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        let source = GatedSource::default();

        let outcome = cache
            .update_cache(&source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Updated { count: 2 });
        assert_eq!(cache.entities().len(), 2);
        assert!(!cache.requires_update());
        assert!(!cache.is_updating());
    }

    #[tokio::test]
    async fn concurrent_update_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(open_cache(tmp.path()));
        let gate = Arc::new(Notify::new());
        let source = Arc::new(GatedSource {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });

        let first = {
            let cache = Arc::clone(&cache);
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                cache
                    .update_cache(source.as_ref(), &CancellationToken::new())
                    .await
            })
        };
        while !cache.is_updating() {
            tokio::task::yield_now().await;
        }

        let second = cache
            .update_cache(source.as_ref(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second, UpdateOutcome::AlreadyRunning);

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, UpdateOutcome::Updated { count: 2 });
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_update_clears_flag_and_keeps_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        cache.persist(&[mapping("NO2", "ug/m3")]).unwrap();
        let source = GatedSource {
            fail: true,
            ..Default::default()
        };

        let err = cache
            .update_cache(&source, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Source(_)));
        assert!(!cache.is_updating());
        assert_eq!(cache.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(open_cache(tmp.path()));
        let source = Arc::new(GatedSource {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let task = {
            let cache = Arc::clone(&cache);
            let source = Arc::clone(&source);
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.update_cache(source.as_ref(), &cancel).await })
        };
        while source.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
        assert!(!cache.file_path().exists());
        assert!(!cache.is_updating());
    }
}
