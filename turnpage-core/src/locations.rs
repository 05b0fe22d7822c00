use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, LocalCache};
use crate::engine::Locations;
use crate::DocumentId;

/// Mapping from linear progress to canonical references for one document.
/// Immutable once built; a failed build yields an index with no entries.
#[derive(Clone)]
pub struct LocationIndex {
    document_id: DocumentId,
    total: usize,
    locations: Option<Arc<dyn Locations>>,
}

impl LocationIndex {
    pub fn unavailable(document_id: DocumentId) -> Self {
        Self {
            document_id,
            total: 0,
            locations: None,
        }
    }

    fn ready(document_id: DocumentId, total: usize, locations: Arc<dyn Locations>) -> Self {
        Self {
            document_id,
            total,
            locations: Some(locations),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_available(&self) -> bool {
        self.total > 0 && self.locations.is_some()
    }

    /// Reference for a slider position, clamped to the last location.
    pub fn ref_from_progress(&self, progress: usize) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        let locations = self.locations.as_ref()?;
        locations.ref_from_location(progress.min(self.total - 1))
    }

    pub fn progress_from_ref(&self, reference: &str) -> Option<usize> {
        if !self.is_available() {
            return None;
        }
        self.locations.as_ref()?.location_from_ref(reference)
    }

    /// Progress as a percentage, or `None` while the index is unavailable.
    pub fn percent(&self, progress: usize) -> Option<f32> {
        if !self.is_available() {
            return None;
        }
        let clamped = progress.min(self.total);
        Some(clamped as f32 / self.total as f32 * 100.0)
    }
}

impl fmt::Debug for LocationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationIndex")
            .field("document_id", &self.document_id)
            .field("total", &self.total)
            .finish()
    }
}

pub struct LocationIndexBuilder {
    cache: Arc<dyn LocalCache>,
    chunk_size: usize,
}

impl LocationIndexBuilder {
    pub fn new(cache: Arc<dyn LocalCache>, chunk_size: usize) -> Self {
        Self { cache, chunk_size }
    }

    /// Loads the persisted index for `document_id`, or generates and
    /// persists one. Never fails: generation errors degrade to an
    /// unavailable index.
    #[instrument(skip(self, locations))]
    pub async fn build_or_load(
        &self,
        document_id: &DocumentId,
        locations: Arc<dyn Locations>,
    ) -> LocationIndex {
        let key = CacheKey::Locations(document_id.clone());

        match self.cache.get(&key) {
            Ok(Some(serialized)) if !serialized.is_empty() => match locations.load(&serialized) {
                Ok(total) if total > 0 => {
                    debug!(total, "loaded cached location index");
                    return LocationIndex::ready(document_id.clone(), total, locations);
                }
                Ok(_) => warn!("cached location index is empty, regenerating"),
                Err(err) => warn!(%err, "cached location index is unreadable, regenerating"),
            },
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to read cached location index"),
        }

        let total = match locations.generate(self.chunk_size).await {
            Ok(total) => total,
            Err(err) => {
                warn!(%err, "location index generation failed, progress unavailable");
                return LocationIndex::unavailable(document_id.clone());
            }
        };
        if total == 0 {
            warn!("location index generation produced no locations");
            return LocationIndex::unavailable(document_id.clone());
        }

        if let Err(err) = self.cache.set(&key, &locations.save()) {
            warn!(error = %err, "failed to persist location index");
        }
        debug!(total, chunk_size = self.chunk_size, "generated location index");
        LocationIndex::ready(document_id.clone(), total, locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::cache::MemoryCache;
    use crate::error::EngineError;

    struct FakeLocations {
        available: usize,
        refs: Mutex<Vec<String>>,
        generated: AtomicUsize,
        fail: bool,
    }

    impl FakeLocations {
        fn new(available: usize) -> Arc<Self> {
            Arc::new(Self {
                available,
                refs: Mutex::new(Vec::new()),
                generated: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                available: 10,
                refs: Mutex::new(Vec::new()),
                generated: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Locations for FakeLocations {
        async fn generate(&self, _chunk_size: usize) -> Result<usize, EngineError> {
            self.generated.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Locations("no spine".into()));
            }
            let refs: Vec<String> = (0..self.available).map(|n| format!("loc({n})")).collect();
            *self.refs.lock() = refs;
            Ok(self.available)
        }

        fn load(&self, serialized: &str) -> Result<usize, EngineError> {
            let refs: Vec<String> = serde_json::from_str(serialized)
                .map_err(|err| EngineError::Locations(err.to_string()))?;
            let total = refs.len();
            *self.refs.lock() = refs;
            Ok(total)
        }

        fn save(&self) -> String {
            serde_json::to_string(&*self.refs.lock()).unwrap()
        }

        fn ref_from_location(&self, location: usize) -> Option<String> {
            self.refs.lock().get(location).cloned()
        }

        fn location_from_ref(&self, reference: &str) -> Option<usize> {
            self.refs.lock().iter().position(|r| r == reference)
        }

        fn total(&self) -> usize {
            self.refs.lock().len()
        }
    }

    #[tokio::test]
    async fn generated_index_is_persisted_and_reloaded() {
        let cache: Arc<dyn LocalCache> = Arc::new(MemoryCache::new());
        let builder = LocationIndexBuilder::new(Arc::clone(&cache), 1600);
        let id = DocumentId::new("doc");

        let first_engine = FakeLocations::new(100);
        let first = builder.build_or_load(&id, first_engine.clone()).await;
        assert_eq!(first.total(), 100);
        assert_eq!(first_engine.generated.load(Ordering::SeqCst), 1);
        assert!(cache
            .get(&CacheKey::Locations(id.clone()))
            .unwrap()
            .is_some());

        let second_engine = FakeLocations::new(0);
        let second = builder.build_or_load(&id, second_engine.clone()).await;
        assert_eq!(second_engine.generated.load(Ordering::SeqCst), 0);
        assert_eq!(second.total(), first.total());
        for n in [0, 1, 50, 99] {
            assert_eq!(second.ref_from_progress(n), first.ref_from_progress(n));
        }
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_unavailable() {
        let cache: Arc<dyn LocalCache> = Arc::new(MemoryCache::new());
        let builder = LocationIndexBuilder::new(Arc::clone(&cache), 1600);
        let id = DocumentId::new("broken");

        let index = builder.build_or_load(&id, FakeLocations::failing()).await;
        assert_eq!(index.total(), 0);
        assert!(!index.is_available());
        assert_eq!(index.percent(10), None);
        assert_eq!(index.ref_from_progress(0), None);
        assert_eq!(cache.get(&CacheKey::Locations(id)).unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_cache_entry_triggers_regeneration() {
        let cache: Arc<dyn LocalCache> = Arc::new(MemoryCache::new());
        let id = DocumentId::new("doc");
        cache
            .set(&CacheKey::Locations(id.clone()), "not json")
            .unwrap();
        let builder = LocationIndexBuilder::new(Arc::clone(&cache), 1600);

        let engine = FakeLocations::new(12);
        let index = builder.build_or_load(&id, engine.clone()).await;
        assert_eq!(index.total(), 12);
        assert_eq!(engine.generated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_maps_to_percent_and_clamps() {
        let cache: Arc<dyn LocalCache> = Arc::new(MemoryCache::new());
        let builder = LocationIndexBuilder::new(cache, 1600);
        let index = builder
            .build_or_load(&DocumentId::new("doc"), FakeLocations::new(100))
            .await;

        assert_eq!(index.percent(50), Some(50.0));
        assert_eq!(index.ref_from_progress(50).as_deref(), Some("loc(50)"));
        assert_eq!(index.ref_from_progress(500).as_deref(), Some("loc(99)"));
        assert_eq!(index.progress_from_ref("loc(42)"), Some(42));
    }
}
