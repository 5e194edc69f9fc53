use std::sync::Arc;

use dashmap::DashMap;
use dpgate_query::{Dataset, DatasetId};

/// Datasets an engine has already fetched. Entries live until the gateway
/// asks for them to be dropped.
pub trait DatasetCache: Send + Sync {
    fn get(&self, dataset: DatasetId) -> Option<Arc<Dataset>>;
    fn put(&self, dataset: DatasetId, data: Arc<Dataset>);
    /// Returns whether an entry was removed.
    fn invalidate(&self, dataset: DatasetId) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryDatasetCache {
    entries: DashMap<DatasetId, Arc<Dataset>>,
}

impl InMemoryDatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DatasetCache for InMemoryDatasetCache {
    fn get(&self, dataset: DatasetId) -> Option<Arc<Dataset>> {
        self.entries.get(&dataset).map(|entry| Arc::clone(entry.value()))
    }

    fn put(&self, dataset: DatasetId, data: Arc<Dataset>) {
        self.entries.insert(dataset, data);
    }

    fn invalidate(&self, dataset: DatasetId) -> bool {
        self.entries.remove(&dataset).is_some()
    }
}

/// Never holds anything; every request refetches.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDatasetCache;

impl DatasetCache for NoDatasetCache {
    fn get(&self, _dataset: DatasetId) -> Option<Arc<Dataset>> {
        None
    }

    fn put(&self, _dataset: DatasetId, _data: Arc<Dataset>) {}

    fn invalidate(&self, _dataset: DatasetId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpgate_query::Row;

    #[test]
    fn invalidate_drops_only_the_named_dataset() {
        let cache = InMemoryDatasetCache::new();
        let data = Arc::new(Dataset::new(vec![["1"].into_iter().collect::<Row>()]));
        cache.put(1, data.clone());
        cache.put(2, data);
        assert!(cache.invalidate(1));
        assert!(!cache.invalidate(1));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.get(2).map(|d| d.len()), Some(1));
        assert_eq!(cache.len(), 1);

        assert!(NoDatasetCache.get(2).is_none());
    }
}
