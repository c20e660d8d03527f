//! Load-or-create caches keyed by name.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::Result;

type Loader<K, V> = Box<dyn Fn(&K) -> Result<V> + Send + Sync>;

/// Memoizes `loader` per key. Concurrent callers for a key that is still
/// loading block until the first loader finishes and then share its value.
/// A failed load leaves the key empty so the next caller retries.
pub struct LazyCache<K, V> {
    entries: DashMap<K, Arc<OnceCell<Arc<V>>>>,
    loader: Loader<K, V>,
}

impl<K, V> LazyCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(loader: impl Fn(&K) -> Result<V> + Send + Sync + 'static) -> Self {
        Self {
            entries: DashMap::new(),
            loader: Box::new(loader),
        }
    }

    /// Returns the cached value, loading it on first use. The flag is true when
    /// the value was already present.
    pub fn load(&self, key: &K) -> Result<(Arc<V>, bool)> {
        // Clone the cell out so the shard lock is not held while loading.
        let cell = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let mut loaded_here = false;
        let value = cell.get_or_try_init(|| {
            loaded_here = true;
            (self.loader)(key).map(Arc::new)
        })?;
        Ok((Arc::clone(value), !loaded_here))
    }

    /// Returns the value only if it was already loaded.
    pub fn load_existing(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn store(&self, key: K, value: V) {
        let cell = OnceCell::new();
        let _ = cell.set(Arc::new(value));
        self.entries.insert(key, Arc::new(cell));
    }

    /// Loaded entries at the time of the call.
    pub fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.value().get().map(|v| (entry.key().clone(), Arc::clone(v))))
            .collect()
    }
}
