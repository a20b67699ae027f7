//! A thread-safe, versioned in-memory snapshot of flags and segments.
//! Readers (flag evaluation) never block each other; writers (the data
//! synchronizer) are serialized.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::data::{Category, DataItem, DataSet};

#[derive(Default)]
struct StoreInner {
    items: DataSet,
    version: i64,
    initialized: bool,
}

/// `MemoryStore` holds the environment snapshot as a two-level
/// {category -> key -> item} map under a reader-writer lock.
///
/// Archived items are kept as tombstones so that out-of-order patches stay
/// idempotent; tombstones are never observable through [`MemoryStore::get`]
/// or [`MemoryStore::get_all`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Atomically replace the whole snapshot if `version` is newer than the
    /// current one; otherwise a no-op. Returns whether the payload was
    /// applied.
    pub fn init(&self, all: DataSet, version: i64) -> bool {
        if all.is_empty() {
            return false;
        }
        let mut inner = self
            .inner
            .write()
            .expect("thread holding snapshot lock should not panic");
        if version <= inner.version {
            return false;
        }
        inner.items = all;
        inner.version = version;
        inner.initialized = true;
        true
    }

    /// Insert or replace one item iff `version` is strictly newer than the
    /// stored item's timestamp. The first accepted upsert initializes the
    /// store. Returns whether the item was accepted.
    pub fn upsert(
        &self,
        category: Category,
        key: &str,
        item: Arc<DataItem>,
        version: i64,
    ) -> bool {
        if key.is_empty() {
            return false;
        }
        let mut guard = self
            .inner
            .write()
            .expect("thread holding snapshot lock should not panic");
        let inner = &mut *guard;
        let items = inner.items.entry(category).or_default();
        if let Some(existing) = items.get(key) {
            if existing.timestamp() >= version {
                return false;
            }
        }
        items.insert(key.to_owned(), item);
        if version > inner.version {
            inner.version = version;
        }
        inner.initialized = true;
        true
    }

    /// Look up a live item; archived placeholders are invisible.
    pub fn get(&self, category: Category, key: &str) -> Option<Arc<DataItem>> {
        let inner = self
            .inner
            .read()
            .expect("thread holding snapshot lock should not panic");
        inner
            .items
            .get(&category)
            .and_then(|items| items.get(key))
            .filter(|item| !item.is_archived())
            .cloned()
    }

    /// All live items of one category.
    pub fn get_all(&self, category: Category) -> HashMap<String, Arc<DataItem>> {
        let inner = self
            .inner
            .read()
            .expect("thread holding snapshot lock should not panic");
        inner
            .items
            .get(&category)
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, item)| !item.is_archived())
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .read()
            .expect("thread holding snapshot lock should not panic")
            .initialized
    }

    /// The snapshot version: never decreases across init/upsert.
    pub fn version(&self) -> i64 {
        self.inner
            .read()
            .expect("thread holding snapshot lock should not panic")
            .version
    }

    /// Release the snapshot. The in-memory store has nothing to free
    /// beyond dropping its contents.
    pub fn close(&self) {
        let mut inner = self
            .inner
            .write()
            .expect("thread holding snapshot lock should not panic");
        inner.items.clear();
    }
}
