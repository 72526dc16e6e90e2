use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::memo::{CacheEntry, CacheKey};

use super::lock::{rw_read, rw_write};
use super::{EntryStore, EntryStream, StoreError};

const SOURCE: &str = "store::memory";

/// In-process entry store.
///
/// Entries live as long as the store; useful for tests and for runs that only
/// need cross-call reuse within one process.
#[derive(Default)]
pub struct MemoryEntryStore {
    entries: RwLock<BTreeMap<CacheKey, CacheEntry>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Ok(rw_read(&self.entries, SOURCE, "get").get(id).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "put");
        match entries.get_mut(&entry.id) {
            Some(existing) => {
                existing.fields = entry.fields;
                existing.last_accessed = entry.last_accessed;
            }
            None => {
                entries.insert(entry.id.clone(), entry);
            }
        }
        Ok(())
    }

    fn iterate(&self) -> EntryStream<'_> {
        let snapshot: Vec<CacheEntry> = rw_read(&self.entries, SOURCE, "iterate")
            .values()
            .cloned()
            .collect();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn delete(&self, id: &CacheKey) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "delete").remove(id);
        Ok(())
    }
}
