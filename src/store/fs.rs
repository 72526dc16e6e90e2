use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_stream::stream;
use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use crate::memo::{CacheEntry, CacheKey};

use super::{EntryStore, EntryStream, STORE_VERSION, StoreError};

const VERSION_FILE: &str = "VERSION";
const ENTRIES_DIR: &str = "entries";
const ENTRY_EXTENSION: &str = "json";

/// Entry store keeping one JSON document per entry under `<root>/entries`.
///
/// Writes go through a temporary file in the same directory followed by a
/// rename, so readers never observe a partially written entry.
#[derive(Debug, Clone)]
pub struct FsEntryStore {
    root: PathBuf,
    entries_dir: PathBuf,
}

impl FsEntryStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// A missing or different version tag wipes the entries directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let entries_dir = root.join(ENTRIES_DIR);
        let version_path = root.join(VERSION_FILE);

        fs::create_dir_all(&root).await?;

        let found = match fs::read_to_string(&version_path).await {
            Ok(tag) => Some(tag.trim().to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if found.as_deref() != Some(STORE_VERSION) {
            match fs::remove_dir_all(&entries_dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            info!(
                op = "store::fs::open",
                root = %root.display(),
                found_version = found.as_deref().unwrap_or("none"),
                version = STORE_VERSION,
                "Recreated filesystem cache store"
            );
        }

        fs::create_dir_all(&entries_dir).await?;
        fs::write(&version_path, STORE_VERSION).await?;

        Ok(Self { root, entries_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, id: &CacheKey) -> Result<PathBuf, StoreError> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::corrupt(raw, "id is not a valid entry file name"));
        }
        Ok(self.entries_dir.join(format!("{raw}.{ENTRY_EXTENSION}")))
    }

    /// Write `entry` through a temporary file. Returns false when
    /// `CreateNew` finds the file already present.
    async fn write_entry(
        &self,
        path: &Path,
        entry: &CacheEntry,
        mode: WriteMode,
    ) -> Result<bool, StoreError> {
        let bytes = serde_json::to_vec(entry)?;
        let dir = self.entries_dir.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let mut file = tempfile::Builder::new()
                .suffix(".tmp")
                .tempfile_in(&dir)?;
            file.write_all(&bytes)?;
            file.flush()?;
            let persisted = match mode {
                WriteMode::Replace => file.persist(&path).map(drop),
                WriteMode::CreateNew => file.persist_noclobber(&path).map(drop),
            };
            match persisted {
                Ok(()) => Ok(true),
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(err) => Err(StoreError::Io(err.error)),
            }
        })
        .await
        .map_err(|err| StoreError::unavailable(format!("entry write task failed: {err}")))?
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Replace,
    CreateNew,
}

async fn read_entry_file(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|err| StoreError::corrupt(path.display().to_string(), err.to_string()))
}

#[async_trait]
impl EntryStore for FsEntryStore {
    fn backend(&self) -> &'static str {
        "filesystem"
    }

    async fn get(&self, id: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        read_entry_file(&self.entry_path(id)?).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let path = self.entry_path(&entry.id)?;

        let entry = match read_entry_file(&path).await {
            Ok(Some(existing)) => CacheEntry {
                namespace: existing.namespace,
                ..entry
            },
            Ok(None) => {
                if self.write_entry(&path, &entry, WriteMode::CreateNew).await? {
                    return Ok(());
                }
                // Another writer created the file first; its namespace wins.
                match read_entry_file(&path).await? {
                    Some(existing) => CacheEntry {
                        namespace: existing.namespace,
                        ..entry
                    },
                    None => entry,
                }
            }
            Err(err) => {
                warn!(
                    op = "store::fs::put",
                    key = %entry.id,
                    error = %err,
                    "Overwriting unreadable cache entry"
                );
                entry
            }
        };

        self.write_entry(&path, &entry, WriteMode::Replace).await?;
        Ok(())
    }

    fn iterate(&self) -> EntryStream<'_> {
        let dir = self.entries_dir.clone();
        Box::pin(stream! {
            match fs::read_dir(&dir).await {
                Err(err) => {
                    yield Err(StoreError::from(err));
                }
                Ok(mut reader) => loop {
                    match reader.next_entry().await {
                        Ok(Some(item)) => {
                            let path = item.path();
                            let is_entry = path
                                .extension()
                                .and_then(|ext| ext.to_str())
                                .is_some_and(|ext| ext == ENTRY_EXTENSION);
                            if !is_entry {
                                continue;
                            }
                            match read_entry_file(&path).await {
                                Ok(Some(entry)) => {
                                    yield Ok(entry);
                                }
                                // Deleted between listing and reading.
                                Ok(None) => {}
                                Err(err) => {
                                    yield Err(err);
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            yield Err(StoreError::from(err));
                            break;
                        }
                    }
                },
            }
        })
    }

    async fn delete(&self, id: &CacheKey) -> Result<(), StoreError> {
        match fs::remove_file(self.entry_path(id)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn entry(id: &str, namespace: &str, minute: i64) -> CacheEntry {
        CacheEntry::from_result(
            CacheKey::from_raw(id),
            namespace,
            &json!({"id": id, "minute": minute}),
            minute,
        )
        .expect("entry builds")
    }

    #[tokio::test]
    async fn entries_survive_reopening() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::open(dir.path()).await.expect("open");
        store.put(entry("abc123", "images", 7)).await.expect("put");

        let reopened = FsEntryStore::open(dir.path()).await.expect("reopen");
        let found = reopened
            .get(&CacheKey::from_raw("abc123"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(found.namespace, "images");
        assert_eq!(found.last_accessed, 7);
    }

    #[tokio::test]
    async fn version_mismatch_recreates_the_store() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::open(dir.path()).await.expect("open");
        store.put(entry("abc123", "images", 7)).await.expect("put");

        std::fs::write(dir.path().join(VERSION_FILE), "0").expect("write old tag");

        let reopened = FsEntryStore::open(dir.path()).await.expect("reopen");
        assert!(
            reopened
                .get(&CacheKey::from_raw("abc123"))
                .await
                .expect("get")
                .is_none()
        );
        let tag = std::fs::read_to_string(dir.path().join(VERSION_FILE)).expect("tag");
        assert_eq!(tag, STORE_VERSION);
    }

    #[tokio::test]
    async fn upsert_keeps_namespace_and_replaces_fields() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::open(dir.path()).await.expect("open");
        store.put(entry("k1", "first", 1)).await.expect("put");
        store.put(entry("k1", "second", 2)).await.expect("put");

        let found = store
            .get(&CacheKey::from_raw("k1"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(found.namespace, "first");
        assert_eq!(found.fields.get("minute"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn exclusive_create_never_replaces_an_existing_entry() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::open(dir.path()).await.expect("open");
        let first = entry("k2", "first", 1);
        let path = store.entry_path(&first.id).expect("path");

        assert!(
            store
                .write_entry(&path, &first, WriteMode::CreateNew)
                .await
                .expect("create")
        );
        assert!(
            !store
                .write_entry(&path, &entry("k2", "second", 2), WriteMode::CreateNew)
                .await
                .expect("second create")
        );

        let found = store
            .get(&CacheKey::from_raw("k2"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(found, first);
    }

    #[tokio::test]
    async fn concurrent_first_writes_agree_on_one_namespace() {
        let dir = TempDir::new().expect("temp dir");
        let store = std::sync::Arc::new(FsEntryStore::open(dir.path()).await.expect("open"));

        let writes = (0..8).map(|n| {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move { store.put(entry("k3", &format!("ns{n}"), n)).await })
        });
        for write in futures::future::join_all(writes).await {
            write.expect("task").expect("put");
        }

        let winner = store
            .get(&CacheKey::from_raw("k3"))
            .await
            .expect("get")
            .expect("present")
            .namespace;
        store.put(entry("k3", "late", 99)).await.expect("put");
        let found = store
            .get(&CacheKey::from_raw("k3"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(found.namespace, winner);
        assert_eq!(found.last_accessed, 99);
    }

    #[tokio::test]
    async fn scan_reports_corrupt_files_and_keeps_going() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::open(dir.path()).await.expect("open");
        store.put(entry("good1", "ns", 1)).await.expect("put");
        store.put(entry("good2", "ns", 1)).await.expect("put");
        std::fs::write(dir.path().join(ENTRIES_DIR).join("bad.json"), "{not json")
            .expect("write corrupt file");
        std::fs::write(dir.path().join(ENTRIES_DIR).join("notes.txt"), "ignored")
            .expect("write stray file");

        let items: Vec<_> = store.iterate().collect().await;
        let ok = items.iter().filter(|item| item.is_ok()).count();
        let corrupt = items
            .iter()
            .filter(|item| matches!(item, Err(StoreError::Corrupt { .. })))
            .count();
        assert_eq!(ok, 2);
        assert_eq!(corrupt, 1);
    }

    #[tokio::test]
    async fn rejects_ids_that_escape_the_directory() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::open(dir.path()).await.expect("open");
        let err = store
            .get(&CacheKey::from_raw("../etc/passwd"))
            .await
            .expect_err("invalid id");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::open(dir.path()).await.expect("open");
        store.put(entry("gone", "ns", 1)).await.expect("put");
        store.delete(&CacheKey::from_raw("gone")).await.expect("delete");
        store
            .delete(&CacheKey::from_raw("gone"))
            .await
            .expect("second delete");
        assert!(
            store
                .get(&CacheKey::from_raw("gone"))
                .await
                .expect("get")
                .is_none()
        );
    }
}
