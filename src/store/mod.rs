//! Persistent entry stores.
//!
//! The memoization core talks to durable storage only through [`EntryStore`]:
//! keyed get/put/delete plus a lazy full scan. Three adapters are provided:
//!
//! - [`MemoryEntryStore`]: process-local, for tests and ephemeral runs
//! - [`FsEntryStore`]: one JSON document per entry on local disk
//! - [`PostgresEntryStore`]: a single table in Postgres
//!
//! Each adapter carries a storage version tag; opening a store whose tag does
//! not match [`STORE_VERSION`] recreates it empty.

mod fs;
mod lock;
mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreSettings};
use crate::memo::{CacheEntry, CacheKey};

pub use fs::FsEntryStore;
pub use memory::MemoryEntryStore;
pub use postgres::PostgresEntryStore;

/// Version tag of the persisted entry layout.
pub const STORE_VERSION: &str = "1";

pub type EntryStream<'a> = BoxStream<'a, Result<CacheEntry, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("corrupt entry `{id}`: {message}")]
    Corrupt { id: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn corrupt(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Keyed, durable storage for cache entries.
///
/// `put` is an upsert keyed by `id`. When an entry already exists only its
/// `fields` and `last_accessed` are replaced; the stored namespace is kept.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    async fn get(&self, id: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

    /// Lazy scan over every entry, in no particular order.
    fn iterate(&self) -> EntryStream<'_>;

    /// Remove an entry; removing a missing id succeeds.
    async fn delete(&self, id: &CacheKey) -> Result<(), StoreError>;
}

/// Open the store described by `settings`.
pub async fn open(settings: &StoreSettings) -> Result<Arc<dyn EntryStore>, StoreError> {
    let store: Arc<dyn EntryStore> = match &settings.backend {
        StoreBackend::Memory => Arc::new(MemoryEntryStore::new()),
        StoreBackend::Filesystem { path } => Arc::new(FsEntryStore::open(path).await?),
        StoreBackend::Postgres {
            url,
            max_connections,
        } => {
            let pool = PostgresEntryStore::connect(url, max_connections.get()).await?;
            Arc::new(PostgresEntryStore::open(pool).await?)
        }
    };

    info!(
        op = "store::open",
        backend = store.backend(),
        version = STORE_VERSION,
        "Opened cache entry store"
    );
    Ok(store)
}
