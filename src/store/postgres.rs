use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::info;

use crate::memo::{CacheEntry, CacheKey};

use super::{EntryStore, EntryStream, STORE_VERSION, StoreError};

const VERSION_KEY: &str = "entries_version";

const CREATE_META_SQL: &str = "CREATE TABLE IF NOT EXISTS memo_store_meta (\
    key TEXT PRIMARY KEY, \
    value TEXT NOT NULL)";

const CREATE_ENTRIES_SQL: &str = "CREATE TABLE IF NOT EXISTS memo_cache_entries (\
    id TEXT PRIMARY KEY, \
    namespace TEXT NOT NULL, \
    fields JSONB NOT NULL, \
    last_accessed BIGINT NOT NULL)";

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: String,
    namespace: String,
    fields: Json<JsonMap<String, JsonValue>>,
    last_accessed: i64,
}

impl From<EntryRow> for CacheEntry {
    fn from(row: EntryRow) -> Self {
        Self {
            id: CacheKey::from_raw(row.id),
            namespace: row.namespace,
            fields: row.fields.0,
            last_accessed: row.last_accessed,
        }
    }
}

/// Entry store backed by a single Postgres table shared by all namespaces.
#[derive(Clone)]
pub struct PostgresEntryStore {
    pool: PgPool,
}

impl PostgresEntryStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|err| StoreError::unavailable(format!("failed to connect: {err}")))
    }

    /// Prepare the schema, recreating the entries table on a version change.
    pub async fn open(pool: PgPool) -> Result<Self, StoreError> {
        let mut tx = pool.begin().await?;

        sqlx::query(CREATE_META_SQL).execute(&mut *tx).await?;
        let found: Option<String> =
            sqlx::query_scalar("SELECT value FROM memo_store_meta WHERE key = $1")
                .bind(VERSION_KEY)
                .fetch_optional(&mut *tx)
                .await?;

        if found.as_deref() != Some(STORE_VERSION) {
            sqlx::query("DROP TABLE IF EXISTS memo_cache_entries")
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO memo_store_meta (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(VERSION_KEY)
            .bind(STORE_VERSION)
            .execute(&mut *tx)
            .await?;
            info!(
                op = "store::postgres::open",
                found_version = found.as_deref().unwrap_or("none"),
                version = STORE_VERSION,
                "Recreated Postgres cache store"
            );
        }

        sqlx::query(CREATE_ENTRIES_SQL).execute(&mut *tx).await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS memo_cache_entries_namespace_idx \
             ON memo_cache_entries (namespace)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EntryStore for PostgresEntryStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, id: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(
            "SELECT id, namespace, fields, last_accessed FROM memo_cache_entries WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheEntry::from))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO memo_cache_entries (id, namespace, fields, last_accessed) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET \
                fields = EXCLUDED.fields, \
                last_accessed = EXCLUDED.last_accessed",
        )
        .bind(entry.id.as_str())
        .bind(&entry.namespace)
        .bind(Json(&entry.fields))
        .bind(entry.last_accessed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn iterate(&self) -> EntryStream<'_> {
        sqlx::query_as::<_, EntryRow>(
            "SELECT id, namespace, fields, last_accessed FROM memo_cache_entries",
        )
        .fetch(&self.pool)
        .map_ok(CacheEntry::from)
        .map_err(StoreError::from)
        .boxed()
    }

    async fn delete(&self, id: &CacheKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM memo_cache_entries WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
