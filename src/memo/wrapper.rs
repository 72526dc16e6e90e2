//! Memoizing wrapper around an async generator.
//!
//! A [`Memoized`] function fingerprints its arguments, then resolves the
//! result through the dedup map, the persistent store, or both, depending on
//! its [`StorageMode`]. Store failures never reach the caller: they are logged,
//! counted and treated as a miss.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{EntryStore, StoreError};

use super::clock::{Clock, SystemClock};
use super::dedup::{DedupError, DedupMap, METRIC_MEMO_HIT_TOTAL};
use super::entry::CacheEntry;
use super::keys::{ArgumentError, CacheArgs, CacheKey, fingerprint};
use super::race::{Branch, BothFailed, first_success};
use super::serialize::ExcludedKeys;

const METRIC_MEMO_MISS_TOTAL: &str = "soffio_memo_miss_total";
const METRIC_MEMO_COMPUTE_TOTAL: &str = "soffio_memo_compute_total";
const METRIC_MEMO_COMPUTE_MS: &str = "soffio_memo_compute_ms";
pub(crate) const METRIC_MEMO_STORE_ERROR_TOTAL: &str = "soffio_memo_store_error_total";

/// Which tiers a wrapper consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Dedup map only; nothing survives the process.
    Memory,
    /// Persistent store only; concurrent calls are not coalesced.
    Persistent,
    /// Persistent resolution coalesced through the dedup map.
    #[default]
    Both,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Persistent => "persistent",
            Self::Both => "both",
        }
    }
}

/// Per-wrapper configuration.
#[derive(Clone)]
pub struct MemoOptions {
    /// Map members ignored when fingerprinting arguments.
    pub excluded_keys: ExcludedKeys,
    pub storage_mode: StorageMode,
    pub shared_map: DedupMap,
    /// Race the store read against the generator instead of reading first.
    /// Has no effect in [`StorageMode::Memory`].
    pub resolve_in_parallel: bool,
}

impl Default for MemoOptions {
    fn default() -> Self {
        Self {
            excluded_keys: ExcludedKeys::new(),
            storage_mode: StorageMode::default(),
            shared_map: DedupMap::global(),
            resolve_in_parallel: true,
        }
    }
}

impl MemoOptions {
    pub fn exclude<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            self.excluded_keys.insert(key);
        }
        self
    }

    pub fn storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn shared_map(mut self, map: DedupMap) -> Self {
        self.shared_map = map;
        self
    }

    pub fn resolve_in_parallel(mut self, parallel: bool) -> Self {
        self.resolve_in_parallel = parallel;
        self
    }
}

impl From<&crate::config::MemoSettings> for MemoOptions {
    fn from(settings: &crate::config::MemoSettings) -> Self {
        Self::default()
            .storage_mode(settings.storage_mode)
            .resolve_in_parallel(settings.resolve_in_parallel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError<E> {
    /// The generator failed; its error is passed through unchanged.
    #[error("{0}")]
    Generator(E),
    #[error("cache arguments could not be fingerprinted: {0}")]
    Arguments(String),
    /// The generator task panicked or was cancelled by the runtime.
    #[error("memoized computation aborted: {0}")]
    Aborted(String),
}

impl<E> CallError<E> {
    pub fn generator(&self) -> Option<&E> {
        match self {
            Self::Generator(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_generator(self) -> Option<E> {
        match self {
            Self::Generator(err) => Some(err),
            _ => None,
        }
    }
}

impl<E> From<ArgumentError> for CallError<E> {
    fn from(err: ArgumentError) -> Self {
        Self::Arguments(err.to_string())
    }
}

impl<E> From<DedupError<CallError<E>>> for CallError<E> {
    fn from(err: DedupError<CallError<E>>) -> Self {
        match err {
            DedupError::Failed(inner) => inner,
            DedupError::Aborted(reason) => Self::Aborted(reason),
        }
    }
}

/// Entry point for building memoized functions over one store.
#[derive(Clone)]
pub struct MemoCache {
    pub(crate) store: Arc<dyn EntryStore>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl MemoCache {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn now_minutes(&self) -> i64 {
        self.clock.now_minutes()
    }

    /// Wrap `generator` so its results are cached under `namespace`.
    pub fn wrap<F, A, Fut, T, E>(
        &self,
        generator: F,
        namespace: impl Into<String>,
        options: MemoOptions,
    ) -> Memoized<F, A, T, E>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Memoized {
            inner: Arc::new(MemoInner {
                generator,
                namespace: namespace.into(),
                options,
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                _marker: PhantomData,
            }),
        }
    }
}

struct MemoInner<F, A, T, E> {
    generator: F,
    namespace: String,
    options: MemoOptions,
    store: Arc<dyn EntryStore>,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn(A) -> Result<T, E>>,
}

/// A generator with memoized results. Cheap to clone.
pub struct Memoized<F, A, T, E> {
    inner: Arc<MemoInner<F, A, T, E>>,
}

impl<F, A, T, E> Clone for Memoized<F, A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Store read that produced no value.
struct ReadMiss;

impl<F, A, Fut, T, E> Memoized<F, A, T, E>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    A: CacheArgs + Send + 'static,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn options(&self) -> &MemoOptions {
        &self.inner.options
    }

    /// Cache key `args` resolve to.
    pub fn key_for(&self, args: &A) -> Result<CacheKey, ArgumentError> {
        fingerprint(&self.inner.options.excluded_keys, args)
    }

    pub async fn call(&self, args: A) -> Result<T, CallError<E>> {
        let key = self.key_for(&args)?;
        let inner = Arc::clone(&self.inner);
        let mode = inner.options.storage_mode;

        match mode {
            StorageMode::Memory => {
                let map = inner.options.shared_map.clone();
                Ok(map
                    .get_or_create(&key, move || async move { inner.compute(args).await })
                    .await?)
            }
            StorageMode::Persistent => inner.resolve(key, args).await,
            StorageMode::Both => {
                let map = inner.options.shared_map.clone();
                let slot_key = key.clone();
                Ok(map
                    .get_or_create(&slot_key, move || inner.resolve(key, args))
                    .await?)
            }
        }
    }
}

impl<F, A, Fut, T, E> MemoInner<F, A, T, E>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    A: Send + 'static,
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Send + 'static,
{
    async fn resolve(self: Arc<Self>, key: CacheKey, args: A) -> Result<T, CallError<E>> {
        if !self.options.resolve_in_parallel {
            if let Some(value) = self.read(&key).await {
                return Ok(value);
            }
            return self.compute_and_persist(&key, args).await;
        }

        let reader = {
            let inner = Arc::clone(&self);
            let key = key.clone();
            tokio::spawn(async move { inner.read(&key).await.ok_or(ReadMiss) })
        };
        let computer = {
            let inner = Arc::clone(&self);
            let key = key.clone();
            tokio::spawn(async move { inner.compute_and_persist(&key, args).await })
        };

        match first_success(reader, computer).await {
            Ok(value) => Ok(value),
            Err(BothFailed { left, right }) => {
                if let Branch::Aborted(reason) = left {
                    warn!(
                        op = "memo::resolve",
                        namespace = %self.namespace,
                        key = %key,
                        result = "read_aborted",
                        reason = %reason,
                        "Store read task aborted"
                    );
                }
                Err(match right {
                    Branch::Rejected(err) => err,
                    Branch::Aborted(reason) => CallError::Aborted(reason),
                })
            }
        }
    }

    async fn compute(&self, args: A) -> Result<T, CallError<E>> {
        let started_at = Instant::now();
        counter!(METRIC_MEMO_COMPUTE_TOTAL).increment(1);
        let outcome = (self.generator)(args).await;
        histogram!(METRIC_MEMO_COMPUTE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        if outcome.is_err() {
            debug!(
                op = "memo::compute",
                namespace = %self.namespace,
                result = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Generator failed"
            );
        }
        outcome.map_err(CallError::Generator)
    }

    async fn compute_and_persist(&self, key: &CacheKey, args: A) -> Result<T, CallError<E>> {
        let value = self.compute(args).await?;
        self.persist(key, &value).await;
        Ok(value)
    }

    /// Look `key` up in the store, touching it on a hit.
    async fn read(&self, key: &CacheKey) -> Option<T> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                counter!(METRIC_MEMO_MISS_TOTAL).increment(1);
                return None;
            }
            Err(err) => {
                self.store_failed("get", key, &err);
                return None;
            }
        };

        let value = match entry.restore::<T>() {
            Ok(value) => value,
            Err(err) => {
                self.store_failed("decode", key, &StoreError::corrupt(key.as_str(), err.to_string()));
                return None;
            }
        };

        counter!(METRIC_MEMO_HIT_TOTAL, "tier" => "persistent").increment(1);
        if let Err(err) = self.store.put(entry.touched(self.clock.now_minutes())).await {
            self.store_failed("touch", key, &err);
        }
        debug!(
            op = "memo::read",
            namespace = %self.namespace,
            key = %key,
            result = "hit",
            "Served result from store"
        );
        Some(value)
    }

    async fn persist(&self, key: &CacheKey, value: &T) {
        let entry = match CacheEntry::from_result(
            key.clone(),
            self.namespace.clone(),
            value,
            self.clock.now_minutes(),
        ) {
            Ok(entry) => entry,
            Err(err) => {
                self.store_failed("encode", key, &StoreError::from(err));
                return;
            }
        };

        if let Err(err) = self.store.put(entry).await {
            self.store_failed("put", key, &err);
        }
    }

    fn store_failed(&self, op: &'static str, key: &CacheKey, err: &StoreError) {
        counter!(METRIC_MEMO_STORE_ERROR_TOTAL, "op" => op).increment(1);
        warn!(
            op = "memo::store",
            store_op = op,
            backend = self.store.backend(),
            namespace = %self.namespace,
            key = %key,
            error = %err,
            "Cache store operation failed; continuing without it"
        );
    }
}
