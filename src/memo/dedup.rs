//! Single-flight map of shared computations.
//!
//! Each key owns at most one slot. The first caller spawns the computation on
//! the tokio runtime; every later caller joins the same shared handle, whether
//! it is still running or already settled. Settled successes stay in the map
//! for the lifetime of the map; failures are evicted so the next call retries.

use std::any::{Any, TypeId};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{debug, warn};

use super::keys::CacheKey;

pub(crate) const METRIC_MEMO_HIT_TOTAL: &str = "soffio_memo_hit_total";

type Erased = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
enum Settled {
    Ready(Erased),
    Failed(Erased),
    Aborted(Arc<str>),
}

type SharedTask = Shared<BoxFuture<'static, Settled>>;

#[derive(Clone)]
struct Slot {
    generation: u64,
    output: TypeId,
    task: SharedTask,
}

#[derive(Default)]
struct DedupInner {
    slots: DashMap<CacheKey, Slot>,
    next_generation: AtomicU64,
}

static GLOBAL: Lazy<DedupMap> = Lazy::new(DedupMap::new);

/// Process-local map from cache key to a shared computation.
///
/// Clones share the same slots, so one instance can be handed to several
/// independently configured wrappers.
#[derive(Clone, Default)]
pub struct DedupMap {
    inner: Arc<DedupInner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("shared computation aborted: {0}")]
    Aborted(String),
}

impl DedupMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default map.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Whether both handles point at the same slots.
    pub fn shares_state_with(&self, other: &DedupMap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Join the computation registered for `key`, or register `factory()`.
    ///
    /// `factory` is called at most once and only when no slot exists. The
    /// future it returns is spawned, so it runs to completion even if every
    /// caller stops waiting. A slot registered for a different result type
    /// (two call sites colliding on one key) is left alone and the factory
    /// runs unshared.
    pub async fn get_or_create<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        factory: F,
    ) -> Result<T, DedupError<E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let output = TypeId::of::<Result<T, E>>();
        let joined = match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(occupied) if occupied.get().output == output => {
                counter!(METRIC_MEMO_HIT_TOTAL, "tier" => "memory").increment(1);
                debug!(
                    op = "dedup::get_or_create",
                    key = %key,
                    result = "joined",
                    "Joined shared computation"
                );
                Some(occupied.get().clone())
            }
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let slot = Slot {
                    generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
                    output,
                    task: spawn_shared(factory()),
                };
                vacant.insert(slot.clone());
                return self.settle(key, slot).await;
            }
        };

        match joined {
            Some(slot) => self.settle(key, slot).await,
            None => {
                warn!(
                    op = "dedup::get_or_create",
                    key = %key,
                    result = "type_conflict",
                    "Key is shared by a computation of another type; running unshared"
                );
                downcast(spawn_shared(factory()).await)
            }
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.slots.contains_key(key)
    }

    /// Drop the slot for `key`; in-flight work keeps running but is no longer shared.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.slots.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    async fn settle<T, E>(&self, key: &CacheKey, slot: Slot) -> Result<T, DedupError<E>>
    where
        T: Clone + 'static,
        E: Clone + 'static,
    {
        let settled = slot.task.await;
        if !matches!(settled, Settled::Ready(_)) {
            // A newer slot may already have replaced the failed one.
            self.inner
                .slots
                .remove_if(key, |_, current| current.generation == slot.generation);
        }
        downcast(settled)
    }
}

fn downcast<T, E>(settled: Settled) -> Result<T, DedupError<E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    match settled {
        Settled::Ready(value) => value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| DedupError::Aborted("unexpected shared result type".to_string())),
        Settled::Failed(error) => match error.downcast_ref::<E>() {
            Some(error) => Err(DedupError::Failed(error.clone())),
            None => Err(DedupError::Aborted("unexpected shared error type".to_string())),
        },
        Settled::Aborted(reason) => Err(DedupError::Aborted(reason.to_string())),
    }
}

fn spawn_shared<T, E, Fut>(future: Fut) -> SharedTask
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let handle = tokio::spawn(future);
    async move {
        match handle.await {
            Ok(Ok(value)) => Settled::Ready(Arc::new(value)),
            Ok(Err(error)) => Settled::Failed(Arc::new(error)),
            Err(join_error) => Settled::Aborted(Arc::from(join_error.to_string())),
        }
    }
    .boxed()
    .shared()
}
