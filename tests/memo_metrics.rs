use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics_util::debugging::DebuggingRecorder;
use soffio_memo::memo::{
    CacheEntry, CacheKey, DedupMap, ManualClock, MemoCache, MemoOptions, StorageMode,
};
use soffio_memo::store::{EntryStore, EntryStream, MemoryEntryStore, StoreError};

struct BrokenStore;

#[async_trait]
impl EntryStore for BrokenStore {
    fn backend(&self) -> &'static str {
        "broken"
    }

    async fn get(&self, _id: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn put(&self, _entry: CacheEntry) -> Result<(), StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    fn iterate(&self) -> EntryStream<'_> {
        Box::pin(futures::stream::empty())
    }

    async fn delete(&self, _id: &CacheKey) -> Result<(), StoreError> {
        Err(StoreError::unavailable("offline"))
    }
}

#[tokio::test]
async fn memo_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let store = Arc::new(MemoryEntryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let cache = MemoCache::new(store.clone()).with_clock(clock.clone());
    let map = DedupMap::new();

    // Miss, compute, then a memory hit on the shared slot.
    let double = cache.wrap(
        |(n,): (u32,)| async move { Ok::<_, String>(n * 2) },
        "numbers",
        MemoOptions::default()
            .shared_map(map.clone())
            .resolve_in_parallel(false),
    );
    assert_eq!(double.call((2,)).await, Ok(4));
    assert_eq!(double.call((2,)).await, Ok(4));

    // Persistent hit through a wrapper with its own map.
    let fresh = cache.wrap(
        |(n,): (u32,)| async move { Ok::<_, String>(n * 2) },
        "numbers",
        MemoOptions::default()
            .shared_map(DedupMap::new())
            .resolve_in_parallel(false),
    );
    assert_eq!(fresh.call((2,)).await, Ok(4));

    // Absorbed store failures.
    let broken = MemoCache::new(Arc::new(BrokenStore)).wrap(
        |(n,): (u32,)| async move { Ok::<_, String>(n + 1) },
        "numbers",
        MemoOptions::default()
            .shared_map(DedupMap::new())
            .storage_mode(StorageMode::Persistent),
    );
    assert_eq!(broken.call((1,)).await, Ok(2));

    // Cleanup removes the aged entry.
    clock.set(1_000);
    let report = cache.cleanup(10, "numbers").await;
    assert_eq!(report.deleted, 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "soffio_memo_hit_total",
        "soffio_memo_miss_total",
        "soffio_memo_compute_total",
        "soffio_memo_compute_ms",
        "soffio_memo_store_error_total",
        "soffio_memo_cleanup_deleted_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
