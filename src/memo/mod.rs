//! Memoization of expensive, deterministic async operations.
//!
//! Arguments are reduced to a [`CacheKey`] by [`fingerprint`]. A
//! [`Memoized`] function then resolves the key against two tiers:
//!
//! - a process-local [`DedupMap`] that coalesces concurrent calls for the same
//!   key into one computation;
//! - a persistent [`EntryStore`](crate::store::EntryStore) holding
//!   [`CacheEntry`] records grouped by namespace.
//!
//! Stale entries are evicted per namespace with [`MemoCache::cleanup`].

mod cleanup;
mod clock;
mod dedup;
mod entry;
mod keys;
mod race;
mod serialize;
mod value;
mod wrapper;

pub use cleanup::{CleanupPolicy, CleanupReport, spawn_periodic_cleanup};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::{DedupError, DedupMap};
pub use entry::{CacheEntry, SCALAR_FIELD};
pub use keys::{ArgumentError, CacheArgs, CacheKey, fingerprint, fingerprint_values};
pub use serialize::{ExcludedKeys, stable_serialize};
pub use value::{Opaque, Value};
pub use wrapper::{CallError, MemoCache, MemoOptions, Memoized, StorageMode};
