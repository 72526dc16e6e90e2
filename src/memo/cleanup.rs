//! Age-based eviction scoped to one namespace.

use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::store::EntryStore;

use super::clock::Clock;
use super::wrapper::{METRIC_MEMO_STORE_ERROR_TOTAL, MemoCache};

const METRIC_MEMO_CLEANUP_DELETED_TOTAL: &str = "soffio_memo_cleanup_deleted_total";

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Entries read from the store, any namespace.
    pub scanned: usize,
    /// Entries in the requested namespace.
    pub matched: usize,
    pub deleted: usize,
    /// Unreadable entries and failed deletions.
    pub errors: usize,
}

/// Namespace plus the age past which its entries are evicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub namespace: String,
    pub max_age_minutes: u64,
}

impl MemoCache {
    /// Delete entries of `namespace` last accessed more than
    /// `max_age_minutes` ago. Store failures are logged and counted in the
    /// report, never returned.
    pub async fn cleanup(&self, max_age_minutes: u64, namespace: &str) -> CleanupReport {
        cleanup_namespace(
            self.store.as_ref(),
            self.clock.as_ref(),
            max_age_minutes,
            namespace,
        )
        .await
    }

    /// Run every policy once, in order.
    pub async fn sweep(&self, policies: &[CleanupPolicy]) -> Vec<(String, CleanupReport)> {
        let mut reports = Vec::with_capacity(policies.len());
        for policy in policies {
            let report = self
                .cleanup(policy.max_age_minutes, &policy.namespace)
                .await;
            reports.push((policy.namespace.clone(), report));
        }
        reports
    }
}

async fn cleanup_namespace(
    store: &dyn EntryStore,
    clock: &dyn Clock,
    max_age_minutes: u64,
    namespace: &str,
) -> CleanupReport {
    let started_at = Instant::now();
    let now = clock.now_minutes();
    let mut report = CleanupReport::default();

    let mut entries = store.iterate();
    while let Some(item) = entries.next().await {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                report.errors += 1;
                counter!(METRIC_MEMO_STORE_ERROR_TOTAL, "op" => "iterate").increment(1);
                warn!(
                    op = "memo::cleanup",
                    namespace,
                    error = %err,
                    "Skipping unreadable cache entry"
                );
                continue;
            }
        };

        report.scanned += 1;
        if entry.namespace != namespace {
            continue;
        }
        report.matched += 1;
        if !entry.is_older_than(max_age_minutes, now) {
            continue;
        }

        match store.delete(&entry.id).await {
            Ok(()) => report.deleted += 1,
            Err(err) => {
                report.errors += 1;
                counter!(METRIC_MEMO_STORE_ERROR_TOTAL, "op" => "delete").increment(1);
                warn!(
                    op = "memo::cleanup",
                    namespace,
                    key = %entry.id,
                    error = %err,
                    "Failed to delete stale cache entry"
                );
            }
        }
    }

    counter!(METRIC_MEMO_CLEANUP_DELETED_TOTAL).increment(report.deleted as u64);
    info!(
        op = "memo::cleanup",
        backend = store.backend(),
        namespace,
        max_age_minutes,
        scanned = report.scanned,
        matched = report.matched,
        deleted = report.deleted,
        errors = report.errors,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Namespace cleanup finished"
    );
    report
}

/// Run `policies` against `cache` every `interval`, starting immediately.
pub fn spawn_periodic_cleanup(
    cache: MemoCache,
    policies: Vec<CleanupPolicy>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            cache.sweep(&policies).await;
        }
    })
}
