//! Counters for transaction outcomes, chain-head CAS behavior and GC.
//!
//! Every [`TransactionManager`](crate::TransactionManager) owns one
//! [`MvccMetrics`] instance. Counters are relaxed atomics; take a
//! [`MvccMetricsSnapshot`] for a consistent-enough point-in-time view.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use ssidb_error::{AbortReason, SsiAbortReason};

/// Histogram buckets for CAS attempts per chain-head install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CasRetriesHistogram {
    pub le_1: u64,
    pub le_2: u64,
    pub le_4: u64,
    pub gt_4: u64,
}

/// Point-in-time copy of [`MvccMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MvccMetricsSnapshot {
    pub txns_begun: u64,
    pub commits: u64,
    pub read_only_commits: u64,
    pub aborts_user: u64,
    pub aborts_write_conflict: u64,
    pub aborts_pivot: u64,
    pub aborts_committed_pivot: u64,
    pub aborts_durability: u64,
    pub aborts_internal: u64,
    pub rw_edges_marked: u64,
    pub cas_installs: u64,
    pub cas_retries: CasRetriesHistogram,
    pub versions_retired: u64,
    pub versions_freed: u64,
    pub gc_passes: u64,
    pub index_remove_failures: u64,
    pub txn_records_pruned: u64,
}

impl MvccMetricsSnapshot {
    /// Sum of all abort counters.
    #[must_use]
    pub fn aborts_total(&self) -> u64 {
        self.aborts_user
            + self.aborts_write_conflict
            + self.aborts_pivot
            + self.aborts_committed_pivot
            + self.aborts_durability
            + self.aborts_internal
    }

    /// Fraction of finished transactions that aborted for a reason other
    /// than a caller request.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn conflict_rate(&self) -> f64 {
        let forced = self.aborts_total() - self.aborts_user;
        let finished = self.commits + self.read_only_commits + self.aborts_total();
        if finished == 0 {
            0.0
        } else {
            forced as f64 / finished as f64
        }
    }
}

/// Live counters.
#[derive(Debug, Default)]
pub struct MvccMetrics {
    txns_begun: AtomicU64,
    commits: AtomicU64,
    read_only_commits: AtomicU64,
    aborts_user: AtomicU64,
    aborts_write_conflict: AtomicU64,
    aborts_pivot: AtomicU64,
    aborts_committed_pivot: AtomicU64,
    aborts_durability: AtomicU64,
    aborts_internal: AtomicU64,
    rw_edges_marked: AtomicU64,
    cas_installs: AtomicU64,
    cas_le_1: AtomicU64,
    cas_le_2: AtomicU64,
    cas_le_4: AtomicU64,
    cas_gt_4: AtomicU64,
    versions_retired: AtomicU64,
    versions_freed: AtomicU64,
    gc_passes: AtomicU64,
    index_remove_failures: AtomicU64,
    txn_records_pruned: AtomicU64,
}

impl MvccMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_begin(&self) {
        self.txns_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, read_only: bool) {
        if read_only {
            self.read_only_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_abort(&self, reason: AbortReason) {
        let counter = match reason {
            AbortReason::User => &self.aborts_user,
            AbortReason::WriteConflict => &self.aborts_write_conflict,
            AbortReason::Serialization(SsiAbortReason::Pivot) => &self.aborts_pivot,
            AbortReason::Serialization(SsiAbortReason::CommittedPivot) => {
                &self.aborts_committed_pivot
            }
            AbortReason::Durability => &self.aborts_durability,
            AbortReason::Internal => &self.aborts_internal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rw_edge(&self) {
        self.rw_edges_marked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one chain-head install that took `attempts` CAS attempts.
    pub fn record_cas_attempt(&self, attempts: u32) {
        self.cas_installs.fetch_add(1, Ordering::Relaxed);
        let bucket = match attempts {
            0 | 1 => &self.cas_le_1,
            2 => &self.cas_le_2,
            3 | 4 => &self.cas_le_4,
            _ => &self.cas_gt_4,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retired(&self, count: u64) {
        self.versions_retired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_gc_pass(&self, freed: u64, index_failures: u64) {
        self.gc_passes.fetch_add(1, Ordering::Relaxed);
        self.versions_freed.fetch_add(freed, Ordering::Relaxed);
        self.index_remove_failures
            .fetch_add(index_failures, Ordering::Relaxed);
    }

    /// Finished transaction records dropped, in or out of a GC pass.
    pub fn record_txns_pruned(&self, count: u64) {
        self.txn_records_pruned.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MvccMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MvccMetricsSnapshot {
            txns_begun: load(&self.txns_begun),
            commits: load(&self.commits),
            read_only_commits: load(&self.read_only_commits),
            aborts_user: load(&self.aborts_user),
            aborts_write_conflict: load(&self.aborts_write_conflict),
            aborts_pivot: load(&self.aborts_pivot),
            aborts_committed_pivot: load(&self.aborts_committed_pivot),
            aborts_durability: load(&self.aborts_durability),
            aborts_internal: load(&self.aborts_internal),
            rw_edges_marked: load(&self.rw_edges_marked),
            cas_installs: load(&self.cas_installs),
            cas_retries: CasRetriesHistogram {
                le_1: load(&self.cas_le_1),
                le_2: load(&self.cas_le_2),
                le_4: load(&self.cas_le_4),
                gt_4: load(&self.cas_gt_4),
            },
            versions_retired: load(&self.versions_retired),
            versions_freed: load(&self.versions_freed),
            gc_passes: load(&self.gc_passes),
            index_remove_failures: load(&self.index_remove_failures),
            txn_records_pruned: load(&self.txn_records_pruned),
        }
    }
}
