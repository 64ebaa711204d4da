//! Watermark-driven garbage collection of superseded and aborted versions.
//!
//! This module implements:
//! - [`RetiredQueue`]: versions waiting to become reclaimable, tagged with
//!   the timestamp at which they stopped being current.
//! - [`GcScheduler`]: decides when a cooperative pass should run.
//! - [`GarbageCollector::collect`]: one budgeted pass.
//! - [`GcRunner`]: background thread running passes on an interval.
//!
//! A retired version is reclaimable once its end timestamp is at or below
//! the watermark (the oldest active snapshot). Versions created by aborted
//! transactions are reclaimable at once. The index is told before a slot is
//! freed; if it refuses, the version stays allocated and queued.
//!
//! A committed delete leaves a tombstone at the head of its chain. Once the
//! watermark passes it and the older versions are gone, the pass drops the
//! tombstone and the row's head entry together.
//!
//! Finished transaction records are pruned here too, both during a pass and
//! every few finishes from the lifecycle, so pruning does not depend on the
//! GC mode.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use ssidb_types::{RowId, Timestamp, TxnId};

use crate::config::{GcConfig, GcMode};
use crate::core_types::{VersionIdx, VersionState};
use crate::index::IndexMaintainer;
use crate::invariants::{CommitClock, TombstoneCollapse, VersionStore};
use crate::metrics::MvccMetrics;
use crate::registry::TxnRegistry;

// ---------------------------------------------------------------------------
// RetiredQueue
// ---------------------------------------------------------------------------

/// How a version stopped being current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireKind {
    /// Replaced by a newer committed version.
    Superseded,
    /// Created by a transaction that aborted; never visible to anyone else.
    Aborted,
    /// Committed tombstone still heading its chain. Reclaiming it removes
    /// the row.
    Deleted,
}

/// A version that is no longer current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredVersion {
    pub row: RowId,
    pub version: VersionIdx,
    /// Commit timestamp of the superseding or deleting transaction, or the
    /// stable timestamp at abort.
    pub end_ts: Timestamp,
    pub retired_by: TxnId,
    pub kind: RetireKind,
}

impl RetiredVersion {
    #[must_use]
    pub fn is_reclaimable(&self, watermark: Timestamp) -> bool {
        self.kind == RetireKind::Aborted || self.end_ts <= watermark
    }
}

/// FIFO of retired versions.
#[derive(Debug, Default)]
pub struct RetiredQueue {
    queue: VecDeque<RetiredVersion>,
}

impl RetiredQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: RetiredVersion) {
        self.queue.push_back(entry);
    }

    /// Take up to `budget` entries from the front.
    pub fn drain_up_to(&mut self, budget: usize) -> Vec<RetiredVersion> {
        let n = budget.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Put entries that could not be reclaimed back at the tail.
    pub fn requeue(&mut self, entries: impl IntoIterator<Item = RetiredVersion>) {
        self.queue.extend(entries);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// GcScheduler
// ---------------------------------------------------------------------------

/// Decides when a cooperative pass is due: the queue reached its threshold,
/// or there is work and `interval` has elapsed since the last pass.
#[derive(Debug, Clone)]
pub struct GcScheduler {
    interval: Duration,
    queue_threshold: usize,
    last_pass: Option<Instant>,
}

impl GcScheduler {
    #[must_use]
    pub fn new(interval: Duration, queue_threshold: usize) -> Self {
        Self {
            interval,
            queue_threshold: queue_threshold.max(1),
            last_pass: None,
        }
    }

    #[must_use]
    pub fn should_collect(&self, queue_len: usize, now: Instant) -> bool {
        if queue_len >= self.queue_threshold {
            return true;
        }
        queue_len > 0
            && self
                .last_pass
                .is_some_and(|last| now.duration_since(last) >= self.interval)
    }

    pub fn record_pass(&mut self, now: Instant) {
        self.last_pass = Some(now);
    }
}

// ---------------------------------------------------------------------------
// GarbageCollector
// ---------------------------------------------------------------------------

/// Result of one GC pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcPassResult {
    pub watermark: Timestamp,
    pub examined: usize,
    pub versions_freed: usize,
    /// Entries put back: not yet reclaimable, or refused by the index.
    pub requeued: usize,
    pub index_failures: usize,
    /// Deleted rows whose tombstone and head entry were dropped.
    pub rows_collapsed: usize,
    pub records_pruned: usize,
    /// Entries were left unexamined because of the versions budget.
    pub budget_exhausted: bool,
    pub queue_remaining: usize,
    /// Active transaction holding the watermark back for too long.
    pub stale_snapshot: Option<TxnId>,
}

#[derive(Debug, Default)]
struct RunnerState {
    wake: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct GcSignal {
    state: Mutex<RunnerState>,
    cv: Condvar,
}

/// Owns the retired queue and performs reclamation passes.
pub struct GarbageCollector {
    config: GcConfig,
    store: Arc<VersionStore>,
    registry: Arc<TxnRegistry>,
    clock: Arc<CommitClock>,
    index: Arc<dyn IndexMaintainer>,
    metrics: Arc<MvccMetrics>,
    queue: Mutex<RetiredQueue>,
    scheduler: Mutex<GcScheduler>,
    pass_lock: Mutex<()>,
    signal: Arc<GcSignal>,
}

impl GarbageCollector {
    #[must_use]
    pub fn new(
        config: GcConfig,
        store: Arc<VersionStore>,
        registry: Arc<TxnRegistry>,
        clock: Arc<CommitClock>,
        index: Arc<dyn IndexMaintainer>,
        metrics: Arc<MvccMetrics>,
    ) -> Self {
        let scheduler = GcScheduler::new(config.interval, config.queue_threshold);
        Self {
            config,
            store,
            registry,
            clock,
            index,
            metrics,
            queue: Mutex::new(RetiredQueue::new()),
            scheduler: Mutex::new(scheduler),
            pass_lock: Mutex::new(()),
            signal: Arc::new(GcSignal::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Queue versions that stopped being current.
    ///
    /// With [`GcMode::Off`] nothing is queued. Otherwise a cooperative pass
    /// may run inline, or the background runner is woken once the queue
    /// reaches its threshold.
    pub fn retire(&self, entries: impl IntoIterator<Item = RetiredVersion>) {
        if self.config.mode == GcMode::Off {
            return;
        }
        let mut count = 0_u64;
        let len = {
            let mut queue = self.queue.lock();
            for entry in entries {
                self.store.set_state(entry.version, VersionState::Retired);
                queue.push(entry);
                count += 1;
            }
            queue.len()
        };
        self.metrics.record_retired(count);

        match self.config.mode {
            GcMode::Off => {}
            GcMode::Cooperative => {
                let due = self.scheduler.lock().should_collect(len, Instant::now());
                if due {
                    self.collect();
                }
            }
            GcMode::Periodic => {
                if len >= self.config.queue_threshold {
                    self.wake();
                }
            }
        }
    }

    /// Number of versions waiting in the retired queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Ask the background runner, if any, for an early pass.
    pub fn wake(&self) {
        self.signal.state.lock().wake = true;
        self.signal.cv.notify_one();
    }

    /// Drop records of finished transactions that no running transaction
    /// overlaps, and unregister them from the versions they read.
    pub fn prune_records(&self) -> usize {
        let pruned = self.registry.prune_finished();
        for record in &pruned {
            self.store.unregister_reader(record.txn_id, &record.take_reads());
        }
        if !pruned.is_empty() {
            self.metrics.record_txns_pruned(pruned.len() as u64);
            debug!(records_pruned = pruned.len(), "finished transaction records pruned");
        }
        pruned.len()
    }

    /// Run one budgeted reclamation pass.
    #[allow(clippy::significant_drop_tightening)]
    pub fn collect(&self) -> GcPassResult {
        let _pass = self.pass_lock.lock();
        let started = Instant::now();
        // Readers leave reader sets first so dead rows can collapse.
        let records_pruned = self.prune_records();
        let watermark = self.registry.watermark(self.clock.stable_ts());
        let batch = self
            .queue
            .lock()
            .drain_up_to(self.config.versions_budget.max(1));
        let examined = batch.len();

        let mut keep = Vec::new();
        let mut victims = Vec::new();
        let mut deleted = Vec::new();
        let mut index_failures = 0_usize;
        for entry in batch {
            if !entry.is_reclaimable(watermark) {
                keep.push(entry);
                continue;
            }
            if entry.kind == RetireKind::Deleted {
                // Tombstones are never indexed.
                deleted.push(entry);
                continue;
            }
            self.store.set_state(entry.version, VersionState::Reclaimable);
            match self.index.entry_removed(entry.row, entry.version) {
                Ok(()) => victims.push(entry),
                Err(err) => {
                    warn!(row = %entry.row, version = %entry.version, error = %err, "index refused removal; version kept");
                    index_failures += 1;
                    keep.push(entry);
                }
            }
        }

        let pairs: Vec<(RowId, VersionIdx)> = victims.iter().map(|e| (e.row, e.version)).collect();
        let (mut versions_freed, skipped) = self.store.unlink_and_free(&pairs);
        keep.extend(
            victims
                .into_iter()
                .filter(|e| skipped.contains(&(e.row, e.version))),
        );

        let mut rows_collapsed = 0_usize;
        for entry in deleted {
            match self.store.collapse_tombstone(entry.row, entry.version) {
                TombstoneCollapse::Freed => rows_collapsed += 1,
                TombstoneCollapse::Busy => keep.push(entry),
                TombstoneCollapse::Gone => {}
            }
        }
        versions_freed += rows_collapsed;

        let requeued = keep.len();
        let queue_remaining = {
            let mut queue = self.queue.lock();
            let unexamined = queue.len();
            queue.requeue(keep);
            (unexamined, queue.len())
        };
        let budget_exhausted = queue_remaining.0 > 0;

        let stale_snapshot = self.check_stale_snapshot(watermark);

        self.metrics
            .record_gc_pass(versions_freed as u64, index_failures as u64);
        self.scheduler.lock().record_pass(Instant::now());

        if versions_freed > 0 || records_pruned > 0 {
            info!(
                watermark = watermark.get(),
                examined,
                versions_freed,
                rows_collapsed,
                requeued,
                records_pruned,
                elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                "gc pass complete"
            );
        } else {
            debug!(watermark = watermark.get(), examined, requeued, "gc pass found nothing to free");
        }
        if budget_exhausted {
            warn!(
                queue_remaining = queue_remaining.1,
                budget = self.config.versions_budget,
                "gc pass budget exhausted with versions still queued"
            );
        }

        GcPassResult {
            watermark,
            examined,
            versions_freed,
            requeued,
            index_failures,
            rows_collapsed,
            records_pruned,
            budget_exhausted,
            queue_remaining: queue_remaining.1,
            stale_snapshot,
        }
    }

    fn check_stale_snapshot(&self, watermark: Timestamp) -> Option<TxnId> {
        let oldest = self.registry.oldest_active()?;
        let age = oldest.started_at.elapsed();
        if age < self.config.stale_snapshot_warn {
            return None;
        }
        warn!(
            txn_id = %oldest.txn_id,
            snapshot_ts = oldest.snapshot.ts.get(),
            watermark = watermark.get(),
            age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
            "long-running transaction is holding back garbage collection"
        );
        Some(oldest.txn_id)
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("mode", &self.config.mode)
            .field("queue_len", &self.queue_len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// GcRunner
// ---------------------------------------------------------------------------

/// Background thread running [`GarbageCollector::collect`] every
/// `interval`, or earlier when woken.
pub struct GcRunner {
    signal: Arc<GcSignal>,
    handle: Option<JoinHandle<()>>,
}

impl GcRunner {
    /// Spawn the runner thread.
    ///
    /// # Errors
    ///
    /// Returns the error from spawning the thread.
    pub fn start(gc: Arc<GarbageCollector>) -> io::Result<Self> {
        let signal = Arc::clone(&gc.signal);
        *signal.state.lock() = RunnerState::default();
        let interval = gc.config.interval;
        let thread_signal = Arc::clone(&signal);

        let handle = std::thread::Builder::new()
            .name("ssidb-gc".to_owned())
            .spawn(move || {
                info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "gc runner started");
                loop {
                    {
                        let mut state = thread_signal.state.lock();
                        if !state.shutdown && !state.wake {
                            let _ = thread_signal.cv.wait_for(&mut state, interval);
                        }
                        if state.shutdown {
                            break;
                        }
                        state.wake = false;
                    }
                    gc.collect();
                }
                info!("gc runner stopped");
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to exit and wait for it.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.signal.state.lock().shutdown = true;
        self.signal.cv.notify_all();
        if handle.join().is_err() {
            warn!("gc runner thread panicked");
        }
    }
}

impl Drop for GcRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for GcRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcRunner")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{NoopIndex, RecordingIndex};
    use ssidb_types::{RowData, Snapshot, TableId};

    fn row(key: u64) -> RowId {
        RowId::new(TableId::new(1), key)
    }

    fn txn(n: u64) -> TxnId {
        TxnId::new(n).unwrap()
    }

    struct Fixture {
        store: Arc<VersionStore>,
        registry: Arc<TxnRegistry>,
        clock: Arc<CommitClock>,
        metrics: Arc<MvccMetrics>,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(MvccMetrics::new());
        Fixture {
            store: Arc::new(VersionStore::new(Arc::clone(&metrics))),
            registry: Arc::new(TxnRegistry::new()),
            clock: Arc::new(CommitClock::default()),
            metrics,
        }
    }

    fn gc(f: &Fixture, mode: GcMode, index: Arc<dyn IndexMaintainer>) -> GarbageCollector {
        GarbageCollector::new(
            GcConfig {
                mode,
                ..GcConfig::default()
            },
            Arc::clone(&f.store),
            Arc::clone(&f.registry),
            Arc::clone(&f.clock),
            index,
            Arc::clone(&f.metrics),
        )
    }

    /// Seed `row(1)` and commit one update at ts 2. Returns the superseded
    /// seed version.
    fn superseded_version(f: &Fixture) -> RetiredVersion {
        f.store
            .seed(row(1), RowData::from("a"), txn(1), Timestamp::BOOTSTRAP)
            .unwrap();
        let out = f
            .store
            .install(row(1), Some(RowData::from("b")), txn(2), Snapshot::new(Timestamp::BOOTSTRAP), 4)
            .unwrap();
        let ts = f.clock.reserve_commit_ts().unwrap();
        f.store
            .commit_writes(
                txn(2),
                &[crate::core_types::WriteEntry {
                    row: row(1),
                    created: out.created,
                    superseded: out.superseded,
                }],
                ts,
            )
            .unwrap();
        f.clock.release_commit_ts(ts);
        RetiredVersion {
            row: row(1),
            version: out.superseded.unwrap(),
            end_ts: ts,
            retired_by: txn(2),
            kind: RetireKind::Superseded,
        }
    }

    #[test]
    fn test_retired_queue_budgeted_drain() {
        let mut q = RetiredQueue::new();
        for key in 0..5 {
            q.push(RetiredVersion {
                row: row(key),
                version: VersionIdx::new(0, u32::try_from(key).unwrap(), 0),
                end_ts: Timestamp::new(2),
                retired_by: txn(1),
                kind: RetireKind::Superseded,
            });
        }
        let batch = q.drain_up_to(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].row, row(0));
        assert_eq!(q.len(), 2);
        q.requeue(batch);
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn test_scheduler_threshold_and_interval() {
        let mut s = GcScheduler::new(Duration::from_millis(10), 4);
        let now = Instant::now();
        assert!(!s.should_collect(0, now));
        assert!(!s.should_collect(3, now), "no pass yet, below threshold");
        assert!(s.should_collect(4, now));
        s.record_pass(now);
        assert!(!s.should_collect(1, now));
        assert!(s.should_collect(1, now + Duration::from_millis(10)));
    }

    #[test]
    fn test_version_pinned_by_older_snapshot_is_kept() {
        let f = fixture();
        // Active reader with snapshot 1 pins the seed version.
        f.registry.begin(txn(9), || Timestamp::BOOTSTRAP);
        let retired = superseded_version(&f);
        let gc = gc(&f, GcMode::Cooperative, Arc::new(NoopIndex));
        gc.retire([retired]);

        let result = gc.collect();
        assert_eq!(result.watermark, Timestamp::BOOTSTRAP);
        assert_eq!(result.versions_freed, 0);
        assert_eq!(result.requeued, 1);
        assert!(f.store.is_allocated(retired.version));

        f.registry.deactivate(txn(9));
        let result = gc.collect();
        assert_eq!(result.versions_freed, 1);
        assert!(!f.store.is_allocated(retired.version));
        assert_eq!(f.store.walk_chain(row(1)).len(), 1);
    }

    #[test]
    fn test_prune_records_unregisters_readers() {
        let f = fixture();
        let seed = f
            .store
            .seed(row(1), RowData::from("a"), txn(1), Timestamp::BOOTSTRAP)
            .unwrap();
        let reader = f.registry.begin(txn(9), || Timestamp::BOOTSTRAP);
        let read = f.store.resolve(row(1), reader.snapshot, txn(9), true);
        assert_eq!(read.version, Some(seed));
        reader.stash_reads(&[seed]);
        reader.mark_committed(Timestamp::BOOTSTRAP, false);
        let gc = gc(&f, GcMode::Off, Arc::new(NoopIndex));

        let other = f.registry.begin(txn(10), || Timestamp::BOOTSTRAP);
        f.registry.deactivate(txn(9));
        assert_eq!(gc.prune_records(), 0, "txn 10 began while txn 9 ran");
        assert_eq!(f.store.reader_count(seed), Some(1));

        other.mark_aborted(Timestamp::BOOTSTRAP);
        f.registry.deactivate(txn(10));
        assert_eq!(gc.prune_records(), 2);
        assert_eq!(f.store.reader_count(seed), Some(0));
        assert_eq!(f.metrics.snapshot().txn_records_pruned, 2);
        assert_eq!(gc.collect().records_pruned, 0);
    }

    #[test]
    fn test_index_failure_keeps_version_reclaimable() {
        let f = fixture();
        let retired = superseded_version(&f);
        let index = Arc::new(RecordingIndex::new());
        index.fail_next_removals(1);
        let gc = gc(&f, GcMode::Cooperative, Arc::clone(&index) as Arc<dyn IndexMaintainer>);
        gc.retire([retired]);

        let result = gc.collect();
        assert_eq!(result.index_failures, 1);
        assert_eq!(
            f.store.version_state(retired.version),
            Some(VersionState::Reclaimable)
        );
        assert_eq!(gc.queue_len(), 1);

        let result = gc.collect();
        assert_eq!(result.versions_freed, 1);
        assert!(index.was_removed(retired.version));
        assert_eq!(f.metrics.snapshot().index_remove_failures, 1);
    }

    #[test]
    fn test_off_mode_queues_nothing() {
        let f = fixture();
        let retired = superseded_version(&f);
        let gc = gc(&f, GcMode::Off, Arc::new(NoopIndex));
        gc.retire([retired]);
        assert_eq!(gc.queue_len(), 0);
        assert!(f.store.is_allocated(retired.version));
    }

    #[test]
    fn test_budget_limits_pass() {
        let f = fixture();
        let retired = superseded_version(&f);
        let gc = GarbageCollector::new(
            GcConfig {
                mode: GcMode::Periodic,
                versions_budget: 1,
                ..GcConfig::default()
            },
            Arc::clone(&f.store),
            Arc::clone(&f.registry),
            Arc::clone(&f.clock),
            Arc::new(NoopIndex),
            Arc::clone(&f.metrics),
        );
        let never_visible = RetiredVersion {
            version: VersionIdx::new(0, 99, 0),
            kind: RetireKind::Aborted,
            ..retired
        };
        gc.retire([retired, never_visible]);

        let result = gc.collect();
        assert_eq!(result.examined, 1);
        assert!(result.budget_exhausted);
        assert_eq!(result.queue_remaining, 1);
    }

    #[test]
    fn test_runner_collects_in_background() {
        let f = fixture();
        let retired = superseded_version(&f);
        let gc = Arc::new(GarbageCollector::new(
            GcConfig {
                mode: GcMode::Periodic,
                interval: Duration::from_millis(5),
                ..GcConfig::default()
            },
            Arc::clone(&f.store),
            Arc::clone(&f.registry),
            Arc::clone(&f.clock),
            Arc::new(NoopIndex),
            Arc::clone(&f.metrics),
        ));
        gc.retire([retired]);

        let mut runner = GcRunner::start(Arc::clone(&gc)).unwrap();
        assert!(runner.is_running());
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.store.is_allocated(retired.version) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        runner.stop();
        assert!(!runner.is_running());
        assert!(!f.store.is_allocated(retired.version));
    }
}
