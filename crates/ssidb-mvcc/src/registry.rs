//! Shared transaction records: status, finish timestamps and SSI edges.
//!
//! The caller owns its [`Transaction`](crate::Transaction); everything other
//! transactions must be able to observe lives in an `Arc<TxnShared>` held by
//! the [`TxnRegistry`]. Records outlive their transaction until every
//! transaction that ran alongside it has finished, so edge checks against a
//! recently committed transaction still find its record.
//!
//! The registry numbers begins and finishes from one private counter, so
//! "finished before the other began" compares two event numbers rather than
//! snapshot timestamps, which do not move while only readers run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use ssidb_types::{Snapshot, Timestamp, TxnId};

use crate::core_types::VersionIdx;

/// Finished transactions between two amortized record prunes.
pub const RECORD_PRUNE_INTERVAL: usize = 64;

/// Status of a transaction as seen by other transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxnStatus {
    Active = 0,
    Committing = 1,
    Committed = 2,
    Aborted = 3,
}

impl TxnStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Committing,
            2 => Self::Committed,
            3 => Self::Aborted,
            _ => Self::Active,
        }
    }
}

/// Per-transaction rw-antidependency tracking.
#[derive(Debug, Clone, Default)]
pub struct SsiState {
    /// Sources of incoming edges (R -rw-> T).
    pub rw_in_from: HashSet<TxnId>,
    /// Targets of outgoing edges (T -rw-> W).
    pub rw_out_to: HashSet<TxnId>,
}

/// The shared part of a transaction.
pub struct TxnShared {
    pub txn_id: TxnId,
    pub snapshot: Snapshot,
    pub started_at: Instant,
    /// Registry event number at begin.
    pub begin_seq: u64,
    /// Registry event number when the transaction left the active set; 0
    /// while it is still registered as active.
    finish_seq: AtomicU64,
    status: AtomicU8,
    /// Commit timestamp for writers; stable timestamp at finish otherwise.
    finish_ts: AtomicU64,
    wrote: AtomicBool,
    has_in_rw: AtomicBool,
    has_out_rw: AtomicBool,
    ssi: Mutex<SsiState>,
    /// Versions this transaction registered on as a reader, handed over at
    /// finish so they can be unregistered when the record is pruned.
    reads: Mutex<Vec<VersionIdx>>,
}

impl TxnShared {
    #[must_use]
    pub fn new(txn_id: TxnId, snapshot: Snapshot) -> Self {
        Self::starting(txn_id, snapshot, 0)
    }

    fn starting(txn_id: TxnId, snapshot: Snapshot, begin_seq: u64) -> Self {
        Self {
            txn_id,
            snapshot,
            started_at: Instant::now(),
            begin_seq,
            finish_seq: AtomicU64::new(0),
            status: AtomicU8::new(TxnStatus::Active as u8),
            finish_ts: AtomicU64::new(0),
            wrote: AtomicBool::new(false),
            has_in_rw: AtomicBool::new(false),
            has_out_rw: AtomicBool::new(false),
            ssi: Mutex::new(SsiState::default()),
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> TxnStatus {
        TxnStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_committing(&self) {
        self.status
            .store(TxnStatus::Committing as u8, Ordering::Release);
    }

    /// Record a commit. `wrote` distinguishes a commit timestamp from the
    /// stable timestamp a read-only transaction finished at.
    pub(crate) fn mark_committed(&self, ts: Timestamp, wrote: bool) {
        self.wrote.store(wrote, Ordering::Release);
        self.finish_ts.store(ts.get(), Ordering::Release);
        self.status
            .store(TxnStatus::Committed as u8, Ordering::Release);
    }

    pub(crate) fn mark_aborted(&self, ts: Timestamp) {
        self.finish_ts.store(ts.get(), Ordering::Release);
        self.status.store(TxnStatus::Aborted as u8, Ordering::Release);
    }

    /// Commit timestamp, if this transaction committed writes.
    #[must_use]
    pub fn commit_ts(&self) -> Option<Timestamp> {
        (self.status() == TxnStatus::Committed && self.wrote.load(Ordering::Acquire))
            .then(|| Timestamp::new(self.finish_ts.load(Ordering::Acquire)))
    }

    /// Timestamp at which the transaction finished, if it has.
    #[must_use]
    pub fn finish_ts(&self) -> Option<Timestamp> {
        matches!(self.status(), TxnStatus::Committed | TxnStatus::Aborted)
            .then(|| Timestamp::new(self.finish_ts.load(Ordering::Acquire)))
    }

    /// Registry event number at which this transaction left the active set.
    #[must_use]
    pub fn finish_seq(&self) -> Option<u64> {
        let seq = self.finish_seq.load(Ordering::Acquire);
        (seq != 0).then_some(seq)
    }

    /// Whether this transaction may have run concurrently with `other`, for
    /// the purpose of rw-antidependencies.
    ///
    /// A writer overlaps while its commit is outside `other`'s snapshot. A
    /// read-only transaction overlaps only if it was still registered when
    /// `other` began. Aborted transactions never matter.
    #[must_use]
    pub fn overlaps(&self, other: &TxnShared) -> bool {
        match self.status() {
            TxnStatus::Active | TxnStatus::Committing => true,
            TxnStatus::Aborted => false,
            TxnStatus::Committed if self.wrote.load(Ordering::Acquire) => {
                Timestamp::new(self.finish_ts.load(Ordering::Acquire)) > other.snapshot.ts
            }
            TxnStatus::Committed => self
                .finish_seq()
                .is_none_or(|finished| finished > other.begin_seq),
        }
    }

    /// Hand over the versions read, for unregistration at prune time.
    pub(crate) fn stash_reads(&self, reads: &[VersionIdx]) {
        self.reads.lock().extend_from_slice(reads);
    }

    pub(crate) fn take_reads(&self) -> Vec<VersionIdx> {
        std::mem::take(&mut *self.reads.lock())
    }

    #[must_use]
    pub fn in_conflict(&self) -> bool {
        self.has_in_rw.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn out_conflict(&self) -> bool {
        self.has_out_rw.load(Ordering::Acquire)
    }

    pub(crate) fn add_in_edge(&self, from: TxnId) -> bool {
        let inserted = self.ssi.lock().rw_in_from.insert(from);
        self.has_in_rw.store(true, Ordering::Release);
        inserted
    }

    pub(crate) fn add_out_edge(&self, to: TxnId) -> bool {
        let inserted = self.ssi.lock().rw_out_to.insert(to);
        self.has_out_rw.store(true, Ordering::Release);
        inserted
    }

    /// Copy of the current edge sets.
    #[must_use]
    pub fn ssi_state(&self) -> SsiState {
        self.ssi.lock().clone()
    }
}

impl std::fmt::Debug for TxnShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnShared")
            .field("txn_id", &self.txn_id)
            .field("snapshot", &self.snapshot.ts)
            .field("begin_seq", &self.begin_seq)
            .field("status", &self.status())
            .field("has_in_rw", &self.in_conflict())
            .field("has_out_rw", &self.out_conflict())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TxnRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ActiveEntry {
    snapshot: Timestamp,
    begin_seq: u64,
}

/// Active set plus retained records of finished transactions.
///
/// Lock order: `active` before `records`.
#[derive(Default)]
pub struct TxnRegistry {
    active: RwLock<BTreeMap<TxnId, ActiveEntry>>,
    records: RwLock<HashMap<TxnId, Arc<TxnShared>>>,
    events: AtomicU64,
    finished_since_prune: AtomicUsize,
}

impl TxnRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_event(&self) -> u64 {
        self.events.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register `txn_id` with a snapshot taken by `snapshot_ts`.
    ///
    /// The snapshot is read while the active set is write-locked, so a
    /// concurrently computed watermark never exceeds it.
    pub fn begin(&self, txn_id: TxnId, snapshot_ts: impl FnOnce() -> Timestamp) -> Arc<TxnShared> {
        let mut active = self.active.write();
        let begin_seq = self.next_event();
        let snapshot = Snapshot::new(snapshot_ts());
        let shared = Arc::new(TxnShared::starting(txn_id, snapshot, begin_seq));
        active.insert(
            txn_id,
            ActiveEntry {
                snapshot: snapshot.ts,
                begin_seq,
            },
        );
        self.records.write().insert(txn_id, Arc::clone(&shared));
        drop(active);
        shared
    }

    /// Remove `txn_id` from the active set and stamp its finish sequence.
    /// Its record stays until pruned.
    ///
    /// Returns `true` once every [`RECORD_PRUNE_INTERVAL`] calls, telling
    /// the caller a prune is due.
    pub fn deactivate(&self, txn_id: TxnId) -> bool {
        let mut active = self.active.write();
        if active.remove(&txn_id).is_some() {
            if let Some(record) = self.records.read().get(&txn_id) {
                record.finish_seq.store(self.next_event(), Ordering::Release);
            }
        }
        drop(active);
        self.finished_since_prune.fetch_add(1, Ordering::Relaxed) + 1 >= RECORD_PRUNE_INTERVAL
    }

    #[must_use]
    pub fn get(&self, txn_id: TxnId) -> Option<Arc<TxnShared>> {
        self.records.read().get(&txn_id).cloned()
    }

    /// Status of `txn_id`; `None` if it was never registered or was pruned.
    #[must_use]
    pub fn status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        self.records.read().get(&txn_id).map(|r| r.status())
    }

    /// Oldest snapshot still in use, or `stable` if nothing is active.
    #[must_use]
    pub fn watermark(&self, stable: Timestamp) -> Timestamp {
        self.active
            .read()
            .values()
            .map(|entry| entry.snapshot)
            .min()
            .map_or(stable, |oldest| oldest.min(stable))
    }

    /// The active transaction with the oldest snapshot.
    #[must_use]
    pub fn oldest_active(&self) -> Option<Arc<TxnShared>> {
        let oldest = {
            let active = self.active.read();
            active
                .iter()
                .min_by_key(|(id, entry)| (entry.snapshot, **id))
                .map(|(id, _)| *id)
        }?;
        self.get(oldest)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Drop records of transactions that finished before every active
    /// transaction began, and return them.
    ///
    /// Such a transaction overlaps nothing that is running or will run, so
    /// no edge check can ask for it again.
    pub fn prune_finished(&self) -> Vec<Arc<TxnShared>> {
        let active = self.active.read();
        let horizon = active.values().map(|entry| entry.begin_seq).min();
        self.finished_since_prune.store(0, Ordering::Relaxed);

        let mut pruned = Vec::new();
        self.records.write().retain(|_, record| {
            let done = record
                .finish_seq()
                .is_some_and(|finished| horizon.is_none_or(|oldest| finished < oldest));
            if done {
                pruned.push(Arc::clone(record));
            }
            !done
        });
        drop(active);
        pruned
    }
}

impl std::fmt::Debug for TxnRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnRegistry")
            .field("active", &self.active_count())
            .field("records", &self.record_count())
            .finish()
    }
}
