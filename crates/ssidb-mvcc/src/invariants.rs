//! Timestamp allocation, visibility rules and version-chain management.
//!
//! This module implements:
//! - [`CommitClock`]: `TxnId` allocation and commit-timestamp sequencing with
//!   a stable timestamp that never exposes a partially stamped commit.
//! - [`visible_to`]: the visibility predicate over a version's stamps.
//! - [`HeadTable`]: sharded CAS-updated chain heads keyed by `RowId`.
//! - [`VersionStore`]: arena plus chain heads, providing resolve, install,
//!   commit stamping, rollback and the unlink/free step used by GC.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use ssidb_error::{Holder, MvccError, Result};
use ssidb_types::{RowData, RowId, Snapshot, Timestamp, TxnId};

use crate::core_types::{Stamp, Version, VersionArena, VersionIdx, VersionState, WriteEntry};
use crate::metrics::MvccMetrics;

// ---------------------------------------------------------------------------
// CommitClock
// ---------------------------------------------------------------------------

/// Hands out transaction ids and commit timestamps, and publishes the
/// stable timestamp: the highest `T` with no commit at or below `T` still
/// being stamped. Snapshots are taken at the stable timestamp.
pub struct CommitClock {
    next_txn: AtomicU64,
    window: Mutex<CommitWindow>,
    stable: AtomicU64,
}

/// Reserved commit timestamps not yet released, oldest first.
#[derive(Debug)]
struct CommitWindow {
    next_ts: u64,
    in_flight: VecDeque<u64>,
}

impl CommitWindow {
    fn stable(&self) -> u64 {
        self.in_flight
            .front()
            .copied()
            .unwrap_or(self.next_ts)
            .saturating_sub(1)
    }
}

impl CommitClock {
    /// A clock whose first transaction id is `first_txn_id` and whose first
    /// commit lands at `first_commit_ts`.
    #[must_use]
    pub fn new(first_txn_id: u64, first_commit_ts: u64) -> Self {
        let window = CommitWindow {
            next_ts: first_commit_ts,
            in_flight: VecDeque::new(),
        };
        Self {
            next_txn: AtomicU64::new(first_txn_id),
            stable: AtomicU64::new(window.stable()),
            window: Mutex::new(window),
        }
    }

    /// Next transaction id, or `None` once the id space is used up.
    pub fn next_txn_id(&self) -> Option<TxnId> {
        self.next_txn
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw <= TxnId::MAX_RAW).then_some(raw + 1)
            })
            .ok()
            .and_then(TxnId::new)
    }

    /// Reserve the next commit timestamp. Until it is released the stable
    /// timestamp stays below it.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::Internal`] once the timestamp space is used up.
    pub fn reserve_commit_ts(&self) -> Result<Timestamp> {
        let mut window = self.window.lock();
        let raw = window.next_ts;
        if raw > Timestamp::MAX.get() {
            return Err(MvccError::internal("commit timestamp space exhausted"));
        }
        window.next_ts = raw + 1;
        window.in_flight.push_back(raw);
        Ok(Timestamp::new(raw))
    }

    /// Release a reserved timestamp, stamped or abandoned, and publish the
    /// new stable timestamp. An abandoned timestamp leaves a gap.
    pub fn release_commit_ts(&self, ts: Timestamp) {
        let mut window = self.window.lock();
        let at = window.in_flight.iter().position(|&raw| raw == ts.get());
        debug_assert!(at.is_some(), "commit ts {ts} was not reserved");
        if let Some(at) = at {
            window.in_flight.remove(at);
        }
        // Stored under the lock, so the published value never moves back.
        self.stable.store(window.stable(), Ordering::Release);
    }

    #[must_use]
    pub fn stable_ts(&self) -> Timestamp {
        Timestamp::new(self.stable.load(Ordering::Acquire))
    }

    /// Raw value of the id the next [`CommitClock::next_txn_id`] returns.
    #[must_use]
    pub fn peek_txn_id(&self) -> u64 {
        self.next_txn.load(Ordering::Acquire)
    }
}

impl Default for CommitClock {
    /// Bootstrap data sits at `Timestamp::BOOTSTRAP`; real commits follow.
    fn default() -> Self {
        Self::new(1, Timestamp::BOOTSTRAP.get() + 1)
    }
}

impl std::fmt::Debug for CommitClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitClock")
            .field("next_txn", &self.peek_txn_id())
            .field("window", &*self.window.lock())
            .field("stable", &self.stable_ts())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Visibility predicate
// ---------------------------------------------------------------------------

/// Visibility interval of a committed version: `[begin_ts, end_ts)`, with
/// `end_ts = None` for a version nobody has superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionVisibilityRange {
    pub begin_ts: Timestamp,
    pub end_ts: Option<Timestamp>,
}

impl VersionVisibilityRange {
    /// Whether this interval contains `snapshot_ts`.
    #[must_use]
    pub fn contains(self, snapshot_ts: Timestamp) -> bool {
        if snapshot_ts < self.begin_ts {
            return false;
        }
        match self.end_ts {
            Some(end) => snapshot_ts < end,
            None => true,
        }
    }
}

/// Whether a version with stamps `(begin, end)` is visible to transaction
/// `me` reading at `snapshot`.
///
/// Committed intervals follow [`VersionVisibilityRange::contains`]. A
/// pending begin is visible only to its owner. A pending end counts as open
/// for everyone except its owner, who sees its own newer version instead.
#[inline]
#[must_use]
pub fn visible_to(begin: Stamp, end: Stamp, snapshot: Snapshot, me: TxnId) -> bool {
    let begin_ok = match begin {
        Stamp::Committed(ts) => snapshot.includes(ts),
        Stamp::Pending(owner) => owner == me,
        Stamp::Open => false,
    };
    begin_ok && end_allows(end, snapshot, me)
}

#[inline]
fn end_allows(end: Stamp, snapshot: Snapshot, me: TxnId) -> bool {
    match end {
        Stamp::Open => true,
        Stamp::Pending(owner) => owner != me,
        Stamp::Committed(ts) => snapshot.ts < ts,
    }
}

// ---------------------------------------------------------------------------
// HeadTable
// ---------------------------------------------------------------------------

/// Number of shards in the head table (power of 2).
pub const HEAD_SHARDS: usize = 64;

/// Outcome of a compare-and-swap on a row's head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadSwap {
    /// The head moved from `previous` to the new version.
    Swapped { previous: Option<VersionIdx> },
    /// The head no longer matched the expected value.
    Stale,
}

type HeadShard = RwLock<HashMap<RowId, AtomicU64>>;

/// Sharded map from row to its newest version.
///
/// Heads are swung by CAS under the shard read lock. A row gets an entry
/// under the write lock on its first install and loses it under the write
/// lock when its chain is cleared, so every entry holds a live head and a
/// row with no versions costs nothing.
pub struct HeadTable {
    shards: Box<[HeadShard]>,
}

impl HeadTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..HEAD_SHARDS).map(|_| RwLock::default()).collect(),
        }
    }

    #[inline]
    fn shard(&self, row: RowId) -> &HeadShard {
        let hash = (row.key.rotate_left(20) ^ u64::from(row.table.get()))
            .wrapping_mul(0x9E37_79B9_7F4A_7C15);
        #[allow(clippy::cast_possible_truncation)]
        let at = (hash >> (64 - HEAD_SHARDS.trailing_zeros())) as usize;
        &self.shards[at]
    }

    /// Newest version of `row`, if it has any.
    #[must_use]
    pub fn head(&self, row: RowId) -> Option<VersionIdx> {
        self.shard(row)
            .read()
            .get(&row)
            .map(|slot| VersionIdx::from_bits(slot.load(Ordering::Acquire)))
    }

    /// Point `row` at `new_head` if its head is still `expected`.
    pub fn swap_head(
        &self,
        row: RowId,
        new_head: VersionIdx,
        expected: Option<VersionIdx>,
    ) -> HeadSwap {
        let shard = self.shard(row);
        if let Some(slot) = shard.read().get(&row) {
            return Self::cas(slot, expected, new_head);
        }
        if expected.is_some() {
            return HeadSwap::Stale;
        }
        match shard.write().entry(row) {
            Entry::Occupied(_) => HeadSwap::Stale,
            Entry::Vacant(vacant) => {
                vacant.insert(AtomicU64::new(new_head.to_bits()));
                HeadSwap::Swapped { previous: None }
            }
        }
    }

    fn cas(slot: &AtomicU64, expected: Option<VersionIdx>, new_head: VersionIdx) -> HeadSwap {
        let Some(expected) = expected else {
            return HeadSwap::Stale;
        };
        match slot.compare_exchange(
            expected.to_bits(),
            new_head.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => HeadSwap::Swapped {
                previous: Some(expected),
            },
            Err(_) => HeadSwap::Stale,
        }
    }

    /// Drop `row` from the table if its head is still `expected`.
    pub fn clear(&self, row: RowId, expected: VersionIdx) -> bool {
        let mut heads = self.shard(row).write();
        let matches = heads
            .get(&row)
            .is_some_and(|slot| slot.load(Ordering::Acquire) == expected.to_bits());
        if matches {
            heads.remove(&row);
        }
        matches
    }

    /// Visit every row and its head. Diagnostics only.
    pub fn visit(&self, mut f: impl FnMut(RowId, VersionIdx)) {
        for shard in self.shards.iter() {
            for (&row, slot) in shard.read().iter() {
                f(row, VersionIdx::from_bits(slot.load(Ordering::Acquire)));
            }
        }
    }

    /// Rows that currently have a chain.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }
}

impl Default for HeadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeadTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadTable")
            .field("shards", &HEAD_SHARDS)
            .field("row_count", &self.row_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// VersionStore
// ---------------------------------------------------------------------------

/// Outcome of resolving a row for a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRead {
    /// Version the read resolved to; `None` is a visibility miss.
    pub version: Option<VersionIdx>,
    /// Row contents; `None` for a miss or a tombstone.
    pub data: Option<RowData>,
    /// A concurrent writer that has already superseded the resolved version
    /// (pending, or committed after the reader's snapshot).
    pub overwritten_by: Option<TxnId>,
    pub versions_traversed: u64,
}

impl ResolvedRead {
    fn miss(versions_traversed: u64) -> Self {
        Self {
            version: None,
            data: None,
            overwritten_by: None,
            versions_traversed,
        }
    }
}

/// Outcome of installing a new version at a chain head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub created: VersionIdx,
    pub superseded: Option<VersionIdx>,
    /// Readers registered on the superseded version when its end was claimed.
    pub readers: SmallVec<[TxnId; 4]>,
    pub cas_attempts: u32,
}

/// Diagnostic view of one chain element, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub idx: VersionIdx,
    pub begin: Stamp,
    pub end: Stamp,
    pub state: VersionState,
    pub data: Option<RowData>,
}

/// Outcome of [`VersionStore::collapse_tombstone`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneCollapse {
    /// Tombstone freed and the row dropped from the head table.
    Freed,
    /// Not yet: older versions, a pending writer or readers remain.
    Busy,
    /// Already freed, or no longer the head.
    Gone,
}

/// Head claim taken before a new version is allocated.
enum HeadClaim {
    Empty,
    Claimed {
        head: VersionIdx,
        readers: SmallVec<[TxnId; 4]>,
    },
}

/// Version arena plus chain heads.
///
/// Readers and writers hold the arena read lock while touching versions;
/// allocation takes the write lock briefly, and the garbage collector takes
/// it while unlinking and freeing.
pub struct VersionStore {
    arena: RwLock<VersionArena>,
    heads: HeadTable,
    metrics: Arc<MvccMetrics>,
}

impl VersionStore {
    #[must_use]
    pub fn new(metrics: Arc<MvccMetrics>) -> Self {
        Self::with_arena(metrics, VersionArena::new())
    }

    /// A store over a caller-built arena, e.g. one with a chunk limit.
    #[must_use]
    pub fn with_arena(metrics: Arc<MvccMetrics>, arena: VersionArena) -> Self {
        Self {
            arena: RwLock::new(arena),
            heads: HeadTable::new(),
            metrics,
        }
    }

    /// Install a bootstrap version of `row` committed at `ts`.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::Internal`] if the row already has a chain.
    pub fn seed(&self, row: RowId, data: RowData, creator: TxnId, ts: Timestamp) -> Result<VersionIdx> {
        let idx = self
            .arena
            .write()
            .alloc(Version::committed(row, Some(data), creator, ts))?;
        match self.heads.swap_head(row, idx, None) {
            HeadSwap::Swapped { .. } => Ok(idx),
            HeadSwap::Stale => {
                self.arena.write().free(idx);
                Err(MvccError::internal(format!("row {row} already has versions")))
            }
        }
    }

    /// Resolve the version of `row` visible to `me` at `snapshot`.
    ///
    /// With `register_reader` set, `me` is added to the reader set of the
    /// committed version it resolves to, and the end stamp observed while
    /// registered decides [`ResolvedRead::overwritten_by`].
    #[must_use]
    pub fn resolve(
        &self,
        row: RowId,
        snapshot: Snapshot,
        me: TxnId,
        register_reader: bool,
    ) -> ResolvedRead {
        'retry: loop {
            let Some(head_idx) = self.heads.head(row) else {
                return ResolvedRead::miss(0);
            };

            let arena = self.arena.read();
            let mut current_idx = head_idx;
            let mut traversed = 0_u64;

            loop {
                let Some(version) = arena.get(current_idx) else {
                    // Freed between reading the head and locking the arena.
                    continue 'retry;
                };
                traversed += 1;

                let begin = version.begin();
                let own = begin == Stamp::Pending(me);
                let begin_ok = match begin {
                    Stamp::Committed(ts) => snapshot.includes(ts),
                    _ => own,
                };

                if begin_ok {
                    let mut end = version.end();
                    let final_end = matches!(end, Stamp::Committed(ts) if ts <= snapshot.ts);
                    if register_reader && !own && !final_end {
                        end = version.register_reader(me);
                    }
                    if end_allows(end, snapshot, me) {
                        let overwritten_by = match end {
                            Stamp::Pending(owner) if owner != me => Some(owner),
                            Stamp::Committed(_) => version.superseded_by(),
                            _ => None,
                        };
                        tracing::trace!(
                            row = %row,
                            snapshot_ts = snapshot.ts.get(),
                            versions_traversed = traversed,
                            "row resolved"
                        );
                        return ResolvedRead {
                            version: Some(current_idx),
                            data: version.data.clone(),
                            overwritten_by,
                            versions_traversed: traversed,
                        };
                    }
                }

                let Some(prev) = version.prev else {
                    return ResolvedRead::miss(traversed);
                };
                current_idx = prev;
            }
        }
    }

    /// Install a new version of `row` owned by `txn`.
    ///
    /// The head must be the caller's own pending version or a version
    /// committed at or before `snapshot` whose end is still open; its end is
    /// claimed before the new head is swung in. `data = None` writes a
    /// tombstone.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::WriteConflict`] if another writer holds the head,
    /// a newer commit replaced it, or `max_retries` CAS attempts fail.
    pub fn install(
        &self,
        row: RowId,
        data: Option<RowData>,
        txn: TxnId,
        snapshot: Snapshot,
        max_retries: u32,
    ) -> Result<InstallOutcome> {
        let _span = tracing::info_span!(
            "chain_install",
            row = %row,
            txn_id = %txn,
            cas_attempts = tracing::field::Empty,
        )
        .entered();

        let max_retries = max_retries.max(1);
        for attempt in 1..=max_retries {
            let head = self.heads.head(row);
            let claim = match self.claim_head(row, head, txn, snapshot)? {
                Some(claim) => claim,
                None => continue,
            };
            let superseded = match &claim {
                HeadClaim::Empty => None,
                HeadClaim::Claimed { head, .. } => Some(*head),
            };

            let alloc = self
                .arena
                .write()
                .alloc(Version::pending(row, data.clone(), txn, superseded));
            let created = match alloc {
                Ok(idx) => idx,
                Err(err) => {
                    self.release_claim(&claim, txn);
                    return Err(err);
                }
            };

            match self.heads.swap_head(row, created, superseded) {
                HeadSwap::Swapped { .. } => {
                    self.metrics.record_cas_attempt(attempt);
                    tracing::Span::current().record("cas_attempts", attempt);
                    let readers = match claim {
                        HeadClaim::Empty => SmallVec::new(),
                        HeadClaim::Claimed { readers, .. } => readers,
                    };
                    return Ok(InstallOutcome {
                        created,
                        superseded,
                        readers,
                        cas_attempts: attempt,
                    });
                }
                HeadSwap::Stale => {
                    self.arena.write().free(created);
                    self.release_claim(&claim, txn);
                    std::hint::spin_loop();
                }
            }
        }

        self.metrics.record_cas_attempt(max_retries.saturating_add(1));
        tracing::debug!(row = %row, txn_id = %txn, max_retries, "chain install retries exhausted");
        Err(MvccError::WriteConflict {
            row,
            holder: Holder::Contended,
        })
    }

    /// Validate the observed head and claim its end for `txn`.
    ///
    /// `Ok(None)` asks the caller to re-read the head.
    fn claim_head(
        &self,
        row: RowId,
        head: Option<VersionIdx>,
        txn: TxnId,
        snapshot: Snapshot,
    ) -> Result<Option<HeadClaim>> {
        let Some(head) = head else {
            return Ok(Some(HeadClaim::Empty));
        };
        let arena = self.arena.read();
        let Some(version) = arena.get(head) else {
            return Ok(None);
        };

        match version.begin() {
            Stamp::Pending(owner) if owner != txn => {
                return Err(MvccError::WriteConflict {
                    row,
                    holder: Holder::Txn(owner),
                });
            }
            Stamp::Committed(ts) if !snapshot.includes(ts) => {
                return Err(MvccError::WriteConflict {
                    row,
                    holder: Holder::CommittedAt(ts.get()),
                });
            }
            _ => {}
        }

        match version.claim_end(txn) {
            Ok(readers) => Ok(Some(HeadClaim::Claimed { head, readers })),
            Err(Stamp::Pending(owner)) if owner != txn => Err(MvccError::WriteConflict {
                row,
                holder: Holder::Txn(owner),
            }),
            // The head was superseded after we read it; look again.
            Err(_) => Ok(None),
        }
    }

    fn release_claim(&self, claim: &HeadClaim, txn: TxnId) {
        if let HeadClaim::Claimed { head, .. } = claim {
            if let Some(version) = self.arena.read().get(*head) {
                version.release_end(txn);
            }
        }
    }

    /// Replace `txn`'s pending stamps on its write set with `ts`.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::Internal`] if a written version is missing or
    /// not owned by `txn`.
    pub fn commit_writes(&self, txn: TxnId, writes: &[WriteEntry], ts: Timestamp) -> Result<()> {
        let arena = self.arena.read();
        for entry in writes {
            let created = arena
                .get(entry.created)
                .ok_or_else(|| MvccError::internal(format!("created version {} missing", entry.created)))?;
            if !created.commit_begin(txn, ts) {
                return Err(MvccError::internal(format!(
                    "version {} not pending for {txn}",
                    entry.created
                )));
            }
            if let Some(superseded) = entry.superseded {
                let old = arena.get(superseded).ok_or_else(|| {
                    MvccError::internal(format!("superseded version {superseded} missing"))
                })?;
                if !old.commit_end(txn, ts) {
                    return Err(MvccError::internal(format!(
                        "version {superseded} end not claimed by {txn}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Return any stamps [`VersionStore::commit_writes`] already moved to
    /// `ts` back to pending, so the write set can be rolled back. `ts` must
    /// still be reserved.
    pub fn unstamp_writes(&self, txn: TxnId, writes: &[WriteEntry], ts: Timestamp) {
        let arena = self.arena.read();
        for entry in writes {
            if let Some(created) = arena.get(entry.created) {
                created.revert_begin(txn, ts);
            }
            if let Some(old) = entry.superseded.and_then(|idx| arena.get(idx)) {
                old.revert_end(txn, ts);
            }
        }
    }

    /// Undo `txn`'s writes: restore every touched chain head to the version
    /// it replaced, release the claimed ends and retire the orphans.
    pub fn rollback_writes(&self, txn: TxnId, writes: &[WriteEntry]) {
        // (row, base, top) per row, in first-write order.
        let mut rows: Vec<(RowId, Option<VersionIdx>, VersionIdx)> = Vec::new();
        for entry in writes {
            match rows.iter_mut().find(|(row, _, _)| *row == entry.row) {
                Some((_, _, top)) => *top = entry.created,
                None => rows.push((entry.row, entry.superseded, entry.created)),
            }
        }

        for &(row, base, top) in &rows {
            let restored = match base {
                Some(base) => matches!(
                    self.heads.swap_head(row, base, Some(top)),
                    HeadSwap::Swapped { .. }
                ),
                None => self.heads.clear(row, top),
            };
            if !restored {
                tracing::error!(row = %row, txn_id = %txn, "chain head moved under an uncommitted writer");
            }
        }

        let arena = self.arena.read();
        for &(_, base, _) in &rows {
            if let Some(version) = base.and_then(|b| arena.get(b)) {
                version.release_end(txn);
            }
        }
        for entry in writes {
            if let Some(version) = arena.get(entry.created) {
                version.set_state(VersionState::Retired);
            }
        }
    }

    /// Remove `txn` from the reader sets of `versions`. Freed handles are
    /// skipped.
    pub fn unregister_reader(&self, txn: TxnId, versions: &[VersionIdx]) {
        if versions.is_empty() {
            return;
        }
        let arena = self.arena.read();
        for &idx in versions {
            if let Some(version) = arena.get(idx) {
                version.unregister_reader(txn);
            }
        }
    }

    /// Registered readers of a version; `None` once freed.
    #[must_use]
    pub fn reader_count(&self, idx: VersionIdx) -> Option<usize> {
        self.arena.read().get(idx).map(Version::reader_count)
    }

    /// Set the GC state of a version, if it still exists.
    pub fn set_state(&self, idx: VersionIdx, state: VersionState) {
        if let Some(version) = self.arena.read().get(idx) {
            version.set_state(state);
        }
    }

    /// Current GC state of a version; `None` once freed.
    #[must_use]
    pub fn version_state(&self, idx: VersionIdx) -> Option<VersionState> {
        self.arena.read().get(idx).map(Version::state)
    }

    /// Whether `idx` still occupies an arena slot.
    #[must_use]
    pub fn is_allocated(&self, idx: VersionIdx) -> bool {
        self.arena.read().get(idx).is_some()
    }

    /// Contents of a version: `Some(None)` for a tombstone, `None` once freed.
    #[must_use]
    pub fn row_data(&self, idx: VersionIdx) -> Option<Option<RowData>> {
        self.arena.read().get(idx).map(|v| v.data.clone())
    }

    /// Current chain head of `row`.
    #[must_use]
    pub fn chain_head(&self, row: RowId) -> Option<VersionIdx> {
        self.heads.head(row)
    }

    /// Walk the chain of `row`, newest first.
    #[must_use]
    pub fn walk_chain(&self, row: RowId) -> Vec<ChainEntry> {
        'retry: loop {
            let Some(head_idx) = self.heads.head(row) else {
                return Vec::new();
            };
            let arena = self.arena.read();
            let mut result = Vec::new();
            let mut current = Some(head_idx);
            while let Some(idx) = current {
                let Some(version) = arena.get(idx) else {
                    continue 'retry;
                };
                result.push(ChainEntry {
                    idx,
                    begin: version.begin(),
                    end: version.end(),
                    state: version.state(),
                    data: version.data.clone(),
                });
                current = version.prev;
            }
            return result;
        }
    }

    /// Unlink each victim from its row's chain and free its slot.
    ///
    /// A victim that is still a chain head is skipped and returned so the
    /// caller can retry it later. A victim no longer reachable from the head
    /// (an aborted version) is freed without relinking.
    #[allow(clippy::significant_drop_tightening)]
    pub fn unlink_and_free(
        &self,
        victims: &[(RowId, VersionIdx)],
    ) -> (usize, Vec<(RowId, VersionIdx)>) {
        let mut arena = self.arena.write();
        let mut freed = 0_usize;
        let mut skipped = Vec::new();

        for &(row, victim) in victims {
            let Some(victim_prev) = arena.get(victim).map(|v| v.prev) else {
                continue;
            };
            let head = self.heads.head(row);
            if head == Some(victim) {
                skipped.push((row, victim));
                continue;
            }

            let mut current = head;
            while let Some(idx) = current {
                let Some(version) = arena.get_mut(idx) else {
                    break;
                };
                if version.prev == Some(victim) {
                    version.prev = victim_prev;
                    break;
                }
                current = version.prev;
            }

            arena.free(victim);
            freed += 1;
        }
        (freed, skipped)
    }

    /// Drop a deleted row: free its tombstone head and forget the row.
    ///
    /// The caller has checked the delete is at or below the watermark. The
    /// tombstone must still be the head, be the whole chain, have an open
    /// end and no registered readers; a reader still registered could need
    /// the edge to a later insert.
    pub fn collapse_tombstone(&self, row: RowId, tombstone: VersionIdx) -> TombstoneCollapse {
        let mut arena = self.arena.write();
        let Some(version) = arena.get(tombstone) else {
            return TombstoneCollapse::Gone;
        };
        if self.heads.head(row) != Some(tombstone) || version.data.is_some() {
            return TombstoneCollapse::Gone;
        }
        let settled = version.prev.is_none()
            && matches!(version.begin(), Stamp::Committed(_))
            && version.end() == Stamp::Open
            && version.reader_count() == 0;
        if !settled || !self.heads.clear(row, tombstone) {
            return TombstoneCollapse::Busy;
        }
        arena.free(tombstone);
        tracing::trace!(row = %row, version = %tombstone, "deleted row collapsed");
        TombstoneCollapse::Freed
    }

    /// Mean chain length over up to `sample_limit` rows; 0.0 when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sample_chain_pressure(&self, sample_limit: usize) -> f64 {
        let arena = self.arena.read();
        let mut total_length = 0_usize;
        let mut sampled = 0_usize;

        self.heads.visit(|_row, head_idx| {
            if sampled >= sample_limit {
                return;
            }
            let mut current = Some(head_idx);
            while let Some(version) = current.and_then(|idx| arena.get(idx)) {
                total_length += 1;
                current = version.prev;
            }
            sampled += 1;
        });

        if sampled == 0 {
            0.0
        } else {
            total_length as f64 / sampled as f64
        }
    }

    /// Versions currently allocated in the arena.
    #[must_use]
    pub fn live_version_count(&self) -> usize {
        self.arena.read().live_count()
    }

    /// Rows with a non-empty chain.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.heads.row_count()
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.read();
        f.debug_struct("VersionStore")
            .field("row_count", &self.heads.row_count())
            .field("arena", &*arena)
            .finish_non_exhaustive()
    }
}
