//! MVCC core runtime types.
//!
//! This module implements the runtime data structures shared by the version
//! store, the transaction manager and the garbage collector: version stamps,
//! the generation-checked version arena, and the per-transaction context.
//!
//! Identifier types (`TxnId`, `Timestamp`, `RowId`, ...) live in
//! [`ssidb_types`]; this module builds the runtime machinery on top.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use ssidb_error::{MvccError, Result};
use ssidb_types::{RowData, RowId, Snapshot, Timestamp, TxnId};

use crate::config::IsolationLevel;
use crate::registry::{TxnShared, TxnStatus};

// ---------------------------------------------------------------------------
// Stamp
// ---------------------------------------------------------------------------

/// Raw encoding of an open (infinite) end stamp.
const STAMP_OPEN: u64 = u64::MAX;

/// Tag bit marking a transaction-local (uncommitted) stamp.
const STAMP_PENDING_BIT: u64 = 1 << 63;

/// One bound of a version's validity interval.
///
/// Encoded into a single `u64` so that readers observe every transition
/// atomically: committed timestamps and `TxnId`s both fit in 62 bits, the
/// top bit tags a pending owner, and `u64::MAX` is "open".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stamp {
    /// Fixed by the commit of the owning transaction.
    Committed(Timestamp),
    /// Transaction-local marker of an in-flight writer.
    Pending(TxnId),
    /// No upper bound yet (only valid for `end`).
    Open,
}

impl Stamp {
    #[inline]
    #[must_use]
    pub fn encode(self) -> u64 {
        match self {
            Self::Committed(ts) => {
                debug_assert!(ts <= Timestamp::MAX, "timestamp overflows stamp encoding");
                ts.get()
            }
            Self::Pending(txn) => STAMP_PENDING_BIT | txn.get(),
            Self::Open => STAMP_OPEN,
        }
    }

    #[inline]
    #[must_use]
    pub fn decode(raw: u64) -> Self {
        if raw == STAMP_OPEN {
            return Self::Open;
        }
        if raw & STAMP_PENDING_BIT != 0 {
            return TxnId::new(raw & !STAMP_PENDING_BIT).map_or(Self::Open, Self::Pending);
        }
        Self::Committed(Timestamp::new(raw))
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Lifecycle of a version as seen by the garbage collector.
///
/// `Freed` is not represented here: a freed version no longer occupies an
/// arena slot, and its handle fails the generation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VersionState {
    /// Current, or inside some snapshot's visibility window.
    Live = 0,
    /// Superseded by a commit or orphaned by an abort; queued for reclamation.
    Retired = 1,
    /// No snapshot can observe it; waiting for index removal and free.
    Reclaimable = 2,
}

impl VersionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Retired,
            2 => Self::Reclaimable,
            _ => Self::Live,
        }
    }
}

/// One immutable row image with its validity interval.
///
/// `data` never changes once the version is allocated. `begin` and `end`
/// move from pending to committed exactly once; `prev` is rewritten only by
/// the garbage collector while it holds the arena write lock.
#[derive(Debug)]
pub struct Version {
    pub row: RowId,
    /// `None` is a tombstone.
    pub data: Option<RowData>,
    pub creator: TxnId,
    pub prev: Option<VersionIdx>,
    begin: AtomicU64,
    end: AtomicU64,
    /// Raw `TxnId` of the writer that claimed `end`, 0 if unclaimed.
    superseded_by: AtomicU64,
    state: AtomicU8,
    /// Transactions that resolved a read to this version.
    readers: Mutex<SmallVec<[TxnId; 4]>>,
}

impl Version {
    /// A new uncommitted version owned by `creator`.
    #[must_use]
    pub fn pending(
        row: RowId,
        data: Option<RowData>,
        creator: TxnId,
        prev: Option<VersionIdx>,
    ) -> Self {
        Self::with_begin(row, data, creator, prev, Stamp::Pending(creator))
    }

    /// A version committed at `ts` with an open end (bulk load).
    #[must_use]
    pub fn committed(row: RowId, data: Option<RowData>, creator: TxnId, ts: Timestamp) -> Self {
        Self::with_begin(row, data, creator, None, Stamp::Committed(ts))
    }

    fn with_begin(
        row: RowId,
        data: Option<RowData>,
        creator: TxnId,
        prev: Option<VersionIdx>,
        begin: Stamp,
    ) -> Self {
        Self {
            row,
            data,
            creator,
            prev,
            begin: AtomicU64::new(begin.encode()),
            end: AtomicU64::new(STAMP_OPEN),
            superseded_by: AtomicU64::new(0),
            state: AtomicU8::new(VersionState::Live as u8),
            readers: Mutex::new(SmallVec::new()),
        }
    }

    #[inline]
    pub fn begin(&self) -> Stamp {
        Stamp::decode(self.begin.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn end(&self) -> Stamp {
        Stamp::decode(self.end.load(Ordering::SeqCst))
    }

    /// The writer that claimed this version's end, if any.
    pub fn superseded_by(&self) -> Option<TxnId> {
        TxnId::new(self.superseded_by.load(Ordering::SeqCst))
    }

    pub fn state(&self) -> VersionState {
        VersionState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: VersionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Register `txn` as a reader and return the end stamp observed while
    /// registered.
    ///
    /// Registration and the end load happen under the reader-list lock, and
    /// [`Version::claim_end`] swaps the end before taking that lock, so a
    /// concurrent overwrite either finds this reader or this reader sees the
    /// pending end.
    pub fn register_reader(&self, txn: TxnId) -> Stamp {
        let mut readers = self.readers.lock();
        if !readers.contains(&txn) {
            readers.push(txn);
        }
        let end = self.end();
        drop(readers);
        end
    }

    /// Drop `txn` from the reader set once nothing can ask about its reads.
    pub fn unregister_reader(&self, txn: TxnId) {
        self.readers.lock().retain(|reader| *reader != txn);
    }

    /// Atomically claim the open end for `txn`.
    ///
    /// On success returns the readers registered so far. On failure returns
    /// the end stamp that was already in place.
    pub fn claim_end(&self, txn: TxnId) -> std::result::Result<SmallVec<[TxnId; 4]>, Stamp> {
        self.end
            .compare_exchange(
                STAMP_OPEN,
                Stamp::Pending(txn).encode(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(Stamp::decode)?;
        self.superseded_by.store(txn.get(), Ordering::SeqCst);
        Ok(self.readers.lock().clone())
    }

    /// Undo a claim made by `txn`. Returns `false` if `txn` did not hold it.
    pub fn release_end(&self, txn: TxnId) -> bool {
        let released = self
            .end
            .compare_exchange(
                Stamp::Pending(txn).encode(),
                STAMP_OPEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if released {
            self.superseded_by.store(0, Ordering::SeqCst);
        }
        released
    }

    /// Replace `txn`'s pending begin with the commit timestamp.
    pub fn commit_begin(&self, txn: TxnId, ts: Timestamp) -> bool {
        self.begin
            .compare_exchange(
                Stamp::Pending(txn).encode(),
                Stamp::Committed(ts).encode(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Replace `txn`'s pending end with the commit timestamp.
    pub fn commit_end(&self, txn: TxnId, ts: Timestamp) -> bool {
        self.end
            .compare_exchange(
                Stamp::Pending(txn).encode(),
                Stamp::Committed(ts).encode(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Put `txn`'s pending begin back in place of a commit at `ts` that
    /// never became stable.
    pub fn revert_begin(&self, txn: TxnId, ts: Timestamp) -> bool {
        self.begin
            .compare_exchange(
                Stamp::Committed(ts).encode(),
                Stamp::Pending(txn).encode(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// End-stamp counterpart of [`Version::revert_begin`].
    pub fn revert_end(&self, txn: TxnId, ts: Timestamp) -> bool {
        self.end
            .compare_exchange(
                Stamp::Committed(ts).encode(),
                Stamp::Pending(txn).encode(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Number of registered readers.
    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }
}

// ---------------------------------------------------------------------------
// VersionIdx / VersionArena
// ---------------------------------------------------------------------------

/// Generation-checked handle into a [`VersionArena`].
///
/// A handle to a freed slot never resolves, even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionIdx {
    chunk: u32,
    offset: u32,
    generation: u32,
}

impl VersionIdx {
    #[inline]
    pub(crate) const fn new(chunk: u32, offset: u32, generation: u32) -> Self {
        Self {
            chunk,
            offset,
            generation,
        }
    }

    /// Chunk index within the arena.
    #[inline]
    #[must_use]
    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Offset within the chunk.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Slot generation this handle was issued for.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Single-word form: generation in the high half, flat arena slot
    /// number in the low half.
    #[inline]
    pub(crate) fn to_bits(self) -> u64 {
        let slot = u64::from(self.chunk) * ARENA_CHUNK as u64 + u64::from(self.offset);
        (u64::from(self.generation) << 32) | slot
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn from_bits(bits: u64) -> Self {
        let slot = bits & u64::from(u32::MAX);
        Self::new(
            (slot / ARENA_CHUNK as u64) as u32,
            (slot % ARENA_CHUNK as u64) as u32,
            (bits >> 32) as u32,
        )
    }
}

impl std::fmt::Display for VersionIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}@{}", self.chunk, self.offset, self.generation)
    }
}

/// Number of versions per arena chunk.
pub(crate) const ARENA_CHUNK: usize = 4096;

/// Highest chunk index whose slots fit the 32-bit slot number of
/// [`VersionIdx::to_bits`], one chunk short so no handle packs to all ones.
#[allow(clippy::cast_possible_truncation)]
const MAX_CHUNK: u32 = u32::MAX / ARENA_CHUNK as u32 - 1;

#[derive(Debug)]
struct ArenaSlot {
    generation: u32,
    version: Option<Version>,
}

/// Chunked arena owning every version until the garbage collector frees it.
///
/// Freed slots are recycled via a free list; each free bumps the slot's
/// generation so stale handles stop resolving.
pub struct VersionArena {
    chunks: Vec<Vec<ArenaSlot>>,
    free_list: Vec<(u32, u32)>,
    max_chunks: usize,
    high_water: u64,
    live: usize,
}

impl VersionArena {
    /// Create an empty arena that may grow to the full handle range.
    #[must_use]
    pub fn new() -> Self {
        Self::with_chunk_limit(MAX_CHUNK + 1)
    }

    /// Create an empty arena holding at most `max_chunks` chunks of
    /// [`ARENA_CHUNK`] versions each (at least one, at most the handle range).
    #[must_use]
    pub fn with_chunk_limit(max_chunks: u32) -> Self {
        Self {
            chunks: vec![Vec::with_capacity(ARENA_CHUNK)],
            free_list: Vec::new(),
            max_chunks: max_chunks.clamp(1, MAX_CHUNK + 1) as usize,
            high_water: 0,
            live: 0,
        }
    }

    /// Allocate a slot for `version`, returning its handle.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::Internal`] if every slot is in use and the chunk
    /// limit is reached. The arena is unchanged in that case.
    pub fn alloc(&mut self, version: Version) -> Result<VersionIdx> {
        if let Some((chunk, offset)) = self.free_list.pop() {
            let slot = &mut self.chunks[chunk as usize][offset as usize];
            slot.version = Some(version);
            self.live += 1;
            return Ok(VersionIdx::new(chunk, offset, slot.generation));
        }

        if self.chunks.last().is_none_or(|chunk| chunk.len() >= ARENA_CHUNK) {
            if self.chunks.len() >= self.max_chunks {
                return Err(MvccError::internal(format!(
                    "version arena full at {} chunks",
                    self.chunks.len()
                )));
            }
            self.chunks.push(Vec::with_capacity(ARENA_CHUNK));
        }

        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let offset = chunk.len();
        chunk.push(ArenaSlot {
            generation: 0,
            version: Some(version),
        });
        self.high_water += 1;
        self.live += 1;

        // Both bounded by `max_chunks` and `ARENA_CHUNK`.
        #[allow(clippy::cast_possible_truncation)]
        Ok(VersionIdx::new(chunk_idx as u32, offset as u32, 0))
    }

    /// Free the slot at `idx`, making it available for reuse.
    ///
    /// # Panics
    ///
    /// Asserts that the slot is currently occupied by this generation
    /// (catches double-free).
    pub fn free(&mut self, idx: VersionIdx) -> Version {
        let slot = &mut self.chunks[idx.chunk as usize][idx.offset as usize];
        assert_eq!(
            slot.generation, idx.generation,
            "VersionArena::free: stale handle {idx}"
        );
        let version = slot
            .version
            .take()
            .unwrap_or_else(|| panic!("VersionArena::free: double-free of {idx}"));
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push((idx.chunk, idx.offset));
        self.live -= 1;
        version
    }

    /// Look up a version by handle.
    #[must_use]
    pub fn get(&self, idx: VersionIdx) -> Option<&Version> {
        let slot = self
            .chunks
            .get(idx.chunk as usize)?
            .get(idx.offset as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        slot.version.as_ref()
    }

    /// Look up a version mutably by handle.
    pub fn get_mut(&mut self, idx: VersionIdx) -> Option<&mut Version> {
        let slot = self
            .chunks
            .get_mut(idx.chunk as usize)?
            .get_mut(idx.offset as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        slot.version.as_mut()
    }

    /// Total slots ever allocated (including freed).
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Versions currently occupying a slot.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}

impl Default for VersionArena {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for VersionArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionArena")
            .field("chunk_count", &self.chunks.len())
            .field("live", &self.live)
            .field("free_count", &self.free_list.len())
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Transaction state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Reading and writing.
    Active,
    /// Validation and timestamp assignment in progress.
    Committing,
    Committed,
    Aborted,
}

impl TransactionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

/// One row write: the version this transaction created and the version it
/// superseded (absent for an insert into an empty chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEntry {
    pub row: RowId,
    pub created: VersionIdx,
    pub superseded: Option<VersionIdx>,
}

/// A running MVCC transaction, owned by the caller.
///
/// The context never owns storage: read and write sets hold arena handles.
/// SSI edges and status live in the shared [`TxnShared`] record so other
/// transactions can mark edges against this one.
#[derive(Debug)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub snapshot: Snapshot,
    pub isolation: IsolationLevel,
    pub read_set: Vec<VersionIdx>,
    pub write_set: Vec<WriteEntry>,
    /// Conflict recorded by a failed write; surfaced again at commit.
    pub(crate) doomed: Option<MvccError>,
    pub(crate) shared: Arc<TxnShared>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<TxnShared>, isolation: IsolationLevel) -> Self {
        Self {
            txn_id: shared.txn_id,
            snapshot: shared.snapshot,
            isolation,
            read_set: Vec::new(),
            write_set: Vec::new(),
            doomed: None,
            shared,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        match self.shared.status() {
            TxnStatus::Active => TransactionState::Active,
            TxnStatus::Committing => TransactionState::Committing,
            TxnStatus::Committed => TransactionState::Committed,
            TxnStatus::Aborted => TransactionState::Aborted,
        }
    }

    /// Whether a failed write has already doomed this transaction.
    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed.is_some()
    }

    /// SSI: some concurrent transaction read a version this one overwrote.
    #[must_use]
    pub fn in_conflict(&self) -> bool {
        self.shared.in_conflict()
    }

    /// SSI: some concurrent transaction overwrote a version this one read.
    #[must_use]
    pub fn out_conflict(&self) -> bool {
        self.shared.out_conflict()
    }

    /// Whether both SSI edge flags are set.
    #[must_use]
    pub fn has_dangerous_structure(&self) -> bool {
        self.in_conflict() && self.out_conflict()
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state == TransactionState::Active {
            Ok(())
        } else {
            Err(MvccError::InvalidTransactionState {
                txn: self.txn_id,
                state: state.as_str(),
            })
        }
    }
}
