//! Core identifier and value types for the ssidb concurrency core.
//!
//! These types are shared by the error crate and the MVCC runtime. They carry
//! no behavior beyond construction, ordering and display.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// TxnId
// ---------------------------------------------------------------------------

/// Monotonically increasing transaction identifier.
///
/// Domain: `1..=(2^62 - 1)`. The top two bits are reserved so that a pending
/// version stamp can carry a `TxnId` in the same `u64` as a committed
/// timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(NonZeroU64);

impl TxnId {
    /// Maximum raw value representable by a real transaction id.
    pub const MAX_RAW: u64 = (1_u64 << 62) - 1;

    /// Construct a `TxnId` if `raw` is in-domain.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.get())
    }
}

impl TryFrom<u64> for TxnId {
    type Error = InvalidTxnId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTxnId { raw: value })
    }
}

/// Error returned when attempting to construct an out-of-domain `TxnId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTxnId {
    raw: u64,
}

impl fmt::Display for InvalidTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid TxnId {} (must satisfy 1 <= id <= {})",
            self.raw,
            TxnId::MAX_RAW
        )
    }
}

impl std::error::Error for InvalidTxnId {}

// ---------------------------------------------------------------------------
// Timestamp / Snapshot
// ---------------------------------------------------------------------------

/// Logical commit time. Totally ordered; assigned only by the commit sequencer.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Timestamp of data loaded before any transaction runs.
    pub const BOOTSTRAP: Self = Self(1);

    /// Largest timestamp that still fits the committed-stamp encoding.
    pub const MAX: Self = Self((1_u64 << 62) - 1);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts#{}", self.get())
    }
}

/// A frozen view of the database taken at BEGIN.
///
/// A committed version with interval `[begin, end)` is visible iff
/// `begin <= snapshot.ts < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub ts: Timestamp,
}

impl Snapshot {
    #[inline]
    pub const fn new(ts: Timestamp) -> Self {
        Self { ts }
    }

    /// Whether a commit at `ts` happened at or before this snapshot.
    #[inline]
    pub fn includes(self, ts: Timestamp) -> bool {
        ts <= self.ts
    }
}

// ---------------------------------------------------------------------------
// TableId / RowId
// ---------------------------------------------------------------------------

/// Catalog-assigned table identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical row address: the key under which a version chain is located.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RowId {
    pub table: TableId,
    pub key: u64,
}

impl RowId {
    #[inline]
    pub const fn new(table: TableId, key: u64) -> Self {
        Self { table, key }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}:{}", self.table, self.key)
    }
}

// ---------------------------------------------------------------------------
// RowData
// ---------------------------------------------------------------------------

/// Immutable row payload. Cloning is a reference-count bump, so readers can
/// hold row contents after the version that produced them has been freed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RowData(Arc<[u8]>);

impl RowData {
    #[inline]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for RowData {
    fn from(value: &[u8]) -> Self {
        Self(Arc::from(value))
    }
}

impl From<Vec<u8>> for RowData {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&str> for RowData {
    fn from(value: &str) -> Self {
        Self(Arc::from(value.as_bytes()))
    }
}

impl fmt::Debug for RowData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "RowData({text:?})"),
            Err(_) => write!(f, "RowData({} bytes)", self.0.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_txn_id_valid_range() {
        assert!(TxnId::new(0).is_none(), "0 must be rejected");
        assert!(TxnId::new(1).is_some(), "1 must be accepted");
        assert!(TxnId::new(TxnId::MAX_RAW).is_some());
        assert!(TxnId::new(TxnId::MAX_RAW + 1).is_none());
        assert!(TxnId::new(u64::MAX).is_none());
    }

    #[test]
    fn test_txn_id_try_from_reports_raw() {
        let err = TxnId::try_from(0).unwrap_err();
        assert!(err.to_string().contains("invalid TxnId 0"));
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(TxnId::new(7).unwrap().to_string(), "txn#7");
        assert_eq!(Timestamp::new(3).to_string(), "ts#3");
        assert_eq!(RowId::new(TableId::new(2), 9).to_string(), "t2:9");
    }

    #[test]
    fn test_snapshot_includes_commits_at_or_before() {
        let snap = Snapshot::new(Timestamp::new(5));
        assert!(snap.includes(Timestamp::new(5)));
        assert!(snap.includes(Timestamp::BOOTSTRAP));
        assert!(!snap.includes(Timestamp::new(6)));
    }

    #[test]
    fn test_row_data_debug_is_readable() {
        assert_eq!(format!("{:?}", RowData::from("a")), "RowData(\"a\")");
        assert_eq!(
            format!("{:?}", RowData::from(vec![0xff, 0xfe])),
            "RowData(2 bytes)"
        );
    }

    proptest! {
        #[test]
        fn prop_timestamp_next_is_successor(raw in 0_u64..Timestamp::MAX.get()) {
            let ts = Timestamp::new(raw);
            prop_assert!(ts < ts.next());
            prop_assert_eq!(ts.next().get(), raw + 1);
        }

        #[test]
        fn prop_txn_id_round_trips_in_domain(raw in 1_u64..=TxnId::MAX_RAW) {
            let id = TxnId::new(raw).unwrap();
            prop_assert_eq!(id.get(), raw);
            prop_assert_eq!(id.get() >> 62, 0);
        }
    }
}
