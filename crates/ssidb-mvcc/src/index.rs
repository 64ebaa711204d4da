//! Seam to secondary-index maintenance.
//!
//! Indexes point at versions. A committed version is announced with
//! [`IndexMaintainer::entry_added`]; before the garbage collector frees a
//! version it must hear back from [`IndexMaintainer::entry_removed`]. A
//! failed removal keeps the version allocated and queued.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use ssidb_types::RowId;

use crate::core_types::VersionIdx;

/// Why an index entry could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("index entry for {row} ({version}) not removed: {reason}")]
pub struct IndexError {
    pub row: RowId,
    pub version: VersionIdx,
    pub reason: String,
}

/// Index maintenance callbacks.
///
/// `entry_removed` may be called for a version that was never announced
/// (versions of aborted transactions), and must treat that as success.
pub trait IndexMaintainer: Send + Sync {
    fn entry_added(&self, row: RowId, version: VersionIdx);

    /// # Errors
    ///
    /// Returns [`IndexError`] if the entry could not be removed now.
    fn entry_removed(&self, row: RowId, version: VersionIdx) -> Result<(), IndexError>;
}

/// No secondary indexes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndex;

impl IndexMaintainer for NoopIndex {
    fn entry_added(&self, _row: RowId, _version: VersionIdx) {}

    fn entry_removed(&self, _row: RowId, _version: VersionIdx) -> Result<(), IndexError> {
        Ok(())
    }
}

/// In-memory index that records entries and can be told to refuse removals.
#[derive(Debug, Default)]
pub struct RecordingIndex {
    entries: Mutex<HashMap<VersionIdx, RowId>>,
    removed: Mutex<HashSet<VersionIdx>>,
    fail_removals: AtomicUsize,
}

impl RecordingIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` removals fail.
    pub fn fail_next_removals(&self, count: usize) {
        self.fail_removals.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn contains(&self, version: VersionIdx) -> bool {
        self.entries.lock().contains_key(&version)
    }

    #[must_use]
    pub fn was_removed(&self, version: VersionIdx) -> bool {
        self.removed.lock().contains(&version)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl IndexMaintainer for RecordingIndex {
    fn entry_added(&self, row: RowId, version: VersionIdx) {
        self.entries.lock().insert(version, row);
    }

    fn entry_removed(&self, row: RowId, version: VersionIdx) -> Result<(), IndexError> {
        let fail = self
            .fail_removals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(IndexError {
                row,
                version,
                reason: "injected failure".to_owned(),
            });
        }
        self.entries.lock().remove(&version);
        self.removed.lock().insert(version);
        Ok(())
    }
}
