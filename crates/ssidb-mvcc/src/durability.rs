//! Commit log seam.
//!
//! A writer's commit record is appended before any of its versions are
//! stamped, so nothing becomes visible that the log did not accept. An
//! append error aborts the transaction.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use ssidb_types::{RowId, Timestamp, TxnId};

/// Final image of one row in a commit. `data = None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedWrite {
    pub row: RowId,
    pub data: Option<Vec<u8>>,
}

/// What a committed transaction changed and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub txn_id: TxnId,
    pub commit_ts: Timestamp,
    /// One entry per row, in first-write order.
    pub writes: SmallVec<[LoggedWrite; 8]>,
    pub timestamp_unix_ns: u64,
}

impl CommitRecord {
    #[must_use]
    pub fn new(txn_id: TxnId, commit_ts: Timestamp, writes: SmallVec<[LoggedWrite; 8]>) -> Self {
        let timestamp_unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        Self {
            txn_id,
            commit_ts,
            writes,
            timestamp_unix_ns,
        }
    }
}

/// Durable commit log.
pub trait CommitLogSink: Send + Sync {
    /// Persist `record`. Returning `Ok` means the commit may become visible.
    ///
    /// # Errors
    ///
    /// Any I/O error aborts the committing transaction.
    fn append(&self, record: &CommitRecord) -> io::Result<()>;
}

/// Accepts every record without storing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl CommitLogSink for NoopLog {
    fn append(&self, _record: &CommitRecord) -> io::Result<()> {
        Ok(())
    }
}

/// Writes each record as one JSON line and flushes.
#[derive(Debug)]
pub struct JsonLinesLog<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesLog<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesLog<io::Stdout> {
    /// Log to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> CommitLogSink for JsonLinesLog<W> {
    fn append(&self, record: &CommitRecord) -> io::Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// Keeps records in memory; can be told to reject the next appends.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<CommitRecord>>,
    fail_next: AtomicUsize,
}

impl MemoryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` appends with an I/O error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn records(&self) -> Vec<CommitRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl CommitLogSink for MemoryLog {
    fn append(&self, record: &CommitRecord) -> io::Result<()> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::other("commit log unavailable"));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}
