//! Multi-version concurrency control for row stores.
//!
//! Version chains per row, snapshot reads, first-writer-wins write
//! conflicts, serializable snapshot isolation via rw-antidependency
//! tracking, and watermark-driven reclamation of dead versions.

pub mod config;
pub mod core_types;
pub mod durability;
pub mod gc;
pub mod index;
pub mod invariants;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
pub mod ssi;

pub use config::{GC_VERSIONS_BUDGET, GcConfig, GcMode, IsolationLevel, MvccConfig, SsiPolicy};
pub use core_types::{
    Stamp, Transaction, TransactionState, Version, VersionArena, VersionIdx, VersionState,
    WriteEntry,
};
pub use durability::{CommitLogSink, CommitRecord, JsonLinesLog, LoggedWrite, MemoryLog, NoopLog};
pub use gc::{
    GarbageCollector, GcPassResult, GcRunner, GcScheduler, RetireKind, RetiredQueue,
    RetiredVersion,
};
pub use index::{IndexError, IndexMaintainer, NoopIndex, RecordingIndex};
pub use invariants::{
    ChainEntry, CommitClock, HeadSwap, HeadTable, InstallOutcome, ResolvedRead,
    TombstoneCollapse, VersionStore, VersionVisibilityRange, visible_to,
};
pub use lifecycle::TransactionManager;
pub use metrics::{CasRetriesHistogram, MvccMetrics, MvccMetricsSnapshot};
pub use registry::{RECORD_PRUNE_INTERVAL, SsiState, TxnRegistry, TxnShared, TxnStatus};
pub use ssi::{mark_rw_edge, validate_commit};

pub use ssidb_error::{AbortReason, ErrorCode, Holder, MvccError, Result, SsiAbortReason};
pub use ssidb_types::{RowData, RowId, Snapshot, TableId, Timestamp, TxnId};
