//! Transaction lifecycle: begin, read, write, commit, abort.
//!
//! [`TransactionManager`] owns the shared infrastructure (timestamp
//! sequencer, version store, transaction registry, garbage collector and
//! the log/index seams) and drives each caller-owned [`Transaction`]
//! through its state machine.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use ssidb_error::{AbortReason, MvccError, Result};
use ssidb_types::{RowData, RowId, Timestamp, TxnId};

use crate::config::{GcMode, IsolationLevel, MvccConfig, SsiPolicy};
use crate::core_types::{Transaction, TransactionState, VersionIdx, WriteEntry};
use crate::durability::{CommitLogSink, CommitRecord, LoggedWrite, NoopLog};
use crate::gc::{GarbageCollector, GcPassResult, GcRunner, RetireKind, RetiredVersion};
use crate::index::{IndexMaintainer, NoopIndex};
use crate::invariants::{CommitClock, VersionStore};
use crate::metrics::{MvccMetrics, MvccMetricsSnapshot};
use crate::registry::{TxnRegistry, TxnShared};
use crate::ssi;

/// Orchestrates the full transaction lifecycle.
pub struct TransactionManager {
    config: MvccConfig,
    clock: Arc<CommitClock>,
    version_store: Arc<VersionStore>,
    registry: Arc<TxnRegistry>,
    gc: Arc<GarbageCollector>,
    gc_runner: Mutex<Option<GcRunner>>,
    commit_mutex: Mutex<()>,
    log: Arc<dyn CommitLogSink>,
    index: Arc<dyn IndexMaintainer>,
    metrics: Arc<MvccMetrics>,
    /// Creator recorded on bootstrap versions.
    bootstrap_txn: TxnId,
}

impl TransactionManager {
    /// Create a manager with no commit log and no secondary indexes.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::with_components`].
    pub fn new(config: MvccConfig) -> Result<Self> {
        Self::with_components(config, Arc::new(NoopLog), Arc::new(NoopIndex))
    }

    /// Create a manager wired to a commit log and an index maintainer.
    ///
    /// With [`GcMode::Periodic`] the background GC thread is started here.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::Internal`] if the GC thread cannot be spawned.
    pub fn with_components(
        config: MvccConfig,
        log: Arc<dyn CommitLogSink>,
        index: Arc<dyn IndexMaintainer>,
    ) -> Result<Self> {
        let metrics = Arc::new(MvccMetrics::new());
        let clock = Arc::new(CommitClock::default());
        let bootstrap_txn = clock.next_txn_id().ok_or(MvccError::TxnIdExhausted)?;
        let version_store = Arc::new(VersionStore::new(Arc::clone(&metrics)));
        let registry = Arc::new(TxnRegistry::new());
        let gc = Arc::new(GarbageCollector::new(
            config.gc.clone(),
            Arc::clone(&version_store),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::clone(&index),
            Arc::clone(&metrics),
        ));

        let runner = if config.gc.mode == GcMode::Periodic {
            Some(GcRunner::start(Arc::clone(&gc)).map_err(|err| {
                MvccError::internal(format!("failed to start gc runner: {err}"))
            })?)
        } else {
            None
        };

        info!(
            isolation = ?config.isolation,
            ssi_policy = ?config.ssi_policy,
            gc_mode = ?config.gc.mode,
            "transaction manager created"
        );

        Ok(Self {
            config,
            clock,
            version_store,
            registry,
            gc,
            gc_runner: Mutex::new(runner),
            commit_mutex: Mutex::new(()),
            log,
            index,
            metrics,
            bootstrap_txn,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MvccConfig {
        &self.config
    }

    /// Isolation level for transactions begun from now on.
    pub fn set_isolation(&mut self, isolation: IsolationLevel) {
        self.config.isolation = isolation;
    }

    /// Commit-time SSI rule.
    pub fn set_ssi_policy(&mut self, policy: SsiPolicy) {
        self.config.ssi_policy = policy;
    }

    /// Install bootstrap contents for an empty row, visible to every
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::Internal`] if the row already has versions.
    pub fn seed_row(&self, row: RowId, data: RowData) -> Result<()> {
        self.version_store
            .seed(row, data, self.bootstrap_txn, Timestamp::BOOTSTRAP)?;
        debug!(row = %row, "row seeded");
        Ok(())
    }

    /// Begin a new transaction with a snapshot of all finished commits.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::TxnIdExhausted`] if the id space is exhausted.
    pub fn begin(&self) -> Result<Transaction> {
        let txn_id = self.clock.next_txn_id().ok_or(MvccError::TxnIdExhausted)?;
        let shared = self.registry.begin(txn_id, || self.clock.stable_ts());
        self.metrics.record_begin();

        info!(
            txn_id = %txn_id,
            snapshot_ts = shared.snapshot.ts.get(),
            isolation = ?self.config.isolation,
            "transaction begun"
        );
        Ok(Transaction::new(shared, self.config.isolation))
    }

    /// Read `row` as of the transaction's snapshot, including its own
    /// uncommitted writes. `Ok(None)` means no visible version, or a
    /// visible delete.
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::InvalidTransactionState`] if `txn` is not active.
    pub fn read(&self, txn: &mut Transaction, row: RowId) -> Result<Option<RowData>> {
        txn.ensure_active()?;
        let serializable = txn.isolation == IsolationLevel::Serializable;
        let read = self
            .version_store
            .resolve(row, txn.snapshot, txn.txn_id, serializable);

        if let Some(idx) = read.version {
            txn.read_set.push(idx);
        }
        if serializable {
            if let Some(writer) = read.overwritten_by {
                self.mark_edge_to_writer(&txn.shared, writer);
            }
        }

        debug!(
            txn_id = %txn.txn_id,
            row = %row,
            found = read.data.is_some(),
            versions_traversed = read.versions_traversed,
            "row read"
        );
        Ok(read.data)
    }

    /// Write a new image of `row` (insert or update).
    ///
    /// # Errors
    ///
    /// Returns [`MvccError::WriteConflict`] if another transaction holds or
    /// has replaced the row; the transaction is then doomed and its commit
    /// will abort. Returns [`MvccError::InvalidTransactionState`] if `txn`
    /// is not active.
    pub fn write(&self, txn: &mut Transaction, row: RowId, data: RowData) -> Result<()> {
        self.write_version(txn, row, Some(data))
    }

    /// Delete `row` by writing a tombstone.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionManager::write`].
    pub fn delete(&self, txn: &mut Transaction, row: RowId) -> Result<()> {
        self.write_version(txn, row, None)
    }

    fn write_version(&self, txn: &mut Transaction, row: RowId, data: Option<RowData>) -> Result<()> {
        txn.ensure_active()?;
        if let Some(err) = &txn.doomed {
            return Err(err.clone());
        }

        let tombstone = data.is_none();
        let outcome = match self.version_store.install(
            row,
            data,
            txn.txn_id,
            txn.snapshot,
            self.config.max_install_retries,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(txn_id = %txn.txn_id, row = %row, error = %err, "write conflict; transaction doomed");
                txn.doomed = Some(err.clone());
                return Err(err);
            }
        };

        txn.write_set.push(WriteEntry {
            row,
            created: outcome.created,
            superseded: outcome.superseded,
        });

        for &reader in &outcome.readers {
            if reader == txn.txn_id {
                continue;
            }
            if let Some(record) = self.registry.get(reader) {
                if record.overlaps(&txn.shared) {
                    ssi::mark_rw_edge(&record, &txn.shared, &self.metrics);
                }
            }
        }

        debug!(
            txn_id = %txn.txn_id,
            row = %row,
            tombstone,
            cas_attempts = outcome.cas_attempts,
            "row written"
        );
        Ok(())
    }

    /// Record `reader -rw-> writer` found while reading, unless the writer
    /// is gone or aborted.
    fn mark_edge_to_writer(&self, reader: &TxnShared, writer: TxnId) {
        if let Some(record) = self.registry.get(writer) {
            if record.overlaps(reader) {
                ssi::mark_rw_edge(reader, &record, &self.metrics);
            }
        }
    }

    /// Commit a transaction.
    ///
    /// Validation, timestamp assignment, the log append and version stamping
    /// run under the commit mutex. A read-only transaction commits at its
    /// snapshot timestamp.
    ///
    /// # Errors
    ///
    /// - [`MvccError::WriteConflict`]: an earlier write failed; aborted.
    /// - [`MvccError::SerializationFailure`]: SSI validation failed; aborted.
    /// - [`MvccError::DurabilityFailure`]: the log rejected the record; aborted.
    /// - [`MvccError::Internal`]: the write set could not be stamped; aborted
    ///   and its timestamp left as a gap.
    /// - [`MvccError::InvalidTransactionState`]: `txn` is not active.
    pub fn commit(&self, txn: &mut Transaction) -> Result<Timestamp> {
        txn.ensure_active()?;
        let txn_id = txn.txn_id;

        if let Some(err) = txn.doomed.clone() {
            self.finish_abort(txn, AbortReason::WriteConflict);
            return Err(err);
        }

        txn.shared.set_committing();
        let commit_guard = self.commit_mutex.lock();

        if txn.isolation == IsolationLevel::Serializable {
            if let Err(reason) =
                ssi::validate_commit(&txn.shared, &self.registry, self.config.ssi_policy)
            {
                drop(commit_guard);
                self.finish_abort(txn, AbortReason::Serialization(reason));
                return Err(MvccError::SerializationFailure { txn: txn_id, reason });
            }
        }

        if txn.write_set.is_empty() {
            txn.shared.mark_committed(self.clock.stable_ts(), false);
            drop(commit_guard);
            txn.shared.stash_reads(&txn.read_set);
            self.deactivate(txn_id);
            self.metrics.record_commit(true);
            info!(
                txn_id = %txn_id,
                reads = txn.read_set.len(),
                "read-only transaction committed"
            );
            return Ok(txn.snapshot.ts);
        }

        let commit_ts = match self.clock.reserve_commit_ts() {
            Ok(ts) => ts,
            Err(err) => {
                drop(commit_guard);
                self.finish_abort(txn, AbortReason::Durability);
                return Err(err);
            }
        };

        let record = self.commit_record(txn, commit_ts);
        if let Err(io_err) = self.log.append(&record) {
            self.clock.release_commit_ts(commit_ts);
            drop(commit_guard);
            error!(txn_id = %txn_id, commit_ts = commit_ts.get(), error = %io_err, "commit log append failed");
            self.finish_abort(txn, AbortReason::Durability);
            return Err(MvccError::DurabilityFailure {
                txn: txn_id,
                detail: io_err.to_string(),
            });
        }

        if let Err(err) = self
            .version_store
            .commit_writes(txn_id, &txn.write_set, commit_ts)
        {
            error!(txn_id = %txn_id, commit_ts = commit_ts.get(), error = %err, "failed to stamp logged commit");
            // Unstamp before the timestamp can become stable.
            self.version_store
                .unstamp_writes(txn_id, &txn.write_set, commit_ts);
            self.finish_abort(txn, AbortReason::Internal);
            self.clock.release_commit_ts(commit_ts);
            drop(commit_guard);
            return Err(err);
        }
        txn.shared.mark_committed(commit_ts, true);
        self.clock.release_commit_ts(commit_ts);
        drop(commit_guard);

        txn.shared.stash_reads(&txn.read_set);
        self.deactivate(txn_id);
        self.publish_committed(txn, commit_ts);
        self.metrics.record_commit(false);

        info!(
            txn_id = %txn_id,
            commit_ts = commit_ts.get(),
            writes = txn.write_set.len(),
            "transaction committed"
        );
        Ok(commit_ts)
    }

    /// Abort a transaction, undoing its writes.
    ///
    /// A no-op on a transaction that already committed or aborted.
    pub fn abort(&self, txn: &mut Transaction) {
        if txn.state() != TransactionState::Active {
            return;
        }
        self.finish_abort(txn, AbortReason::User);
    }

    fn finish_abort(&self, txn: &mut Transaction, reason: AbortReason) {
        let txn_id = txn.txn_id;
        let stable = self.clock.stable_ts();
        txn.shared.mark_aborted(stable);
        self.version_store.unregister_reader(txn_id, &txn.read_set);

        if !txn.write_set.is_empty() {
            self.version_store.rollback_writes(txn_id, &txn.write_set);
            self.gc.retire(txn.write_set.iter().map(|entry| RetiredVersion {
                row: entry.row,
                version: entry.created,
                end_ts: stable,
                retired_by: txn_id,
                kind: RetireKind::Aborted,
            }));
        }

        self.deactivate(txn_id);
        self.metrics.record_abort(reason);
        info!(
            txn_id = %txn_id,
            ?reason,
            writes = txn.write_set.len(),
            "transaction aborted"
        );
    }

    /// Final image of each written row, in first-write order.
    fn commit_record(&self, txn: &Transaction, commit_ts: Timestamp) -> CommitRecord {
        let mut writes: SmallVec<[LoggedWrite; 8]> = SmallVec::new();
        let mut rows: Vec<(RowId, VersionIdx)> = Vec::new();
        for entry in &txn.write_set {
            match rows.iter_mut().find(|(row, _)| *row == entry.row) {
                Some((_, last)) => *last = entry.created,
                None => rows.push((entry.row, entry.created)),
            }
        }
        for (row, idx) in rows {
            let data = self
                .version_store
                .row_data(idx)
                .flatten()
                .map(|d| d.as_bytes().to_vec());
            writes.push(LoggedWrite { row, data });
        }
        CommitRecord::new(txn.txn_id, commit_ts, writes)
    }

    /// Announce the committed row images to the index, retire every
    /// version this commit superseded, and queue final tombstones so their
    /// rows can be dropped.
    fn publish_committed(&self, txn: &Transaction, commit_ts: Timestamp) {
        let superseded: HashSet<VersionIdx> =
            txn.write_set.iter().filter_map(|e| e.superseded).collect();
        let mut deleted = Vec::new();
        for entry in &txn.write_set {
            if superseded.contains(&entry.created) {
                continue;
            }
            if matches!(self.version_store.row_data(entry.created), Some(None)) {
                deleted.push((entry.row, entry.created));
            } else {
                self.index.entry_added(entry.row, entry.created);
            }
        }

        let retired = |row, version, kind| RetiredVersion {
            row,
            version,
            end_ts: commit_ts,
            retired_by: txn.txn_id,
            kind,
        };
        let replaced = txn.write_set.iter().filter_map(|entry| {
            entry
                .superseded
                .map(|version| retired(entry.row, version, RetireKind::Superseded))
        });
        let tombstones = deleted
            .into_iter()
            .map(|(row, version)| retired(row, version, RetireKind::Deleted));
        self.gc.retire(replaced.chain(tombstones));
    }

    /// Leave the active set, pruning finished records once enough have
    /// piled up.
    fn deactivate(&self, txn_id: TxnId) {
        if self.registry.deactivate(txn_id) {
            self.gc.prune_records();
        }
    }

    /// Run one GC pass now, regardless of mode.
    pub fn gc_pass(&self) -> GcPassResult {
        self.gc.collect()
    }

    /// Stop the background GC thread, if running.
    pub fn stop_gc_runner(&self) {
        if let Some(mut runner) = self.gc_runner.lock().take() {
            runner.stop();
        }
    }

    #[must_use]
    pub fn gc_runner_running(&self) -> bool {
        self.gc_runner
            .lock()
            .as_ref()
            .is_some_and(GcRunner::is_running)
    }

    /// Oldest snapshot timestamp still in use.
    #[must_use]
    pub fn watermark(&self) -> Timestamp {
        self.registry.watermark(self.clock.stable_ts())
    }

    /// Snapshot new transactions would receive right now.
    #[must_use]
    pub fn stable_commit_ts(&self) -> Timestamp {
        self.clock.stable_ts()
    }

    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.registry.active_count()
    }

    #[must_use]
    pub fn metrics(&self) -> MvccMetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn version_store(&self) -> &VersionStore {
        &self.version_store
    }

    #[must_use]
    pub fn registry(&self) -> &TxnRegistry {
        &self.registry
    }

    #[must_use]
    pub fn gc_queue_len(&self) -> usize {
        self.gc.queue_len()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("registry", &self.registry)
            .field("gc", &self.gc)
            .finish_non_exhaustive()
    }
}
