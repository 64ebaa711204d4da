//! Multi-threaded workloads with garbage collection running underneath.
//!
//! Transfers between accounts keep a global balance invariant; readers scan
//! every account while the periodic collector frees superseded versions.
//! A reader must never observe a torn total or a reclaimed version.

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use ssidb_mvcc::{
    GcConfig, GcMode, IsolationLevel, MvccConfig, MvccError, RowData, RowId, TableId, Timestamp,
    TransactionManager,
};

const ACCOUNTS: u64 = 8;
const INITIAL_BALANCE: i64 = 1_000;
const WRITERS: u64 = 4;
const TRANSFERS_PER_WRITER: u64 = 150;
const READERS: u64 = 2;
const SCANS_PER_READER: u64 = 100;
const MAX_RETRIES: usize = 10_000;
/// Rows past the accounts that writers also delete and re-insert.
const SCRATCH_ROWS: u64 = 4;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn account(key: u64) -> RowId {
    RowId::new(TableId::new(3), key)
}

fn encode(n: i64) -> RowData {
    RowData::from(n.to_string().as_str())
}

fn decode(data: &RowData) -> i64 {
    std::str::from_utf8(data.as_bytes())
        .expect("balance is utf-8")
        .parse()
        .expect("balance is an integer")
}

/// Deterministic per-thread generator (xorshift64*).
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D) % bound
    }
}

fn periodic_config(isolation: IsolationLevel) -> MvccConfig {
    MvccConfig {
        isolation,
        gc: GcConfig {
            mode: GcMode::Periodic,
            interval: Duration::from_millis(1),
            queue_threshold: 8,
            versions_budget: 64,
            ..GcConfig::default()
        },
        ..MvccConfig::default()
    }
}

fn seeded_manager(config: MvccConfig) -> Arc<TransactionManager> {
    let m = TransactionManager::new(config).unwrap();
    for key in 0..ACCOUNTS {
        m.seed_row(account(key), encode(INITIAL_BALANCE)).unwrap();
    }
    Arc::new(m)
}

/// Move `amount` from `from` to `to`. `Ok(false)` means the attempt aborted
/// and should be retried.
fn transfer(m: &TransactionManager, from: u64, to: u64, amount: i64) -> Result<bool, MvccError> {
    let mut txn = m.begin()?;
    let step = (|| -> Result<(), MvccError> {
        let a = m.read(&mut txn, account(from))?.expect("account exists");
        let b = m.read(&mut txn, account(to))?.expect("account exists");
        m.write(&mut txn, account(from), encode(decode(&a) - amount))?;
        m.write(&mut txn, account(to), encode(decode(&b) + amount))?;
        Ok(())
    })();

    match step {
        Ok(()) => {}
        Err(MvccError::WriteConflict { .. }) => {
            m.abort(&mut txn);
            return Ok(false);
        }
        Err(err) => return Err(err),
    }
    match m.commit(&mut txn) {
        Ok(_) => Ok(true),
        Err(err) if err.is_transient() => Ok(false),
        Err(err) => Err(err),
    }
}

fn total(m: &TransactionManager) -> i64 {
    let mut txn = m.begin().unwrap();
    let mut sum = 0;
    for key in 0..ACCOUNTS {
        sum += decode(&m.read(&mut txn, account(key)).unwrap().expect("account exists"));
    }
    // Read-only SSI commits may still be refused; the view was consistent.
    let _ = m.commit(&mut txn);
    sum
}

fn run_bank(isolation: IsolationLevel) -> (Arc<TransactionManager>, u64) {
    let m = seeded_manager(periodic_config(isolation));
    let retries = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let m = Arc::clone(&m);
        let retries = Arc::clone(&retries);
        handles.push(thread::spawn(move || {
            let mut rng = Rng::new(0x5EED_0000 + w);
            for _ in 0..TRANSFERS_PER_WRITER {
                let from = rng.below(ACCOUNTS);
                let to = (from + 1 + rng.below(ACCOUNTS - 1)) % ACCOUNTS;
                let amount = i64::try_from(rng.below(50)).unwrap() + 1;
                let mut done = false;
                for _ in 0..MAX_RETRIES {
                    if transfer(&m, from, to, amount).unwrap() {
                        done = true;
                        break;
                    }
                    retries.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                }
                assert!(done, "transfer starved after {MAX_RETRIES} attempts");
            }
        }));
    }
    for _ in 0..READERS {
        let m = Arc::clone(&m);
        handles.push(thread::spawn(move || {
            for _ in 0..SCANS_PER_READER {
                let expected = i64::try_from(ACCOUNTS).unwrap() * INITIAL_BALANCE;
                assert_eq!(total(&m), expected);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let retries = retries.load(Ordering::Relaxed);
    (m, retries)
}

/// One writer attempt: one to three writes or deletes, then a commit or a
/// deliberate abort. A conflict ends the attempt early.
fn churn_once(m: &TransactionManager, rng: &mut Rng) {
    let mut txn = m.begin().unwrap();
    for _ in 0..=rng.below(3) {
        let key = rng.below(ACCOUNTS + SCRATCH_ROWS);
        let result = if key >= ACCOUNTS && rng.below(2) == 0 {
            m.delete(&mut txn, account(key))
        } else {
            let value = i64::try_from(rng.below(1_000)).unwrap();
            m.write(&mut txn, account(key), encode(value))
        };
        if result.is_err() {
            m.abort(&mut txn);
            return;
        }
    }
    if rng.below(3) == 0 {
        m.abort(&mut txn);
    } else {
        let _ = m.commit(&mut txn);
    }
}

/// Read every row once.
fn scan(m: &TransactionManager, txn: &mut ssidb_mvcc::Transaction) -> Vec<Option<RowData>> {
    (0..ACCOUNTS + SCRATCH_ROWS)
        .map(|key| m.read(txn, account(key)).unwrap())
        .collect()
}

fn drain_gc(m: &TransactionManager) {
    for _ in 0..1_000 {
        if m.gc_queue_len() == 0 {
            return;
        }
        m.gc_pass();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_bank_transfers_preserve_total_under_ssi() {
    let (m, _retries) = run_bank(IsolationLevel::Serializable);
    let expected = i64::try_from(ACCOUNTS).unwrap() * INITIAL_BALANCE;
    assert_eq!(total(&m), expected);

    let metrics = m.metrics();
    assert_eq!(metrics.commits, WRITERS * TRANSFERS_PER_WRITER);
    assert_eq!(metrics.aborts_durability, 0);
}

#[test]
fn test_bank_transfers_preserve_total_under_snapshot_isolation() {
    let (m, _retries) = run_bank(IsolationLevel::Snapshot);
    let expected = i64::try_from(ACCOUNTS).unwrap() * INITIAL_BALANCE;
    assert_eq!(total(&m), expected);
    assert_eq!(m.metrics().aborts_pivot, 0);
    assert_eq!(m.metrics().aborts_committed_pivot, 0);
}

#[test]
fn test_quiescent_gc_collapses_every_chain() {
    let (m, _retries) = run_bank(IsolationLevel::Serializable);
    m.stop_gc_runner();
    assert_eq!(m.active_transactions(), 0);
    drain_gc(&m);

    assert_eq!(m.gc_queue_len(), 0);
    for key in 0..ACCOUNTS {
        let chain = m.version_store().walk_chain(account(key));
        assert_eq!(chain.len(), 1, "account {key} still has {} versions", chain.len());
    }
    assert_eq!(m.version_store().live_version_count(), usize::try_from(ACCOUNTS).unwrap());
    assert!(m.metrics().versions_freed > 0);
    assert!(m.metrics().txn_records_pruned > 0);
}

#[test]
fn test_pinned_reader_blocks_reclamation_of_its_versions() {
    let m = seeded_manager(MvccConfig::cooperative_gc(1));
    let mut pinned = m.begin().unwrap();

    for round in 0..20 {
        let mut w = m.begin().unwrap();
        m.write(&mut w, account(0), encode(round)).unwrap();
        m.commit(&mut w).unwrap();
    }

    let seen = m.read(&mut pinned, account(0)).unwrap().unwrap();
    assert_eq!(decode(&seen), INITIAL_BALANCE);
    assert!(m.version_store().walk_chain(account(0)).len() > 1);
    m.commit(&mut pinned).unwrap();

    m.gc_pass();
    assert_eq!(m.version_store().walk_chain(account(0)).len(), 1);
    let mut latest = m.begin().unwrap();
    assert_eq!(decode(&m.read(&mut latest, account(0)).unwrap().unwrap()), 19);
}

#[test]
fn test_hot_row_increments_are_not_lost() {
    let m = seeded_manager(periodic_config(IsolationLevel::Serializable));
    let threads = 4_u64;
    let per_thread = 100_u64;
    let start = Arc::new(Barrier::new(usize::try_from(threads).unwrap()));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let m = Arc::clone(&m);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..per_thread {
                    loop {
                        let mut txn = m.begin().unwrap();
                        let current = decode(&m.read(&mut txn, account(0)).unwrap().unwrap());
                        if m.write(&mut txn, account(0), encode(current + 1)).is_err() {
                            m.abort(&mut txn);
                            thread::yield_now();
                            continue;
                        }
                        if m.commit(&mut txn).is_ok() {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut check = m.begin().unwrap();
    let value = decode(&m.read(&mut check, account(0)).unwrap().unwrap());
    assert_eq!(value, INITIAL_BALANCE + i64::try_from(threads * per_thread).unwrap());
}

#[test]
fn test_random_aborts_never_reclaim_versions_in_use() {
    let m = seeded_manager(periodic_config(IsolationLevel::Serializable));
    // Snapshot of every scanning reader, keyed by raw txn id.
    let live: Arc<Mutex<HashMap<u64, Timestamp>>> = Arc::default();
    let done = Arc::new(AtomicBool::new(false));

    let mut workers = Vec::new();
    for w in 0..3_u64 {
        let m = Arc::clone(&m);
        workers.push(thread::spawn(move || {
            let mut rng = Rng::new(0xAB07_0000 + w);
            for _ in 0..400 {
                churn_once(&m, &mut rng);
            }
        }));
    }
    for r in 0..2_u64 {
        let m = Arc::clone(&m);
        let live = Arc::clone(&live);
        workers.push(thread::spawn(move || {
            let mut rng = Rng::new(0x0EAD_0000 + r);
            for _ in 0..150 {
                let mut txn = m.begin().unwrap();
                live.lock().insert(txn.txn_id.get(), txn.snapshot.ts);
                let first = scan(&m, &mut txn);
                for _ in 0..rng.below(4) {
                    thread::yield_now();
                }
                for &idx in &txn.read_set {
                    assert!(
                        m.version_store().is_allocated(idx),
                        "{idx} freed under snapshot {}",
                        txn.snapshot.ts
                    );
                }
                assert_eq!(scan(&m, &mut txn), first, "snapshot moved");
                live.lock().remove(&txn.txn_id.get());
                let _ = m.commit(&mut txn);
            }
        }));
    }

    let watcher = {
        let m = Arc::clone(&m);
        let live = Arc::clone(&live);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut passes = 0_u64;
            while !done.load(Ordering::Acquire) {
                let before = live.lock().clone();
                let result = m.gc_pass();
                let after = live.lock().clone();
                // Readers present on both sides were active for the whole pass.
                for (id, snapshot) in before.iter().filter(|(id, _)| after.contains_key(id)) {
                    assert!(
                        result.watermark <= *snapshot,
                        "watermark {} passed live snapshot {snapshot} of txn {id}",
                        result.watermark
                    );
                }
                passes += 1;
                thread::yield_now();
            }
            passes
        })
    };

    for h in workers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(watcher.join().unwrap() > 0);

    m.stop_gc_runner();
    assert_eq!(m.active_transactions(), 0);
    drain_gc(&m);
    m.gc_pass();
    assert_eq!(m.registry().record_count(), 0);
    assert!(m.metrics().aborts_user > 0);
    for key in 0..ACCOUNTS {
        assert_eq!(m.version_store().walk_chain(account(key)).len(), 1);
    }
}
