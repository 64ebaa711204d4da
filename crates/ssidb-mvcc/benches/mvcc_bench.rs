//! Criterion micro-benchmarks for MVCC operations.
//!
//! Benchmarks:
//! - Version arena alloc/free cycle
//! - Chain head insert on fresh rows (uncontended)
//! - Snapshot read through chains of increasing length
//! - Write/commit round trip, with and without SSI
//! - GC pass over a batch of superseded versions

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use ssidb_mvcc::{
    HeadTable, IsolationLevel, MvccConfig, MvccMetrics, RowData, RowId, TableId, Timestamp,
    TransactionManager, TxnId, Version, VersionArena, VersionStore,
};

fn criterion_config() -> Criterion {
    Criterion::default().configure_from_args()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row(key: u64) -> RowId {
    RowId::new(TableId::new(1), key)
}

fn txn(n: u64) -> TxnId {
    TxnId::new(n).unwrap()
}

fn payload() -> RowData {
    RowData::from(&[0xAB_u8; 64][..])
}

/// Manager whose row 0 has `depth` committed versions.
fn manager_with_chain(depth: u64, isolation: IsolationLevel) -> TransactionManager {
    chain_under(MvccConfig::without_gc(), depth, isolation)
}

fn chain_under(config: MvccConfig, depth: u64, isolation: IsolationLevel) -> TransactionManager {
    let mut m = TransactionManager::new(config).expect("manager");
    m.set_isolation(isolation);
    m.seed_row(row(0), payload()).expect("seed");
    for _ in 1..depth {
        let mut w = m.begin().expect("begin");
        m.write(&mut w, row(0), payload()).expect("write");
        m.commit(&mut w).expect("commit");
    }
    m
}

// ---------------------------------------------------------------------------
// Storage benchmarks
// ---------------------------------------------------------------------------

/// Benchmark: allocate and free one version slot.
fn bench_arena_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena/alloc_free");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        let mut arena = VersionArena::new();
        b.iter(|| {
            let idx = arena
                .alloc(Version::committed(row(1), Some(payload()), txn(1), Timestamp::BOOTSTRAP))
                .unwrap();
            black_box(arena.free(idx));
        });
    });

    group.finish();
}

/// Benchmark: CAS-install a head on fresh rows.
fn bench_chain_head_install(c: &mut Criterion) {
    let mut group = c.benchmark_group("heads/insert");
    group.sample_size(50);

    for &rows in &[100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(rows));
        group.bench_with_input(BenchmarkId::new("rows", rows), &rows, |b, &count| {
            b.iter_batched(
                || {
                    let mut arena = VersionArena::new();
                    let idx = arena
                        .alloc(Version::pending(row(0), Some(payload()), txn(1), None))
                        .unwrap();
                    (HeadTable::new(), idx)
                },
                |(table, idx)| {
                    for key in 0..count {
                        black_box(table.swap_head(row(key), idx, None));
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Transaction benchmarks
// ---------------------------------------------------------------------------

/// Benchmark: snapshot read where the visible version sits at the tail.
fn bench_read_chain_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("read/chain_depth");
    group.measurement_time(Duration::from_secs(5));

    for &depth in &[1_u64, 8, 64] {
        let m = manager_with_chain(depth, IsolationLevel::Snapshot);
        let store = m.version_store();
        let oldest = ssidb_mvcc::Snapshot::new(Timestamp::BOOTSTRAP);
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, _| {
            b.iter(|| black_box(store.resolve(row(0), oldest, txn(u64::MAX >> 3), false)));
        });
    }

    group.finish();
}

/// Benchmark: begin, read, write, commit on a private row.
fn bench_write_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("txn/write_commit");
    group.throughput(Throughput::Elements(1));

    for isolation in [IsolationLevel::Snapshot, IsolationLevel::Serializable] {
        let m = manager_with_chain(1, isolation);
        group.bench_function(format!("{isolation:?}"), |b| {
            b.iter(|| {
                let mut t = m.begin().unwrap();
                black_box(m.read(&mut t, row(0)).unwrap());
                m.write(&mut t, row(0), payload()).unwrap();
                black_box(m.commit(&mut t).unwrap());
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// GC benchmarks
// ---------------------------------------------------------------------------

/// Benchmark: one GC pass reclaiming `n` superseded versions.
fn bench_gc_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc/pass");
    group.sample_size(20);

    for &n in &[64_u64, 1_024] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::new("superseded", n), &n, |b, &count| {
            b.iter_batched(
                || {
                    // Queue everything; the measured pass does the reclaiming.
                    let config = MvccConfig::cooperative_gc(usize::MAX);
                    chain_under(config, count + 1, IsolationLevel::Snapshot)
                },
                |m| black_box(m.gc_pass()),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark: store-level resolve with reader registration.
fn bench_resolve_register_reader(c: &mut Criterion) {
    let store = VersionStore::new(Arc::new(MvccMetrics::new()));
    store
        .seed(row(0), payload(), txn(1), Timestamp::BOOTSTRAP)
        .unwrap();
    let snapshot = ssidb_mvcc::Snapshot::new(Timestamp::BOOTSTRAP);

    c.bench_function("read/register_reader", |b| {
        // Cycle within the inline reader capacity.
        let mut n = 0_u64;
        b.iter(|| {
            n = (n + 1) % 4;
            black_box(store.resolve(row(0), snapshot, txn(n + 2), true))
        });
    });
}

criterion_group!(
    name = benches;
    config = criterion_config();
    targets =
        bench_arena_alloc_free,
        bench_chain_head_install,
        bench_read_chain_depth,
        bench_write_commit,
        bench_gc_pass,
        bench_resolve_register_reader
);
criterion_main!(benches);
