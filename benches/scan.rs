//! Benchmarks for ferrodex inserts, scans and maintenance.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench scan              # run everything
//! cargo bench --bench scan -- forward   # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use ferrodex::{Db, DbConfig, Index, IndexKind, Isolation, ScanSpec};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn make_key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn open() -> Db {
    Db::open(DbConfig {
        background_purge: false,
        ..DbConfig::default()
    })
    .expect("open")
}

/// Creates an index holding keys `0..count`, inserted in one transaction.
fn populated(db: &Db, name: &str, count: u64) -> Index {
    let index = db.create_index(name, IndexKind::Unique).unwrap();
    let txn = db.begin(Isolation::ReadCommitted).unwrap();
    for i in 0..count {
        index.insert(&txn, &make_key(i)).unwrap();
    }
    txn.commit().unwrap();
    index
}

// ================================================================================================
// Insert benchmarks
// ================================================================================================

/// ## `insert/sequential`
///
/// **Scenario:** Appends ascending keys, one per iteration, in a single
/// long transaction.
///
/// **What it measures:** Descent, row and table locking, and the cost of
/// rightmost splits.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.bench_function("sequential", |b| {
        let db = open();
        let index = db.create_index("idx", IndexKind::Unique).unwrap();
        let txn = db.begin(Isolation::ReadCommitted).unwrap();
        let mut seq = 0u64;
        b.iter(|| {
            index.insert(&txn, black_box(&make_key(seq))).unwrap();
            seq += 1;
        });
        txn.commit().unwrap();
    });
    group.finish();
}

// ================================================================================================
// Scan benchmarks
// ================================================================================================

/// ## `forward/<isolation>/<rows>`
///
/// **Scenario:** Full forward scan of a populated index, one row per call.
///
/// **What it measures:** Per-row cost of saving and restoring the scan
/// position. Read committed adds a lock and unlock per row; read
/// uncommitted takes no locks at all.
///
/// ## `forward_batch/<rows>`
///
/// **Scenario:** The same scan in batches of 64 rows.
///
/// **What it measures:** How much holding the leaf latch across a batch
/// saves over repositioning for every row.
fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    let db = open();

    for &rows in &[1_000u64, 10_000] {
        let index = populated(&db, &format!("fwd-{rows}"), rows);
        group.throughput(Throughput::Elements(rows));

        for (label, isolation) in [
            ("read_uncommitted", Isolation::ReadUncommitted),
            ("read_committed", Isolation::ReadCommitted),
        ] {
            group.bench_with_input(BenchmarkId::new(label, rows), &rows, |b, _| {
                let txn = db.begin(isolation).unwrap();
                b.iter(|| {
                    let mut scan = index.open_scan(&txn, ScanSpec::all()).unwrap();
                    let mut n = 0;
                    while let Some(row) = scan.fetch_next().unwrap() {
                        black_box(row);
                        n += 1;
                    }
                    assert_eq!(n, rows);
                });
            });
        }

        group.bench_with_input(BenchmarkId::new("batch_64", rows), &rows, |b, _| {
            let txn = db.begin(Isolation::ReadCommitted).unwrap();
            b.iter(|| {
                let mut scan = index.open_scan(&txn, ScanSpec::all()).unwrap();
                loop {
                    let batch = scan.fetch_next_batch(64).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    black_box(batch);
                }
            });
        });
    }
    group.finish();
}

/// ## `max/<rows>`
///
/// **Scenario:** One max scan over a populated index.
///
/// **What it measures:** Rightmost descent plus one row lock; should be
/// flat in the number of rows.
fn bench_max(c: &mut Criterion) {
    let mut group = c.benchmark_group("max");
    let db = open();
    for &rows in &[1_000u64, 100_000] {
        let index = populated(&db, &format!("max-{rows}"), rows);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            let txn = db.begin(Isolation::ReadCommitted).unwrap();
            b.iter(|| {
                let mut max = index.open_max_scan(&txn, Vec::new()).unwrap();
                black_box(max.fetch_max().unwrap());
                max.close();
            });
        });
    }
    group.finish();
}

// ================================================================================================
// Maintenance benchmarks
// ================================================================================================

/// ## `compress/half_deleted`
///
/// **Scenario:** 10,000 rows with every key below 5,000 deleted, then
/// compressed. Setup is excluded from the measurement.
///
/// **What it measures:** Purge plus freeing of empty leaves and branch
/// pages.
fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress");
    group.sample_size(10);
    group.bench_function("half_deleted", |b| {
        b.iter_batched(
            || {
                let db = open();
                let index = populated(&db, "idx", 10_000);
                let txn = db.begin(Isolation::ReadCommitted).unwrap();
                for i in 0..5_000 {
                    index.delete(&txn, &make_key(i)).unwrap();
                }
                txn.commit().unwrap();
                (db, index)
            },
            |(_db, index)| black_box(index.compress().unwrap()),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(benches, bench_insert, bench_forward, bench_max, bench_compress);

criterion_main!(benches);
