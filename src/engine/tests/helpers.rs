use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig, Index};
use crate::page::{IndexRow, RowId};
use crate::scan::ForwardScan;
use crate::txn::Isolation;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 256-byte pages (13 four-byte keys per leaf), short waits, no
/// background purge.
pub fn small_page_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        page_size: 256,
        lock_timeout: Duration::from_secs(2),
        latch_timeout: Duration::from_secs(2),
        background_purge: false,
    }
}

pub fn small_engine() -> Engine {
    Engine::open(small_page_config())
}

/// Big-endian encoding, so byte order matches numeric order.
pub fn key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

pub fn key_of(row: &IndexRow) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&row.key[..4]);
    u32::from_be_bytes(buf)
}

/// Inserts `keys` in one committed unit of work.
pub fn load(engine: &Engine, index: &Index, keys: impl IntoIterator<Item = u32>) -> Vec<RowId> {
    let txn = engine.begin(Isolation::ReadCommitted).unwrap();
    let rows = keys
        .into_iter()
        .map(|i| index.insert(&txn, &key(i)).unwrap())
        .collect();
    txn.commit().unwrap();
    rows
}

/// Deletes `keys` in one committed unit of work.
pub fn delete(engine: &Engine, index: &Index, keys: impl IntoIterator<Item = u32>) {
    let txn = engine.begin(Isolation::ReadCommitted).unwrap();
    for i in keys {
        index.delete(&txn, &key(i)).unwrap();
    }
    txn.commit().unwrap();
}

/// Drains a scan and returns the keys it produced.
pub fn drain_keys(scan: &mut ForwardScan<'_>) -> Vec<u32> {
    let mut out = Vec::new();
    while let Some(row) = scan.fetch_next().unwrap() {
        out.push(key_of(&row));
    }
    out
}

/// Blocks until at least `n` lock requests are queued.
pub fn wait_for_waiters(engine: &Engine, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.waiting_lock_requests() < n {
        assert!(Instant::now() < deadline, "waiter never queued");
        thread::sleep(Duration::from_millis(1));
    }
}
