//! # Index Engine
//!
//! The [`Engine`] ties the pieces together: it owns the lock manager and
//! the registry of indexes, hands out table, transaction and row ids, and
//! runs system work (purge, compress, checkpoint) under short-lived
//! system transactions.
//!
//! ## Concurrency Model
//!
//! `Engine` is a cheap handle around `Arc<EngineInner>`. Nothing in the
//! engine is guarded by one big lock:
//!
//! - the index registry is a `RwLock<HashMap>` touched only on create,
//!   lookup and restore;
//! - id counters are atomics;
//! - each index synchronises through its own page latches and the
//!   shared [`LockManager`].
//!
//! ## Background purge
//!
//! A commit that deleted rows asks the engine to purge the affected
//! indexes. When a purge queue is attached (see
//! [`Engine::attach_purge_queue`]) the request becomes a task on the
//! background worker pool; otherwise it is dropped. Purge is never needed
//! for correctness: scans skip delete-marked rows and compress purges
//! before reclaiming pages.

mod index;

#[cfg(test)]
pub(crate) mod tests;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::Sender;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::btree::{BTree, CompressStats, IndexKind, PurgeStats, TreeError};
use crate::checkpoint::{self, CheckpointError};
use crate::lock::{LockError, LockManager, TxnId};
use crate::page::{RowId, TableId};
use crate::scan::ScanError;
use crate::txn::{Isolation, Transaction, TxnCtx, TxnError};

pub use index::{Index, IndexStats};

/// Work item for the background pool.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Errors surfaced by engine and index operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is closed")]
    Closed,

    #[error("index {0:?} already exists")]
    IndexExists(String),

    #[error("index {0:?} not found")]
    IndexNotFound(String),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl EngineError {
    /// Whether the error came from a wait that observed the interrupt flag.
    pub fn is_interrupt(&self) -> bool {
        match self {
            EngineError::Lock(LockError::Interrupted(_)) => true,
            EngineError::Tree(e) => e.is_interrupt(),
            EngineError::Scan(e) => *e == ScanError::Interrupted,
            _ => false,
        }
    }
}

/// Runtime settings of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Byte budget of every page.
    pub page_size: usize,

    /// Longest a transaction waits for one row or table lock.
    pub lock_timeout: Duration,

    /// Longest a thread waits for one page latch.
    pub latch_timeout: Duration,

    /// Whether commits queue purge work on the background pool.
    pub background_purge: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            lock_timeout: Duration::from_secs(10),
            latch_timeout: Duration::from_secs(5),
            background_purge: true,
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    locks: LockManager,
    indexes: RwLock<HashMap<String, Arc<BTree>>>,
    next_table: AtomicU32,
    next_txn: AtomicU64,
    next_row: AtomicU64,
    purge_queue: Mutex<Option<Sender<Task>>>,
    /// Interrupt flag of system work. Never raised.
    uninterruptible: AtomicBool,
    closed: AtomicBool,
}

/// Shared engine handle. Cloning is cheap.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("indexes", &self.inner.indexes.read().len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    pub fn open(config: EngineConfig) -> Self {
        info!(
            page_size = config.page_size,
            lock_timeout = ?config.lock_timeout,
            latch_timeout = ?config.latch_timeout,
            "engine opened"
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                locks: LockManager::new(),
                indexes: RwLock::new(HashMap::new()),
                next_table: AtomicU32::new(1),
                next_txn: AtomicU64::new(1),
                next_row: AtomicU64::new(1),
                purge_queue: Mutex::new(None),
                uninterruptible: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Stops accepting new indexes and transactions and detaches the
    /// purge queue. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach_purge_queue();
        info!("engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    // --------------------------------------------------------------------------------------------
    // Index registry
    // --------------------------------------------------------------------------------------------

    pub fn create_index(&self, name: &str, kind: IndexKind) -> Result<Index, EngineError> {
        self.check_open()?;
        let mut indexes = self.inner.indexes.write();
        if indexes.contains_key(name) {
            return Err(EngineError::IndexExists(name.to_string()));
        }
        let tree = Arc::new(self.new_tree(name, kind));
        indexes.insert(name.to_string(), Arc::clone(&tree));
        info!(index = name, table = tree.table_id(), ?kind, "index created");
        Ok(Index::new(self.clone(), tree))
    }

    pub fn index(&self, name: &str) -> Result<Index, EngineError> {
        self.check_open()?;
        let tree = self
            .inner
            .indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::IndexNotFound(name.to_string()))?;
        Ok(Index::new(self.clone(), tree))
    }

    /// Names of all registered indexes, sorted.
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Creates index `name` from the checkpoint at `path`.
    ///
    /// The index kind comes from the file. Row ids are preserved and the
    /// row id allocator is moved past the largest one restored.
    pub fn restore_index(&self, name: &str, path: &Path) -> Result<Index, EngineError> {
        self.check_open()?;
        let snapshot = checkpoint::read(path)?;
        let rows = snapshot.rows.len();

        let mut indexes = self.inner.indexes.write();
        if indexes.contains_key(name) {
            return Err(EngineError::IndexExists(name.to_string()));
        }
        if let Some(max) = snapshot.max_row_id() {
            self.observe_row_id(max);
        }
        let tree = Arc::new(self.new_tree(name, snapshot.kind));
        tree.bulk_load(snapshot.rows, self.system_interrupt())?;
        indexes.insert(name.to_string(), Arc::clone(&tree));

        info!(
            index = name,
            from = %snapshot.name,
            path = %path.display(),
            rows,
            "index restored from checkpoint"
        );
        Ok(Index::new(self.clone(), tree))
    }

    fn new_tree(&self, name: &str, kind: IndexKind) -> BTree {
        let table: TableId = self.inner.next_table.fetch_add(1, Ordering::Relaxed);
        BTree::new(
            table,
            name,
            kind,
            self.inner.config.page_size,
            self.inner.config.latch_timeout,
        )
    }

    // --------------------------------------------------------------------------------------------
    // Transactions and ids
    // --------------------------------------------------------------------------------------------

    pub fn begin(&self, isolation: Isolation) -> Result<Transaction, EngineError> {
        self.check_open()?;
        Ok(Transaction::new(self.clone(), isolation))
    }

    pub(crate) fn next_txn_id(&self) -> TxnId {
        self.inner.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_row_id(&self) -> RowId {
        RowId(self.inner.next_row.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes sure future row ids are greater than `row`.
    pub(crate) fn observe_row_id(&self, row: RowId) {
        self.inner.next_row.fetch_max(row.0.saturating_add(1), Ordering::AcqRel);
    }

    /// Interrupt flag for work that must not be interrupted, such as undo.
    pub(crate) fn system_interrupt(&self) -> &AtomicBool {
        &self.inner.uninterruptible
    }

    /// Runs `f` as a short system transaction and releases its locks.
    pub(crate) fn with_system_txn<R>(&self, f: impl FnOnce(&TxnCtx<'_>) -> R) -> R {
        let id = self.next_txn_id();
        let ctx = TxnCtx {
            id,
            locks: &self.inner.locks,
            interrupt: &self.inner.uninterruptible,
            lock_timeout: self.inner.config.lock_timeout,
        };
        let out = f(&ctx);
        self.inner.locks.unlock_all(id);
        out
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    pub(crate) fn purge_tree(&self, tree: &BTree) -> Result<PurgeStats, EngineError> {
        Ok(self.with_system_txn(|ctx| tree.purge(ctx))?)
    }

    pub(crate) fn compress_tree(&self, tree: &BTree) -> Result<CompressStats, EngineError> {
        Ok(self.with_system_txn(|ctx| tree.compress(ctx))?)
    }

    pub(crate) fn checkpoint_tree(&self, tree: &BTree, path: &Path) -> Result<usize, EngineError> {
        Ok(self.with_system_txn(|ctx| checkpoint::write(tree, path, ctx))?)
    }

    // --------------------------------------------------------------------------------------------
    // Background purge
    // --------------------------------------------------------------------------------------------

    pub(crate) fn attach_purge_queue(&self, sender: Sender<Task>) {
        *self.inner.purge_queue.lock() = Some(sender);
    }

    pub(crate) fn detach_purge_queue(&self) {
        if self.inner.purge_queue.lock().take().is_some() {
            debug!("purge queue detached");
        }
    }

    /// Queues a purge of `tree` if background purge is enabled.
    pub(crate) fn schedule_purge(&self, tree: Arc<BTree>) {
        if !self.inner.config.background_purge {
            return;
        }
        let guard = self.inner.purge_queue.lock();
        let Some(sender) = guard.as_ref() else {
            return;
        };
        let engine = self.clone();
        let task: Task = Box::new(move || match engine.purge_tree(&tree) {
            Ok(stats) => debug!(index = %tree.name(), purged = stats.purged, skipped = stats.skipped, "background purge"),
            Err(e) => error!(index = %tree.name(), "background purge failed: {e}"),
        });
        if sender.send(task).is_err() {
            warn!("purge queue closed, dropping purge request");
        }
    }

    // --------------------------------------------------------------------------------------------
    // Diagnostics
    // --------------------------------------------------------------------------------------------

    /// Number of lock requests currently blocked.
    pub fn waiting_lock_requests(&self) -> usize {
        self.inner.locks.waiting_count()
    }
}
