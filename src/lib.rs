//! # ferrodex
//!
//! An embeddable, in-memory **B-tree index engine** with row-level
//! locking and cursors that survive concurrent structural change.
//!
//! Scans never hold a page latch between calls. Every time a scan lets
//! go of its leaf it remembers the last row it saw, and on the next
//! call it finds its way back: in place if the leaf is unchanged,
//! otherwise by descending from the root again. Splits, root growth,
//! purge, compress and root shrink can all happen in between.
//!
//! ## Quick Start
//!
//! ```rust
//! use ferrodex::{Db, DbConfig, IndexKind, Isolation, ScanSpec};
//!
//! let db = Db::open(DbConfig::default()).unwrap();
//! let index = db.create_index("orders_by_customer", IndexKind::NonUnique).unwrap();
//!
//! // Write
//! let txn = db.begin(Isolation::ReadCommitted).unwrap();
//! index.insert(&txn, b"alice").unwrap();
//! index.insert(&txn, b"bob").unwrap();
//! index.insert(&txn, b"alice").unwrap();
//! txn.commit().unwrap();
//!
//! // Forward scan
//! let mut scan = index.open_scan(&txn, ScanSpec::key(b"alice")).unwrap();
//! let mut alices = 0;
//! while let Some(_row) = scan.fetch_next().unwrap() {
//!     alices += 1;
//! }
//! assert_eq!(alices, 2);
//! scan.close();
//!
//! // Max scan
//! let mut max = index.open_max_scan(&txn, Vec::new()).unwrap();
//! assert_eq!(max.fetch_max().unwrap().unwrap().key, b"bob");
//! max.close();
//!
//! txn.commit().unwrap();
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Unique and non-unique indexes** ordered by `(key, row id)`.
//! - **Four isolation levels** with table and row locks, deadlock
//!   detection and bounded waits.
//! - **Holdable cursors** that stay open across commits.
//! - **Interrupts**: a blocked transaction can be cancelled from another
//!   thread.
//! - **Background purge** of committed deletes, and explicit compress
//!   to reclaim empty pages.
//! - **CRC32-checked checkpoints** that can be restored into a new index.

pub(crate) mod btree;
pub(crate) mod checkpoint;
pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod lock;
pub(crate) mod page;
pub(crate) mod scan;
pub(crate) mod txn;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use engine::{Engine, EngineConfig, Task};

pub use btree::{CompressStats, IndexKind, MIN_PAGE_SIZE, PurgeStats, TreeError};
pub use checkpoint::{Checkpoint, CheckpointError};
pub use engine::{EngineError, Index, IndexStats};
pub use lock::{LockError, LockMode, LockTarget};
pub use page::{IndexRow, PageId, RowId};
pub use scan::{
    CompareOp, ForwardScan, MaxScan, MaxScanStats, Qualifier, ScanError, ScanLock, ScanPosition,
    ScanSpec, ScanStart, ScanState, ScanStats, ScanStop,
};
pub use txn::{Interrupter, Isolation, Transaction, TxnError};

/// Largest accepted page size.
const MAX_PAGE_SIZE: usize = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// Validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use ferrodex::DbConfig;
///
/// let config = DbConfig {
///     page_size: 512,
///     lock_timeout: Duration::from_millis(500),
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Byte budget of every index page. Small pages mean many splits.
    ///
    /// Default: 4 KiB. Must be in [`MIN_PAGE_SIZE`]..=1 MiB.
    pub page_size: usize,

    /// Longest a transaction waits for a single lock before the statement
    /// fails with a timeout.
    ///
    /// Default: 10 s. Must be non-zero.
    pub lock_timeout: Duration,

    /// Longest a thread waits for a single page latch.
    ///
    /// Default: 5 s. Must be non-zero.
    pub latch_timeout: Duration,

    /// Whether commits that deleted rows queue a purge on the background
    /// pool.
    ///
    /// Default: true.
    pub background_purge: bool,

    /// Number of background worker threads.
    ///
    /// Default: 2. Must be ≥ 1 when `background_purge` is set.
    pub thread_pool_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            lock_timeout: Duration::from_secs(10),
            latch_timeout: Duration::from_secs(5),
            background_purge: true,
            thread_pool_size: 2,
        }
    }
}

impl DbConfig {
    fn validate(&self) -> Result<(), DbError> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "page_size must be in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(DbError::InvalidConfig("lock_timeout must be > 0".into()));
        }
        if self.latch_timeout.is_zero() {
            return Err(DbError::InvalidConfig("latch_timeout must be > 0".into()));
        }
        if self.background_purge && self.thread_pool_size < 1 {
            return Err(DbError::InvalidConfig(
                "thread_pool_size must be >= 1 with background_purge".into(),
            ));
        }
        Ok(())
    }

    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.page_size,
            lock_timeout: self.lock_timeout,
            latch_timeout: self.latch_timeout,
            background_purge: self.background_purge,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is closed")]
    Closed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

/// Purge workers and the sending side of their queue.
/// Taken on shutdown so cleanup runs once.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Task>,
    workers: Vec<thread::JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The database handle: a registry of indexes plus their lock manager
/// and background purge workers.
///
/// `Db` is `Send + Sync` and can be shared through an `Arc<Db>`. Index
/// handles and transactions keep working while the `Db` is alive; after
/// [`Db::close`] no new indexes or transactions can be created.
pub struct Db {
    engine: Engine,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("indexes", &self.engine.index_names())
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens an empty database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any parameter is out of range.
    pub fn open(config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let engine = Engine::open(config.to_engine_config());

        let bg = if config.background_purge {
            let (sender, receiver) = crossbeam::channel::unbounded::<Task>();
            let mut workers = Vec::with_capacity(config.thread_pool_size);
            for id in 0..config.thread_pool_size {
                let rx = receiver.clone();
                let handle = thread::Builder::new()
                    .name(format!("ferrodex-purge-{id}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn background thread");
                workers.push(handle);
            }
            drop(receiver);
            engine.attach_purge_queue(sender.clone());
            Some(BackgroundPool { sender, workers })
        } else {
            None
        };

        info!(
            page_size = config.page_size,
            pool_size = if config.background_purge { config.thread_pool_size } else { 0 },
            "database opened"
        );
        Ok(Self {
            engine,
            bg: Mutex::new(bg),
            closed: AtomicBool::new(false),
        })
    }

    /// Shuts down: finishes queued purges and joins the workers.
    ///
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.close();
        self.shutdown_pool();
        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Indexes
    // --------------------------------------------------------------------------------------------

    /// Creates an empty index.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidArgument`] for an empty name and
    /// [`EngineError::IndexExists`] if the name is taken.
    pub fn create_index(&self, name: &str, kind: IndexKind) -> Result<Index, DbError> {
        self.check_open()?;
        if name.is_empty() {
            return Err(DbError::InvalidArgument("index name must not be empty".into()));
        }
        Ok(self.engine.create_index(name, kind)?)
    }

    pub fn index(&self, name: &str) -> Result<Index, DbError> {
        self.check_open()?;
        Ok(self.engine.index(name)?)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.engine.index_names()
    }

    /// Creates index `name` from a checkpoint written by [`Index::checkpoint`].
    pub fn restore_index(&self, name: &str, path: impl AsRef<Path>) -> Result<Index, DbError> {
        self.check_open()?;
        if name.is_empty() {
            return Err(DbError::InvalidArgument("index name must not be empty".into()));
        }
        Ok(self.engine.restore_index(name, path.as_ref())?)
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    /// Starts a transaction. It lives until dropped; commit and rollback
    /// only end its current unit of work.
    pub fn begin(&self, isolation: Isolation) -> Result<Transaction, DbError> {
        self.check_open()?;
        Ok(self.engine.begin(isolation)?)
    }

    /// Number of lock requests currently blocked.
    pub fn waiting_lock_requests(&self) -> usize {
        self.engine.waiting_lock_requests()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    /// Closes the queue and joins every worker once it drained.
    fn shutdown_pool(&self) {
        if let Some(bg) = self.bg.lock().take() {
            self.engine.detach_purge_queue();
            drop(bg.sender);
            for worker in bg.workers {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.engine.close();
            self.shutdown_pool();
        }
    }
}
