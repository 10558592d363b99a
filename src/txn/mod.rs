//! # Transactions
//!
//! A [`Transaction`] behaves like a connection: it owns an isolation
//! level and an interrupt flag, and runs a sequence of units of work.
//! Each unit of work has its own transaction id. [`Transaction::commit`]
//! and [`Transaction::rollback`] end the current unit, release its locks
//! and continue under a fresh id.
//!
//! ## Undo
//!
//! Inserts and delete-marks are recorded in an undo log. Rollback walks
//! it in reverse, removing inserted entries and clearing delete marks,
//! before releasing any lock.
//!
//! ## Commit epoch
//!
//! Every commit or rollback bumps the epoch. A scan remembers the epoch
//! it was opened in; a non-holdable scan refuses to continue once the
//! epoch moved on.
//!
//! ## Interrupts
//!
//! [`Interrupter::interrupt`] raises a sticky flag that every lock and
//! latch wait of this transaction polls. A wait that observes it fails,
//! the unit of work is rolled back and the transaction becomes
//! **terminated**: every later operation fails with
//! [`TxnError::Terminated`].

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::btree::{BTree, TreeError};
use crate::engine::Engine;
use crate::lock::{LockError, LockGrant, LockManager, LockMode, LockTarget, LockWait, TxnId};
use crate::page::IndexRow;

// ------------------------------------------------------------------------------------------------
// Public types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Reads take no row locks and may see uncommitted rows.
    ReadUncommitted,
    /// Read locks are released as soon as the scan moves off the row.
    #[default]
    ReadCommitted,
    /// Read locks are held until the end of the unit of work.
    RepeatableRead,
    /// Like `RepeatableRead`; max scans lock the whole table.
    Serializable,
}

impl Isolation {
    /// Whether scans at this level lock the rows they return.
    pub fn locks_rows(self) -> bool {
        self != Isolation::ReadUncommitted
    }

    /// Whether shared row locks outlive the scan position.
    pub fn holds_read_locks(self) -> bool {
        matches!(self, Isolation::RepeatableRead | Isolation::Serializable)
    }
}

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("transaction has been terminated")]
    Terminated,

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("undo failed for {row}: {source}")]
    Undo {
        row: IndexRow,
        #[source]
        source: TreeError,
    },
}

/// Raises the interrupt flag of one transaction from any thread.
#[derive(Debug, Clone)]
pub struct Interrupter {
    flag: Arc<AtomicBool>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

// ------------------------------------------------------------------------------------------------
// Latch/lock context
// ------------------------------------------------------------------------------------------------

/// Who is latching and locking, and how long they may wait.
///
/// Tree and scan code receive one of these instead of a whole
/// transaction so system work (purge, checkpoint) can use the same paths.
#[derive(Clone, Copy)]
pub(crate) struct TxnCtx<'a> {
    pub id: TxnId,
    pub locks: &'a LockManager,
    pub interrupt: &'a AtomicBool,
    pub lock_timeout: Duration,
}

impl TxnCtx<'_> {
    pub fn lock_nowait(&self, target: LockTarget, mode: LockMode) -> Result<LockGrant, LockError> {
        self.locks.lock(self.id, target, mode, LockWait::NoWait, self.interrupt)
    }

    pub fn lock_wait(&self, target: LockTarget, mode: LockMode) -> Result<LockGrant, LockError> {
        self.locks.lock(
            self.id,
            target,
            mode,
            LockWait::Timeout(self.lock_timeout),
            self.interrupt,
        )
    }

    pub fn unlock(&self, target: LockTarget) {
        self.locks.unlock(self.id, target);
    }

    #[cfg(test)]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }
}

// ------------------------------------------------------------------------------------------------
// Undo log
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UndoOp {
    Inserted,
    Deleted,
}

struct UndoRecord {
    tree: Arc<BTree>,
    row: IndexRow,
    op: UndoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Terminated,
}

// ------------------------------------------------------------------------------------------------
// Transaction
// ------------------------------------------------------------------------------------------------

/// A connection-like transaction context. See the module docs.
///
/// All methods take `&self` so open scans can keep borrowing the
/// transaction across commits.
pub struct Transaction {
    engine: Engine,
    isolation: Isolation,
    id: AtomicU64,
    epoch: AtomicU64,
    interrupt: Arc<AtomicBool>,
    state: Mutex<TxnState>,
    undo: Mutex<Vec<UndoRecord>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("isolation", &self.isolation)
            .field("epoch", &self.epoch())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(engine: Engine, isolation: Isolation) -> Self {
        let id = engine.next_txn_id();
        debug!(txn = id, ?isolation, "transaction started");
        Self {
            engine,
            isolation,
            id: AtomicU64::new(id),
            epoch: AtomicU64::new(0),
            interrupt: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(TxnState::Active),
            undo: Mutex::new(Vec::new()),
        }
    }

    /// Id of the current unit of work.
    pub fn id(&self) -> TxnId {
        self.id.load(Ordering::Acquire)
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn is_terminated(&self) -> bool {
        *self.state.lock() == TxnState::Terminated
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            flag: Arc::clone(&self.interrupt),
        }
    }

    /// Commits the current unit of work.
    ///
    /// Releases every lock, bumps the epoch and schedules background
    /// purge for indexes this unit deleted from.
    pub fn commit(&self) -> Result<(), TxnError> {
        self.ensure_active()?;

        let undo = std::mem::take(&mut *self.undo.lock());
        let mut purge_tables = HashSet::new();
        let mut to_purge = Vec::new();
        for record in &undo {
            if record.op == UndoOp::Deleted && purge_tables.insert(record.tree.table_id()) {
                to_purge.push(Arc::clone(&record.tree));
            }
        }

        let old = self.end_unit_of_work();
        info!(txn = old, changes = undo.len(), "transaction committed");

        for tree in to_purge {
            self.engine.schedule_purge(tree);
        }
        Ok(())
    }

    /// Rolls back the current unit of work.
    ///
    /// On a terminated transaction this is a no-op that reports
    /// [`TxnError::Terminated`].
    pub fn rollback(&self) -> Result<(), TxnError> {
        self.ensure_active()?;
        let res = self.undo_all();
        let old = self.end_unit_of_work();
        info!(txn = old, "transaction rolled back");
        res
    }

    // --------------------------------------------------------------------------------------------
    // Crate-internal API
    // --------------------------------------------------------------------------------------------

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), TxnError> {
        match *self.state.lock() {
            TxnState::Active => Ok(()),
            TxnState::Terminated => Err(TxnError::Terminated),
        }
    }

    pub(crate) fn ctx(&self) -> TxnCtx<'_> {
        TxnCtx {
            id: self.id(),
            locks: self.engine.locks(),
            interrupt: &self.interrupt,
            lock_timeout: self.engine.config().lock_timeout,
        }
    }

    pub(crate) fn record_insert(&self, tree: &Arc<BTree>, row: IndexRow) {
        self.undo.lock().push(UndoRecord {
            tree: Arc::clone(tree),
            row,
            op: UndoOp::Inserted,
        });
    }

    pub(crate) fn record_delete(&self, tree: &Arc<BTree>, row: IndexRow) {
        self.undo.lock().push(UndoRecord {
            tree: Arc::clone(tree),
            row,
            op: UndoOp::Deleted,
        });
    }

    /// Rolls back and marks the transaction terminated after an interrupt.
    pub(crate) fn terminate(&self) {
        {
            let mut state = self.state.lock();
            if *state == TxnState::Terminated {
                return;
            }
            *state = TxnState::Terminated;
        }
        let res = self.undo_all();
        let old = self.end_unit_of_work();
        match res {
            Ok(()) => warn!(txn = old, "transaction interrupted and terminated"),
            Err(e) => error!(txn = old, "transaction terminated, undo incomplete: {e}"),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Applies the undo log in reverse. Keeps going after a failure and
    /// reports the first one.
    fn undo_all(&self) -> Result<(), TxnError> {
        let undo = std::mem::take(&mut *self.undo.lock());
        // Undo is never interrupted by this transaction's own flag.
        let quiet = self.engine.system_interrupt();
        let mut first_err = None;
        for record in undo.into_iter().rev() {
            let res = match record.op {
                UndoOp::Inserted => record.tree.remove_row(&record.row, quiet).map(|_| ()),
                UndoOp::Deleted => record.tree.set_deleted(&record.row, false, quiet).map(|_| ()),
            };
            if let Err(source) = res {
                error!(row = %record.row, "undo failed: {source}");
                if first_err.is_none() {
                    first_err = Some(TxnError::Undo {
                        row: record.row,
                        source,
                    });
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Releases locks, bumps the epoch and switches to a fresh id.
    fn end_unit_of_work(&self) -> TxnId {
        let new_id = self.engine.next_txn_id();
        let old = self.id.swap(new_id, Ordering::AcqRel);
        self.engine.locks().unlock_all(old);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        old
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.undo.lock().is_empty() {
            if let Err(e) = self.undo_all() {
                error!(txn = self.id(), "rollback on drop failed: {e}");
            }
        }
        self.engine.locks().unlock_all(self.id());
    }
}
