//! Max scan.
//!
//! Finds the greatest qualifying row by descending to the rightmost leaf
//! and walking backwards. Two situations send it elsewhere:
//!
//! - the rightmost leaf is empty, or a left neighbour cannot be latched
//!   without waiting: the answer is computed by a forward scan from the
//!   beginning instead, keeping its last row;
//! - the candidate row is locked by someone else: the scan waits for the
//!   lock with no latch held and then starts over from the rightmost
//!   leaf, because a greater row may have been committed meanwhile.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{ForwardScan, MaxScanStats, Qualifier, ScanError, ScanSpec, ScanState, qualifies};
use crate::btree::{BTree, Descend, leaf_of};
use crate::lock::{LockError, LockMode, LockTarget};
use crate::page::{IndexRow, LatchError, LatchWait, RowId, SharedLatch};
use crate::txn::{Isolation, Transaction, TxnCtx};

/// What the backward walk concluded.
enum Walk {
    Found(IndexRow),
    Empty,
    /// Fall back to a forward scan from the beginning.
    FromBeginning,
    /// Lock granted after waiting; start over from the rightmost leaf.
    Restart,
}

/// Scan returning the greatest qualifying row. See the [module docs](self).
pub struct MaxScan<'t> {
    txn: &'t Transaction,
    tree: Arc<BTree>,
    qualifiers: Vec<Qualifier>,
    state: ScanState,
    epoch: u64,
    /// Lock obtained by waiting for a candidate that may have been overtaken.
    waited_lock: Option<RowId>,
    /// Read-committed lock on the returned row.
    held_read: Option<RowId>,
    stats: MaxScanStats,
}

impl std::fmt::Debug for MaxScan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxScan")
            .field("index", &self.tree.name())
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'t> MaxScan<'t> {
    pub(crate) fn open(txn: &'t Transaction, tree: Arc<BTree>, qualifiers: Vec<Qualifier>) -> Self {
        trace!(index = %tree.name(), "max scan opened");
        Self {
            epoch: txn.epoch(),
            txn,
            tree,
            qualifiers,
            state: ScanState::Init,
            waited_lock: None,
            held_read: None,
            stats: MaxScanStats::default(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn stats(&self) -> MaxScanStats {
        self.stats
    }

    /// Returns the greatest qualifying row, or `None` if there is none.
    ///
    /// Each call computes the answer afresh.
    pub fn fetch_max(&mut self) -> Result<Option<IndexRow>, ScanError> {
        if self.state == ScanState::Closed {
            return Err(ScanError::NoCurrentCursor);
        }
        self.txn.ensure_active()?;
        if self.txn.epoch() != self.epoch {
            self.epoch = self.txn.epoch();
            self.waited_lock = None;
            self.held_read = None;
        }

        let res = self.compute();
        if let Err(ScanError::Interrupted) = &res {
            self.state = ScanState::Done;
            self.txn.terminate();
        }
        res
    }

    pub fn close(&mut self) {
        if self.state == ScanState::Closed {
            return;
        }
        let txn = self.txn;
        self.release_locks(&txn.ctx());
        self.state = ScanState::Closed;
        debug!(index = %self.tree.name(), stats = ?self.stats, "max scan closed");
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn releases_read_locks(&self) -> bool {
        self.txn.isolation() == Isolation::ReadCommitted
    }

    fn release_locks(&mut self, ctx: &TxnCtx<'_>) {
        let table = self.tree.table_id();
        if let Some(row) = self.held_read.take() {
            ctx.unlock(LockTarget::Row(table, row));
        }
        if let Some(row) = self.waited_lock.take() {
            if self.releases_read_locks() {
                ctx.unlock(LockTarget::Row(table, row));
            }
        }
    }

    fn compute(&mut self) -> Result<Option<IndexRow>, ScanError> {
        let txn = self.txn;
        let ctx = txn.ctx();
        self.release_locks(&ctx);

        let table = LockTarget::Table(self.tree.table_id());
        let row_locks = match txn.isolation() {
            Isolation::Serializable => {
                ctx.lock_wait(table, LockMode::Shared)?;
                false
            }
            Isolation::ReadUncommitted => false,
            _ => {
                ctx.lock_wait(table, LockMode::IntentShared)?;
                true
            }
        };

        self.state = ScanState::InProgress;
        loop {
            let leaf = self.tree.descend_shared(Descend::Rightmost, ctx.interrupt)?;
            self.stats.pages_visited += 1;
            let walk = if leaf_of(&leaf)?.is_empty() {
                trace!(index = %self.tree.name(), "rightmost leaf empty");
                drop(leaf);
                Walk::FromBeginning
            } else {
                self.walk_back(&ctx, leaf, row_locks)?
            };

            let found = match walk {
                Walk::Restart => {
                    self.stats.restarts += 1;
                    continue;
                }
                Walk::Found(row) => Some(row),
                Walk::Empty => None,
                Walk::FromBeginning => {
                    self.stats.forward_fallbacks += 1;
                    self.max_from_beginning(row_locks)?
                }
            };

            // A lock won by waiting on a row that is not the answer is stale.
            if let Some(waited) = self.waited_lock {
                if found.as_ref().map(|r| r.row) != Some(waited) {
                    self.waited_lock = None;
                    if self.releases_read_locks() {
                        ctx.unlock(LockTarget::Row(self.tree.table_id(), waited));
                    }
                } else {
                    self.waited_lock = None;
                    if self.releases_read_locks() {
                        self.held_read = Some(waited);
                    }
                }
            }
            self.state = ScanState::Done;
            return Ok(found);
        }
    }

    /// Walks from the end of `leaf` towards the left.
    fn walk_back(
        &mut self,
        ctx: &TxnCtx<'_>,
        mut leaf: SharedLatch,
        row_locks: bool,
    ) -> Result<Walk, ScanError> {
        let mut slot = leaf_of(&leaf)?.len();
        loop {
            if slot == 0 {
                let Some(left_id) = leaf_of(&leaf)?.left() else {
                    return Ok(Walk::Empty);
                };
                let Some(handle) = self.tree.lookup(left_id) else {
                    return Ok(Walk::FromBeginning);
                };
                let left = match handle.latch_shared(LatchWait::NoWait, ctx.interrupt) {
                    Ok(left) => left,
                    Err(LatchError::WouldBlock(_)) => {
                        trace!(index = %self.tree.name(), page = %left_id, "left latch busy, scanning from the beginning");
                        return Ok(Walk::FromBeginning);
                    }
                    Err(e) => return Err(e.into()),
                };
                let linked = left.leaf().is_some_and(|l| l.right() == Some(leaf.id()));
                if !linked {
                    return Ok(Walk::FromBeginning);
                }
                leaf = left;
                slot = leaf_of(&leaf)?.len();
                self.stats.pages_visited += 1;
                continue;
            }

            slot -= 1;
            let entry = &leaf_of(&leaf)?.entries()[slot];
            if !qualifies(&self.qualifiers, &entry.row.key) {
                continue;
            }
            if !row_locks {
                if entry.deleted {
                    continue;
                }
                return Ok(Walk::Found(entry.row.clone()));
            }

            let row = entry.row.clone();
            let deleted = entry.deleted;
            let target = LockTarget::Row(self.tree.table_id(), row.row);
            match ctx.lock_nowait(target, LockMode::Shared) {
                Ok(grant) => {
                    let waited = self.waited_lock == Some(row.row);
                    if deleted {
                        if (grant.is_new() || waited) && self.releases_read_locks() {
                            ctx.unlock(target);
                            if waited {
                                self.waited_lock = None;
                            }
                        }
                        continue;
                    }
                    if grant.is_new() && self.releases_read_locks() {
                        self.held_read = Some(row.row);
                    }
                    return Ok(Walk::Found(row));
                }
                Err(LockError::WouldBlock(_)) => {
                    drop(leaf);
                    trace!(index = %self.tree.name(), row = %row, "max scan waits for row lock");
                    self.stats.lock_waits += 1;
                    let grant = ctx.lock_wait(target, LockMode::Shared)?;
                    if grant.is_new() {
                        if let Some(stale) = self.waited_lock.replace(row.row) {
                            if self.releases_read_locks() {
                                ctx.unlock(LockTarget::Row(self.tree.table_id(), stale));
                            }
                        }
                    }
                    return Ok(Walk::Restart);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Runs a forward scan over the whole index and keeps its last row.
    fn max_from_beginning(&mut self, row_locks: bool) -> Result<Option<IndexRow>, ScanError> {
        let spec = ScanSpec {
            qualifiers: self.qualifiers.clone(),
            ..ScanSpec::all()
        };
        let mut scan = ForwardScan::with_row_locks(self.txn, Arc::clone(&self.tree), spec, row_locks);
        let mut last = None;
        while let Some(row) = scan.fetch_next()? {
            last = Some(row);
        }
        scan.close();
        debug!(index = %self.tree.name(), found = last.is_some(), "max computed from the beginning");
        Ok(last)
    }
}

impl Drop for MaxScan<'_> {
    fn drop(&mut self) {
        if self.held_read.is_some() || self.waited_lock.is_some() {
            let txn = self.txn;
            self.release_locks(&txn.ctx());
        }
    }
}
