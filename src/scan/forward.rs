//! Forward scan.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{
    ScanError, ScanLock, ScanPosition, ScanSpec, ScanStart, ScanState, ScanStats, qualifies,
};
use crate::btree::{BTree, Descend, leaf_of};
use crate::lock::{LockError, LockTarget};
use crate::page::{IndexRow, LeafNode, RowId, SharedLatch};
use crate::txn::{Isolation, Transaction, TxnCtx};

/// A latched leaf and the next slot to examine on it.
type Cursor = (SharedLatch, usize);

/// Ascending scan over an index range. See the [module docs](super).
pub struct ForwardScan<'t> {
    txn: &'t Transaction,
    tree: Arc<BTree>,
    spec: ScanSpec,
    /// Whether rows are locked at all.
    row_locks: bool,
    state: ScanState,
    pos: Option<ScanPosition>,
    /// Epoch the scan's locks belong to.
    epoch: u64,
    table_locked: bool,
    /// Lock obtained by waiting, not yet matched to a returned row.
    waited_lock: Option<RowId>,
    /// Read lock on the last returned row, dropped when moving on.
    held_read: Option<RowId>,
    stats: ScanStats,
}

impl std::fmt::Debug for ForwardScan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardScan")
            .field("index", &self.tree.name())
            .field("state", &self.state)
            .field("pos", &self.pos)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'t> ForwardScan<'t> {
    pub(crate) fn open(txn: &'t Transaction, tree: Arc<BTree>, spec: ScanSpec) -> Self {
        let row_locks = txn.isolation().locks_rows() || spec.lock == ScanLock::Exclusive;
        Self::with_row_locks(txn, tree, spec, row_locks)
    }

    /// Opens a scan with row locking chosen by the caller. With
    /// `row_locks` off, rows are read without locks, which callers use when
    /// they already hold a covering table lock.
    pub(crate) fn with_row_locks(
        txn: &'t Transaction,
        tree: Arc<BTree>,
        spec: ScanSpec,
        row_locks: bool,
    ) -> Self {
        trace!(index = %tree.name(), ?spec, row_locks, "forward scan opened");
        Self {
            epoch: txn.epoch(),
            txn,
            tree,
            spec,
            row_locks,
            state: ScanState::Init,
            pos: None,
            table_locked: false,
            waited_lock: None,
            held_read: None,
            stats: ScanStats::default(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn position(&self) -> Option<&ScanPosition> {
        self.pos.as_ref()
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Returns the next qualifying row, or `None` once the scan is done.
    pub fn fetch_next(&mut self) -> Result<Option<IndexRow>, ScanError> {
        self.check_usable()?;
        let mut cursor = None;
        let res = self.next_row(&mut cursor);
        drop(cursor);
        self.observe(res)
    }

    /// Returns up to `max` rows, keeping the leaf latched between rows of
    /// the batch. For `max > 0`, an empty vector means the scan is done;
    /// `max == 0` returns an empty vector and leaves the scan where it was.
    ///
    /// If a row fails to lock partway through, the whole batch is given
    /// back: the scan resumes after the last row of the previous call.
    pub fn fetch_next_batch(&mut self, max: usize) -> Result<Vec<IndexRow>, ScanError> {
        self.check_usable()?;
        let mut out = Vec::with_capacity(max.min(1024));
        if max == 0 {
            return Ok(out);
        }
        let delivered = self.pos.clone();
        let mut cursor = None;
        while out.len() < max {
            match self.next_row(&mut cursor) {
                Ok(Some(row)) => out.push(row),
                Ok(None) => break,
                Err(e) => {
                    drop(cursor);
                    if !out.is_empty() {
                        trace!(index = %self.tree.name(), dropped = out.len(), "batch failed, rewinding");
                        self.pos = delivered;
                        self.stats.rows_returned -= out.len();
                    }
                    return self.observe(Err(e));
                }
            }
        }
        drop(cursor);
        Ok(out)
    }

    /// Closes the scan. Further fetches fail with [`ScanError::NoCurrentCursor`].
    pub fn close(&mut self) {
        if self.state == ScanState::Closed {
            return;
        }
        let txn = self.txn;
        let ctx = txn.ctx();
        self.release_read_lock(&ctx);
        self.release_waited_lock(&ctx);
        self.state = ScanState::Closed;
        debug!(index = %self.tree.name(), stats = ?self.stats, "forward scan closed");
    }

    // --------------------------------------------------------------------------------------------
    // State checks
    // --------------------------------------------------------------------------------------------

    fn check_usable(&mut self) -> Result<(), ScanError> {
        if self.state == ScanState::Closed {
            return Err(ScanError::NoCurrentCursor);
        }
        self.txn.ensure_active()?;

        let epoch = self.txn.epoch();
        if epoch != self.epoch {
            if !self.spec.holdable {
                return Err(ScanError::NoCurrentCursor);
            }
            // Commit released every lock this scan had.
            trace!(index = %self.tree.name(), from = self.epoch, to = epoch, "holdable scan crosses commit");
            self.epoch = epoch;
            self.table_locked = false;
            self.waited_lock = None;
            self.held_read = None;
        }
        Ok(())
    }

    /// Terminates the transaction on interrupt and passes the result on.
    fn observe<T>(&mut self, res: Result<T, ScanError>) -> Result<T, ScanError> {
        if let Err(ScanError::Interrupted) = &res {
            self.state = ScanState::Done;
            self.txn.terminate();
        }
        res
    }

    fn releases_read_locks(&self) -> bool {
        self.row_locks
            && self.spec.lock == ScanLock::Shared
            && self.txn.isolation() == Isolation::ReadCommitted
    }

    fn release_read_lock(&mut self, ctx: &TxnCtx<'_>) {
        if let Some(row) = self.held_read.take() {
            ctx.unlock(LockTarget::Row(self.tree.table_id(), row));
        }
    }

    fn release_waited_lock(&mut self, ctx: &TxnCtx<'_>) {
        if let Some(row) = self.waited_lock.take() {
            if self.releases_read_locks() {
                ctx.unlock(LockTarget::Row(self.tree.table_id(), row));
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Core loop
    // --------------------------------------------------------------------------------------------

    fn next_row(&mut self, cursor: &mut Option<Cursor>) -> Result<Option<IndexRow>, ScanError> {
        if self.state == ScanState::Done {
            return Ok(None);
        }
        let txn = self.txn;
        let ctx = txn.ctx();
        self.release_read_lock(&ctx);

        if self.row_locks && !self.table_locked {
            let table = LockTarget::Table(self.tree.table_id());
            ctx.lock_wait(table, self.spec.lock.table_mode())?;
            self.table_locked = true;
        }

        let (mut leaf, mut slot) = match cursor.take() {
            Some(cursor) => cursor,
            None if self.state == ScanState::InProgress => self.reposition(&ctx)?,
            None => self.position_at_start(&ctx)?,
        };

        loop {
            let node = leaf_of(&leaf)?;
            if slot >= node.len() {
                match node.right() {
                    Some(right) => {
                        leaf = self.tree.latch_shared(right, ctx.interrupt)?;
                        slot = 0;
                        self.stats.pages_visited += 1;
                        continue;
                    }
                    None => return Ok(self.finish(&ctx)),
                }
            }

            let entry = &node.entries()[slot];
            if self.spec.stop.is_past(&entry.row.key) {
                return Ok(self.finish(&ctx));
            }
            if let Some(waited) = self.waited_lock {
                if waited != entry.row.row {
                    // The row we waited for is gone.
                    self.release_waited_lock(&ctx);
                }
            }
            if !qualifies(&self.spec.qualifiers, &entry.row.key) {
                slot += 1;
                continue;
            }

            if !self.row_locks {
                if entry.deleted {
                    slot += 1;
                    continue;
                }
                let row = entry.row.clone();
                return Ok(Some(self.yield_row(cursor, leaf, slot, row)));
            }

            let row = entry.row.clone();
            let deleted = entry.deleted;
            let target = LockTarget::Row(self.tree.table_id(), row.row);
            match ctx.lock_nowait(target, self.spec.lock.row_mode()) {
                Ok(grant) => {
                    let waited = self.waited_lock.take() == Some(row.row);
                    let newly_locked = grant.is_new() || waited;
                    if deleted {
                        if newly_locked && self.releases_read_locks() {
                            ctx.unlock(target);
                        }
                        slot += 1;
                        continue;
                    }
                    if newly_locked && self.releases_read_locks() {
                        self.held_read = Some(row.row);
                    }
                    return Ok(Some(self.yield_row(cursor, leaf, slot, row)));
                }
                Err(LockError::WouldBlock(_)) => {
                    self.save_position(&leaf, row.clone(), true);
                    drop(leaf);
                    trace!(index = %self.tree.name(), row = %row, "scan waits for row lock");
                    self.stats.lock_waits += 1;
                    let grant = ctx.lock_wait(target, self.spec.lock.row_mode())?;
                    if grant.is_new() {
                        self.waited_lock = Some(row.row);
                    }
                    (leaf, slot) = self.reposition(&ctx)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn yield_row(
        &mut self,
        cursor: &mut Option<Cursor>,
        leaf: SharedLatch,
        slot: usize,
        row: IndexRow,
    ) -> IndexRow {
        self.save_position(&leaf, row.clone(), false);
        self.stats.rows_returned += 1;
        *cursor = Some((leaf, slot + 1));
        row
    }

    fn finish(&mut self, ctx: &TxnCtx<'_>) -> Option<IndexRow> {
        self.release_waited_lock(ctx);
        self.state = ScanState::Done;
        trace!(index = %self.tree.name(), stats = ?self.stats, "forward scan done");
        None
    }

    fn save_position(&mut self, leaf: &SharedLatch, row: IndexRow, inclusive: bool) {
        self.pos = Some(ScanPosition {
            row,
            inclusive,
            leaf: leaf.id(),
            version: leaf.version(),
        });
    }

    // --------------------------------------------------------------------------------------------
    // Positioning
    // --------------------------------------------------------------------------------------------

    fn position_at_start(&mut self, ctx: &TxnCtx<'_>) -> Result<Cursor, ScanError> {
        self.state = ScanState::InProgress;
        self.stats.pages_visited += 1;
        let cursor = match &self.spec.start {
            ScanStart::Beginning => (self.tree.descend_shared(Descend::Leftmost, ctx.interrupt)?, 0),
            ScanStart::AtOrAfter(key) => {
                let probe = IndexRow::first_for(key);
                let leaf = self.tree.descend_shared(Descend::To(&probe), ctx.interrupt)?;
                let slot = leaf_of(&leaf)?.lower_bound(&probe);
                (leaf, slot)
            }
            ScanStart::After(key) => {
                let probe = IndexRow::last_for(key);
                let leaf = self.tree.descend_shared(Descend::To(&probe), ctx.interrupt)?;
                let slot = leaf_of(&leaf)?.upper_bound(&probe);
                (leaf, slot)
            }
        };
        Ok(cursor)
    }

    /// Latches the leaf holding the resume point of the saved position.
    fn reposition(&mut self, ctx: &TxnCtx<'_>) -> Result<Cursor, ScanError> {
        let Some(pos) = self.pos.clone() else {
            return self.position_at_start(ctx);
        };
        let resume = |leaf: &LeafNode| {
            if pos.inclusive {
                leaf.lower_bound(&pos.row)
            } else {
                leaf.upper_bound(&pos.row)
            }
        };

        if let Some(handle) = self.tree.lookup(pos.leaf) {
            let latch = handle.latch_shared(self.tree.latch_wait(), ctx.interrupt)?;
            if latch.version() == pos.version {
                if let Some(node) = latch.leaf() {
                    let slot = resume(node);
                    self.stats.repositions_in_page += 1;
                    return Ok((latch, slot));
                }
            }
        }

        self.stats.repositions_by_key += 1;
        self.stats.pages_visited += 1;
        let latch = self.tree.descend_shared(Descend::To(&pos.row), ctx.interrupt)?;
        let slot = resume(leaf_of(&latch)?);
        trace!(index = %self.tree.name(), row = %pos.row, page = %latch.id(), "repositioned by key");
        Ok((latch, slot))
    }
}

impl Drop for ForwardScan<'_> {
    fn drop(&mut self) {
        if self.state != ScanState::Closed && (self.held_read.is_some() || self.waited_lock.is_some()) {
            let txn = self.txn;
            let ctx = txn.ctx();
            self.release_read_lock(&ctx);
            self.release_waited_lock(&ctx);
        }
    }
}
