//! Purge of committed deletes.
//!
//! A delete only marks its entry. Once the deleting transaction has
//! committed nobody holds its row lock any more, so a `NoWait` exclusive
//! lock request by the purging transaction succeeds; that grant is the
//! proof that the entry can be removed. Entries whose lock is busy are
//! left for a later pass.

use std::collections::HashSet;

use tracing::debug;

use super::{BTree, Descend, TreeError, leaf_of, leaf_of_mut};
use crate::lock::{LockError, LockGrant, LockMode, LockTarget};
use crate::page::{ExclusiveLatch, RowId};
use crate::txn::TxnCtx;

/// Outcome of one purge pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub leaves_visited: usize,
    pub purged: usize,
    /// Delete-marked entries whose deleter still held the row lock.
    pub skipped: usize,
}

impl BTree {
    /// Walks every leaf left to right and removes committed deletes.
    pub(crate) fn purge(&self, ctx: &TxnCtx<'_>) -> Result<PurgeStats, TreeError> {
        let mut stats = PurgeStats::default();
        let mut leaf = self.descend_for_update(Descend::Leftmost, ctx.interrupt)?;
        loop {
            stats.leaves_visited += 1;
            self.purge_leaf(ctx, &mut leaf, &mut stats)?;
            match leaf_of(&leaf)?.right() {
                Some(right) => leaf = self.latch_exclusive(right, ctx.interrupt)?,
                None => break,
            }
        }
        debug!(
            index = %self.name,
            purged = stats.purged,
            skipped = stats.skipped,
            leaves = stats.leaves_visited,
            "purge finished"
        );
        Ok(stats)
    }

    fn purge_leaf(
        &self,
        ctx: &TxnCtx<'_>,
        leaf: &mut ExclusiveLatch,
        stats: &mut PurgeStats,
    ) -> Result<(), TreeError> {
        let candidates: Vec<RowId> = leaf_of(leaf)?
            .entries()
            .iter()
            .filter(|e| e.deleted)
            .map(|e| e.row.row)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let mut committed = HashSet::new();
        for row in candidates {
            match ctx.lock_nowait(LockTarget::Row(self.table, row), LockMode::Exclusive) {
                // Only a fresh grant proves someone else's delete committed.
                Ok(LockGrant::AlreadyHeld) | Err(LockError::WouldBlock(_)) => stats.skipped += 1,
                Ok(_) => {
                    committed.insert(row);
                }
                Err(e) => {
                    self.release_rows(ctx, &committed);
                    return Err(e.into());
                }
            }
        }

        let removed = leaf_of_mut(leaf)?.drain_where(|e| e.deleted && committed.contains(&e.row.row));
        self.release_rows(ctx, &committed);

        if !removed.is_empty() {
            leaf.bump_version();
            stats.purged += removed.len();
            debug!(index = %self.name, page = %leaf.id(), removed = removed.len(), "leaf purged");
        }
        Ok(())
    }

    fn release_rows(&self, ctx: &TxnCtx<'_>, rows: &HashSet<RowId>) {
        for row in rows {
            ctx.unlock(LockTarget::Row(self.table, *row));
        }
    }
}
