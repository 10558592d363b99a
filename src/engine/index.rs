//! Public handle on one index.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{Engine, EngineError};
use crate::btree::{BTree, CompressStats, IndexKind, PurgeStats, TreeError};
use crate::lock::{LockMode, LockTarget};
use crate::page::{IndexRow, RowId};
use crate::scan::{ForwardScan, MaxScan, Qualifier, ScanLock, ScanSpec};
use crate::txn::Transaction;

/// Shape of an index at one moment, for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub height: usize,
    pub pages: usize,
    pub leaves: usize,
    pub empty_leaves: usize,
    pub live_rows: usize,
    pub deleted_rows: usize,
}

/// Handle on a B-tree index. Cloning is cheap.
#[derive(Clone)]
pub struct Index {
    engine: Engine,
    tree: Arc<BTree>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.tree.name())
            .field("table", &self.tree.table_id())
            .field("kind", &self.tree.kind())
            .finish()
    }
}

impl Index {
    pub(crate) fn new(engine: Engine, tree: Arc<BTree>) -> Self {
        Self { engine, tree }
    }

    pub fn name(&self) -> &str {
        self.tree.name()
    }

    pub fn kind(&self) -> IndexKind {
        self.tree.kind()
    }

    /// Largest key this index accepts.
    pub fn max_key_len(&self) -> usize {
        self.tree.max_key_len()
    }

    #[cfg(test)]
    pub(crate) fn tree(&self) -> &Arc<BTree> {
        &self.tree
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts `key` under a freshly allocated row id and returns it.
    ///
    /// Takes an intent-exclusive lock on the table and an exclusive lock
    /// on the new row, both held until the unit of work ends.
    pub fn insert(&self, txn: &Transaction, key: &[u8]) -> Result<RowId, EngineError> {
        txn.ensure_active()?;
        let row = IndexRow::new(key, self.engine.next_row_id());
        let res = self.insert_row(txn, &row);
        self.observe(txn, res)?;
        Ok(row.row)
    }

    fn insert_row(&self, txn: &Transaction, row: &IndexRow) -> Result<(), EngineError> {
        let ctx = txn.ctx();
        ctx.lock_wait(LockTarget::Table(self.tree.table_id()), LockMode::IntentExclusive)?;
        // Fresh row id: nobody else can hold it.
        ctx.lock_nowait(LockTarget::Row(self.tree.table_id(), row.row), LockMode::Exclusive)?;
        self.tree.insert(&ctx, row)?;
        txn.record_insert(&self.tree, row.clone());
        Ok(())
    }

    /// Delete-marks every live entry with `key`. Returns how many.
    ///
    /// The entries stay on their pages until purged after commit.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> Result<usize, EngineError> {
        txn.ensure_active()?;
        let res = self.delete_key(txn, key);
        self.observe(txn, res)
    }

    fn delete_key(&self, txn: &Transaction, key: &[u8]) -> Result<usize, EngineError> {
        let spec = ScanSpec::key(key).lock(ScanLock::Exclusive);
        let mut scan = ForwardScan::open(txn, Arc::clone(&self.tree), spec);
        let mut deleted = 0;
        while let Some(row) = scan.fetch_next()? {
            // The scan holds the row's exclusive lock, so the mark is ours to set.
            if self.tree.set_deleted(&row, true, txn.ctx().interrupt)? {
                txn.record_delete(&self.tree, row);
                deleted += 1;
            }
        }
        scan.close();
        trace!(index = %self.tree.name(), deleted, "key deleted");
        Ok(deleted)
    }

    /// Terminates `txn` if `res` failed on an interrupt.
    fn observe<T>(&self, txn: &Transaction, res: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &res {
            if e.is_interrupt() {
                txn.terminate();
            }
        }
        res
    }

    // --------------------------------------------------------------------------------------------
    // Scans
    // --------------------------------------------------------------------------------------------

    pub fn open_scan<'t>(&self, txn: &'t Transaction, spec: ScanSpec) -> Result<ForwardScan<'t>, EngineError> {
        txn.ensure_active()?;
        Ok(ForwardScan::open(txn, Arc::clone(&self.tree), spec))
    }

    pub fn open_max_scan<'t>(
        &self,
        txn: &'t Transaction,
        qualifiers: Vec<Qualifier>,
    ) -> Result<MaxScan<'t>, EngineError> {
        txn.ensure_active()?;
        Ok(MaxScan::open(txn, Arc::clone(&self.tree), qualifiers))
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Removes entries whose delete has committed.
    pub fn purge(&self) -> Result<PurgeStats, EngineError> {
        self.engine.purge_tree(&self.tree)
    }

    /// Purges, frees empty leaves and shrinks the root.
    pub fn compress(&self) -> Result<CompressStats, EngineError> {
        self.engine.compress_tree(&self.tree)
    }

    /// Writes a checkpoint of the committed contents to `path`.
    /// Returns the number of rows written.
    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<usize, EngineError> {
        self.engine.checkpoint_tree(&self.tree, path.as_ref())
    }

    // --------------------------------------------------------------------------------------------
    // Diagnostics
    // --------------------------------------------------------------------------------------------

    /// Walks the leaf chain and reports the tree's shape.
    pub fn stats(&self) -> Result<IndexStats, EngineError> {
        let interrupt = self.engine.system_interrupt();
        let mut stats = IndexStats {
            height: self.tree.height(interrupt)?,
            pages: self.tree.page_count(),
            ..IndexStats::default()
        };
        for leaf in self.tree.leaf_ids(interrupt)? {
            // Freed since the walk: compress ran concurrently.
            let Some(handle) = self.tree.lookup(leaf) else { continue };
            let latch = handle
                .latch_shared(self.tree.latch_wait(), interrupt)
                .map_err(TreeError::from)?;
            let Some(node) = latch.leaf() else { continue };
            stats.leaves += 1;
            if node.is_empty() {
                stats.empty_leaves += 1;
            }
            for entry in node.entries() {
                if entry.deleted {
                    stats.deleted_rows += 1;
                } else {
                    stats.live_rows += 1;
                }
            }
        }
        debug!(index = %self.tree.name(), ?stats, "index stats");
        Ok(stats)
    }
}
