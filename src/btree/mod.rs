//! # B-Tree
//!
//! A B-tree over [`IndexRow`]s stored in a [`PageStore`].
//!
//! ## Shape
//!
//! ```text
//!                 [ root (fixed id) ]            level 2
//!                /                   \
//!        [ branch ]               [ branch ]     level 1
//!        /   |    \               /       \
//!    [leaf]<->[leaf]<->[leaf]<->[leaf]<->[leaf]  leaves, doubly linked
//! ```
//!
//! The root page id never changes. When the root overflows its contents
//! move into two new children and the root becomes their parent
//! (growth); when compress leaves it with a single child, the child's
//! contents are pulled up into it (shrink).
//!
//! ## Latching protocol
//!
//! - Descents couple latches top-down: the child is latched before the
//!   parent is released.
//! - Sibling moves to the **right** may wait; moves to the **left** only
//!   ever try (`NoWait`). With both rules the latch graph is acyclic.
//! - Readers use shared latches throughout. Optimistic writers use
//!   shared latches on branches and an exclusive latch on the leaf. A
//!   leaf that is too full sends the writer down the pessimistic path in
//!   [`split`], which holds exclusive latches from the root and splits
//!   full nodes on the way down.
//!
//! ## Row locks
//!
//! The tree itself never waits for a row lock while holding a latch.
//! Unique inserts probe delete-marked duplicates with `NoWait` and, if
//! the deleter is still in flight, release every latch before waiting.

mod bulk;
mod compress;
mod purge;
mod split;

#[cfg(test)]
pub(crate) mod tests;

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::lock::{LockError, LockGrant, LockMode, LockTarget};
use crate::page::{
    BranchNode, CHILD_POINTER_SIZE, ExclusiveLatch, HexKey, IndexRow, LatchError, LatchWait,
    LeafEntry, LeafNode, Node, PAGE_HEADER_SIZE, PageBody, PageHandle, PageId, PageStore,
    ROW_ID_SIZE, RowId, SLOT_OVERHEAD, SharedLatch, TableId,
};
use crate::txn::TxnCtx;

pub use compress::CompressStats;
pub use purge::PurgeStats;

/// Smallest page size that still fits four maximal entries per page.
pub const MIN_PAGE_SIZE: usize = 256;

// ------------------------------------------------------------------------------------------------
// Public types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// At most one live entry per key.
    Unique,
    /// Any number of entries per key, told apart by row id.
    NonUnique,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("latch error: {0}")]
    Latch(#[from] LatchError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("duplicate key {0}")]
    DuplicateKey(String),

    #[error("key of {len} bytes exceeds the {max}-byte limit")]
    KeyTooLarge { len: usize, max: usize },

    #[error("page {0} is missing or has an unexpected type")]
    BadPage(PageId),

    #[error("bulk load requires an empty tree")]
    NotEmpty,

    #[error("bulk load input is not strictly ascending")]
    UnsortedInput,
}

impl TreeError {
    /// Whether a latch or lock wait observed the interrupt flag.
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            TreeError::Latch(LatchError::Interrupted(_)) | TreeError::Lock(LockError::Interrupted(_))
        )
    }
}

/// Where a descent is headed.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Descend<'a> {
    To(&'a IndexRow),
    Leftmost,
    Rightmost,
}

impl Descend<'_> {
    fn child_of(&self, branch: &BranchNode) -> PageId {
        match self {
            Descend::To(row) => branch.child_for(row).1,
            Descend::Leftmost => branch.children()[0],
            Descend::Rightmost => branch.rightmost_child(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Node accessors
// ------------------------------------------------------------------------------------------------

pub(crate) fn leaf_of(body: &PageBody) -> Result<&LeafNode, TreeError> {
    body.leaf().ok_or(TreeError::BadPage(body.id()))
}

pub(crate) fn leaf_of_mut(body: &mut PageBody) -> Result<&mut LeafNode, TreeError> {
    let id = body.id();
    body.leaf_mut().ok_or(TreeError::BadPage(id))
}

pub(crate) fn branch_of(body: &PageBody) -> Result<&BranchNode, TreeError> {
    body.branch().ok_or(TreeError::BadPage(body.id()))
}

pub(crate) fn branch_of_mut(body: &mut PageBody) -> Result<&mut BranchNode, TreeError> {
    let id = body.id();
    body.branch_mut().ok_or(TreeError::BadPage(id))
}

// ------------------------------------------------------------------------------------------------
// Tree
// ------------------------------------------------------------------------------------------------

/// One index: a page store plus its fixed root.
#[derive(Debug)]
pub struct BTree {
    table: TableId,
    name: String,
    kind: IndexKind,
    store: PageStore,
    root: PageId,
    latch_timeout: Duration,
}

enum UniqueCheck {
    Clear,
    /// A delete-marked duplicate belongs to an in-flight transaction.
    WaitFor(RowId),
    /// A left neighbour could not be latched without waiting.
    Retry(PageId),
}

enum Probe {
    Committed,
    Own,
    InFlight,
}

impl BTree {
    pub fn new(
        table: TableId,
        name: impl Into<String>,
        kind: IndexKind,
        page_size: usize,
        latch_timeout: Duration,
    ) -> Self {
        let store = PageStore::new(page_size);
        let root = store.allocate(Node::Leaf(LeafNode::new())).id();
        let name = name.into();
        debug!(table, name = %name, ?kind, page_size, "index created");
        Self {
            table,
            name,
            kind,
            store,
            root,
            latch_timeout,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    #[cfg(test)]
    pub fn root_id(&self) -> PageId {
        self.root
    }

    /// Number of live pages, branches included.
    pub fn page_count(&self) -> usize {
        self.store.page_count()
    }

    /// Largest key accepted by this index.
    pub fn max_key_len(&self) -> usize {
        self.max_entry() - ROW_ID_SIZE - SLOT_OVERHEAD - CHILD_POINTER_SIZE
    }

    /// Largest footprint any single entry may have, leaf or branch.
    fn max_entry(&self) -> usize {
        self.store.page_size().saturating_sub(PAGE_HEADER_SIZE) / 4
    }

    pub(crate) fn latch_wait(&self) -> LatchWait {
        LatchWait::Bounded(self.latch_timeout)
    }

    pub(crate) fn latch_timeout(&self) -> Duration {
        self.latch_timeout
    }

    /// Live page handle, or `None` once freed.
    pub(crate) fn lookup(&self, id: PageId) -> Option<PageHandle> {
        self.store.get(id)
    }

    pub(crate) fn page(&self, id: PageId) -> Result<PageHandle, TreeError> {
        self.store.get(id).ok_or(TreeError::BadPage(id))
    }

    pub(crate) fn latch_shared(
        &self,
        id: PageId,
        interrupt: &AtomicBool,
    ) -> Result<SharedLatch, TreeError> {
        Ok(self.page(id)?.latch_shared(self.latch_wait(), interrupt)?)
    }

    pub(crate) fn latch_exclusive(
        &self,
        id: PageId,
        interrupt: &AtomicBool,
    ) -> Result<ExclusiveLatch, TreeError> {
        Ok(self.page(id)?.latch_exclusive(self.latch_wait(), interrupt)?)
    }

    pub(crate) fn free_page(&self, body: &mut PageBody) {
        self.store.free(body);
    }

    pub(crate) fn allocate(&self, node: Node) -> PageHandle {
        self.store.allocate(node)
    }

    fn check_key(&self, key: &[u8]) -> Result<(), TreeError> {
        let max = self.max_key_len();
        if key.len() > max {
            return Err(TreeError::KeyTooLarge {
                len: key.len(),
                max,
            });
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Descent
    // --------------------------------------------------------------------------------------------

    /// Latch-coupled shared descent to a leaf.
    pub(crate) fn descend_shared(
        &self,
        to: Descend<'_>,
        interrupt: &AtomicBool,
    ) -> Result<SharedLatch, TreeError> {
        let mut cur = self.latch_shared(self.root, interrupt)?;
        loop {
            if cur.is_leaf() {
                return Ok(cur);
            }
            let child = to.child_of(branch_of(&cur)?);
            cur = self.latch_shared(child, interrupt)?;
        }
    }

    /// Descent with shared latches on branches and an exclusive latch on the leaf.
    pub(crate) fn descend_for_update(
        &self,
        to: Descend<'_>,
        interrupt: &AtomicBool,
    ) -> Result<ExclusiveLatch, TreeError> {
        loop {
            let root = self.latch_shared(self.root, interrupt)?;
            if root.is_leaf() {
                drop(root);
                let root = self.latch_exclusive(self.root, interrupt)?;
                if root.is_leaf() {
                    return Ok(root);
                }
                // Grew between the two latches.
                continue;
            }

            let mut cur = root;
            loop {
                let branch = branch_of(&cur)?;
                let child = to.child_of(branch);
                if branch.level() == 1 {
                    return self.latch_exclusive(child, interrupt);
                }
                cur = self.latch_shared(child, interrupt)?;
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Insert
    // --------------------------------------------------------------------------------------------

    /// Inserts `row`. The caller already holds the row's exclusive lock.
    pub(crate) fn insert(&self, ctx: &TxnCtx<'_>, row: &IndexRow) -> Result<(), TreeError> {
        self.check_key(&row.key)?;
        let started = Instant::now();

        loop {
            let mut leaf = self.descend_for_update(Descend::To(row), ctx.interrupt)?;

            if self.kind == IndexKind::Unique {
                match self.check_unique(ctx, &mut leaf, row)? {
                    UniqueCheck::Clear => {}
                    UniqueCheck::WaitFor(other) => {
                        drop(leaf);
                        let target = LockTarget::Row(self.table, other);
                        debug!(index = %self.name, row = %other, "insert waits for deleter of duplicate");
                        let grant = ctx.lock_wait(target, LockMode::Exclusive)?;
                        if grant.is_new() {
                            ctx.unlock(target);
                        }
                        continue;
                    }
                    UniqueCheck::Retry(page) => {
                        drop(leaf);
                        let waited = started.elapsed();
                        if waited >= self.latch_timeout {
                            return Err(LatchError::Timeout { page, waited }.into());
                        }
                        std::thread::yield_now();
                        continue;
                    }
                }
            }

            if !leaf.has_room_for(row.leaf_footprint()) {
                let full = leaf.id();
                drop(leaf);
                trace!(index = %self.name, page = %full, "leaf full, splitting");
                self.split_for(row, ctx.interrupt)?;
                continue;
            }

            let node = leaf_of_mut(&mut leaf)?;
            let slot = match node.search(row) {
                Ok(_) => return Err(TreeError::DuplicateKey(HexKey(&row.key).to_string())),
                Err(slot) => slot,
            };
            node.insert_at(slot, LeafEntry::live(row.clone()));
            trace!(index = %self.name, page = %leaf.id(), row = %row, "row inserted");
            return Ok(());
        }
    }

    /// Checks that no live entry carries `row.key`.
    ///
    /// Every existing entry with the key sorts before `row` because row
    /// ids only grow, so they sit in this leaf or in leaves to its left.
    /// Duplicates whose delete has committed are removed from this leaf.
    fn check_unique(
        &self,
        ctx: &TxnCtx<'_>,
        leaf: &mut ExclusiveLatch,
        row: &IndexRow,
    ) -> Result<UniqueCheck, TreeError> {
        let node = leaf_of(leaf)?;
        let range = node.key_range(&row.key);
        let mut committed = Vec::new();
        for (slot, entry) in node.entries()[range.clone()].iter().enumerate() {
            if !entry.deleted {
                return Err(TreeError::DuplicateKey(HexKey(&row.key).to_string()));
            }
            match self.probe_deleted(ctx, entry.row.row)? {
                Probe::Committed => committed.push(range.start + slot),
                Probe::Own => {}
                Probe::InFlight => return Ok(UniqueCheck::WaitFor(entry.row.row)),
            }
        }
        let mut next_left = if range.start == 0 { node.left() } else { None };

        if !committed.is_empty() {
            let node = leaf_of_mut(leaf)?;
            for slot in committed.into_iter().rev() {
                node.remove_at(slot);
            }
            leaf.bump_version();
        }

        let mut _held: Option<SharedLatch> = None;
        while let Some(left_id) = next_left {
            let Some(handle) = self.lookup(left_id) else {
                return Ok(UniqueCheck::Retry(left_id));
            };
            let latch = match handle.latch_shared(LatchWait::NoWait, ctx.interrupt) {
                Ok(latch) => latch,
                Err(LatchError::WouldBlock(page)) => return Ok(UniqueCheck::Retry(page)),
                Err(e) => return Err(e.into()),
            };
            let Some(left) = latch.leaf() else {
                return Ok(UniqueCheck::Retry(left_id));
            };
            let range = left.key_range(&row.key);
            for entry in &left.entries()[range.clone()] {
                if !entry.deleted {
                    return Err(TreeError::DuplicateKey(HexKey(&row.key).to_string()));
                }
                if let Probe::InFlight = self.probe_deleted(ctx, entry.row.row)? {
                    return Ok(UniqueCheck::WaitFor(entry.row.row));
                }
            }
            next_left = if range.start == 0 { left.left() } else { None };
            _held = Some(latch);
        }
        Ok(UniqueCheck::Clear)
    }

    /// Finds out whether the delete of `row` has committed.
    fn probe_deleted(&self, ctx: &TxnCtx<'_>, row: RowId) -> Result<Probe, TreeError> {
        let target = LockTarget::Row(self.table, row);
        match ctx.lock_nowait(target, LockMode::Exclusive) {
            Ok(LockGrant::AlreadyHeld) => Ok(Probe::Own),
            Ok(_) => {
                ctx.unlock(target);
                Ok(Probe::Committed)
            }
            Err(LockError::WouldBlock(_)) => Ok(Probe::InFlight),
            Err(e) => Err(e.into()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Point updates
    // --------------------------------------------------------------------------------------------

    /// Sets or clears the delete mark on `row`. Returns whether it was found.
    pub(crate) fn set_deleted(
        &self,
        row: &IndexRow,
        deleted: bool,
        interrupt: &AtomicBool,
    ) -> Result<bool, TreeError> {
        let mut leaf = self.descend_for_update(Descend::To(row), interrupt)?;
        let node = leaf_of_mut(&mut leaf)?;
        match node.search(row) {
            Ok(slot) => {
                node.set_deleted(slot, deleted);
                trace!(index = %self.name, row = %row, deleted, "delete mark changed");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Physically removes `row`. Returns whether it was found.
    pub(crate) fn remove_row(&self, row: &IndexRow, interrupt: &AtomicBool) -> Result<bool, TreeError> {
        let mut leaf = self.descend_for_update(Descend::To(row), interrupt)?;
        let node = leaf_of_mut(&mut leaf)?;
        match node.search(row) {
            Ok(slot) => {
                node.remove_at(slot);
                leaf.bump_version();
                trace!(index = %self.name, row = %row, "row removed");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Whole-tree walks
    // --------------------------------------------------------------------------------------------

    /// All entries in order, delete-marked ones included.
    pub(crate) fn entries(&self, interrupt: &AtomicBool) -> Result<Vec<LeafEntry>, TreeError> {
        let mut out = Vec::new();
        let mut leaf = self.descend_shared(Descend::Leftmost, interrupt)?;
        loop {
            let node = leaf_of(&leaf)?;
            out.extend(node.entries().iter().cloned());
            match node.right() {
                Some(right) => leaf = self.latch_shared(right, interrupt)?,
                None => return Ok(out),
            }
        }
    }

    /// Leaf page ids from left to right.
    pub(crate) fn leaf_ids(&self, interrupt: &AtomicBool) -> Result<Vec<PageId>, TreeError> {
        let mut out = Vec::new();
        let mut leaf = self.descend_shared(Descend::Leftmost, interrupt)?;
        loop {
            out.push(leaf.id());
            match leaf_of(&leaf)?.right() {
                Some(right) => leaf = self.latch_shared(right, interrupt)?,
                None => return Ok(out),
            }
        }
    }

    /// Number of levels, leaves included.
    pub fn height(&self, interrupt: &AtomicBool) -> Result<usize, TreeError> {
        let root = self.latch_shared(self.root, interrupt)?;
        Ok(match root.branch() {
            Some(branch) => branch.level() as usize + 1,
            None => 1,
        })
    }
}
