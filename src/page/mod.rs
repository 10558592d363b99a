//! # Page Module
//!
//! Fixed-budget in-memory pages that make up a B-tree index.
//!
//! Every page is a [`PageBody`] behind a reader/writer **latch** (see
//! [`store`]). A body is either a [`LeafNode`] holding sorted
//! `(key, row)` entries linked to its siblings, or a [`BranchNode`]
//! routing searches down to the next level.
//!
//! ## Space accounting
//!
//! Pages are budgeted in bytes rather than in entry counts so that the
//! split points depend on key sizes the way an on-disk page would:
//!
//! ```text
//! leaf entry   = key bytes + ROW_ID_SIZE + SLOT_OVERHEAD
//! branch entry = key bytes + ROW_ID_SIZE + SLOT_OVERHEAD + CHILD_POINTER_SIZE
//! page usable  = page_size - PAGE_HEADER_SIZE
//! ```
//!
//! ## Page version
//!
//! Each body carries a `version` that is bumped whenever rows move **off**
//! the page (split, purge, root growth/shrink) or the page is freed.
//! Inserts and delete-marking leave it unchanged because a saved row is
//! still found on the same page by binary search. Scans compare a saved
//! version against the live one to decide whether their cached page id
//! can be trusted after a latch release.

pub mod store;


use std::fmt;

pub use store::{ExclusiveLatch, LatchError, LatchWait, PageHandle, PageStore, SharedLatch};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Bytes reserved on every page for the header (version, siblings, counts).
pub const PAGE_HEADER_SIZE: usize = 48;

/// Bytes needed to store a [`RowId`].
pub const ROW_ID_SIZE: usize = std::mem::size_of::<u64>();

/// Per-entry slot directory overhead.
pub const SLOT_OVERHEAD: usize = 4;

/// Bytes needed to store a child page pointer in a branch.
pub const CHILD_POINTER_SIZE: usize = std::mem::size_of::<u64>();

// ------------------------------------------------------------------------------------------------
// Identifiers
// ------------------------------------------------------------------------------------------------

/// Identifier of a table (and of the single index built over it).
pub type TableId = u32;

/// Identifier of a page inside one index's page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Location of a base row. Allocated by the engine, unique and increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub u64);

impl RowId {
    pub const MIN: RowId = RowId(0);
    pub const MAX: RowId = RowId(u64::MAX);
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// ------------------------------------------------------------------------------------------------
// Index rows
// ------------------------------------------------------------------------------------------------

/// A full index row: the key plus the location of the base row.
///
/// Rows are ordered by key bytes first and [`RowId`] second. The row id
/// is what makes positions unique in a non-unique index, where many
/// entries can share a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexRow {
    pub key: Vec<u8>,
    pub row: RowId,
}

impl IndexRow {
    pub fn new(key: impl Into<Vec<u8>>, row: RowId) -> Self {
        Self {
            key: key.into(),
            row,
        }
    }

    /// Smallest possible row carrying `key`.
    pub fn first_for(key: &[u8]) -> Self {
        Self::new(key.to_vec(), RowId::MIN)
    }

    /// Largest possible row carrying `key`.
    pub fn last_for(key: &[u8]) -> Self {
        Self::new(key.to_vec(), RowId::MAX)
    }

    /// Bytes this row occupies in a leaf.
    pub fn leaf_footprint(&self) -> usize {
        self.key.len() + ROW_ID_SIZE + SLOT_OVERHEAD
    }

    /// Bytes this row occupies as a branch separator.
    pub fn branch_footprint(&self) -> usize {
        self.leaf_footprint() + CHILD_POINTER_SIZE
    }
}

impl fmt::Display for IndexRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", HexKey(&self.key), self.row)
    }
}

/// A leaf slot. Deleted entries stay on the page until purged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub row: IndexRow,
    pub deleted: bool,
}

impl LeafEntry {
    pub fn live(row: IndexRow) -> Self {
        Self {
            row,
            deleted: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Leaf node
// ------------------------------------------------------------------------------------------------

/// Bottom-level node: sorted entries plus sibling links.
#[derive(Debug, Default)]
pub struct LeafNode {
    entries: Vec<LeafEntry>,
    left: Option<PageId>,
    right: Option<PageId>,
    used: usize,
}

impl LeafNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a leaf from entries that are already sorted.
    pub fn from_sorted(entries: Vec<LeafEntry>) -> Self {
        let used = entries.iter().map(|e| e.row.leaf_footprint()).sum();
        Self {
            entries,
            left: None,
            right: None,
            used,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LeafEntry] {
        &self.entries
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn left(&self) -> Option<PageId> {
        self.left
    }

    pub fn right(&self) -> Option<PageId> {
        self.right
    }

    pub fn set_left(&mut self, left: Option<PageId>) {
        self.left = left;
    }

    pub fn set_right(&mut self, right: Option<PageId>) {
        self.right = right;
    }

    /// Exact lookup: `Ok(slot)` if present, `Err(insert_slot)` otherwise.
    pub fn search(&self, row: &IndexRow) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.row.cmp(row))
    }

    /// First slot whose row is `>= row`.
    pub fn lower_bound(&self, row: &IndexRow) -> usize {
        self.entries.partition_point(|e| e.row < *row)
    }

    /// First slot whose row is `> row`.
    pub fn upper_bound(&self, row: &IndexRow) -> usize {
        self.entries.partition_point(|e| e.row <= *row)
    }

    /// Slots whose key equals `key`, in row order.
    pub fn key_range(&self, key: &[u8]) -> std::ops::Range<usize> {
        let start = self.entries.partition_point(|e| e.row.key.as_slice() < key);
        let end = self.entries.partition_point(|e| e.row.key.as_slice() <= key);
        start..end
    }

    pub fn insert_at(&mut self, slot: usize, entry: LeafEntry) {
        self.used += entry.row.leaf_footprint();
        self.entries.insert(slot, entry);
    }

    pub fn remove_at(&mut self, slot: usize) -> LeafEntry {
        let entry = self.entries.remove(slot);
        self.used -= entry.row.leaf_footprint();
        entry
    }

    pub fn set_deleted(&mut self, slot: usize, deleted: bool) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.deleted = deleted;
        }
    }

    /// Removes every entry for which `purge` returns true, returning them.
    pub fn drain_where(&mut self, mut purge: impl FnMut(&LeafEntry) -> bool) -> Vec<LeafEntry> {
        let mut kept = Vec::with_capacity(self.entries.len());
        let mut removed = Vec::new();
        for entry in self.entries.drain(..) {
            if purge(&entry) {
                removed.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        self.used = self.entries.iter().map(|e| e.row.leaf_footprint()).sum();
        removed
    }

    /// Moves the upper half (by bytes) of the entries into a new leaf.
    ///
    /// Sibling links are left for the caller to fix up.
    pub fn split_off_upper(&mut self) -> LeafNode {
        if self.entries.len() < 2 {
            return LeafNode::new();
        }
        let half = self.used / 2;
        let mut acc = 0;
        let mut at = self.entries.len();
        for (slot, entry) in self.entries.iter().enumerate() {
            acc += entry.row.leaf_footprint();
            if acc > half {
                at = slot;
                break;
            }
        }
        let at = at.clamp(1, self.entries.len() - 1);
        let upper = self.entries.split_off(at);
        let upper = LeafNode::from_sorted(upper);
        self.used -= upper.used;
        upper
    }
}

// ------------------------------------------------------------------------------------------------
// Branch node
// ------------------------------------------------------------------------------------------------

/// Internal node. `children[i]` holds rows in `[separators[i-1], separators[i])`.
#[derive(Debug)]
pub struct BranchNode {
    level: u16,
    separators: Vec<IndexRow>,
    children: Vec<PageId>,
    used: usize,
}

impl BranchNode {
    /// A branch over a single child.
    #[cfg(test)]
    pub fn with_child(level: u16, child: PageId) -> Self {
        Self {
            level,
            separators: Vec::new(),
            children: vec![child],
            used: CHILD_POINTER_SIZE,
        }
    }

    pub fn from_parts(level: u16, separators: Vec<IndexRow>, children: Vec<PageId>) -> Self {
        debug_assert_eq!(children.len(), separators.len() + 1);
        let used = CHILD_POINTER_SIZE + separators.iter().map(|s| s.branch_footprint()).sum::<usize>();
        Self {
            level,
            separators,
            children,
            used,
        }
    }

    /// Height above the leaves; level 1 branches point at leaves.
    pub fn level(&self) -> u16 {
        self.level
    }

    #[cfg(test)]
    pub fn separators(&self) -> &[IndexRow] {
        &self.separators
    }

    pub fn children(&self) -> &[PageId] {
        &self.children
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Index and id of the child whose range covers `row`.
    pub fn child_for(&self, row: &IndexRow) -> (usize, PageId) {
        let idx = self.separators.partition_point(|s| s <= row);
        (idx, self.children[idx])
    }

    #[cfg(test)]
    pub fn child_index(&self, child: PageId) -> Option<usize> {
        self.children.iter().position(|c| *c == child)
    }

    pub fn rightmost_child(&self) -> PageId {
        self.children[self.children.len() - 1]
    }

    /// Inserts `separator` and `right` immediately after child `left_idx`.
    pub fn insert_after(&mut self, left_idx: usize, separator: IndexRow, right: PageId) {
        self.used += separator.branch_footprint();
        self.separators.insert(left_idx, separator);
        self.children.insert(left_idx + 1, right);
    }

    /// Removes child `idx` together with one adjacent separator.
    pub fn remove_child(&mut self, idx: usize) -> PageId {
        let child = self.children.remove(idx);
        if !self.separators.is_empty() {
            let sep_idx = if idx == 0 { 0 } else { idx - 1 };
            let sep = self.separators.remove(sep_idx);
            self.used -= sep.branch_footprint();
        }
        child
    }

    /// Moves the upper half into a new branch, returning the promoted separator.
    ///
    /// Returns `None` when there is no separator to promote.
    pub fn split_off_upper(&mut self) -> Option<(IndexRow, BranchNode)> {
        if self.separators.is_empty() {
            return None;
        }
        let mid = self.separators.len() / 2;
        let mut upper_seps = self.separators.split_off(mid);
        let promoted = upper_seps.remove(0);
        let upper_children = self.children.split_off(mid + 1);
        let upper = BranchNode::from_parts(self.level, upper_seps, upper_children);
        self.used = CHILD_POINTER_SIZE
            + self.separators.iter().map(|s| s.branch_footprint()).sum::<usize>();
        Some((promoted, upper))
    }
}

// ------------------------------------------------------------------------------------------------
// Page body
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub enum Node {
    Leaf(LeafNode),
    Branch(BranchNode),
}

/// Contents of one page, protected by the page latch.
#[derive(Debug)]
pub struct PageBody {
    id: PageId,
    version: u64,
    freed: bool,
    page_size: usize,
    node: Node,
}

impl PageBody {
    pub(crate) fn new(id: PageId, page_size: usize, node: Node) -> Self {
        Self {
            id,
            version: 1,
            freed: false,
            page_size,
            node,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Records that rows moved off this page.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    #[cfg(test)]
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    pub(crate) fn mark_freed(&mut self) {
        self.freed = true;
        self.bump_version();
    }

    #[cfg(test)]
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn set_node(&mut self, node: Node) {
        self.node = node;
    }

    /// Replaces the node, returning the old one.
    pub fn replace_node(&mut self, node: Node) -> Node {
        std::mem::replace(&mut self.node, node)
    }

    /// The leaf, if this is a live leaf page.
    pub fn leaf(&self) -> Option<&LeafNode> {
        match &self.node {
            Node::Leaf(leaf) if !self.freed => Some(leaf),
            _ => None,
        }
    }

    pub fn leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match &mut self.node {
            Node::Leaf(leaf) if !self.freed => Some(leaf),
            _ => None,
        }
    }

    /// The branch, if this is a live branch page.
    pub fn branch(&self) -> Option<&BranchNode> {
        match &self.node {
            Node::Branch(branch) if !self.freed => Some(branch),
            _ => None,
        }
    }

    pub fn branch_mut(&mut self) -> Option<&mut BranchNode> {
        match &mut self.node {
            Node::Branch(branch) if !self.freed => Some(branch),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.node, Node::Leaf(_))
    }

    /// Bytes available for entries on this page.
    pub fn capacity(&self) -> usize {
        self.page_size.saturating_sub(PAGE_HEADER_SIZE)
    }

    pub fn used(&self) -> usize {
        match &self.node {
            Node::Leaf(leaf) => leaf.used(),
            Node::Branch(branch) => branch.used(),
        }
    }

    /// Free-space measure in bytes.
    pub fn free_space(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    pub fn has_room_for(&self, bytes: usize) -> bool {
        self.free_space() >= bytes
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Compact hex rendering of keys for log output.
pub struct HexKey<'a>(pub &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
