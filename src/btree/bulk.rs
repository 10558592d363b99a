//! Bottom-up bulk load into an empty tree.
//!
//! Leaves are packed to [`FILL_PERCENT`] of their capacity and linked
//! left to right; each branch level is then built over the first rows of
//! the level below until a single node remains, which becomes the root.

use std::sync::atomic::AtomicBool;

use tracing::info;

use super::{BTree, TreeError, leaf_of, leaf_of_mut};
use crate::page::{BranchNode, IndexRow, LatchWait, LeafEntry, LeafNode, Node, PageId};

/// Target fill of bulk-loaded pages, leaving room for later inserts.
const FILL_PERCENT: usize = 80;

impl BTree {
    /// Loads strictly ascending `rows` into this (empty) tree.
    pub(crate) fn bulk_load(&self, rows: Vec<IndexRow>, interrupt: &AtomicBool) -> Result<usize, TreeError> {
        if rows.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TreeError::UnsortedInput);
        }
        for row in &rows {
            self.check_key(&row.key)?;
        }

        let mut root = self.latch_exclusive(self.root, interrupt)?;
        if !root.is_leaf() || !leaf_of(&root)?.is_empty() {
            return Err(TreeError::NotEmpty);
        }

        let total = rows.len();
        let budget = root.capacity() * FILL_PERCENT / 100;

        let mut chunks: Vec<Vec<LeafEntry>> = Vec::new();
        let mut current = Vec::new();
        let mut used = 0;
        for row in rows {
            let footprint = row.leaf_footprint();
            if used + footprint > budget && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                used = 0;
            }
            used += footprint;
            current.push(LeafEntry::live(row));
        }
        if !current.is_empty() || chunks.is_empty() {
            chunks.push(current);
        }

        if chunks.len() == 1 {
            let entries = chunks.pop().unwrap_or_default();
            *leaf_of_mut(&mut root)? = LeafNode::from_sorted(entries);
            info!(index = %self.name, rows = total, leaves = 1, "bulk load finished");
            return Ok(total);
        }

        // Leaf level.
        let leaf_count = chunks.len();
        let mut level: Vec<(IndexRow, PageId)> = Vec::with_capacity(leaf_count);
        let mut prev: Option<PageId> = None;
        for entries in chunks {
            let first = entries[0].row.clone();
            let mut node = LeafNode::from_sorted(entries);
            node.set_left(prev);
            let page = self.allocate(Node::Leaf(node));
            if let Some(prev_id) = prev {
                let mut prev_latch = self.page(prev_id)?.latch_exclusive(LatchWait::NoWait, interrupt)?;
                leaf_of_mut(&mut prev_latch)?.set_right(Some(page.id()));
            }
            prev = Some(page.id());
            level.push((first, page.id()));
        }

        // Branch levels.
        let mut height: u16 = 1;
        loop {
            let groups = group_children(level, budget);
            if groups.len() == 1 {
                let (separators, children) = groups.into_iter().next().map(split_group).unwrap_or_default();
                root.set_node(Node::Branch(BranchNode::from_parts(height, separators, children)));
                root.bump_version();
                break;
            }
            level = groups
                .into_iter()
                .map(|group| {
                    let first = group[0].0.clone();
                    let (separators, children) = split_group(group);
                    let page = self.allocate(Node::Branch(BranchNode::from_parts(height, separators, children)));
                    (first, page.id())
                })
                .collect();
            height += 1;
        }

        info!(index = %self.name, rows = total, leaves = leaf_count, height = height + 1, "bulk load finished");
        Ok(total)
    }
}

/// Packs `(first row, page)` pairs into branch-sized groups.
fn group_children(level: Vec<(IndexRow, PageId)>, budget: usize) -> Vec<Vec<(IndexRow, PageId)>> {
    let mut groups = Vec::new();
    let mut current: Vec<(IndexRow, PageId)> = Vec::new();
    let mut used = 0;
    for (first, page) in level {
        let footprint = first.branch_footprint();
        if used + footprint > budget && current.len() >= 2 {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        used += footprint;
        current.push((first, page));
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Separators are the first rows of every child but the first.
fn split_group(group: Vec<(IndexRow, PageId)>) -> (Vec<IndexRow>, Vec<PageId>) {
    let mut separators = Vec::with_capacity(group.len().saturating_sub(1));
    let mut children = Vec::with_capacity(group.len());
    for (i, (first, page)) in group.into_iter().enumerate() {
        if i > 0 {
            separators.push(first);
        }
        children.push(page);
    }
    (separators, children)
}
