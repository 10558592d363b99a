//! Compress: reclaim empty leaves and shrink the root.
//!
//! Runs a purge first, then holds the root's exclusive latch for the
//! rest of the pass so no descent can reach a page while it is being
//! unlinked. Walking down, it frees:
//!
//! - every empty leaf that is not its parent's only child, after
//!   relinking its left and right neighbours;
//! - every branch that leads through single children down to one empty
//!   leaf, when the branch itself has siblings.
//!
//! Finally a root left with a single child absorbs that child's
//! contents, repeatedly.

use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tracing::{debug, info};

use super::{BTree, TreeError, branch_of, branch_of_mut, leaf_of, leaf_of_mut};
use crate::page::{ExclusiveLatch, LatchError, LatchWait, LeafNode, Node};
use crate::txn::TxnCtx;

/// Outcome of one compress pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompressStats {
    /// Entries removed by the initial purge.
    pub purged: usize,
    pub leaves_freed: usize,
    pub branches_freed: usize,
    /// Levels removed by root shrink.
    pub levels_removed: usize,
}

impl BTree {
    pub(crate) fn compress(&self, ctx: &TxnCtx<'_>) -> Result<CompressStats, TreeError> {
        let purge = self.purge(ctx)?;
        let mut stats = CompressStats {
            purged: purge.purged,
            ..CompressStats::default()
        };

        let mut root = self.latch_exclusive(self.root, ctx.interrupt)?;
        if !root.is_leaf() {
            self.compress_branch(&mut root, ctx.interrupt, &mut stats)?;
            self.collapse_root(&mut root, ctx.interrupt, &mut stats)?;
        }

        info!(
            index = %self.name,
            purged = stats.purged,
            leaves_freed = stats.leaves_freed,
            branches_freed = stats.branches_freed,
            levels_removed = stats.levels_removed,
            "compress finished"
        );
        Ok(stats)
    }

    fn compress_branch(
        &self,
        parent: &mut ExclusiveLatch,
        interrupt: &AtomicBool,
        stats: &mut CompressStats,
    ) -> Result<(), TreeError> {
        let mut idx = 0;
        loop {
            let (siblings, child_id) = {
                let branch = branch_of(parent)?;
                match branch.children().get(idx) {
                    Some(id) => (branch.children().len(), *id),
                    None => return Ok(()),
                }
            };
            let mut child = self.latch_exclusive(child_id, interrupt)?;

            if child.is_leaf() {
                if siblings > 1 && leaf_of(&child)?.is_empty() && self.unlink_leaf(child, interrupt)? {
                    branch_of_mut(parent)?.remove_child(idx);
                    stats.leaves_freed += 1;
                    continue;
                }
                idx += 1;
                continue;
            }

            self.compress_branch(&mut child, interrupt, stats)?;
            if siblings > 1 && self.free_empty_chain(child, interrupt, stats)? {
                branch_of_mut(parent)?.remove_child(idx);
                continue;
            }
            idx += 1;
        }
    }

    /// Frees `branch` if it leads through single children down to one
    /// empty leaf, unlinking that leaf and freeing every branch on the way.
    fn free_empty_chain(
        &self,
        mut branch: ExclusiveLatch,
        interrupt: &AtomicBool,
        stats: &mut CompressStats,
    ) -> Result<bool, TreeError> {
        let only = match branch_of(&branch)?.children() {
            [only] => *only,
            _ => return Ok(false),
        };
        let child = self.latch_exclusive(only, interrupt)?;
        let freed = if child.is_leaf() {
            let empty = leaf_of(&child)?.is_empty();
            if empty && self.unlink_leaf(child, interrupt)? {
                stats.leaves_freed += 1;
                true
            } else {
                false
            }
        } else {
            self.free_empty_chain(child, interrupt, stats)?
        };
        if freed {
            self.free_page(&mut branch);
            stats.branches_freed += 1;
        }
        Ok(freed)
    }

    /// Relinks the neighbours of an empty leaf and frees it.
    ///
    /// Returns `false` if the leaf turned out to be non-empty or its left
    /// link kept moving until the latch timeout expired.
    fn unlink_leaf(&self, mut leaf: ExclusiveLatch, interrupt: &AtomicBool) -> Result<bool, TreeError> {
        let leaf_id = leaf.id();
        let started = Instant::now();

        let (left_id, mut left) = loop {
            let Some(left_id) = leaf_of(&leaf)?.left() else {
                break (None, None);
            };
            let handle = self.page(left_id)?;
            match handle.latch_exclusive(LatchWait::NoWait, interrupt) {
                Ok(left) => break (Some(left_id), Some(left)),
                Err(LatchError::WouldBlock(_)) => {}
                Err(e) => return Err(e.into()),
            }

            // Left before right: give up the leaf, then take both in order.
            drop(leaf);
            let left = handle.latch_exclusive(self.latch_wait(), interrupt)?;
            leaf = self.latch_exclusive(leaf_id, interrupt)?;
            let node = leaf_of(&leaf)?;
            if !node.is_empty() {
                return Ok(false);
            }
            if node.left() == Some(left_id) {
                break (Some(left_id), Some(left));
            }
            drop(left);
            if started.elapsed() >= self.latch_timeout() {
                return Ok(false);
            }
        };

        let node = leaf_of(&leaf)?;
        if !node.is_empty() {
            return Ok(false);
        }
        let right_id = node.right();
        let mut right = match right_id {
            Some(id) => Some(self.latch_exclusive(id, interrupt)?),
            None => None,
        };

        if let Some(left) = left.as_mut() {
            leaf_of_mut(left)?.set_right(right_id);
        }
        if let Some(right) = right.as_mut() {
            leaf_of_mut(right)?.set_left(left_id);
        }
        self.free_page(&mut leaf);
        debug!(index = %self.name, page = %leaf_id, "empty leaf freed");
        Ok(true)
    }

    /// Pulls a lone child up into the root until the root has two or
    /// more children or is a leaf.
    fn collapse_root(
        &self,
        root: &mut ExclusiveLatch,
        interrupt: &AtomicBool,
        stats: &mut CompressStats,
    ) -> Result<(), TreeError> {
        loop {
            let only = match root.branch().map(|b| b.children()) {
                Some([only]) => *only,
                _ => return Ok(()),
            };
            let mut child = self.latch_exclusive(only, interrupt)?;
            let node = child.replace_node(Node::Leaf(LeafNode::new()));
            self.free_page(&mut child);
            root.set_node(node);
            root.bump_version();
            stats.levels_removed += 1;
            debug!(index = %self.name, freed = %only, "root shrank");
        }
    }
}
