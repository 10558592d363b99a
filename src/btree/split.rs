//! Pessimistic top-down split.
//!
//! Entered with no latches held. Takes the root exclusively and walks
//! down towards the target row with exclusive latch coupling, splitting
//! every node on the way that could not absorb one more maximal entry.
//! Because full ancestors are split before their children, a child
//! split always finds room for the new separator in its parent.

use std::sync::atomic::AtomicBool;

use tracing::debug;

use super::{BTree, TreeError, branch_of, branch_of_mut, leaf_of, leaf_of_mut};
use crate::page::{BranchNode, ExclusiveLatch, IndexRow, LatchWait, LeafNode, Node};

impl BTree {
    /// Makes room for `row` in the leaf it belongs to.
    pub(crate) fn split_for(&self, row: &IndexRow, interrupt: &AtomicBool) -> Result<(), TreeError> {
        let needed = row.leaf_footprint();
        let mut root = self.latch_exclusive(self.root, interrupt)?;

        if root.is_leaf() {
            if !root.has_room_for(needed) {
                self.grow_root(&mut root, interrupt)?;
            }
            return Ok(());
        }
        if !root.has_room_for(self.max_entry()) {
            self.grow_root(&mut root, interrupt)?;
        }

        let mut parent = root;
        loop {
            let (idx, child_id) = branch_of(&parent)?.child_for(row);
            let mut child = self.latch_exclusive(child_id, interrupt)?;

            if child.is_leaf() {
                if !child.has_room_for(needed) {
                    self.split_leaf(&mut parent, idx, &mut child, interrupt)?;
                }
                return Ok(());
            }

            if child.has_room_for(self.max_entry()) {
                parent = child;
                continue;
            }

            parent = match self.split_branch(&mut parent, idx, &mut child, interrupt)? {
                Some((separator, upper)) if *row >= separator => upper,
                _ => child,
            };
        }
    }

    /// Splits a full leaf and posts the separator into `parent`.
    ///
    /// The right neighbour is latched before anything changes, so a
    /// latch failure leaves the tree untouched.
    fn split_leaf(
        &self,
        parent: &mut ExclusiveLatch,
        idx: usize,
        leaf: &mut ExclusiveLatch,
        interrupt: &AtomicBool,
    ) -> Result<(), TreeError> {
        let old_right = leaf_of(leaf)?.right();
        let mut right_latch = match old_right {
            Some(id) => Some(self.latch_exclusive(id, interrupt)?),
            None => None,
        };

        let mut upper = leaf_of_mut(leaf)?.split_off_upper();
        if upper.is_empty() {
            return Ok(());
        }
        let separator = upper.entries()[0].row.clone();
        upper.set_left(Some(leaf.id()));
        upper.set_right(old_right);
        let moved = upper.len();
        let new_page = self.allocate(Node::Leaf(upper));

        if let Some(right) = right_latch.as_mut() {
            leaf_of_mut(right)?.set_left(Some(new_page.id()));
        }
        leaf_of_mut(leaf)?.set_right(Some(new_page.id()));
        leaf.bump_version();
        branch_of_mut(parent)?.insert_after(idx, separator, new_page.id());

        debug!(
            index = %self.name,
            page = %leaf.id(),
            new_page = %new_page.id(),
            moved,
            "leaf split"
        );
        Ok(())
    }

    /// Splits a full branch, returning the promoted separator and an
    /// exclusive latch on the new upper half.
    fn split_branch(
        &self,
        parent: &mut ExclusiveLatch,
        idx: usize,
        branch: &mut ExclusiveLatch,
        interrupt: &AtomicBool,
    ) -> Result<Option<(IndexRow, ExclusiveLatch)>, TreeError> {
        let Some((separator, upper)) = branch_of_mut(branch)?.split_off_upper() else {
            return Ok(None);
        };
        let new_page = self.allocate(Node::Branch(upper));
        // Unreachable until posted below.
        let upper_latch = new_page.latch_exclusive(LatchWait::NoWait, interrupt)?;
        branch_of_mut(parent)?.insert_after(idx, separator.clone(), new_page.id());
        branch.bump_version();

        debug!(index = %self.name, page = %branch.id(), new_page = %new_page.id(), "branch split");
        Ok(Some((separator, upper_latch)))
    }

    /// Moves the root's contents into two new children.
    fn grow_root(&self, root: &mut ExclusiveLatch, interrupt: &AtomicBool) -> Result<(), TreeError> {
        let old = root.replace_node(Node::Leaf(LeafNode::new()));
        let new_root = match old {
            Node::Leaf(mut lower) => {
                let mut upper = lower.split_off_upper();
                if upper.is_empty() {
                    root.set_node(Node::Leaf(lower));
                    return Ok(());
                }
                let separator = upper.entries()[0].row.clone();
                let lower_page = self.allocate(Node::Leaf(lower));
                upper.set_left(Some(lower_page.id()));
                let upper_page = self.allocate(Node::Leaf(upper));
                let mut lower_latch = lower_page.latch_exclusive(LatchWait::NoWait, interrupt)?;
                leaf_of_mut(&mut lower_latch)?.set_right(Some(upper_page.id()));
                BranchNode::from_parts(1, vec![separator], vec![lower_page.id(), upper_page.id()])
            }
            Node::Branch(mut lower) => {
                let level = lower.level();
                let Some((separator, upper)) = lower.split_off_upper() else {
                    root.set_node(Node::Branch(lower));
                    return Ok(());
                };
                let lower_page = self.allocate(Node::Branch(lower));
                let upper_page = self.allocate(Node::Branch(upper));
                BranchNode::from_parts(
                    level + 1,
                    vec![separator],
                    vec![lower_page.id(), upper_page.id()],
                )
            }
        };

        let level = new_root.level();
        root.set_node(Node::Branch(new_root));
        root.bump_version();
        debug!(index = %self.name, level, "root grew");
        Ok(())
    }
}
