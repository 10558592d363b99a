use std::sync::atomic::AtomicBool;

use crate::btree::BTree;
use crate::page::{IndexRow, Node, PageBody, PageId};

/// Checks every structural invariant of `tree` and returns its entry
/// count (delete-marked entries included).
///
/// - all leaves are at the same depth and branch levels match it;
/// - every entry lies within the separator bounds of its path;
/// - the leaf chain visits exactly the leaves of the tree, in order,
///   with consistent left and right links;
/// - entries are strictly ascending across the whole chain.
pub fn verify(tree: &BTree) -> usize {
    let interrupt = AtomicBool::new(false);
    let root = tree.latch_shared(tree.root_id(), &interrupt).unwrap();
    let mut leaves = Vec::new();
    walk(tree, &root, None, None, &mut leaves, &interrupt);
    drop(root);

    let chain = tree.leaf_ids(&interrupt).unwrap();
    let ids: Vec<PageId> = leaves.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids, chain, "leaf chain differs from tree order");

    for (i, (id, left, right)) in leaves.iter().enumerate() {
        let expected_left = if i == 0 { None } else { Some(leaves[i - 1].0) };
        let expected_right = leaves.get(i + 1).map(|l| l.0);
        assert_eq!(*left, expected_left, "bad left link on {id}");
        assert_eq!(*right, expected_right, "bad right link on {id}");
    }

    let entries = tree.entries(&interrupt).unwrap();
    assert!(
        entries.windows(2).all(|w| w[0].row < w[1].row),
        "entries not strictly ascending"
    );
    entries.len()
}

/// Returns the depth below `page`: 0 for a leaf.
fn walk(
    tree: &BTree,
    page: &PageBody,
    lo: Option<&IndexRow>,
    hi: Option<&IndexRow>,
    leaves: &mut Vec<(PageId, Option<PageId>, Option<PageId>)>,
    interrupt: &AtomicBool,
) -> u16 {
    assert!(!page.is_freed(), "reachable page {} is freed", page.id());
    match page.node() {
        Node::Leaf(leaf) => {
            for entry in leaf.entries() {
                if let Some(lo) = lo {
                    assert!(&entry.row >= lo, "{} below lower bound {lo}", entry.row);
                }
                if let Some(hi) = hi {
                    assert!(&entry.row < hi, "{} not below upper bound {hi}", entry.row);
                }
            }
            leaves.push((page.id(), leaf.left(), leaf.right()));
            0
        }
        Node::Branch(branch) => {
            let seps = branch.separators();
            let children = branch.children();
            assert_eq!(children.len(), seps.len() + 1, "branch {} shape", page.id());
            assert!(seps.windows(2).all(|w| w[0] < w[1]), "separators unsorted");

            let mut depth = None;
            for (i, child) in children.iter().enumerate() {
                let child_lo = if i == 0 { lo } else { Some(&seps[i - 1]) };
                let child_hi = seps.get(i).or(hi);
                let latch = tree.latch_shared(*child, interrupt).unwrap();
                let d = walk(tree, &latch, child_lo, child_hi, leaves, interrupt);
                match depth {
                    None => depth = Some(d),
                    Some(prev) => assert_eq!(prev, d, "unbalanced under {}", page.id()),
                }
            }
            let depth = depth.unwrap_or(0) + 1;
            assert_eq!(branch.level(), depth, "level of branch {}", page.id());
            depth
        }
    }
}
