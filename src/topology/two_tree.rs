//! Dual edge-disjoint spanning trees.
//!
//! Two trees are built over the non-root ranks so that two segment streams
//! can be pipelined concurrently without contending for the same tree
//! edge. Ranks are shifted so the root takes the highest virtual rank and
//! the remaining `p = size - 1` ranks form the index range `[0, p)`; tree
//! 1 is tree 0's mirror under a one-position rotation of that range. The
//! constructions are meaningful for `size >= 3`; smaller groups degenerate
//! to childless trees.

use super::{Tree, ceil_log2, check_group};
use crate::error::Result;
use crate::types::Rank;

/// Virtual rank with the root rotated to the highest position.
fn two_tree_vrank(size: usize, rank: usize, root: usize) -> usize {
    (rank + size - 1 - root) % size
}

/// Map a tree-0 virtual rank back to a real rank.
fn unshift0(size: usize, vrank: usize, root: usize) -> Rank {
    ((vrank + 1 + root) % size) as Rank
}

/// Map a tree-1 (rotated) virtual rank back to a real rank.
fn unshift1(size: usize, vrank: usize, root: usize) -> Rank {
    (((vrank + size - 2) % (size - 1) + 1 + root) % size) as Rank
}

/// Children and parent of `vrank` in the level-structured binary tree over
/// `[0, p)`: a node sits on level `j` when `vrank % 2^(j+1) == 2^j - 1`.
fn binary_tree_links(vrank: usize, p: usize, h: u32, size: usize) -> (Vec<usize>, Option<usize>) {
    let mut children = Vec::new();
    let mut parent = None;

    for j in 0..h {
        if vrank % (1usize << (j + 1)) != (1usize << j) - 1 {
            continue;
        }
        if j != 0 {
            // Left child is always in range.
            children.push(vrank - (1 << (j - 1)));

            let right = vrank + (1 << (j - 1));
            if right < p {
                children.push(right);
            } else if vrank != p - 1 {
                // Right subtree is short; its root sits closer.
                let right_p = p - vrank - 1;
                let right_h = ceil_log2(right_p + 1);
                children.push(vrank + (1 << (right_h - 1)));
            }
        }
        if j != h - 1 {
            let mut parent_vrank = (vrank + size - (1 << j)) % size;
            if parent_vrank % (1 << (j + 2)) != (1 << (j + 1)) - 1 {
                parent_vrank = (vrank + (1 << j)) % size;
            }
            parent = Some(parent_vrank);
        }
        // j == h-1 leaves `parent` as None: the topmost internal node
        // hangs off the root.
    }

    (children, parent)
}

/// Build two edge-disjoint binary spanning trees over the non-root ranks.
///
/// Every rank is internal in at most one of the two trees, so segments
/// alternating between the trees never contend for the same edge. The
/// construction is balanced for group sizes where `size - 1` is of the
/// form `2^h` or `2^h - 1` (and for small groups); other sizes should
/// prefer the binomial variant.
pub fn build_two_binary_trees(size: u32, rank: Rank, root: Rank) -> Result<[Tree; 2]> {
    check_group(size, rank, root)?;
    tracing::trace!(size, rank, root, "building two binary trees");

    let size = size as usize;
    let p = size - 1;
    let mut trees = [Tree::childless(root, 2), Tree::childless(root, 2)];
    if p <= 1 {
        return Ok(trees);
    }

    let h = ceil_log2(p + 1);
    let vrank = two_tree_vrank(size, rank as usize, root as usize);

    if vrank != p {
        let (children, parent) = binary_tree_links(vrank, p, h, size);
        trees[0].children = children
            .iter()
            .map(|&c| unshift0(size, c, root as usize))
            .collect();
        trees[0].parent = Some(match parent {
            Some(pv) => unshift0(size, pv, root as usize),
            None => root,
        });

        let rotated = (vrank + 1) % (size - 1);
        let (children, parent) = binary_tree_links(rotated, p, h, size);
        trees[1].children = children
            .iter()
            .map(|&c| unshift1(size, c, root as usize))
            .collect();
        trees[1].parent = Some(match parent {
            Some(pv) => unshift1(size, pv, root as usize),
            None => root,
        });
    } else {
        // Root: one child per tree, the topmost internal node of each.
        trees[0].children = vec![unshift0(size, (1usize << (h - 1)) - 1, root as usize)];
        trees[1].children = vec![unshift1(size, (1usize << (h - 1)) - 1, root as usize)];
    }

    Ok(trees)
}

/// Append `child` under `parent` in the adjacency matrix.
fn add_edge(tree: &mut [Vec<usize>], parent: usize, child: usize) {
    tree[parent].push(child);
}

/// Recursively bisect `[start, end]`, hanging each half's head off the
/// current head. `tree_id` 0 grows left-to-right, 1 is its mirror.
fn divide_group(tree: &mut [Vec<usize>], start: usize, end: usize, tree_id: usize) {
    if end - start == 1 {
        if tree_id == 0 {
            add_edge(tree, start, end);
        } else {
            add_edge(tree, end, start);
        }
    } else if end - start == 2 {
        if tree_id == 0 {
            add_edge(tree, start, start + 1);
            add_edge(tree, start + 1, end);
        } else {
            add_edge(tree, end, start);
            add_edge(tree, start, start + 1);
        }
    } else if end - start > 2 {
        let mid = (end - start) / 2 + start;
        if tree_id == 0 {
            add_edge(tree, start, mid + 1);
        } else {
            add_edge(tree, end, mid);
        }
        divide_group(tree, start, mid, tree_id);
        divide_group(tree, mid + 1, end, tree_id);
    }
}

/// Build two edge-disjoint binomial-shaped spanning trees over the
/// non-root ranks via recursive balanced bisection of `[0, p - 1]`.
///
/// Tree 0's internal nodes are tree 1's leaves and vice versa, giving
/// directed-edge-disjoint child sets for any group size.
pub fn build_two_binomial_trees(size: u32, rank: Rank, root: Rank) -> Result<[Tree; 2]> {
    check_group(size, rank, root)?;
    tracing::trace!(size, rank, root, "building two binomial trees");

    let size = size as usize;
    let p = size - 1;
    let max_children = ceil_log2(p.max(1)).max(1) as usize;
    let mut trees = [
        Tree::childless(root, max_children),
        Tree::childless(root, max_children),
    ];
    if p <= 1 {
        return Ok(trees);
    }

    let mut adj0: Vec<Vec<usize>> = vec![Vec::new(); p];
    let mut adj1: Vec<Vec<usize>> = vec![Vec::new(); p];
    divide_group(&mut adj0, 0, p - 1, 0);
    divide_group(&mut adj1, 0, p - 1, 1);

    let vrank = two_tree_vrank(size, rank as usize, root as usize);

    let fill = |tree: &mut Tree, adj: &[Vec<usize>], top: usize| {
        if vrank != p {
            tree.children = adj[vrank]
                .iter()
                .map(|&c| unshift0(size, c, root as usize))
                .collect();
            tree.parent = if vrank == top {
                Some(root)
            } else {
                adj.iter()
                    .position(|row| row.contains(&vrank))
                    .map(|parent_vrank| unshift0(size, parent_vrank, root as usize))
            };
        } else {
            tree.children = vec![unshift0(size, top, root as usize)];
        }
    };
    fill(&mut trees[0], &adj0, 0);
    fill(&mut trees[1], &adj1, p - 1);

    Ok(trees)
}
