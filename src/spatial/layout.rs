use crate::geometry::Aabb;

use nalgebra::Point3;
use rayon::prelude::*;
use std::ops::Range;

/// Shape of an implicit, complete binary tree over `items` entries of a permutation array
///
/// Node `i` has children `2i + 1` and `2i + 2`. All leaves sit on the same level, and node `k` of
/// level `l` owns the permutation range `[k·n / 2^l, (k + 1)·n / 2^l)`, so no node stores its
/// extent. The depth is the largest `d` with `n >> d >= min_leaf_count` (zero for small inputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLayout {
    items: usize,
    depth: u32,
}

impl TreeLayout {
    pub fn new(items: usize, min_leaf_count: usize) -> Self {
        let min = min_leaf_count.max(1);
        let mut depth = 0;
        while depth + 1 < usize::BITS && (items >> (depth + 1)) >= min {
            depth += 1;
        }
        Self { items, depth }
    }

    pub fn items(&self) -> usize {
        self.items
    }

    /// Level of the leaves (the root is level 0)
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn node_count(&self) -> usize {
        (1 << (self.depth + 1)) - 1
    }

    pub fn level_of(node: usize) -> u32 {
        usize::BITS - 1 - (node + 1).leading_zeros()
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        Self::level_of(node) == self.depth
    }

    pub fn children(&self, node: usize) -> Option<[usize; 2]> {
        if self.is_leaf(node) {
            None
        } else {
            Some([2 * node + 1, 2 * node + 2])
        }
    }

    /// Node ids of one level
    pub fn level_nodes(level: u32) -> Range<usize> {
        ((1 << level) - 1)..((1 << (level + 1)) - 1)
    }

    /// Leaf node ids
    pub fn leaves(&self) -> Range<usize> {
        Self::level_nodes(self.depth)
    }

    /// Range of the permutation array owned by `node`
    pub fn range(&self, node: usize) -> Range<usize> {
        let level = Self::level_of(node);
        let k = node + 1 - (1 << level);
        ((k * self.items) >> level)..(((k + 1) * self.items) >> level)
    }
}

/// Split `perm` into the disjoint sub-slices owned by the nodes of one level
fn split_level<'a>(
    layout: &TreeLayout,
    level: u32,
    mut perm: &'a mut [u32],
) -> Vec<(usize, &'a mut [u32])> {
    let nodes = TreeLayout::level_nodes(level);
    let mut parts = Vec::with_capacity(nodes.len());
    let mut offset = 0;
    for node in nodes {
        let end = layout.range(node).end;
        let (head, tail) = std::mem::take(&mut perm).split_at_mut(end - offset);
        parts.push((node, head));
        perm = tail;
        offset = end;
    }
    parts
}

/// Reorder `perm` so that every node's range holds the entries belonging to its subtree
///
/// Each node splits its entries at the median along the longest axis of the box spanned by
/// their `centers`. Levels are processed one after another; nodes within a level in parallel.
pub(crate) fn partition(layout: &TreeLayout, perm: &mut [u32], centers: &[Point3<f64>]) {
    for level in 0..layout.depth() {
        split_level(layout, level, perm)
            .into_par_iter()
            .for_each(|(node, slice)| {
                if slice.len() < 2 {
                    return;
                }
                let range = layout.range(node);
                let mid = layout.range(2 * node + 1).end - range.start;

                let axis =
                    Aabb::from_points(slice.iter().map(|&i| &centers[i as usize])).longest_axis();
                slice.select_nth_unstable_by(mid, |&a, &b| {
                    centers[a as usize][axis].total_cmp(&centers[b as usize][axis])
                });
            });
    }
}

/// Boxes of every node: leaves from `leaf_box`, internal nodes as the union of their children
pub(crate) fn fit_boxes<F>(layout: &TreeLayout, perm: &[u32], leaf_box: F) -> Vec<Aabb>
where
    F: Fn(&[u32]) -> Aabb + Sync,
{
    let mut boxes = vec![Aabb::empty(); layout.node_count()];

    let leaves = layout.leaves();
    let first_leaf = leaves.start;
    boxes[leaves]
        .par_iter_mut()
        .enumerate()
        .for_each(|(k, b)| *b = leaf_box(&perm[layout.range(first_leaf + k)]));

    for level in (0..layout.depth()).rev() {
        for node in TreeLayout::level_nodes(level) {
            let mut b = boxes[2 * node + 1];
            b.expand(&boxes[2 * node + 2]);
            boxes[node] = b;
        }
    }

    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_respects_min_leaf_count() {
        assert_eq!(TreeLayout::new(5, 8).depth(), 0);
        assert_eq!(TreeLayout::new(16, 8).depth(), 1);
        assert_eq!(TreeLayout::new(17, 8).depth(), 1);
        assert_eq!(TreeLayout::new(100, 8).depth(), 3);
        assert_eq!(TreeLayout::new(0, 8).node_count(), 1);
    }

    #[test]
    fn ranges_tile_every_level() {
        let layout = TreeLayout::new(37, 2);
        for level in 0..=layout.depth() {
            let mut next = 0;
            for node in TreeLayout::level_nodes(level) {
                let r = layout.range(node);
                assert_eq!(r.start, next);
                assert!(!r.is_empty());
                next = r.end;
            }
            assert_eq!(next, 37);
        }
        for node in 0..layout.node_count() {
            if let Some([l, r]) = layout.children(node) {
                assert_eq!(layout.range(l).start, layout.range(node).start);
                assert_eq!(layout.range(r).end, layout.range(node).end);
                assert_eq!(layout.range(l).end, layout.range(r).start);
            }
        }
    }

    #[test]
    fn partition_separates_along_longest_axis() {
        let centers: Vec<Point3<f64>> = (0..8)
            .rev()
            .map(|i| Point3::new(i as f64, 0.0, 0.0))
            .collect();
        let layout = TreeLayout::new(8, 1);
        let mut perm: Vec<u32> = (0..8).collect();
        partition(&layout, &mut perm, &centers);

        for leaf in layout.leaves() {
            let r = layout.range(leaf);
            let x: Vec<f64> = perm[r].iter().map(|&i| centers[i as usize].x).collect();
            assert_eq!(x.len(), 1);
            assert_eq!(x[0], (leaf - layout.leaves().start) as f64);
        }

        let boxes = fit_boxes(&layout, &perm, |ids| {
            Aabb::from_points(ids.iter().map(|&i| &centers[i as usize]))
        });
        assert_eq!(boxes[0].min.x, 0.0);
        assert_eq!(boxes[0].max.x, 7.0);
        assert_eq!(boxes[1].max.x, 3.0);
    }
}
