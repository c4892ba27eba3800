use super::layout::{self, TreeLayout};
use crate::geometry::Aabb;

use nalgebra::Point3;
use rayon::prelude::*;
use smallvec::SmallVec;

/// Balanced box tree over a point cloud, sharing the implicit layout of the triangle index
#[derive(Debug, Clone)]
pub struct PointTree {
    points: Vec<Point3<f64>>,
    perm: Vec<u32>,
    boxes: Vec<Aabb>,
    layout: TreeLayout,
}

impl PointTree {
    pub fn build(points: &[Point3<f64>], min_leaf_count: usize) -> Self {
        let layout = TreeLayout::new(points.len(), min_leaf_count);
        let mut perm: Vec<u32> = (0..points.len() as u32).collect();
        layout::partition(&layout, &mut perm, points);
        let boxes = layout::fit_boxes(&layout, &perm, |ids| {
            Aabb::from_points(ids.iter().map(|&i| &points[i as usize]))
        });

        Self {
            points: points.to_vec(),
            perm,
            boxes,
            layout,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, i: u32) -> &Point3<f64> {
        &self.points[i as usize]
    }

    /// Indices of all points within `radius` of `p`, sorted
    pub fn within(&self, p: &Point3<f64>, radius: f64) -> Vec<u32> {
        let r2 = radius * radius;
        let mut found = Vec::new();
        if self.is_empty() {
            return found;
        }

        let mut stack: SmallVec<[usize; 64]> = SmallVec::new();
        stack.push(0);
        while let Some(node) = stack.pop() {
            if self.boxes[node].distance_squared(p) > r2 {
                continue;
            }
            match self.layout.children(node) {
                None => found.extend(
                    self.perm[self.layout.range(node)]
                        .iter()
                        .filter(|&&i| (self.points[i as usize] - p).norm_squared() <= r2),
                ),
                Some([l, r]) => {
                    stack.push(l);
                    stack.push(r);
                }
            }
        }

        found.sort_unstable();
        found
    }

    /// Closest point to `p` and its squared distance
    pub fn nearest(&self, p: &Point3<f64>) -> Option<(u32, f64)> {
        let mut best: Option<(u32, f64)> = None;
        if self.is_empty() {
            return best;
        }

        let mut stack: SmallVec<[usize; 64]> = SmallVec::new();
        stack.push(0);
        while let Some(node) = stack.pop() {
            let bound = best.map_or(f64::INFINITY, |(_, d)| d);
            if self.boxes[node].distance_squared(p) > bound {
                continue;
            }
            match self.layout.children(node) {
                None => {
                    for &i in self.perm[self.layout.range(node)].iter() {
                        let d2 = (self.points[i as usize] - p).norm_squared();
                        if best.map_or(true, |(_, d)| d2 < d) {
                            best = Some((i, d2));
                        }
                    }
                }
                Some([l, r]) => {
                    if self.boxes[l].distance_squared(p) <= self.boxes[r].distance_squared(p) {
                        stack.push(r);
                        stack.push(l);
                    } else {
                        stack.push(l);
                        stack.push(r);
                    }
                }
            }
        }
        best
    }

    /// Box centers of all leaves
    pub fn leaf_centers(&self) -> Vec<Point3<f64>> {
        self.level_centers(self.layout.depth())
    }

    /// About `target_count` sample locations: box centers of the shallowest level with at least
    /// that many nodes (or of the leaves, if the tree is not deep enough)
    pub fn sample_centers(&self, target_count: usize) -> Vec<Point3<f64>> {
        let mut level = 0;
        while level < self.layout.depth() && (1_usize << level) < target_count {
            level += 1;
        }
        self.level_centers(level)
    }

    fn level_centers(&self, level: u32) -> Vec<Point3<f64>> {
        if self.is_empty() {
            return Vec::new();
        }
        TreeLayout::level_nodes(level)
            .filter(|&n| self.boxes[n].is_valid())
            .map(|n| self.boxes[n].center())
            .collect()
    }

    /// Pairs `(i, j)`, `i < j`, of distinct points closer than `tol`
    pub fn coincident_pairs(&self, tol: f64) -> Vec<(u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = (0..self.len() as u32)
            .into_par_iter()
            .flat_map_iter(|i| {
                self.within(&self.points[i as usize], tol)
                    .into_iter()
                    .filter(move |&j| j > i)
                    .map(move |j| (i, j))
            })
            .collect();
        pairs.sort_unstable();
        pairs
    }
}
