use super::layout::{self, TreeLayout};
use crate::error::{MapError, MapResult};
use crate::geometry::triangle::triangle_center;
use crate::geometry::{closest_point, intersection_segment, triangles_intersect, Aabb};

use nalgebra::Point3;
use rayon::prelude::*;
use smallvec::SmallVec;
use std::sync::Mutex;

/// Result of a nearest-triangle query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Index into the triangle list the index was built from
    pub triangle: u32,
    /// Clamped barycentric weights of the foot point
    pub weights: [f64; 3],
    /// Squared distance from the query point to the foot point
    pub dist2: f64,
    pub foot: Point3<f64>,
}

/// Balanced bounding-volume hierarchy over a triangle set
///
/// Nodes live in a flat array addressed through [`TreeLayout`]; leaves own contiguous ranges
/// of a triangle permutation. Split axes follow the triangle centers while the boxes are fit
/// to the triangle vertices.
#[derive(Debug, Clone)]
pub struct SpatialTriangleIndex {
    vertices: Vec<Point3<f64>>,
    triangles: Vec<[u32; 3]>,
    perm: Vec<u32>,
    boxes: Vec<Aabb>,
    layout: TreeLayout,
}

impl SpatialTriangleIndex {
    /// Build the tree; fewer than `min_leaf_count` triangles end up in a single leaf
    pub fn build(
        vertices: &[Point3<f64>],
        triangles: &[[u32; 3]],
        min_leaf_count: usize,
    ) -> MapResult<Self> {
        if let Some(&bad) = triangles
            .iter()
            .flatten()
            .find(|&&v| v as usize >= vertices.len())
        {
            return Err(MapError::InvalidIndex {
                kind: "vertex",
                index: bad as usize,
                count: vertices.len(),
            });
        }

        let layout = TreeLayout::new(triangles.len(), min_leaf_count);
        let centers: Vec<Point3<f64>> = triangles
            .par_iter()
            .map(|t| triangle_center(&t.map(|v| vertices[v as usize])))
            .collect();

        let mut perm: Vec<u32> = (0..triangles.len() as u32).collect();
        layout::partition(&layout, &mut perm, &centers);

        let boxes = layout::fit_boxes(&layout, &perm, |ids| {
            Aabb::from_points(
                ids.iter()
                    .flat_map(|&t| triangles[t as usize].iter())
                    .map(|&v| &vertices[v as usize]),
            )
        });

        tracing::debug!(
            triangles = triangles.len(),
            depth = layout.depth(),
            nodes = layout.node_count(),
            "triangle tree built"
        );

        Ok(Self {
            vertices: vertices.to_vec(),
            triangles: triangles.to_vec(),
            perm,
            boxes,
            layout,
        })
    }

    /// Number of triangles
    pub fn len(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Number of tree nodes
    pub fn node_count(&self) -> usize {
        self.layout.node_count()
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        self.layout.is_leaf(node)
    }

    pub fn bounds(&self, node: usize) -> &Aabb {
        &self.boxes[node]
    }

    /// Vertex indices of triangle `i`
    pub fn triangle(&self, i: u32) -> [u32; 3] {
        self.triangles[i as usize]
    }

    pub fn triangle_points(&self, i: u32) -> [Point3<f64>; 3] {
        self.triangles[i as usize].map(|v| self.vertices[v as usize])
    }

    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    fn leaf_triangles(&self, node: usize) -> &[u32] {
        &self.perm[self.layout.range(node)]
    }

    /// Closest triangle to `p`; `None` for an empty index
    pub fn nearest_triangle(&self, p: &Point3<f64>) -> Option<Projection> {
        if self.is_empty() {
            return None;
        }

        let mut best: Option<Projection> = None;
        let mut best_d2 = f64::INFINITY;
        let mut stack: SmallVec<[usize; 64]> = SmallVec::new();
        stack.push(0);

        while let Some(node) = stack.pop() {
            if self.boxes[node].distance_squared(p) > best_d2 {
                continue;
            }
            match self.layout.children(node) {
                None => {
                    for &t in self.leaf_triangles(node) {
                        let [a, b, c] = self.triangle_points(t);
                        let foot = closest_point(p, &a, &b, &c);
                        let d2 = (foot.point - p).norm_squared();
                        if d2 < best_d2 {
                            best_d2 = d2;
                            best = Some(Projection {
                                triangle: t,
                                weights: foot.weights,
                                dist2: d2,
                                foot: foot.point,
                            });
                        }
                    }
                }
                Some([l, r]) => {
                    let dl = self.boxes[l].distance_squared(p);
                    let dr = self.boxes[r].distance_squared(p);
                    // nearer child is popped first
                    if dl <= dr {
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

    /// All pairs `(self triangle, other triangle)` that intersect
    ///
    /// The two trees are walked breadth-first: every round expands the current frontier of node
    /// pairs, dropping pairs with disjoint boxes and testing leaf/leaf pairs exactly. With
    /// `parallel`, a round is split across the rayon pool; each worker collects into private
    /// buffers that are merged before the next round starts.
    pub fn intersect(&self, other: &Self, parallel: bool) -> Vec<(u32, u32)> {
        if self.is_empty() || other.is_empty() {
            return Vec::new();
        }

        let mut frontier = vec![(0_usize, 0_usize)];
        let mut pairs = Vec::new();
        let mut rounds = 0;

        while !frontier.is_empty() {
            rounds += 1;
            if parallel {
                let merged = Mutex::new((Vec::new(), Vec::new()));
                frontier
                    .par_iter()
                    .fold(
                        || (Vec::new(), Vec::new()),
                        |(mut next, mut hits), &pair| {
                            self.expand_pair(other, pair, &mut next, &mut hits);
                            (next, hits)
                        },
                    )
                    .for_each(|(next, hits)| {
                        let mut guard = match merged.lock() {
                            Ok(g) => g,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        guard.0.extend(next);
                        guard.1.extend(hits);
                    });
                let (next, hits) = match merged.into_inner() {
                    Ok(m) => m,
                    Err(poisoned) => poisoned.into_inner(),
                };
                frontier = next;
                pairs.extend(hits);
            } else {
                let mut next = Vec::new();
                for &pair in frontier.iter() {
                    self.expand_pair(other, pair, &mut next, &mut pairs);
                }
                frontier = next;
            }
        }

        pairs.sort_unstable();
        pairs.dedup();
        tracing::debug!(pairs = pairs.len(), rounds, parallel, "tree intersection done");
        pairs
    }

    fn expand_pair(
        &self,
        other: &Self,
        (a, b): (usize, usize),
        next: &mut Vec<(usize, usize)>,
        hits: &mut Vec<(u32, u32)>,
    ) {
        if !self.boxes[a].overlaps(&other.boxes[b]) {
            return;
        }
        match (self.layout.children(a), other.layout.children(b)) {
            (None, None) => {
                for &ta in self.leaf_triangles(a) {
                    let pa = self.triangle_points(ta);
                    let ba = Aabb::from_points(pa.iter());
                    for &tb in other.leaf_triangles(b) {
                        let pb = other.triangle_points(tb);
                        if ba.overlaps(&Aabb::from_points(pb.iter())) && triangles_intersect(&pa, &pb) {
                            hits.push((ta, tb));
                        }
                    }
                }
            }
            (Some([al, ar]), None) => next.extend([(al, b), (ar, b)]),
            (None, Some([bl, br])) => next.extend([(a, bl), (a, br)]),
            (Some([al, ar]), Some([bl, br])) => {
                next.extend([(al, bl), (al, br), (ar, bl), (ar, br)])
            }
        }
    }

    /// Intersection segments of the given triangle pairs; coplanar pairs are skipped
    pub fn segments(&self, other: &Self, pairs: &[(u32, u32)]) -> Vec<(Point3<f64>, Point3<f64>)> {
        pairs
            .par_iter()
            .filter_map(|&(a, b)| {
                intersection_segment(&self.triangle_points(a), &other.triangle_points(b))
            })
            .collect()
    }
}
