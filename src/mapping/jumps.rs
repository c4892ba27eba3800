use crate::config::JumpConfig;
use crate::mesh::{Adjacency, Mesh, SurfaceTriangle};
use crate::spatial::{PointTree, Projection};

use nalgebra::Point3;
use rayon::prelude::*;

/// Offsets shorter than this fraction of the edge length carry no usable direction
const TINY_OFFSET: f64 = 1e-6;

/// Number of nodes flagged by each heuristic (a node may count more than once)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JumpReport {
    pub component: usize,
    pub angle: usize,
    pub distance: usize,
    pub concavity: usize,
    pub coincident: usize,
    /// Flagged nodes after growth
    pub total: usize,
}

/// Structural component of every surface triangle
pub fn triangle_components(structure: &Mesh, triangles: &[SurfaceTriangle]) -> Vec<u32> {
    let (components, count) = structure.element_components();
    tracing::debug!(components = count, "structural components");
    triangles
        .iter()
        .map(|t| components[t.element as usize])
        .collect()
}

/// Triangles touching a structural node that has a distinct node within `tol`
pub fn coincident_triangles(structure: &Mesh, triangles: &[SurfaceTriangle], tol: f64) -> Vec<bool> {
    if !(tol > 0.0) {
        return vec![false; triangles.len()];
    }
    let tree = PointTree::build(&structure.nodes, 8);
    let mut touched = vec![false; structure.nodes.len()];
    for (i, j) in tree.coincident_pairs(tol) {
        touched[i as usize] = true;
        touched[j as usize] = true;
    }
    triangles
        .iter()
        .map(|t| t.nodes.iter().any(|&n| touched[n as usize]))
        .collect()
}

/// Flags mapped nodes where the projection is likely discontinuous
///
/// All slices are indexed by mapped row; rows without a projection are never flagged.
pub struct JumpDetector<'a> {
    pub config: &'a JumpConfig,
    pub points: &'a [Point3<f64>],
    pub projections: &'a [Option<Projection>],
    pub adjacency: &'a Adjacency,
    /// Component of every structural triangle
    pub components: &'a [u32],
    /// Structural triangles touching coincident nodes
    pub near_coincident: &'a [bool],
}

impl<'a> JumpDetector<'a> {
    /// Union of all enabled heuristics
    pub fn detect(&self) -> (Vec<bool>, JumpReport) {
        let n = self.points.len();
        let mut flags = vec![false; n];
        let mut report = JumpReport::default();

        if self.config.component_jumps {
            report.component = merge(&mut flags, &self.component_jumps());
        }
        if self.config.max_angle.is_finite() {
            report.angle = merge(&mut flags, &self.angle_jumps());
        }
        if self.config.max_distance.is_finite() {
            report.distance = merge(&mut flags, &self.distance_jumps());
        }
        if self.config.concavity_ratio.is_finite() {
            report.concavity = merge(&mut flags, &self.concavity_jumps());
        }
        if self.config.coincident_tolerance > 0.0 {
            report.coincident = merge(&mut flags, &self.coincident_jumps());
        }

        report.total = flags.iter().filter(|f| **f).count();
        (flags, report)
    }

    /// Flag every row for which `test(i, j)` holds with some neighbor `j`
    fn pairwise<F>(&self, test: F) -> Vec<bool>
    where
        F: Fn(&Projection, &Projection, usize, usize) -> bool + Sync,
    {
        (0..self.points.len())
            .into_par_iter()
            .map(|i| {
                let pi = match &self.projections[i] {
                    Some(p) => p,
                    None => return false,
                };
                self.adjacency.neighbors(i).iter().any(|&j| {
                    let j = j as usize;
                    self.projections[j]
                        .as_ref()
                        .map_or(false, |pj| test(pi, pj, i, j))
                })
            })
            .collect()
    }

    /// Neighbors that project onto different structural components
    pub fn component_jumps(&self) -> Vec<bool> {
        self.pairwise(|pi, pj, _, _| {
            self.components[pi.triangle as usize] != self.components[pj.triangle as usize]
        })
    }

    /// Neighbors whose projection offsets point in clearly different directions
    pub fn angle_jumps(&self) -> Vec<bool> {
        let cos_max = self.config.max_angle.to_radians().cos();
        self.pairwise(|pi, pj, i, j| {
            let oi = pi.foot - self.points[i];
            let oj = pj.foot - self.points[j];
            let tiny = TINY_OFFSET * (self.points[i] - self.points[j]).norm();
            let (ni, nj) = (oi.norm(), oj.norm());
            if ni <= tiny || nj <= tiny {
                return false;
            }
            oi.dot(&oj) / (ni * nj) < cos_max
        })
    }

    /// Nodes farther than the distance limit from the structure
    pub fn distance_jumps(&self) -> Vec<bool> {
        let d2 = self.config.max_distance * self.config.max_distance;
        self.projections
            .iter()
            .map(|p| p.map_or(false, |p| p.dist2 > d2))
            .collect()
    }

    /// Neighbor distances that shrink or stretch too much between targets and foot points
    pub fn concavity_jumps(&self) -> Vec<bool> {
        let ratio = self.config.concavity_ratio;
        self.pairwise(|pi, pj, i, j| {
            let dt = (self.points[i] - self.points[j]).norm();
            let df = (pi.foot - pj.foot).norm();
            dt > 0.0 && (df - dt).abs() > ratio * dt
        })
    }

    /// Nodes projecting onto a triangle that touches coincident structural nodes
    pub fn coincident_jumps(&self) -> Vec<bool> {
        self.projections
            .iter()
            .map(|p| p.map_or(false, |p| self.near_coincident[p.triangle as usize]))
            .collect()
    }
}

fn merge(flags: &mut [bool], found: &[bool]) -> usize {
    let mut count = 0;
    for (f, &n) in flags.iter_mut().zip(found.iter()) {
        if n {
            *f = true;
            count += 1;
        }
    }
    count
}

/// Grow flagged rows by `rings` topological rings and by every row within `radius`
///
/// Rows that are not `active` are cleared afterwards.
pub fn grow(
    flags: &mut [bool],
    adjacency: &Adjacency,
    rings: usize,
    radius: f64,
    points: &[Point3<f64>],
    active: &[bool],
) {
    adjacency.grow(flags, rings);

    if radius > 0.0 && flags.iter().any(|f| *f) {
        let tree = PointTree::build(points, 8);
        let seeds: Vec<usize> = (0..flags.len()).filter(|&i| flags[i]).collect();
        let near: Vec<u32> = seeds
            .par_iter()
            .flat_map_iter(|&i| tree.within(&points[i], radius))
            .collect();
        for j in near {
            flags[j as usize] = true;
        }
    }

    for (f, a) in flags.iter_mut().zip(active.iter()) {
        *f &= *a;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(triangle: u32, foot: Point3<f64>, target: &Point3<f64>) -> Option<Projection> {
        Some(Projection {
            triangle,
            weights: [1.0, 0.0, 0.0],
            dist2: (foot - target).norm_squared(),
            foot,
        })
    }

    /// Four nodes on a line, 0 - 1 - 2 - 3
    fn chain() -> (Vec<Point3<f64>>, Adjacency) {
        let points = (0..4).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        let adj = Adjacency::from_lists(vec![vec![1], vec![0, 2], vec![1, 3], vec![2]]);
        (points, adj)
    }

    #[test]
    fn neighbors_on_different_components() {
        let (points, adj) = chain();
        let projections: Vec<_> = points
            .iter()
            .enumerate()
            .map(|(i, p)| projection(if i < 2 { 0 } else { 1 }, p + nalgebra::Vector3::z(), p))
            .collect();
        let config = JumpConfig::disabled().with_component_jumps(true);
        let det = JumpDetector {
            config: &config,
            points: &points,
            projections: &projections,
            adjacency: &adj,
            components: &[0, 1],
            near_coincident: &[false, false],
        };
        let (flags, report) = det.detect();
        assert_eq!(flags, vec![false, true, true, false]);
        assert_eq!(report.component, 2);
        assert_eq!(report.total, 2);
    }

    #[test]
    fn diverging_offsets_are_flagged() {
        let (points, adj) = chain();
        let offsets = [
            nalgebra::Vector3::z(),
            nalgebra::Vector3::z(),
            nalgebra::Vector3::new(1.0, 0.0, 0.0),
            nalgebra::Vector3::new(1.0, 0.0, 0.1),
        ];
        let projections: Vec<_> = points
            .iter()
            .zip(offsets.iter())
            .map(|(p, o)| projection(0, p + o, p))
            .collect();
        let config = JumpConfig::disabled().with_max_angle(45.0);
        let det = JumpDetector {
            config: &config,
            points: &points,
            projections: &projections,
            adjacency: &adj,
            components: &[0],
            near_coincident: &[false],
        };
        assert_eq!(det.angle_jumps(), vec![false, true, true, false]);

        // zero offsets have no direction
        let flat: Vec<_> = points.iter().map(|p| projection(0, *p, p)).collect();
        let det = JumpDetector {
            projections: &flat,
            ..det
        };
        assert!(det.angle_jumps().iter().all(|f| !f));
    }

    #[test]
    fn distance_limit() {
        let (points, adj) = chain();
        let projections: Vec<_> = points
            .iter()
            .enumerate()
            .map(|(i, p)| projection(0, p + nalgebra::Vector3::z() * i as f64, p))
            .collect();
        let config = JumpConfig::disabled().with_max_distance(1.5);
        let det = JumpDetector {
            config: &config,
            points: &points,
            projections: &projections,
            adjacency: &adj,
            components: &[0],
            near_coincident: &[false],
        };
        let (flags, report) = det.detect();
        assert_eq!(flags, vec![false, false, true, true]);
        assert_eq!(report.distance, 2);
    }

    #[test]
    fn collapsing_feet_are_concave() {
        let (points, adj) = chain();
        let feet = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.5, 0.0, 0.0),
            Point3::new(1.6, 0.0, 0.0),
            Point3::new(2.6, 0.0, 0.0),
        ];
        let projections: Vec<_> = points
            .iter()
            .zip(feet.iter())
            .map(|(p, f)| projection(0, *f, p))
            .collect();
        let config = JumpConfig::disabled().with_concavity_ratio(0.5);
        let det = JumpDetector {
            config: &config,
            points: &points,
            projections: &projections,
            adjacency: &adj,
            components: &[0],
            near_coincident: &[false],
        };
        // 1 and 2 end up 0.1 apart instead of 1.0
        assert_eq!(det.concavity_jumps(), vec![false, true, true, false]);
    }

    #[test]
    fn coincident_structural_nodes() {
        let mut structure = Mesh::from_triangles(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(2.0, 0.0, 0.0),
                Point3::new(2.0, 1.0, 0.0),
                Point3::new(5.0, 5.0, 0.0),
                Point3::new(6.0, 5.0, 0.0),
                Point3::new(5.0, 6.0, 0.0),
            ],
            &[[0, 1, 2], [3, 4, 5], [6, 7, 8]],
        );
        let triangles = structure.surface_triangles();
        assert_eq!(
            coincident_triangles(&structure, &triangles, 1e-6),
            vec![true, true, false]
        );
        assert_eq!(
            coincident_triangles(&structure, &triangles, 0.0),
            vec![false, false, false]
        );

        // the two hinged triangles share no node, so they are separate components
        assert_eq!(triangle_components(&structure, &triangles), vec![0, 1, 2]);
        structure.elements[1].nodes[0] = 1;
        assert_eq!(triangle_components(&structure, &triangles), vec![0, 0, 1]);
    }

    #[test]
    fn growth_by_rings_and_radius() {
        let points: Vec<Point3<f64>> = (0..6).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        let adj = Adjacency::from_lists(
            (0..6_u32)
                .map(|i| {
                    let mut l = Vec::new();
                    if i > 0 {
                        l.push(i - 1);
                    }
                    if i < 5 {
                        l.push(i + 1);
                    }
                    l
                })
                .collect(),
        );
        let active = vec![true, true, true, true, false, true];

        let mut flags = vec![true, false, false, false, false, false];
        grow(&mut flags, &adj, 1, 0.0, &points, &active);
        assert_eq!(flags, vec![true, true, false, false, false, false]);

        let mut flags = vec![true, false, false, false, false, false];
        grow(&mut flags, &adj, 0, 2.5, &points, &active);
        assert_eq!(flags, vec![true, true, true, false, false, false]);

        // inactive rows are cleared
        let mut flags = vec![false, false, false, false, true, false];
        grow(&mut flags, &adj, 1, 0.0, &points, &active);
        assert_eq!(flags, vec![false, false, false, true, false, true]);
    }
}
