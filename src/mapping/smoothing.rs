use crate::config::DiffusionOperator;
use crate::error::{MapError, MapResult};
use crate::linalg::{ElementContribution, MatrixClass, SolverRegistry, SplitSystem};
use crate::mesh::{Adjacency, Mesh};
use crate::node_sets::NodeSet;

use nalgebra::{DMatrix, Matrix2x3, Matrix3, Matrix3x2, Point3, Vector3};
use rayon::prelude::*;
use std::collections::VecDeque;

/// Values that can be linearly blended during relaxation
pub trait Blend: Clone + Send + Sync {
    fn zero() -> Self;
    /// `self += s * other`
    fn add_scaled(&mut self, other: &Self, s: f64);
}

impl Blend for Vector3<f64> {
    fn zero() -> Self {
        Vector3::zeros()
    }

    fn add_scaled(&mut self, other: &Self, s: f64) {
        *self += other * s;
    }
}

/// Sparse linear combination of operator rows, sorted by row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowCombination(pub Vec<(usize, f64)>);

impl RowCombination {
    pub fn unit(row: usize) -> Self {
        Self(vec![(row, 1.0)])
    }
}

impl Blend for RowCombination {
    fn zero() -> Self {
        Self(Vec::new())
    }

    fn add_scaled(&mut self, other: &Self, s: f64) {
        let mut merged = Vec::with_capacity(self.0.len() + other.0.len());
        let (a, b) = (&self.0, &other.0);
        let (mut i, mut j) = (0, 0);
        while i < a.len() || j < b.len() {
            if j == b.len() || (i < a.len() && a[i].0 < b[j].0) {
                merged.push(a[i]);
                i += 1;
            } else if i == a.len() || b[j].0 < a[i].0 {
                merged.push((b[j].0, b[j].1 * s));
                j += 1;
            } else {
                merged.push((a[i].0, a[i].1 + b[j].1 * s));
                i += 1;
                j += 1;
            }
        }
        self.0 = merged;
    }
}

/// Weighted Jacobi relaxation: `x_i <- (1 - ω) x_i + ω mean(x_j)` over flagged nodes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Relaxation {
    pub iterations: usize,
    pub omega: f64,
}

impl Relaxation {
    /// Relax `values` in place
    ///
    /// Only `flags` rows change. Neighbors that are not `active` (no mapped value) are left
    /// out of the mean; a flagged row without active neighbors keeps its value.
    pub fn relax<T: Blend>(
        &self,
        adjacency: &Adjacency,
        flags: &[bool],
        active: &[bool],
        values: &mut [T],
    ) {
        assert_eq!(values.len(), adjacency.len(), "values do not match adjacency size");
        for _ in 0..self.iterations {
            let current: &[T] = values;
            let updates: Vec<(usize, T)> = (0..current.len())
                .into_par_iter()
                .filter(|&i| flags[i] && active[i])
                .filter_map(|i| {
                    let neighbors = || {
                        adjacency
                            .neighbors(i)
                            .iter()
                            .map(|&j| j as usize)
                            .filter(|&j| active[j])
                    };
                    let count = neighbors().count();
                    if count == 0 {
                        return None;
                    }
                    let w = self.omega / count as f64;
                    let mut next = T::zero();
                    next.add_scaled(&current[i], 1.0 - self.omega);
                    for j in neighbors() {
                        next.add_scaled(&current[j], w);
                    }
                    Some((i, next))
                })
                .collect();
            for (i, next) in updates {
                values[i] = next;
            }
        }
    }
}

// ----------------------------------------------------------------------------------------------------
// Local element operators
// ----------------------------------------------------------------------------------------------------

/// Below this area (relative to the squared longest edge) a triangle is degenerate
const DEGENERATE_AREA: f64 = 1e-12;

/// Linear surface Laplacian of a triangle
///
/// The embedding Jacobian `[b - a, c - a]` is QR-factored; `R` gives a local 2D frame in which
/// the shape function gradients are `R^-T` times their reference gradients.
pub fn local_stiffness(p: &[Point3<f64>; 3]) -> Option<Matrix3<f64>> {
    let jac = Matrix3x2::from_columns(&[p[1] - p[0], p[2] - p[0]]);
    let r = jac.qr().r();
    let area = 0.5 * (r[(0, 0)] * r[(1, 1)]).abs();
    if is_degenerate(p, area) {
        return None;
    }
    let r_inv_t = r.transpose().try_inverse()?;
    let ref_grad = Matrix2x3::new(-1.0, 1.0, 0.0, -1.0, 0.0, 1.0);
    let grad = r_inv_t * ref_grad;
    Some(grad.transpose() * grad * area)
}

/// Barycentric averaging operator: zero row sums, scaled by the triangle area
pub fn local_averaging(p: &[Point3<f64>; 3]) -> Option<Matrix3<f64>> {
    let area = 0.5 * (p[1] - p[0]).cross(&(p[2] - p[0])).norm();
    if is_degenerate(p, area) {
        return None;
    }
    Some(Matrix3::new(2.0, -1.0, -1.0, -1.0, 2.0, -1.0, -1.0, -1.0, 2.0) * (area / 12.0))
}

fn is_degenerate(p: &[Point3<f64>; 3], area: f64) -> bool {
    let longest = (0..3)
        .map(|k| (p[(k + 1) % 3] - p[k]).norm_squared())
        .fold(0.0, f64::max);
    !(area.is_finite() && area > DEGENERATE_AREA * longest)
}

// ----------------------------------------------------------------------------------------------------
// Diffusion system
// ----------------------------------------------------------------------------------------------------

/// Diffusion operator of a flagged region, split into jump (free) and rim (fixed) unknowns
///
/// Rows are addressed by position in the mapped node set.
#[derive(Debug, Clone)]
pub struct DiffusionSystem {
    pub system: SplitSystem,
    /// Mapped row of every free unknown
    pub free: Vec<usize>,
    /// Mapped row of every rim unknown
    pub rim: Vec<usize>,
    /// Elements skipped as degenerate
    pub skipped: usize,
}

impl DiffusionSystem {
    /// Assemble over the target triangles whose nodes are all active and touch a jump row
    ///
    /// Fails with [`MapError::IllPosedSmoothing`] if a jump node has no usable element or
    /// belongs to a jump cluster that never reaches the rim.
    pub fn assemble(
        target: &Mesh,
        mapped: &NodeSet,
        jumps: &[bool],
        active: &[bool],
        operator: DiffusionOperator,
    ) -> MapResult<Self> {
        let mut elements = Vec::new();
        for t in target.surface_triangles() {
            let rows = t.nodes.map(|n| mapped.position(n));
            if let [Some(a), Some(b), Some(c)] = rows {
                let rows = [a, b, c];
                if rows.iter().all(|&r| active[r]) && rows.iter().any(|&r| jumps[r]) {
                    elements.push((rows, target.triangle_points(&t)));
                }
            }
        }

        let mut on_rim = vec![false; mapped.len()];
        for (rows, _) in elements.iter() {
            for &r in rows.iter() {
                on_rim[r] |= !jumps[r];
            }
        }
        let mut free_index = vec![usize::MAX; mapped.len()];
        let mut rim_index = vec![usize::MAX; mapped.len()];
        let mut free = Vec::new();
        let mut rim = Vec::new();
        for row in 0..mapped.len() {
            if jumps[row] && active[row] {
                free_index[row] = free.len();
                free.push(row);
            } else if on_rim[row] {
                rim_index[row] = rim.len();
                rim.push(row);
            }
        }

        let mut system = SplitSystem::new(free.len(), rim.len());
        let contributions: Vec<Option<ElementContribution>> = elements
            .par_iter()
            .map(|(rows, points)| {
                let local = match operator {
                    DiffusionOperator::Stiffness => local_stiffness(points),
                    DiffusionOperator::Averaging => local_averaging(points),
                }?;
                let mut c = ElementContribution::default();
                for a in 0..3 {
                    let fa = free_index[rows[a]];
                    if fa == usize::MAX {
                        continue;
                    }
                    for b in 0..3 {
                        let fb = free_index[rows[b]];
                        if fb != usize::MAX {
                            c.ff.push(([fa, fb], local[(a, b)]));
                        } else {
                            c.fc.push(([fa, rim_index[rows[b]]], local[(a, b)]));
                        }
                    }
                }
                Some(c)
            })
            .collect();
        let skipped = contributions.iter().filter(|c| c.is_none()).count();
        system.par_extend(contributions.into_par_iter().flatten());

        if skipped > 0 {
            tracing::warn!(skipped, "degenerate triangles left out of the diffusion operator");
        }

        let this = Self {
            system,
            free,
            rim,
            skipped,
        };
        this.check_well_posed(mapped)?;

        tracing::info!(
            free = this.free.len(),
            rim = this.rim.len(),
            elements = elements.len(),
            entries = this.system.dff.num_entries(),
            "diffusion operator assembled"
        );
        Ok(this)
    }

    fn check_well_posed(&self, mapped: &NodeSet) -> MapResult<()> {
        let n = self.free.len();
        if let Some(&row) = self.system.dff.empty_rows().first() {
            return Err(MapError::IllPosedSmoothing {
                node: mapped[self.free[row]],
            });
        }

        let mut neighbors = vec![Vec::new(); n];
        for ([r, c], _) in self.system.dff.iter_upper_tri() {
            if r != c {
                neighbors[r].push(c);
                neighbors[c].push(r);
            }
        }

        // every free cluster must be anchored by at least one rim coupling
        let mut reached = vec![false; n];
        let mut queue = VecDeque::new();
        for ([r, _], v) in self.system.dfc.iter() {
            if v != 0.0 && !reached[r] {
                reached[r] = true;
                queue.push_back(r);
            }
        }
        while let Some(r) = queue.pop_front() {
            for &c in neighbors[r].iter() {
                if !reached[c] {
                    reached[c] = true;
                    queue.push_back(c);
                }
            }
        }
        match reached.iter().position(|r| !r) {
            Some(row) => Err(MapError::IllPosedSmoothing {
                node: mapped[self.free[row]],
            }),
            None => Ok(()),
        }
    }

    fn rim_values(&self, values: &[Vector3<f64>]) -> DMatrix<f64> {
        DMatrix::from_fn(self.rim.len(), 3, |r, k| values[self.rim[r]][k])
    }

    /// Solve `Dff x = -Dfc x_rim` per component and write the result into the jump rows
    pub fn solve_values(&self, solvers: &SolverRegistry, values: &mut [Vector3<f64>]) -> MapResult<()> {
        if self.free.is_empty() {
            return Ok(());
        }
        let rhs = -self.system.dfc.mul_dense(&self.rim_values(values));
        let x = solvers.solve(MatrixClass::SymmetricPositiveDefinite, &self.system.dff, &rhs)?;
        for (i, &row) in self.free.iter().enumerate() {
            values[row] = Vector3::new(x[(i, 0)], x[(i, 1)], x[(i, 2)]);
        }
        Ok(())
    }

    /// `G = -Dff⁻¹ Dfc`: jump values as a linear function of the rim values
    pub fn transfer_operator(&self, solvers: &SolverRegistry) -> MapResult<DMatrix<f64>> {
        if self.free.is_empty() || self.rim.is_empty() {
            return Ok(DMatrix::zeros(self.free.len(), self.rim.len()));
        }
        let rhs = -self.system.dfc.to_dense();
        solvers.solve(MatrixClass::SymmetricPositiveDefinite, &self.system.dff, &rhs)
    }

    /// Operator rows after smoothing, as combinations of the unsmoothed rows
    pub fn row_combinations(
        &self,
        solvers: &SolverRegistry,
        row_count: usize,
    ) -> MapResult<Vec<RowCombination>> {
        let g = self.transfer_operator(solvers)?;
        let mut combos: Vec<RowCombination> = (0..row_count).map(RowCombination::unit).collect();
        for (i, &row) in self.free.iter().enumerate() {
            let mut c: Vec<(usize, f64)> = self
                .rim
                .iter()
                .enumerate()
                .filter(|(r, _)| g[(i, *r)] != 0.0)
                .map(|(r, &rim_row)| (rim_row, g[(i, r)]))
                .collect();
            c.sort_unstable_by_key(|(r, _)| *r);
            combos[row] = RowCombination(c);
        }
        Ok(combos)
    }

    /// Largest absolute entry of `Dff x_f + Dfc x_rim` over all components
    pub fn residual(&self, values: &[Vector3<f64>]) -> f64 {
        let mut worst: f64 = 0.0;
        for k in 0..3 {
            let xf: Vec<f64> = self.free.iter().map(|&r| values[r][k]).collect();
            let xr: Vec<f64> = self.rim.iter().map(|&r| values[r][k]).collect();
            let a = self.system.dff.mul_vec(&xf);
            let b = self.system.dfc.mul_vec(&xr);
            for (x, y) in a.iter().zip(b.iter()) {
                worst = worst.max((x + y).abs());
            }
        }
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `n x n` grid of unit squares split into triangles
    fn grid(n: u32) -> Mesh {
        let w = n + 1;
        let nodes = (0..w * w)
            .map(|i| Point3::new((i % w) as f64, (i / w) as f64, 0.0))
            .collect();
        let mut tris = Vec::new();
        for j in 0..n {
            for i in 0..n {
                let v = j * w + i;
                tris.push([v, v + 1, v + w + 1]);
                tris.push([v, v + w + 1, v + w]);
            }
        }
        Mesh::from_triangles(nodes, &tris)
    }

    #[test]
    fn unit_right_triangle_stiffness() {
        let k = local_stiffness(&[
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ])
        .unwrap();
        let expected = Matrix3::new(1.0, -0.5, -0.5, -0.5, 0.5, 0.0, -0.5, 0.0, 0.5);
        assert_relative_eq!(k, expected, epsilon = 1e-14);
    }

    #[test]
    fn stiffness_is_rotation_invariant() {
        let flat = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(0.5, 1.5, 0.0),
        ];
        // same triangle standing in the x-z plane
        let tilted = flat.map(|p| Point3::new(p.x, 0.0, p.y));
        assert_relative_eq!(
            local_stiffness(&flat).unwrap(),
            local_stiffness(&tilted).unwrap(),
            epsilon = 1e-13
        );
    }

    #[test]
    fn degenerate_triangles_are_rejected() {
        let sliver = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        assert!(local_stiffness(&sliver).is_none());
        assert!(local_averaging(&sliver).is_none());
    }

    #[test]
    fn relaxation_of_vectors_and_rows_agree() {
        let mesh = grid(3);
        let all = NodeSet::from_unsorted((0..16).collect());
        let adj = mesh.node_adjacency(&all);
        let mut flags = vec![false; 16];
        flags[5] = true;
        flags[6] = true;
        let active = vec![true; 16];
        let relax = Relaxation {
            iterations: 4,
            omega: 0.5,
        };

        let mut values: Vec<Vector3<f64>> =
            (0..16).map(|i| Vector3::new(i as f64, 0.0, (i * i) as f64)).collect();
        let original = values.clone();
        relax.relax(&adj, &flags, &active, &mut values);

        let mut rows: Vec<RowCombination> = (0..16).map(RowCombination::unit).collect();
        relax.relax(&adj, &flags, &active, &mut rows);

        for i in 0..16 {
            let v: Vector3<f64> = rows[i].0.iter().map(|&(j, c)| original[j] * c).sum();
            assert_relative_eq!(v, values[i], epsilon = 1e-12);
            if !flags[i] {
                assert_eq!(values[i], original[i]);
            }
        }
    }

    #[test]
    fn relaxation_updates_all_rows_from_the_previous_sweep() {
        let adj = Adjacency::from_lists(vec![vec![1], vec![0, 2], vec![1]]);
        let flags = vec![true; 3];
        // node 2 has no mapped value
        let active = vec![true, true, false];
        let mut values = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(20.0, 0.0, 0.0),
        ];
        Relaxation {
            iterations: 1,
            omega: 0.5,
        }
        .relax(&adj, &flags, &active, &mut values);

        assert_relative_eq!(values[0].x, 5.0, epsilon = 1e-14);
        assert_relative_eq!(values[1].x, 5.0, epsilon = 1e-14);
        assert_eq!(values[2].x, 20.0);
    }

    #[test]
    fn diffusion_round_trip() {
        let mesh = grid(4);
        let all = NodeSet::from_unsorted((0..25).collect());
        let mut jumps = vec![false; 25];
        for i in [6, 7, 8, 11, 12, 13, 16, 17, 18] {
            jumps[i] = true;
        }
        let active = vec![true; 25];

        for operator in [DiffusionOperator::Stiffness, DiffusionOperator::Averaging] {
            let sys = DiffusionSystem::assemble(&mesh, &all, &jumps, &active, operator).unwrap();
            assert_eq!(sys.free.len(), 9);
            // boundary nodes except the two corners cut off by the diagonals
            assert_eq!(sys.rim.len(), 14);

            // a linear field on the rim with garbage inside
            let mut values: Vec<Vector3<f64>> = mesh
                .nodes
                .iter()
                .map(|p| Vector3::new(p.x, 2.0 * p.y, 1.0))
                .collect();
            for (i, v) in values.iter_mut().enumerate() {
                if jumps[i] {
                    *v = Vector3::new(100.0, -100.0, 7.0);
                }
            }
            let before = values.clone();

            let solvers = SolverRegistry::with_defaults();
            sys.solve_values(&solvers, &mut values).unwrap();

            for &r in sys.rim.iter() {
                assert_eq!(values[r], before[r]);
            }
            assert!(sys.residual(&values) < 1e-10);
            // the stiffness operator reproduces linear fields exactly
            if operator == DiffusionOperator::Stiffness {
                for &r in sys.free.iter() {
                    let p = mesh.nodes[r];
                    assert_relative_eq!(values[r], Vector3::new(p.x, 2.0 * p.y, 1.0), epsilon = 1e-10);
                }
            }
            // constants survive either operator
            for &r in sys.free.iter() {
                assert_relative_eq!(values[r].z, 1.0, epsilon = 1e-10);
            }

            // the folded transfer operator gives the same values
            let combos = sys.row_combinations(&solvers, 25).unwrap();
            for &r in sys.free.iter() {
                let v: Vector3<f64> = combos[r].0.iter().map(|&(j, c)| before[j] * c).sum();
                assert_relative_eq!(v, values[r], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn unanchored_cluster_is_ill_posed() {
        let mesh = grid(2);
        let all = NodeSet::from_unsorted((0..9).collect());
        let jumps = vec![true; 9];
        let active = vec![true; 9];
        let err = DiffusionSystem::assemble(&mesh, &all, &jumps, &active, DiffusionOperator::Stiffness)
            .unwrap_err();
        assert!(matches!(err, MapError::IllPosedSmoothing { .. }));
    }

    #[test]
    fn isolated_jump_node_is_ill_posed() {
        let mut mesh = grid(2);
        mesh.nodes.push(Point3::new(5.0, 5.0, 0.0));
        let all = NodeSet::from_unsorted((0..10).collect());
        let mut jumps = vec![false; 10];
        jumps[9] = true;
        let active = vec![true; 10];
        let err = DiffusionSystem::assemble(&mesh, &all, &jumps, &active, DiffusionOperator::Stiffness)
            .unwrap_err();
        assert!(matches!(err, MapError::IllPosedSmoothing { node: 9 }));
    }
}
