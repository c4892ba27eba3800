use super::{DisplacementMapper, MapperBase};
use crate::config::RbfConfig;
use crate::error::{check_size, MapError, MapResult};
use crate::linalg::MappingMatrix;
use crate::mesh::{Field, Mesh};
use crate::node_sets::NodeSet;
use crate::progress::Progress;
use crate::spatial::PointTree;

use nalgebra::{DMatrix, Matrix3, Point3, Vector3};
use rayon::prelude::*;

/// Radial basis functions `φ(r)`
///
/// The Wendland functions have compact support `r < radius`; the others are global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RbfKernel {
    /// Polyharmonic `r`
    Linear,
    /// Polyharmonic `r³`
    Cubic,
    /// Polyharmonic `r⁵`
    Quintic,
    /// `sqrt(r² + c²)`
    Multiquadric { c: f64 },
    /// `1 / sqrt(r² + c²)`
    InverseMultiquadric { c: f64 },
    /// `(1 - ρ)²`
    WendlandC0 { radius: f64 },
    /// `(1 - ρ)⁴ (4ρ + 1)`
    WendlandC2 { radius: f64 },
    /// `(1 - ρ)⁶ (35ρ² + 18ρ + 3) / 3`
    WendlandC4 { radius: f64 },
}

impl RbfKernel {
    /// Kernel by name; `shape` is the support radius or the multiquadric constant (default 1)
    pub fn parse(name: &str, shape: Option<f64>) -> Option<Self> {
        let s = shape.unwrap_or(1.0);
        Some(match name.to_ascii_lowercase().as_str() {
            "linear" => Self::Linear,
            "cubic" => Self::Cubic,
            "quintic" => Self::Quintic,
            "multiquadric" => Self::Multiquadric { c: s },
            "inverse_multiquadric" => Self::InverseMultiquadric { c: s },
            "wendland_c0" => Self::WendlandC0 { radius: s },
            "wendland_c2" => Self::WendlandC2 { radius: s },
            "wendland_c4" => Self::WendlandC4 { radius: s },
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Cubic => "cubic",
            Self::Quintic => "quintic",
            Self::Multiquadric { .. } => "multiquadric",
            Self::InverseMultiquadric { .. } => "inverse_multiquadric",
            Self::WendlandC0 { .. } => "wendland_c0",
            Self::WendlandC2 { .. } => "wendland_c2",
            Self::WendlandC4 { .. } => "wendland_c4",
        }
    }

    /// Radius beyond which the kernel vanishes
    pub fn support(&self) -> Option<f64> {
        match *self {
            Self::WendlandC0 { radius } | Self::WendlandC2 { radius } | Self::WendlandC4 { radius } => {
                Some(radius)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn eval(&self, r: f64) -> f64 {
        match *self {
            Self::Linear => r,
            Self::Cubic => r * r * r,
            Self::Quintic => r.powi(5),
            Self::Multiquadric { c } => (r * r + c * c).sqrt(),
            Self::InverseMultiquadric { c } => 1.0 / (r * r + c * c).sqrt(),
            Self::WendlandC0 { radius } => {
                let t = (1.0 - r / radius).max(0.0);
                t * t
            }
            Self::WendlandC2 { radius } => {
                let rho = r / radius;
                let t = (1.0 - rho).max(0.0);
                t.powi(4) * (4.0 * rho + 1.0)
            }
            Self::WendlandC4 { radius } => {
                let rho = r / radius;
                let t = (1.0 - rho).max(0.0);
                t.powi(6) * (35.0 * rho * rho + 18.0 * rho + 3.0) / 3.0
            }
        }
    }
}

/// Which structural nodes become kernel centers
#[derive(Debug, Clone, PartialEq)]
pub enum CenterSelection {
    /// Every structural surface node, merged within the merge threshold
    All,
    /// About this many centers, sampled from point tree boxes and snapped to nodes
    Reduced(usize),
}

/// Kernel values between every row point and every center
fn kernel_matrix(kernel: RbfKernel, rows: &[Point3<f64>], centers: &[Point3<f64>]) -> DMatrix<f64> {
    let data: Vec<f64> = rows
        .par_iter()
        .flat_map_iter(|p| centers.iter().map(move |c| kernel.eval((p - c).norm())))
        .collect();
    DMatrix::from_row_slice(rows.len(), centers.len(), &data)
}

/// Keep the first of every group of points closer than `threshold`
fn dedup_points(points: &[Point3<f64>], threshold: f64) -> Vec<Point3<f64>> {
    let tree = PointTree::build(points, 8);
    let mut merged = vec![false; points.len()];
    let mut kept = Vec::new();
    for (i, p) in points.iter().enumerate() {
        if merged[i] {
            continue;
        }
        kept.push(*p);
        for j in tree.within(p, threshold) {
            merged[j as usize] = true;
        }
    }
    kept
}

/// Global interpolation of the structural surface displacements with radial basis functions
///
/// The kernel system `Φ w = D` over the structural surface nodes is solved in the least-squares
/// sense through a pseudo-inverse computed once per build, so every field costs two dense
/// products. The result is smooth everywhere; discontinuities are not detected.
pub struct RbfMapper<'s> {
    base: MapperBase<'s>,
    config: RbfConfig,
    sources: NodeSet,
    centers: Vec<Point3<f64>>,
    /// `Φ⁺`, centers by source nodes
    fit_operator: DMatrix<f64>,
    /// Kernel values, mapped rows by centers
    eval_operator: DMatrix<f64>,
    /// Source position used for rows outside every kernel support
    fallback: Vec<Option<usize>>,
}

impl<'s> RbfMapper<'s> {
    pub fn new(base: MapperBase<'s>, config: RbfConfig) -> Self {
        Self {
            base,
            config,
            sources: NodeSet::new(),
            centers: Vec::new(),
            fit_operator: DMatrix::zeros(0, 0),
            eval_operator: DMatrix::zeros(0, 0),
            fallback: Vec::new(),
        }
    }

    /// Structural nodes the kernel system is fit to
    pub fn sources(&self) -> &NodeSet {
        &self.sources
    }

    pub fn centers(&self) -> &[Point3<f64>] {
        &self.centers
    }

    /// Kernel centers for the given source points
    pub fn select_centers(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        match self.config.centers {
            CenterSelection::All => dedup_points(points, self.config.merge_threshold),
            CenterSelection::Reduced(count) => {
                if count >= points.len() {
                    return dedup_points(points, self.config.merge_threshold);
                }
                let tree = PointTree::build(points, 1);
                let snapped: Vec<Point3<f64>> = tree
                    .sample_centers(count)
                    .iter()
                    .filter_map(|c| tree.nearest(c))
                    .map(|(i, _)| *tree.point(i))
                    .collect();
                dedup_points(&snapped, self.config.merge_threshold)
            }
        }
    }

    /// Center weights for the given source values (one column per scalar)
    pub fn fit(&self, values: &DMatrix<f64>) -> MapResult<DMatrix<f64>> {
        check_size("rbf source values", self.sources.len(), values.nrows())?;
        Ok(&self.fit_operator * values)
    }

    /// Interpolated values at the mapped rows for the given center weights
    pub fn evaluate(&self, weights: &DMatrix<f64>) -> MapResult<DMatrix<f64>> {
        check_size("rbf center weights", self.centers.len(), weights.nrows())?;
        Ok(&self.eval_operator * weights)
    }
}

impl<'s> DisplacementMapper for RbfMapper<'s> {
    fn name(&self) -> &'static str {
        "rbf"
    }

    fn base(&self) -> &MapperBase<'_> {
        &self.base
    }

    fn build(&mut self, target: &Mesh, progress: &dyn Progress) -> MapResult<()> {
        self.base.prepare(target)?;
        let structure = self.base.structure;

        let sources = structure.surface_nodes();
        if sources.is_empty() {
            return Err(MapError::EmptyMesh("structural surface nodes"));
        }
        let source_points: Vec<Point3<f64>> =
            sources.iter().map(|n| structure.nodes[n as usize]).collect();
        let centers = self.select_centers(&source_points);

        progress.begin("rbf kernel system", 3);
        let phi = kernel_matrix(self.config.kernel, &source_points, &centers);
        progress.advance(1);

        let svd = phi.svd(true, true);
        let eps = 1e-12 * svd.singular_values.max();
        let fit_operator = svd
            .pseudo_inverse(eps)
            .map_err(|e| MapError::SolverFailed(e.to_owned()))?;
        progress.advance(1);

        let points = self.base.mapped_points(target);
        let eval_operator = kernel_matrix(self.config.kernel, &points, &centers);
        progress.advance(1);
        progress.end();

        let tree = PointTree::build(&source_points, 8);
        let fallback: Vec<Option<usize>> = (0..points.len())
            .map(|i| {
                if eval_operator.row(i).iter().all(|v| *v == 0.0) {
                    tree.nearest(&points[i]).map(|(s, _)| s as usize)
                } else {
                    None
                }
            })
            .collect();
        let outside = fallback.iter().filter(|f| f.is_some()).count();
        if outside > 0 {
            tracing::warn!(
                nodes = outside,
                kernel = self.config.kernel.name(),
                "target nodes outside every kernel support take the nearest node value"
            );
        }

        tracing::info!(
            kernel = self.config.kernel.name(),
            sources = sources.len(),
            centers = centers.len(),
            rows = points.len(),
            "rbf operator built"
        );

        self.sources = sources;
        self.centers = centers;
        self.fit_operator = fit_operator;
        self.eval_operator = eval_operator;
        self.fallback = fallback;
        self.base.commit(target);
        Ok(())
    }

    fn map_field(&self, field: &Field) -> MapResult<Vec<Vector3<f64>>> {
        let mut all = self.map_fields(&[field])?;
        Ok(all.pop().unwrap_or_default())
    }

    /// Fits all fields with a single product against the pseudo-inverse
    fn map_fields(&self, fields: &[&Field]) -> MapResult<Vec<Vec<Vector3<f64>>>> {
        if !self.base.is_built() {
            return Err(MapError::NotBuilt);
        }
        let mut d = DMatrix::zeros(self.sources.len(), 3 * fields.len());
        for (f, field) in fields.iter().enumerate() {
            let u = self.base.source_translations(field)?;
            for (s, node) in self.sources.iter().enumerate() {
                for c in 0..3 {
                    d[(s, 3 * f + c)] = u[node as usize][c];
                }
            }
        }

        let values = self.evaluate(&self.fit(&d)?)?;

        Ok((0..fields.len())
            .map(|f| {
                let mut rows: Vec<Vector3<f64>> = self
                    .fallback
                    .iter()
                    .enumerate()
                    .map(|(i, fb)| {
                        let (m, r) = match fb {
                            Some(s) => (&d, *s),
                            None => (&values, i),
                        };
                        Vector3::new(m[(r, 3 * f)], m[(r, 3 * f + 1)], m[(r, 3 * f + 2)])
                    })
                    .collect();
                self.base.constrain_sliding(&mut rows);
                self.base.scatter(&rows)
            })
            .collect())
    }

    fn hmap(&self) -> MapResult<MappingMatrix> {
        if !self.base.is_built() {
            return Err(MapError::NotBuilt);
        }
        let h = &self.eval_operator * &self.fit_operator;
        let source_ids: Vec<u32> = self.sources.iter().collect();
        let rows: Vec<Vec<(u32, Matrix3<f64>)>> = (0..h.nrows())
            .into_par_iter()
            .map(|i| match self.fallback[i] {
                Some(s) => vec![(source_ids[s], Matrix3::identity())],
                None => h
                    .row(i)
                    .iter()
                    .zip(source_ids.iter())
                    .filter(|(w, _)| **w != 0.0)
                    .map(|(w, &n)| (n, Matrix3::identity() * *w))
                    .collect(),
            })
            .collect();

        let mut matrix = MappingMatrix::from_rows(
            self.base.structure.nodes.len(),
            self.base.mapped().as_slice().to_vec(),
            rows,
        );
        self.base.constrain_sliding_rows(&mut matrix);
        Ok(matrix)
    }
}
