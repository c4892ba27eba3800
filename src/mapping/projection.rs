use super::jumps::{self, JumpDetector, JumpReport};
use super::smoothing::{DiffusionSystem, Relaxation, RowCombination};
use super::{DisplacementMapper, MapperBase};
use crate::config::{JumpConfig, ProjectionConfig, SmoothingConfig, SmoothingMethod};
use crate::error::{MapError, MapResult};
use crate::linalg::{MappingMatrix, SolverRegistry};
use crate::mesh::{Adjacency, Field, Mesh};
use crate::node_sets::NodeSet;
use crate::progress::Progress;
use crate::spatial::{Projection, SpatialTriangleIndex};

use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;

/// Relative size below which a triangle normal is considered degenerate
const DEGENERATE_NORMAL: f64 = 1e-14;

/// 3x3 blocks of one projected node: barycentric weights plus the small-rotation lever arm
///
/// Vertex displacements `u_k` change the (unnormalized) triangle normal by
/// `δN = Σ e_k × u_k`, with `e_k` the edge opposite vertex `k`. The lever arm `r` from the
/// foot point to the target node turns with the normal, `δr = -[r]×[n]× δN / |N|`. Since the
/// opposite edges sum to zero, the blocks sum to the identity.
pub fn projection_blocks(
    corners: &[Point3<f64>; 3],
    weights: [f64; 3],
    foot: &Point3<f64>,
    target: &Point3<f64>,
    rotation: bool,
) -> ([Matrix3<f64>; 3], bool) {
    let mut blocks = weights.map(|w| Matrix3::identity() * w);
    if !rotation {
        return (blocks, false);
    }

    let normal = (corners[1] - corners[0]).cross(&(corners[2] - corners[0]));
    let scale = (corners[1] - corners[0])
        .norm_squared()
        .max((corners[2] - corners[0]).norm_squared());
    let area2 = normal.norm();
    if !(area2 > DEGENERATE_NORMAL * scale) {
        return (blocks, true);
    }

    let n = normal / area2;
    let r = target - foot;
    let lever = -(r.cross_matrix() * n.cross_matrix()) / area2;
    let opposite = [
        corners[2] - corners[1],
        corners[0] - corners[2],
        corners[1] - corners[0],
    ];
    for (b, e) in blocks.iter_mut().zip(opposite.iter()) {
        *b += lever * e.cross_matrix();
    }
    (blocks, false)
}

/// Smoothing applied on top of the raw projection
#[derive(Debug, Clone)]
enum SmoothingPlan {
    None,
    Iterative {
        relaxation: Relaxation,
        adjacency: Adjacency,
        flags: Vec<bool>,
    },
    Diffusion(DiffusionSystem),
}

/// Maps displacements by projecting each target node onto the nearest structural triangle
///
/// Discontinuities in the projection (gaps between structural parts, folded or concave
/// regions) are detected heuristically and smoothed, either by relaxation or by a diffusion
/// solve with the surrounding nodes held fixed.
pub struct ProjectionMapper<'s> {
    base: MapperBase<'s>,
    projection: ProjectionConfig,
    jumps: JumpConfig,
    smoothing: SmoothingConfig,
    solvers: SolverRegistry,
    index: Option<SpatialTriangleIndex>,
    matrix: MappingMatrix,
    /// Mapped rows that have a projection
    active: Vec<bool>,
    flags: Vec<bool>,
    plan: SmoothingPlan,
    report: JumpReport,
}

impl<'s> ProjectionMapper<'s> {
    pub fn new(
        base: MapperBase<'s>,
        projection: ProjectionConfig,
        jumps: JumpConfig,
        smoothing: SmoothingConfig,
        solvers: SolverRegistry,
    ) -> Self {
        let source_count = base.structure.nodes.len();
        Self {
            base,
            projection,
            jumps,
            smoothing,
            solvers,
            index: None,
            matrix: MappingMatrix::new(source_count),
            active: Vec::new(),
            flags: Vec::new(),
            plan: SmoothingPlan::None,
            report: JumpReport::default(),
        }
    }

    /// Heuristic counts of the last build
    pub fn jump_report(&self) -> JumpReport {
        self.report
    }

    /// Target nodes flagged as discontinuous (after growth)
    pub fn jump_nodes(&self) -> MapResult<NodeSet> {
        if !self.base.is_built() {
            return Err(MapError::NotBuilt);
        }
        Ok(self
            .base
            .mapped()
            .iter()
            .zip(self.flags.iter())
            .filter(|(_, f)| **f)
            .map(|(n, _)| n)
            .collect())
    }

    /// Intersection segments between the structural surface and the surface of `target`
    pub fn segments(&self, target: &Mesh) -> MapResult<Vec<(Point3<f64>, Point3<f64>)>> {
        let index = self.index.as_ref().ok_or(MapError::NotBuilt)?;
        let triangles: Vec<[u32; 3]> = target.surface_triangles().iter().map(|t| t.nodes).collect();
        let other =
            SpatialTriangleIndex::build(&target.nodes, &triangles, self.projection.min_leaf_count)?;
        let pairs = index.intersect(&other, self.projection.parallel);
        let segments = index.segments(&other, &pairs);
        tracing::info!(
            pairs = pairs.len(),
            segments = segments.len(),
            "surface intersections"
        );
        Ok(segments)
    }

    fn project(
        &self,
        index: &SpatialTriangleIndex,
        points: &[Point3<f64>],
        progress: &dyn Progress,
    ) -> Vec<Option<Projection>> {
        let catch2 = self.projection.catch_radius * self.projection.catch_radius;
        let query = |p: &Point3<f64>| {
            let found = index.nearest_triangle(p).filter(|pr| pr.dist2 <= catch2);
            progress.advance(1);
            found
        };
        if self.projection.parallel {
            points.par_iter().map(query).collect()
        } else {
            points.iter().map(query).collect()
        }
    }

    fn operator_rows(
        &self,
        index: &SpatialTriangleIndex,
        points: &[Point3<f64>],
        projections: &[Option<Projection>],
    ) -> (Vec<Vec<(u32, Matrix3<f64>)>>, usize) {
        let rotation = self.projection.rotation;
        let rows: Vec<(Vec<(u32, Matrix3<f64>)>, bool)> = projections
            .par_iter()
            .zip(points.par_iter())
            .map(|(pr, x)| match pr {
                None => (Vec::new(), false),
                Some(pr) => {
                    let corners = index.triangle_points(pr.triangle);
                    let (blocks, degenerate) =
                        projection_blocks(&corners, pr.weights, &pr.foot, x, rotation);
                    let nodes = index.triangle(pr.triangle);
                    (nodes.into_iter().zip(blocks).collect(), degenerate)
                }
            })
            .collect();
        let degenerate = rows.iter().filter(|(_, d)| *d).count();
        (rows.into_iter().map(|(r, _)| r).collect(), degenerate)
    }

    fn plan_smoothing(
        &mut self,
        target: &Mesh,
        points: &[Point3<f64>],
        projections: &[Option<Projection>],
        components: &[u32],
        near_coincident: &[bool],
    ) -> MapResult<()> {
        let adjacency = target.node_adjacency(self.base.mapped());
        let detector = JumpDetector {
            config: &self.jumps,
            points,
            projections,
            adjacency: &adjacency,
            components,
            near_coincident,
        };
        let (mut flags, report) = detector.detect();
        jumps::grow(
            &mut flags,
            &adjacency,
            self.smoothing.rings,
            self.smoothing.radius,
            points,
            &self.active,
        );
        self.report = JumpReport {
            total: flags.iter().filter(|f| **f).count(),
            ..report
        };
        tracing::info!(
            component = report.component,
            angle = report.angle,
            distance = report.distance,
            concavity = report.concavity,
            coincident = report.coincident,
            grown = self.report.total,
            "discontinuities detected"
        );

        self.plan = if self.report.total == 0 {
            SmoothingPlan::None
        } else {
            match self.smoothing.method {
                SmoothingMethod::None => SmoothingPlan::None,
                SmoothingMethod::Iterative => SmoothingPlan::Iterative {
                    relaxation: Relaxation {
                        iterations: self.smoothing.iterations,
                        omega: self.smoothing.omega,
                    },
                    adjacency,
                    flags: flags.clone(),
                },
                SmoothingMethod::Diffusion => SmoothingPlan::Diffusion(DiffusionSystem::assemble(
                    target,
                    self.base.mapped(),
                    &flags,
                    &self.active,
                    self.smoothing.operator,
                )?),
            }
        };
        self.flags = flags;
        Ok(())
    }
}

impl<'s> DisplacementMapper for ProjectionMapper<'s> {
    fn name(&self) -> &'static str {
        "projection"
    }

    fn base(&self) -> &MapperBase<'_> {
        &self.base
    }

    fn build(&mut self, target: &Mesh, progress: &dyn Progress) -> MapResult<()> {
        self.index = None;
        self.report = JumpReport::default();
        self.base.prepare(target)?;
        let structure = self.base.structure;

        let surface = structure.surface_triangles();
        if surface.is_empty() {
            return Err(MapError::EmptyMesh("structural surface triangles"));
        }
        let triangles: Vec<[u32; 3]> = surface.iter().map(|t| t.nodes).collect();
        let index =
            SpatialTriangleIndex::build(&structure.nodes, &triangles, self.projection.min_leaf_count)?;

        let points = self.base.mapped_points(target);
        progress.begin("project target nodes", points.len());
        let projections = self.project(&index, &points, progress);
        progress.end();

        let (rows, degenerate) = self.operator_rows(&index, &points, &projections);
        if degenerate > 0 {
            tracing::warn!(
                nodes = degenerate,
                "projected onto degenerate triangles; rotational correction dropped"
            );
        }
        self.matrix = MappingMatrix::from_rows(
            structure.nodes.len(),
            self.base.mapped().as_slice().to_vec(),
            rows,
        );
        self.active = projections.iter().map(Option::is_some).collect();
        let caught = self.active.iter().filter(|a| **a).count();
        if caught < points.len() {
            tracing::warn!(
                unmapped = points.len() - caught,
                radius = self.projection.catch_radius,
                "target nodes outside the catch radius stay in place"
            );
        }

        self.flags = vec![false; points.len()];
        self.plan = SmoothingPlan::None;
        self.report = JumpReport::default();
        if self.smoothing.method != SmoothingMethod::None {
            let components = jumps::triangle_components(structure, &surface);
            let near_coincident =
                jumps::coincident_triangles(structure, &surface, self.jumps.coincident_tolerance);
            self.plan_smoothing(target, &points, &projections, &components, &near_coincident)?;
        }

        tracing::info!(
            rows = self.matrix.row_count(),
            blocks = self.matrix.nnz_blocks(),
            triangles = index.len(),
            "projection operator built"
        );
        self.index = Some(index);
        self.base.commit(target);
        Ok(())
    }

    fn map_field(&self, field: &Field) -> MapResult<Vec<Vector3<f64>>> {
        if !self.base.is_built() {
            return Err(MapError::NotBuilt);
        }
        let u = self.base.source_translations(field)?;
        let mut rows = self.matrix.apply(&u)?;

        match &self.plan {
            SmoothingPlan::None => (),
            SmoothingPlan::Iterative {
                relaxation,
                adjacency,
                flags,
            } => relaxation.relax(adjacency, flags, &self.active, &mut rows),
            SmoothingPlan::Diffusion(system) => system.solve_values(&self.solvers, &mut rows)?,
        }

        self.base.constrain_sliding(&mut rows);
        Ok(self.base.scatter(&rows))
    }

    fn hmap(&self) -> MapResult<MappingMatrix> {
        if !self.base.is_built() {
            return Err(MapError::NotBuilt);
        }
        let row_count = self.matrix.row_count();
        let combos = match &self.plan {
            SmoothingPlan::None => None,
            SmoothingPlan::Iterative {
                relaxation,
                adjacency,
                flags,
            } => {
                let mut combos: Vec<RowCombination> = (0..row_count).map(RowCombination::unit).collect();
                relaxation.relax(adjacency, flags, &self.active, &mut combos);
                Some(combos)
            }
            SmoothingPlan::Diffusion(system) => Some(system.row_combinations(&self.solvers, row_count)?),
        };

        let mut matrix = match combos {
            None => self.matrix.clone(),
            Some(c) => {
                let c: Vec<Vec<(usize, f64)>> = c.into_iter().map(|r| r.0).collect();
                self.matrix.combine_rows(&c)?
            }
        };
        self.base.constrain_sliding_rows(&mut matrix);
        Ok(matrix)
    }
}
