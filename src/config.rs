use crate::error::{MapError, MapResult};
use crate::linalg::SolverRegistry;
use crate::mapping::rbf::{CenterSelection, RbfKernel, RbfMapper};
use crate::mapping::{DisplacementMapper, MapperBase, ProjectionMapper};
use crate::mesh::Mesh;
use crate::node_sets::{Classification, FieldSelection};

use json::JsonValue;
use std::fs::read_to_string;

/// Which mapping strategy to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Projection,
    Rbf,
}

/// Nearest-triangle projection and mapping operator construction
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionConfig {
    /// Leaves of the triangle tree hold at least this many triangles
    pub min_leaf_count: usize,
    /// Target nodes farther than this from the structure stay unmapped
    pub catch_radius: f64,
    /// Add the small-rotation lever arm correction to the barycentric weights
    pub rotation: bool,
    pub parallel: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            min_leaf_count: 8,
            catch_radius: f64::INFINITY,
            rotation: true,
            parallel: true,
        }
    }
}

impl ProjectionConfig {
    pub fn with_min_leaf_count(mut self, count: usize) -> Self {
        self.min_leaf_count = count;
        self
    }

    pub fn with_catch_radius(mut self, radius: f64) -> Self {
        self.catch_radius = radius;
        self
    }

    pub fn with_rotation(mut self, rotation: bool) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Thresholds of the discontinuity heuristics
///
/// An infinite angle, distance or ratio (or a zero tolerance) disables the heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct JumpConfig {
    /// Largest angle (degrees) between projection offsets of neighboring nodes
    pub max_angle: f64,
    /// Largest projection offset
    pub max_distance: f64,
    /// Largest relative change of neighbor distances between target and foot points
    pub concavity_ratio: f64,
    /// Structural nodes closer than this are considered coincident
    pub coincident_tolerance: f64,
    pub component_jumps: bool,
}

impl Default for JumpConfig {
    fn default() -> Self {
        Self {
            max_angle: 45.0,
            max_distance: f64::INFINITY,
            concavity_ratio: 0.5,
            coincident_tolerance: 1e-6,
            component_jumps: true,
        }
    }
}

impl JumpConfig {
    /// All heuristics off
    pub fn disabled() -> Self {
        Self {
            max_angle: f64::INFINITY,
            max_distance: f64::INFINITY,
            concavity_ratio: f64::INFINITY,
            coincident_tolerance: 0.0,
            component_jumps: false,
        }
    }

    pub fn with_max_angle(mut self, degrees: f64) -> Self {
        self.max_angle = degrees;
        self
    }

    pub fn with_max_distance(mut self, distance: f64) -> Self {
        self.max_distance = distance;
        self
    }

    pub fn with_concavity_ratio(mut self, ratio: f64) -> Self {
        self.concavity_ratio = ratio;
        self
    }

    pub fn with_coincident_tolerance(mut self, tol: f64) -> Self {
        self.coincident_tolerance = tol;
        self
    }

    pub fn with_component_jumps(mut self, on: bool) -> Self {
        self.component_jumps = on;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothingMethod {
    None,
    /// Weighted Jacobi relaxation towards the neighbor mean
    Iterative,
    /// Sparse diffusion solve with the region rim held fixed
    Diffusion,
}

/// Local element operator of the diffusion solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffusionOperator {
    /// First order surface Laplacian
    Stiffness,
    /// Barycentric averaging operator
    Averaging,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmoothingConfig {
    pub method: SmoothingMethod,
    pub iterations: usize,
    /// Relaxation factor in `(0, 1]`
    pub omega: f64,
    /// Flagged regions are grown by this many topological rings
    pub rings: usize,
    /// and by all mapped nodes within this distance of a flagged node
    pub radius: f64,
    pub operator: DiffusionOperator,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            method: SmoothingMethod::None,
            iterations: 10,
            omega: 0.5,
            rings: 1,
            radius: 0.0,
            operator: DiffusionOperator::Stiffness,
        }
    }
}

impl SmoothingConfig {
    pub fn iterative(iterations: usize, omega: f64) -> Self {
        Self {
            method: SmoothingMethod::Iterative,
            iterations,
            omega,
            ..Default::default()
        }
    }

    pub fn diffusion(operator: DiffusionOperator) -> Self {
        Self {
            method: SmoothingMethod::Diffusion,
            operator,
            ..Default::default()
        }
    }

    pub fn with_rings(mut self, rings: usize) -> Self {
        self.rings = rings;
        self
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RbfConfig {
    pub kernel: RbfKernel,
    /// Structural nodes closer than this share one center
    pub merge_threshold: f64,
    pub centers: CenterSelection,
}

impl Default for RbfConfig {
    fn default() -> Self {
        Self {
            kernel: RbfKernel::Cubic,
            merge_threshold: 1e-6,
            centers: CenterSelection::All,
        }
    }
}

impl RbfConfig {
    pub fn with_kernel(mut self, kernel: RbfKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_centers(mut self, centers: CenterSelection) -> Self {
        self.centers = centers;
        self
    }

    pub fn with_merge_threshold(mut self, threshold: f64) -> Self {
        self.merge_threshold = threshold;
        self
    }
}

/// Complete mapper configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MapperConfig {
    pub strategy: Strategy,
    /// Global factor applied to every mapped field
    pub scale: f64,
    pub projection: ProjectionConfig,
    pub jumps: JumpConfig,
    pub smoothing: SmoothingConfig,
    pub rbf: RbfConfig,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Projection,
            scale: 1.0,
            projection: ProjectionConfig::default(),
            jumps: JumpConfig::default(),
            smoothing: SmoothingConfig::default(),
            rbf: RbfConfig::default(),
        }
    }
}

impl MapperConfig {
    pub fn projection() -> Self {
        Self::default()
    }

    pub fn rbf(kernel: RbfKernel) -> Self {
        Self {
            strategy: Strategy::Rbf,
            rbf: RbfConfig::default().with_kernel(kernel),
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_projection(mut self, projection: ProjectionConfig) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_jumps(mut self, jumps: JumpConfig) -> Self {
        self.jumps = jumps;
        self
    }

    pub fn with_smoothing(mut self, smoothing: SmoothingConfig) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_rbf(mut self, rbf: RbfConfig) -> Self {
        self.rbf = rbf;
        self
    }

    /// Load a configuration from a JSON file with the following format
    ///
    /// ```JSON
    /// {
    ///     "strategy": "projection",
    ///     "scale": 1.0,
    ///     "projection": { "min_leaf_count": 8, "catch_radius": 0.5, "rotation": true, "parallel": true },
    ///     "jumps": { "max_angle": 45.0, "max_distance": 0.2, "concavity_ratio": 0.5,
    ///                "coincident_tolerance": 1e-6, "component_jumps": true },
    ///     "smoothing": { "method": "diffusion", "iterations": 10, "omega": 0.5,
    ///                    "rings": 1, "radius": 0.0, "operator": "stiffness" },
    ///     "rbf": { "kernel": "wendland_c2", "shape": 2.0, "merge_threshold": 1e-6, "centers": 200 }
    /// }
    /// ```
    ///
    /// Every key is optional; missing keys keep their default and unknown keys are ignored.
    pub fn from_file(path: impl AsRef<str>) -> MapResult<Self> {
        let contents = read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    /// Parse a configuration from a JSON string (see [`MapperConfig::from_file`])
    pub fn from_json(contents: &str) -> MapResult<Self> {
        let jv = json::parse(contents).map_err(|e| MapError::Parse(e.to_string()))?;
        let d = Self::default();

        let strategy = match opt_str(&jv, "strategy")? {
            None | Some("projection") => Strategy::Projection,
            Some("rbf") => Strategy::Rbf,
            Some(other) => return Err(MapError::Parse(format!("unknown strategy '{}'", other))),
        };

        let p = &jv["projection"];
        let projection = ProjectionConfig {
            min_leaf_count: opt_usize(p, "min_leaf_count")?.unwrap_or(d.projection.min_leaf_count),
            catch_radius: opt_f64(p, "catch_radius")?.unwrap_or(d.projection.catch_radius),
            rotation: opt_bool(p, "rotation")?.unwrap_or(d.projection.rotation),
            parallel: opt_bool(p, "parallel")?.unwrap_or(d.projection.parallel),
        };

        let j = &jv["jumps"];
        let jumps = JumpConfig {
            max_angle: opt_f64(j, "max_angle")?.unwrap_or(d.jumps.max_angle),
            max_distance: opt_f64(j, "max_distance")?.unwrap_or(d.jumps.max_distance),
            concavity_ratio: opt_f64(j, "concavity_ratio")?.unwrap_or(d.jumps.concavity_ratio),
            coincident_tolerance: opt_f64(j, "coincident_tolerance")?
                .unwrap_or(d.jumps.coincident_tolerance),
            component_jumps: opt_bool(j, "component_jumps")?.unwrap_or(d.jumps.component_jumps),
        };

        let s = &jv["smoothing"];
        let smoothing = SmoothingConfig {
            method: match opt_str(s, "method")? {
                None | Some("none") => SmoothingMethod::None,
                Some("iterative") => SmoothingMethod::Iterative,
                Some("diffusion") => SmoothingMethod::Diffusion,
                Some(other) => {
                    return Err(MapError::Parse(format!("unknown smoothing method '{}'", other)))
                }
            },
            iterations: opt_usize(s, "iterations")?.unwrap_or(d.smoothing.iterations),
            omega: opt_f64(s, "omega")?.unwrap_or(d.smoothing.omega),
            rings: opt_usize(s, "rings")?.unwrap_or(d.smoothing.rings),
            radius: opt_f64(s, "radius")?.unwrap_or(d.smoothing.radius),
            operator: match opt_str(s, "operator")? {
                None | Some("stiffness") => DiffusionOperator::Stiffness,
                Some("averaging") => DiffusionOperator::Averaging,
                Some(other) => {
                    return Err(MapError::Parse(format!("unknown diffusion operator '{}'", other)))
                }
            },
        };

        let r = &jv["rbf"];
        let kernel = match opt_str(r, "kernel")? {
            None => d.rbf.kernel,
            Some(name) => RbfKernel::parse(name, opt_f64(r, "shape")?)
                .ok_or_else(|| MapError::Parse(format!("unknown rbf kernel '{}'", name)))?,
        };
        let centers = if r["centers"].is_null() || r["centers"].as_str() == Some("all") {
            CenterSelection::All
        } else {
            let count = opt_usize(r, "centers")?.unwrap_or(0);
            CenterSelection::Reduced(count)
        };
        let rbf = RbfConfig {
            kernel,
            merge_threshold: opt_f64(r, "merge_threshold")?.unwrap_or(d.rbf.merge_threshold),
            centers,
        };

        let config = Self {
            strategy,
            scale: opt_f64(&jv, "scale")?.unwrap_or(d.scale),
            projection,
            jumps,
            smoothing,
            rbf,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values no mapper can work with
    pub fn validate(&self) -> MapResult<()> {
        let fail = |msg: &str| Err(MapError::Parse(msg.to_owned()));
        if !self.scale.is_finite() {
            return fail("scale must be finite");
        }
        if self.projection.min_leaf_count == 0 {
            return fail("min_leaf_count must be at least 1");
        }
        if !(self.projection.catch_radius > 0.0) {
            return fail("catch_radius must be positive");
        }
        if !(self.smoothing.omega > 0.0 && self.smoothing.omega <= 1.0) {
            return fail("omega must be in (0, 1]");
        }
        if self.smoothing.radius < 0.0 {
            return fail("smoothing radius must not be negative");
        }
        if self.jumps.max_angle < 0.0
            || self.jumps.max_distance < 0.0
            || self.jumps.concavity_ratio < 0.0
            || self.jumps.coincident_tolerance < 0.0
        {
            return fail("jump thresholds must not be negative");
        }
        if self.rbf.merge_threshold < 0.0 {
            return fail("merge_threshold must not be negative");
        }
        if let CenterSelection::Reduced(0) = self.rbf.centers {
            return fail("a reduced center set needs a positive count");
        }
        Ok(())
    }

    /// Construct the configured strategy for a structural mesh and a node classification
    pub fn build_mapper<'s>(
        &self,
        structure: &'s Mesh,
        classification: Classification,
        selection: FieldSelection,
    ) -> MapResult<Box<dyn DisplacementMapper + 's>> {
        self.validate()?;
        let base = MapperBase::new(structure, classification, selection).with_scale(self.scale);
        tracing::info!(strategy = ?self.strategy, scale = self.scale, "building mapper");
        Ok(match self.strategy {
            Strategy::Projection => Box::new(ProjectionMapper::new(
                base,
                self.projection.clone(),
                self.jumps.clone(),
                self.smoothing.clone(),
                SolverRegistry::with_defaults(),
            )),
            Strategy::Rbf => Box::new(RbfMapper::new(base, self.rbf.clone())),
        })
    }
}

fn opt_f64(jv: &JsonValue, key: &str) -> MapResult<Option<f64>> {
    let v = &jv[key];
    if v.is_null() {
        Ok(None)
    } else {
        v.as_f64()
            .map(Some)
            .ok_or_else(|| MapError::Parse(format!("'{}' must be a number", key)))
    }
}

fn opt_usize(jv: &JsonValue, key: &str) -> MapResult<Option<usize>> {
    let v = &jv[key];
    if v.is_null() {
        Ok(None)
    } else {
        v.as_usize()
            .map(Some)
            .ok_or_else(|| MapError::Parse(format!("'{}' must be a non-negative integer", key)))
    }
}

fn opt_bool(jv: &JsonValue, key: &str) -> MapResult<Option<bool>> {
    let v = &jv[key];
    if v.is_null() {
        Ok(None)
    } else {
        v.as_bool()
            .map(Some)
            .ok_or_else(|| MapError::Parse(format!("'{}' must be true or false", key)))
    }
}

fn opt_str<'a>(jv: &'a JsonValue, key: &str) -> MapResult<Option<&'a str>> {
    let v = &jv[key];
    if v.is_null() {
        Ok(None)
    } else {
        v.as_str()
            .map(Some)
            .ok_or_else(|| MapError::Parse(format!("'{}' must be a string", key)))
    }
}
