//! Transfer of structural displacement fields onto independent surface meshes
//!
//! A [`DisplacementMapper`] is built once per (structure, target) pair and then maps any
//! number of displacement or mode shape fields. Two strategies are available: projection onto
//! the nearest structural triangle (with rotational correction, discontinuity detection and
//! smoothing) and global radial basis function interpolation.

/// Mapper configuration and strategy selection
pub mod config;
/// Crate error type
pub mod error;
/// Boxes and triangle primitives
pub mod geometry;
/// Sparse matrices, mapping operators and the direct solver service
pub mod linalg;
/// The mapping strategies
pub mod mapping;
/// Minimal mesh model: nodes, elements, groups and fields
pub mod mesh;
/// Node sets and their classification
pub mod node_sets;
/// Progress reporting for long-running operations
pub mod progress;
/// Bounding volume hierarchies over triangles and points
pub mod spatial;

pub use config::{MapperConfig, Strategy};
pub use error::{MapError, MapResult};
pub use linalg::MappingMatrix;
pub use mapping::{DisplacementMapper, MapperBase, ProjectionMapper, RbfMapper};
pub use mesh::{Field, Mesh, ValueClass};
pub use node_sets::{Classification, FieldSelection, NodeSet, NodeSetClassifier};
pub use progress::{NoProgress, Progress, TracingProgress};
pub use spatial::SpatialTriangleIndex;
