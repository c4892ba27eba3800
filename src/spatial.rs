/// Implicit balanced binary tree layout and parallel level-by-level construction
pub mod layout;
/// Box tree over a point cloud (radius queries, coincident points, RBF center sampling)
pub mod point_tree;
/// Bounding-volume hierarchy over triangles (projection and tree/tree intersection)
pub mod triangle_tree;

pub use layout::TreeLayout;
pub use point_tree::PointTree;
pub use triangle_tree::{Projection, SpatialTriangleIndex};
