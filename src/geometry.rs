/// Axis-aligned bounding boxes
pub mod aabb;
/// Closest-point queries and triangle/triangle intersection
pub mod triangle;

pub use aabb::Aabb;
pub use triangle::{closest_point, intersection_segment, triangles_intersect, FootPoint};
