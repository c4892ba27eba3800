/// Moving/sliding/fixed/rubber classification and displacement field selection
pub mod classifier;

pub use classifier::{Classification, FieldSelection, ModalInfo, NodeSetClassifier};

use nalgebra::{Matrix3, Unit, Vector3};
use std::ops::Index;

/// Sorted, duplicate-free collection of node indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodeSet {
    indices: Vec<u32>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort and de-duplicate
    pub fn from_unsorted(mut indices: Vec<u32>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Self { indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.indices.iter().copied()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.indices
    }

    pub fn contains(&self, node: u32) -> bool {
        self.indices.binary_search(&node).is_ok()
    }

    /// Position of `node` within the set (its row in anything indexed by this set)
    pub fn position(&self, node: u32) -> Option<usize> {
        self.indices.binary_search(&node).ok()
    }

    pub fn union(&self, other: &Self) -> Self {
        let (a, b) = (&self.indices, &other.indices);
        let mut out = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => {
                    out.push(a[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(b[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(a[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&a[i..]);
        out.extend_from_slice(&b[j..]);
        Self { indices: out }
    }

    /// Elements of `self` not in `other`
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            indices: self.iter().filter(|n| !other.contains(*n)).collect(),
        }
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            indices: self.iter().filter(|n| other.contains(*n)).collect(),
        }
    }

    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.intersection(other).is_empty()
    }
}

impl Index<usize> for NodeSet {
    type Output = u32;
    fn index(&self, index: usize) -> &Self::Output {
        &self.indices[index]
    }
}

impl FromIterator<u32> for NodeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self::from_unsorted(iter.into_iter().collect())
    }
}

/// Nodes that may only move within a plane
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingNodeSet {
    pub name: String,
    pub nodes: NodeSet,
    /// Unit normal of the sliding plane
    pub normal: Unit<Vector3<f64>>,
}

impl SlidingNodeSet {
    pub fn new(name: impl Into<String>, nodes: NodeSet, normal: Vector3<f64>) -> Self {
        Self {
            name: name.into(),
            nodes,
            normal: Unit::new_normalize(normal),
        }
    }

}

/// Normals closer to the span of the earlier ones than this are dropped
const PARALLEL_TOLERANCE: f64 = 1e-8;

/// Projector onto the intersection of the planes with the given normals
///
/// The normals are orthonormalized first, so a node shared by several sliding sets ends up in
/// every plane at once. Normals (nearly) in the span of earlier ones add no constraint.
pub fn plane_projector(normals: &[Unit<Vector3<f64>>]) -> Matrix3<f64> {
    let mut basis: Vec<Vector3<f64>> = Vec::with_capacity(3);
    for n in normals {
        let mut v = n.into_inner();
        for q in basis.iter() {
            let c = q.dot(&v);
            v -= q * c;
        }
        let norm = v.norm();
        if norm > PARALLEL_TOLERANCE {
            basis.push(v / norm);
        }
    }
    basis
        .iter()
        .fold(Matrix3::identity(), |p, q| p - q * q.transpose())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_and_unique() {
        let s = NodeSet::from_unsorted(vec![5, 1, 3, 1, 5]);
        assert_eq!(s.as_slice(), &[1, 3, 5]);
        assert_eq!(s.position(3), Some(1));
        assert_eq!(s.position(4), None);
        assert!(s.contains(5));
    }

    #[test]
    fn set_algebra() {
        let a = NodeSet::from_unsorted(vec![1, 2, 3, 7]);
        let b = NodeSet::from_unsorted(vec![3, 4, 7, 9]);
        assert_eq!(a.union(&b).as_slice(), &[1, 2, 3, 4, 7, 9]);
        assert_eq!(a.difference(&b).as_slice(), &[1, 2]);
        assert_eq!(a.intersection(&b).as_slice(), &[3, 7]);
        assert!(!a.is_disjoint(&b));
        assert!(a.difference(&b).is_disjoint(&b));
    }

    #[test]
    fn sliding_constraint_removes_normal_component() {
        let s = SlidingNodeSet::new("sym", NodeSet::new(), Vector3::new(0.0, 2.0, 0.0));
        let d = plane_projector(&[s.normal]) * Vector3::new(1.0, 3.0, -2.0);
        assert_eq!(d, Vector3::new(1.0, 0.0, -2.0));
    }

    #[test]
    fn shared_node_lies_in_both_planes() {
        let a = Unit::new_normalize(Vector3::new(0.0, 1.0, 1.0));
        let b = Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0));
        let p = plane_projector(&[a, b]);
        let d = p * Vector3::new(0.7, -1.3, 2.9);
        assert!(d.dot(&a).abs() < 1e-14);
        assert!(d.dot(&b).abs() < 1e-14);
        assert!((d.x - 0.7).abs() < 1e-14);

        // a repeated normal adds nothing
        let q = plane_projector(&[b, b, Unit::new_normalize(Vector3::new(0.0, 0.0, -3.0))]);
        assert!((q - plane_projector(&[b])).norm() < 1e-14);

        // three independent planes pin the node
        let x = Unit::new_normalize(Vector3::new(1.0, 0.0, 0.0));
        assert!(plane_projector(&[a, b, x]).norm() < 1e-14);
    }
}
