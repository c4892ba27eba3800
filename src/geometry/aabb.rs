use nalgebra::Point3;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aabb {
    /// An inverted box which contains nothing; any `expand` makes it valid
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(f64::MIN, f64::MIN, f64::MIN),
        }
    }

    /// Smallest box containing all `points`
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f64>>) -> Self {
        let mut bb = Self::empty();
        for p in points {
            bb.expand_point(p);
        }
        bb
    }

    pub fn expand_point(&mut self, p: &Point3<f64>) {
        for k in 0..3 {
            self.min[k] = self.min[k].min(p[k]);
            self.max[k] = self.max[k].max(p[k]);
        }
    }

    pub fn expand(&mut self, other: &Self) {
        for k in 0..3 {
            self.min[k] = self.min[k].min(other.min[k]);
            self.max[k] = self.max[k].max(other.max[k]);
        }
    }

    pub fn is_valid(&self) -> bool {
        (0..3).all(|k| self.min[k] <= self.max[k])
    }

    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Index of the longest axis (0 = x, 1 = y, 2 = z)
    pub fn longest_axis(&self) -> usize {
        let d = self.max - self.min;
        if d.x >= d.y && d.x >= d.z {
            0
        } else if d.y >= d.z {
            1
        } else {
            2
        }
    }

    /// Closed-interval overlap test
    pub fn overlaps(&self, other: &Self) -> bool {
        (0..3).all(|k| self.min[k] <= other.max[k] && other.min[k] <= self.max[k])
    }

    /// Squared distance from `p` to the box (zero inside)
    pub fn distance_squared(&self, p: &Point3<f64>) -> f64 {
        (0..3)
            .map(|k| {
                let d = if p[k] < self.min[k] {
                    self.min[k] - p[k]
                } else if p[k] > self.max[k] {
                    p[k] - self.max[k]
                } else {
                    0.0
                };
                d * d
            })
            .sum()
    }

    /// Copy grown by `margin` in every direction
    pub fn padded(&self, margin: f64) -> Self {
        let m = nalgebra::Vector3::repeat(margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_and_distance() {
        let a = Aabb::from_points(&[Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)]);
        let b = Aabb::from_points(&[Point3::new(1.0, 0.5, 0.5), Point3::new(2.0, 2.0, 2.0)]);
        let c = Aabb::from_points(&[Point3::new(3.0, 3.0, 3.0), Point3::new(4.0, 4.0, 4.0)]);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!((a.distance_squared(&Point3::new(0.5, 0.5, 0.5))).abs() < 1e-15);
        assert!((a.distance_squared(&Point3::new(2.0, 1.0, 1.0)) - 1.0).abs() < 1e-15);
        assert!((a.distance_squared(&Point3::new(2.0, 2.0, 1.0)) - 2.0).abs() < 1e-15);
    }

    #[test]
    fn longest_axis_and_empty() {
        let bb = Aabb::from_points(&[Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 5.0, 2.0)]);
        assert_eq!(bb.longest_axis(), 1);
        assert!(!Aabb::empty().is_valid());
        assert!(bb.padded(0.5).distance_squared(&Point3::new(-0.5, 0.0, 0.0)) < 1e-15);
    }
}
