use nalgebra::{Point3, Vector3};

/// Relative tolerance used to snap plane distances to zero in the intersection tests
const PLANE_EPS: f64 = 1e-12;

/// Closest point on a triangle to a query point
#[derive(Debug, Clone, Copy)]
pub struct FootPoint {
    /// Barycentric weights of the closest point (non-negative, sum to one)
    pub weights: [f64; 3],
    pub point: Point3<f64>,
}

/// Area-weighted normal `(b - a) x (c - a)` (not normalized)
#[inline]
pub fn triangle_normal(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> Vector3<f64> {
    (b - a).cross(&(c - a))
}

#[inline]
pub fn triangle_center(t: &[Point3<f64>; 3]) -> Point3<f64> {
    Point3::from((t[0].coords + t[1].coords + t[2].coords) / 3.0)
}

/// Closest point on the closed triangle `(a, b, c)` to `p`, returned as clamped barycentric weights
///
/// Vertex and edge regions are handled explicitly, so the weights are always in `[0, 1]`.
/// Collinear triangles fall back to the closest of their three edges.
pub fn closest_point(p: &Point3<f64>, a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> FootPoint {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return FootPoint::from_weights([1.0, 0.0, 0.0], a, b, c);
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return FootPoint::from_weights([0.0, 1.0, 0.0], a, b, c);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return FootPoint::from_weights([1.0 - v, v, 0.0], a, b, c);
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return FootPoint::from_weights([0.0, 0.0, 1.0], a, b, c);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return FootPoint::from_weights([1.0 - w, 0.0, w], a, b, c);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return FootPoint::from_weights([0.0, 1.0 - w, w], a, b, c);
    }

    let sum = va + vb + vc;
    if sum.abs() <= f64::EPSILON * (ab.norm_squared() * ac.norm_squared()).max(f64::MIN_POSITIVE) {
        return closest_on_edges(p, a, b, c);
    }
    let v = vb / sum;
    let w = vc / sum;
    FootPoint::from_weights([1.0 - v - w, v, w], a, b, c)
}

impl FootPoint {
    fn from_weights(weights: [f64; 3], a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> Self {
        Self {
            weights,
            point: Point3::from(a.coords * weights[0] + b.coords * weights[1] + c.coords * weights[2]),
        }
    }
}

fn closest_on_edges(p: &Point3<f64>, a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> FootPoint {
    let verts = [a, b, c];
    let mut best: Option<(f64, FootPoint)> = None;
    for (i, j) in [(0, 1), (1, 2), (2, 0)] {
        let e = verts[j] - verts[i];
        let len2 = e.norm_squared();
        let t = if len2 > 0.0 {
            ((p - verts[i]).dot(&e) / len2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut weights = [0.0; 3];
        weights[i] = 1.0 - t;
        weights[j] += t;
        let fp = FootPoint::from_weights(weights, a, b, c);
        let d2 = (fp.point - p).norm_squared();
        if best.as_ref().map_or(true, |(bd, _)| d2 < *bd) {
            best = Some((d2, fp));
        }
    }
    // the loop always runs three times
    best.map(|(_, fp)| fp).unwrap_or(FootPoint::from_weights([1.0, 0.0, 0.0], a, b, c))
}

/// How two triangles touch
#[derive(Debug, Clone, Copy)]
enum Contact {
    Disjoint,
    Coplanar(Vector3<f64>),
    Segment(Point3<f64>, Point3<f64>),
}

/// Möller-style triangle/triangle overlap test, including the coplanar case
pub fn triangles_intersect(t1: &[Point3<f64>; 3], t2: &[Point3<f64>; 3]) -> bool {
    match contact(t1, t2) {
        Contact::Disjoint => false,
        Contact::Segment(..) => true,
        Contact::Coplanar(n) => coplanar_overlap(t1, t2, &n),
    }
}

/// Intersection segment of two triangles; `None` if they are disjoint or coplanar
pub fn intersection_segment(
    t1: &[Point3<f64>; 3],
    t2: &[Point3<f64>; 3],
) -> Option<(Point3<f64>, Point3<f64>)> {
    match contact(t1, t2) {
        Contact::Segment(p, q) => Some((p, q)),
        _ => None,
    }
}

fn contact(t1: &[Point3<f64>; 3], t2: &[Point3<f64>; 3]) -> Contact {
    let scale = t1
        .iter()
        .chain(t2.iter())
        .flat_map(|p| p.coords.iter().map(|x| x.abs()))
        .fold(1.0_f64, f64::max);
    let eps = PLANE_EPS * scale;

    let n1 = match unit_normal(t1) {
        Some(n) => n,
        None => return Contact::Disjoint,
    };
    let n2 = match unit_normal(t2) {
        Some(n) => n,
        None => return Contact::Disjoint,
    };

    // distances of t1 to the plane of t2
    let d1 = signed_distances(t1, &t2[0], &n2, eps);
    if same_strict_sign(&d1) {
        return Contact::Disjoint;
    }
    let d2 = signed_distances(t2, &t1[0], &n1, eps);
    if same_strict_sign(&d2) {
        return Contact::Disjoint;
    }
    if d1.iter().all(|d| *d == 0.0) {
        return Contact::Coplanar(n1);
    }

    let dir = n1.cross(&n2);
    if dir.norm_squared() < eps * eps {
        return Contact::Disjoint;
    }

    let (a_lo, a_hi) = match plane_crossing(t1, &d1, &dir) {
        Some(s) => s,
        None => return Contact::Disjoint,
    };
    let (b_lo, b_hi) = match plane_crossing(t2, &d2, &dir) {
        Some(s) => s,
        None => return Contact::Disjoint,
    };

    let lo = if a_lo.0 >= b_lo.0 { a_lo } else { b_lo };
    let hi = if a_hi.0 <= b_hi.0 { a_hi } else { b_hi };
    if lo.0 > hi.0 + eps {
        Contact::Disjoint
    } else {
        Contact::Segment(lo.1, hi.1)
    }
}

fn unit_normal(t: &[Point3<f64>; 3]) -> Option<Vector3<f64>> {
    let n = triangle_normal(&t[0], &t[1], &t[2]);
    let len = n.norm();
    if len > 0.0 && len.is_finite() {
        Some(n / len)
    } else {
        None
    }
}

fn signed_distances(t: &[Point3<f64>; 3], origin: &Point3<f64>, n: &Vector3<f64>, eps: f64) -> [f64; 3] {
    let mut d = [0.0; 3];
    for (di, p) in d.iter_mut().zip(t.iter()) {
        let v = n.dot(&(p - origin));
        *di = if v.abs() <= eps { 0.0 } else { v };
    }
    d
}

fn same_strict_sign(d: &[f64; 3]) -> bool {
    (d[0] > 0.0 && d[1] > 0.0 && d[2] > 0.0) || (d[0] < 0.0 && d[1] < 0.0 && d[2] < 0.0)
}

/// Extreme points (parameter along `dir`, point) where triangle `t` crosses the plane
/// whose signed distances are `d`
fn plane_crossing(
    t: &[Point3<f64>; 3],
    d: &[f64; 3],
    dir: &Vector3<f64>,
) -> Option<((f64, Point3<f64>), (f64, Point3<f64>))> {
    let mut lo: Option<(f64, Point3<f64>)> = None;
    let mut hi: Option<(f64, Point3<f64>)> = None;
    let mut push = |p: Point3<f64>| {
        let s = dir.dot(&p.coords);
        if lo.map_or(true, |(l, _)| s < l) {
            lo = Some((s, p));
        }
        if hi.map_or(true, |(h, _)| s > h) {
            hi = Some((s, p));
        }
    };

    for i in 0..3 {
        let j = (i + 1) % 3;
        if d[i] == 0.0 {
            push(t[i]);
        }
        if d[i] * d[j] < 0.0 {
            let s = d[i] / (d[i] - d[j]);
            push(t[i] + (t[j] - t[i]) * s);
        }
    }

    lo.zip(hi)
}

fn coplanar_overlap(t1: &[Point3<f64>; 3], t2: &[Point3<f64>; 3], n: &Vector3<f64>) -> bool {
    // drop the dominant normal axis
    let a = n.abs();
    let (i, j) = if a.x >= a.y && a.x >= a.z {
        (1, 2)
    } else if a.y >= a.z {
        (0, 2)
    } else {
        (0, 1)
    };
    let p: [[f64; 2]; 3] = [[t1[0][i], t1[0][j]], [t1[1][i], t1[1][j]], [t1[2][i], t1[2][j]]];
    let q: [[f64; 2]; 3] = [[t2[0][i], t2[0][j]], [t2[1][i], t2[1][j]], [t2[2][i], t2[2][j]]];

    for e in 0..3 {
        for f in 0..3 {
            if segments_cross_2d(p[e], p[(e + 1) % 3], q[f], q[(f + 1) % 3]) {
                return true;
            }
        }
    }
    point_in_triangle_2d(p[0], &q) || point_in_triangle_2d(q[0], &p)
}

fn orient_2d(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn segments_cross_2d(a: [f64; 2], b: [f64; 2], c: [f64; 2], d: [f64; 2]) -> bool {
    let o1 = orient_2d(a, b, c);
    let o2 = orient_2d(a, b, d);
    let o3 = orient_2d(c, d, a);
    let o4 = orient_2d(c, d, b);

    if o1 * o2 < 0.0 && o3 * o4 < 0.0 {
        return true;
    }

    let on_segment = |p: [f64; 2], q: [f64; 2], r: [f64; 2]| {
        r[0] >= p[0].min(q[0]) && r[0] <= p[0].max(q[0]) && r[1] >= p[1].min(q[1]) && r[1] <= p[1].max(q[1])
    };
    (o1 == 0.0 && on_segment(a, b, c))
        || (o2 == 0.0 && on_segment(a, b, d))
        || (o3 == 0.0 && on_segment(c, d, a))
        || (o4 == 0.0 && on_segment(c, d, b))
}

fn point_in_triangle_2d(p: [f64; 2], t: &[[f64; 2]; 3]) -> bool {
    let s0 = orient_2d(t[0], t[1], p);
    let s1 = orient_2d(t[1], t[2], p);
    let s2 = orient_2d(t[2], t[0], p);
    (s0 >= 0.0 && s1 >= 0.0 && s2 >= 0.0) || (s0 <= 0.0 && s1 <= 0.0 && s2 <= 0.0)
}
