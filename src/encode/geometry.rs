//! Point-cloud statistics shared by the node and edge encoders.

use crate::model::Point3;

pub type Mat3 = [[f64; 3]; 3];

const JACOBI_SWEEPS: usize = 32;
const JACOBI_EPS: f64 = 1e-12;

/// Population covariance of a point set (zero matrix below two points).
pub fn covariance(points: &[Point3]) -> Mat3 {
    let mut cov = [[0.0; 3]; 3];
    let Some(mean) = Point3::centroid(points) else {
        return cov;
    };
    if points.len() < 2 {
        return cov;
    }
    for p in points {
        let d = (*p - mean).to_array();
        for r in 0..3 {
            for c in 0..3 {
                cov[r][c] += d[r] * d[c];
            }
        }
    }
    let n = points.len() as f64;
    for row in &mut cov {
        for v in row.iter_mut() {
            *v /= n;
        }
    }
    cov
}

/// Eigen-decomposition of a symmetric 3×3 matrix by cyclic Jacobi
/// rotations. Eigenvalues come back in descending order; column `k` of the
/// returned matrix is the unit eigenvector of eigenvalue `k`.
pub fn symmetric_eigen(m: &Mat3) -> ([f64; 3], Mat3) {
    let mut a = *m;
    let mut v = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    for _ in 0..JACOBI_SWEEPS {
        let off = a[0][1].abs() + a[0][2].abs() + a[1][2].abs();
        if off < JACOBI_EPS {
            break;
        }
        for (p, q) in [(0, 1), (0, 2), (1, 2)] {
            if a[p][q].abs() < JACOBI_EPS {
                continue;
            }
            let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;

            for k in 0..3 {
                let akp = a[k][p];
                let akq = a[k][q];
                a[k][p] = c * akp - s * akq;
                a[k][q] = s * akp + c * akq;
            }
            for k in 0..3 {
                let apk = a[p][k];
                let aqk = a[q][k];
                a[p][k] = c * apk - s * aqk;
                a[q][k] = s * apk + c * aqk;
            }
            for row in &mut v {
                let vp = row[p];
                let vq = row[q];
                row[p] = c * vp - s * vq;
                row[q] = s * vp + c * vq;
            }
        }
    }

    let mut order = [0usize, 1, 2];
    order.sort_by(|&x, &y| a[y][y].total_cmp(&a[x][x]));
    let values = order.map(|k| a[k][k]);
    let mut vectors = [[0.0; 3]; 3];
    for (col, &k) in order.iter().enumerate() {
        for row in 0..3 {
            vectors[row][col] = v[row][k];
        }
    }
    (values, vectors)
}

/// Direction of largest spread, sign fixed so its largest component is
/// positive. Zero vector when the cloud has no spread.
pub fn principal_axis(points: &[Point3]) -> Point3 {
    let (values, vectors) = symmetric_eigen(&covariance(points));
    if values[0] <= JACOBI_EPS {
        return Point3::ORIGIN;
    }
    let axis = Point3::new(vectors[0][0], vectors[1][0], vectors[2][0]).normalized();
    let a = axis.to_array();
    let lead = (0..3).fold(0, |best, k| if a[k].abs() > a[best].abs() { k } else { best });
    if a[lead] < 0.0 { axis * -1.0 } else { axis }
}

pub fn within<'p>(points: &'p [Point3], center: Point3, radius: f64) -> impl Iterator<Item = &'p Point3> {
    let r2 = radius * radius;
    points.iter().filter(move |p| p.distance_sq(center) <= r2)
}

/// Principal direction of the points within `radius` of `center`, oriented
/// away from `center`. Zero vector with fewer than two such points.
pub fn local_direction(points: &[Point3], center: Point3, radius: f64) -> Point3 {
    let local: Vec<Point3> = within(points, center, radius).copied().collect();
    if local.len() < 2 {
        return Point3::ORIGIN;
    }
    let axis = principal_axis(&local);
    let mean = Point3::centroid(&local).unwrap_or(center);
    if axis.dot(mean - center) < 0.0 { axis * -1.0 } else { axis }
}

pub fn local_count(points: &[Point3], center: Point3, radius: f64) -> usize {
    within(points, center, radius).count()
}
