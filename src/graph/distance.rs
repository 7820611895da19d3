//! Cluster-to-cluster distances.
//!
//! | Algorithm | Exact | Cost |
//! |-----------|-------|------|
//! | `recursive` | yes | bounding-box bisection with branch-and-bound; near O((n+m) log) on separated clusters |
//! | `brute` | yes | O(n·m) |
//! | `centroid` | no | O(n+m) |
//! | `bbox` | no (lower bound) | O(n+m) |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::Point3;
use crate::{Error, Result};

/// Point-pair budget under which the recursive search scans directly.
const LEAF_PAIRS: usize = 64;

/// Selects how the distance between two point clouds is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceAlgorithm {
    #[default]
    Recursive,
    Brute,
    Centroid,
    #[serde(rename = "bbox")]
    BoundingBox,
}

impl DistanceAlgorithm {
    pub const NAMES: &'static [&'static str] = &["recursive", "brute", "centroid", "bbox"];

    pub fn is_exact(self) -> bool {
        matches!(self, DistanceAlgorithm::Recursive | DistanceAlgorithm::Brute)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceAlgorithm::Recursive => "recursive",
            DistanceAlgorithm::Brute => "brute",
            DistanceAlgorithm::Centroid => "centroid",
            DistanceAlgorithm::BoundingBox => "bbox",
        }
    }

    /// Distance between two clouds; `None` if either is empty.
    pub fn distance(self, a: &[Point3], b: &[Point3]) -> Option<f64> {
        if a.is_empty() || b.is_empty() {
            return None;
        }
        let d = match self {
            DistanceAlgorithm::Recursive => closest_pair(a, b)?.2,
            DistanceAlgorithm::Brute => closest_pair_brute(a, b)?.2,
            DistanceAlgorithm::Centroid => Point3::centroid(a)?.distance(Point3::centroid(b)?),
            DistanceAlgorithm::BoundingBox => Aabb::of(a.iter().copied())
                .distance_sq(&Aabb::of(b.iter().copied()))
                .sqrt(),
        };
        Some(d)
    }
}

impl FromStr for DistanceAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recursive" => Ok(DistanceAlgorithm::Recursive),
            "brute" | "voxel" => Ok(DistanceAlgorithm::Brute),
            "centroid" => Ok(DistanceAlgorithm::Centroid),
            "bbox" | "box" => Ok(DistanceAlgorithm::BoundingBox),
            other => Err(Error::GraphConfig(format!(
                "unknown dist_algorithm `{other}` (expected one of {:?})",
                DistanceAlgorithm::NAMES
            ))),
        }
    }
}

impl fmt::Display for DistanceAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Axis-aligned boxes
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct Aabb {
    lo: Point3,
    hi: Point3,
}

impl Aabb {
    fn of(points: impl Iterator<Item = Point3>) -> Self {
        let mut lo = Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
        let mut hi = Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            lo = lo.min(p);
            hi = hi.max(p);
        }
        Self { lo, hi }
    }

    fn distance_sq(&self, other: &Aabb) -> f64 {
        let gap = |alo: f64, ahi: f64, blo: f64, bhi: f64| (blo - ahi).max(alo - bhi).max(0.0);
        let dx = gap(self.lo.x, self.hi.x, other.lo.x, other.hi.x);
        let dy = gap(self.lo.y, self.hi.y, other.lo.y, other.hi.y);
        let dz = gap(self.lo.z, self.hi.z, other.lo.z, other.hi.z);
        dx * dx + dy * dy + dz * dz
    }

    fn longest_axis(&self) -> usize {
        let span = self.hi - self.lo;
        if span.x >= span.y && span.x >= span.z {
            0
        } else if span.y >= span.z {
            1
        } else {
            2
        }
    }
}

fn coord(p: Point3, axis: usize) -> f64 {
    match axis {
        0 => p.x,
        1 => p.y,
        _ => p.z,
    }
}

// ============================================================================
// Closest pair
// ============================================================================

/// Exact closest pair `(index in a, index in b, distance)` by plain scan.
/// Ties resolve to the lowest `(i, j)`.
pub fn closest_pair_brute(a: &[Point3], b: &[Point3]) -> Option<(usize, usize, f64)> {
    let mut best: Option<(usize, usize, f64)> = None;
    for (i, pa) in a.iter().enumerate() {
        for (j, pb) in b.iter().enumerate() {
            let d = pa.distance_sq(*pb);
            if best.is_none_or(|(_, _, bd)| d < bd) {
                best = Some((i, j, d));
            }
        }
    }
    best.map(|(i, j, d)| (i, j, d.sqrt()))
}

struct Search<'p> {
    a: &'p [Point3],
    b: &'p [Point3],
    best: (usize, usize, f64),
}

impl Search<'_> {
    fn scan(&mut self, ia: &[usize], ib: &[usize]) {
        for &i in ia {
            for &j in ib {
                let d = self.a[i].distance_sq(self.b[j]);
                let (bi, bj, bd) = self.best;
                if d < bd || (d == bd && (i, j) < (bi, bj)) {
                    self.best = (i, j, d);
                }
            }
        }
    }

    fn descend(&mut self, ia: &mut [usize], ib: &mut [usize]) {
        let box_a = Aabb::of(ia.iter().map(|&i| self.a[i]));
        let box_b = Aabb::of(ib.iter().map(|&j| self.b[j]));
        if box_a.distance_sq(&box_b) > self.best.2 {
            return;
        }
        if ia.len() * ib.len() <= LEAF_PAIRS {
            self.scan(ia, ib);
            return;
        }

        // Bisect the larger side along its longest axis, nearer half first.
        if ia.len() >= ib.len() {
            let (left, right) = bisect(ia, self.a, box_a.longest_axis());
            let dl = Aabb::of(left.iter().map(|&i| self.a[i])).distance_sq(&box_b);
            let dr = Aabb::of(right.iter().map(|&i| self.a[i])).distance_sq(&box_b);
            if dl <= dr {
                self.descend(left, ib);
                self.descend(right, ib);
            } else {
                self.descend(right, ib);
                self.descend(left, ib);
            }
        } else {
            let (left, right) = bisect(ib, self.b, box_b.longest_axis());
            let dl = Aabb::of(left.iter().map(|&j| self.b[j])).distance_sq(&box_a);
            let dr = Aabb::of(right.iter().map(|&j| self.b[j])).distance_sq(&box_a);
            if dl <= dr {
                self.descend(ia, left);
                self.descend(ia, right);
            } else {
                self.descend(ia, right);
                self.descend(ia, left);
            }
        }
    }
}

fn bisect<'s>(idx: &'s mut [usize], points: &[Point3], axis: usize) -> (&'s mut [usize], &'s mut [usize]) {
    let mid = idx.len() / 2;
    idx.select_nth_unstable_by(mid, |&x, &y| {
        coord(points[x], axis)
            .total_cmp(&coord(points[y], axis))
            .then(x.cmp(&y))
    });
    idx.split_at_mut(mid)
}

/// Exact closest pair by recursive bisection with bounding-box pruning.
/// Same result as [`closest_pair_brute`], ties included.
pub fn closest_pair(a: &[Point3], b: &[Point3]) -> Option<(usize, usize, f64)> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let mut ia: Vec<usize> = (0..a.len()).collect();
    let mut ib: Vec<usize> = (0..b.len()).collect();
    let mut search = Search { a, b, best: (usize::MAX, usize::MAX, f64::INFINITY) };
    search.descend(&mut ia, &mut ib);
    let (i, j, d) = search.best;
    Some((i, j, d.sqrt()))
}
