//! Cluster node records and their geometry primitives.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

// ============================================================================
// Point3
// ============================================================================

/// A point in detector space. Serialized as `[x, y, z]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const ORIGIN: Point3 = Point3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn dot(self, other: Point3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn distance(self, other: Point3) -> f64 {
        (self - other).norm()
    }

    pub fn distance_sq(self, other: Point3) -> f64 {
        let d = self - other;
        d.dot(d)
    }

    /// Unit vector, or the zero vector for a zero-length input.
    pub fn normalized(self) -> Point3 {
        let n = self.norm();
        if n > 0.0 { self / n } else { Point3::ORIGIN }
    }

    pub fn min(self, other: Point3) -> Point3 {
        Point3::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    pub fn max(self, other: Point3) -> Point3 {
        Point3::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    /// Mean of a point set; `None` for an empty set.
    pub fn centroid(points: &[Point3]) -> Option<Point3> {
        if points.is_empty() {
            return None;
        }
        let sum = points.iter().fold(Point3::ORIGIN, |acc, p| acc + *p);
        Some(sum / points.len() as f64)
    }
}

impl From<[f64; 3]> for Point3 {
    fn from(v: [f64; 3]) -> Self { Point3::new(v[0], v[1], v[2]) }
}

impl From<Point3> for [f64; 3] {
    fn from(p: Point3) -> Self { p.to_array() }
}

impl Add for Point3 {
    type Output = Point3;
    fn add(self, o: Point3) -> Point3 { Point3::new(self.x + o.x, self.y + o.y, self.z + o.z) }
}

impl Sub for Point3 {
    type Output = Point3;
    fn sub(self, o: Point3) -> Point3 { Point3::new(self.x - o.x, self.y - o.y, self.z - o.z) }
}

impl Mul<f64> for Point3 {
    type Output = Point3;
    fn mul(self, s: f64) -> Point3 { Point3::new(self.x * s, self.y * s, self.z * s) }
}

impl Div<f64> for Point3 {
    type Output = Point3;
    fn div(self, s: f64) -> Point3 { Point3::new(self.x / s, self.y / s, self.z / s) }
}

impl fmt::Display for Point3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// ============================================================================
// Class labels
// ============================================================================

/// Index into the configured [`ClassSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassLabel(pub u16);

impl ClassLabel {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed, ordered set of semantic classes a cluster may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSet {
    names: Vec<String>,
}

impl ClassSet {
    /// Shape classes of the detector reconstruction chain.
    pub const DEFAULT_NAMES: [&'static str; 5] = ["shower", "track", "michel", "delta", "low_energy"];

    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { names: names.into_iter().map(Into::into).collect() }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn label(&self, name: &str) -> Option<ClassLabel> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| ClassLabel(i as u16))
    }

    pub fn name(&self, label: ClassLabel) -> Option<&str> {
        self.names.get(label.index()).map(String::as_str)
    }

    pub fn contains(&self, label: ClassLabel) -> bool {
        label.index() < self.names.len()
    }
}

impl Default for ClassSet {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAMES)
    }
}

// ============================================================================
// NodeRecord
// ============================================================================

/// One cluster: the unit of graph construction.
///
/// Produced by the `cluster3d` parser and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: i64,
    pub class_label: ClassLabel,
    /// Reference point of the cluster (start point when known, else centroid).
    pub position: Point3,
    pub point_cloud: Vec<Point3>,
    /// Summed deposited value over the cluster.
    pub scalar_value: f64,
    /// Ground-truth group; `None` when the truth assignment is unknown.
    pub group_id: Option<i64>,
    /// Ground-truth parent cluster id, if any.
    pub parent_id: Option<i64>,
}

impl NodeRecord {
    pub fn new(id: i64, class_label: ClassLabel) -> Self {
        Self {
            id,
            class_label,
            position: Point3::ORIGIN,
            point_cloud: Vec::new(),
            scalar_value: 0.0,
            group_id: None,
            parent_id: None,
        }
    }

    /// Set the point cloud; the position defaults to its centroid.
    pub fn with_points(mut self, points: impl IntoIterator<Item = impl Into<Point3>>) -> Self {
        self.point_cloud = points.into_iter().map(Into::into).collect();
        if let Some(c) = Point3::centroid(&self.point_cloud) {
            self.position = c;
        }
        self
    }

    pub fn with_position(mut self, position: impl Into<Point3>) -> Self {
        self.position = position.into();
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.scalar_value = value;
        self
    }

    pub fn with_group(mut self, group_id: i64) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn size(&self) -> usize {
        self.point_cloud.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_cloud.is_empty()
    }

    pub fn centroid(&self) -> Option<Point3> {
        Point3::centroid(&self.point_cloud)
    }
}
