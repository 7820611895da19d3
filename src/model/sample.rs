//! Parsed samples and the typed products parsers emit.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClassLabel, NodeRecord, Point3};

/// Plain point set with one value per point (voxels, PPN points, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointSet {
    pub points: Vec<Point3>,
    #[serde(default)]
    pub values: Vec<f64>,
}

/// Truth particle, as recorded by the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    pub id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub class_label: Option<ClassLabel>,
    #[serde(default)]
    pub pdg: i32,
    #[serde(default)]
    pub energy: f64,
    #[serde(default)]
    pub start: Point3,
    #[serde(default)]
    pub end: Point3,
}

/// Image metadata: translates voxel indices into detector coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub lower: Point3,
    pub upper: Point3,
    /// Voxel pitch along each axis.
    pub size: Point3,
}

impl Meta {
    pub fn to_world(&self, voxel: Point3) -> Point3 {
        Point3::new(
            self.lower.x + (voxel.x + 0.5) * self.size.x,
            self.lower.y + (voxel.y + 0.5) * self.size.y,
            self.lower.z + (voxel.z + 0.5) * self.size.z,
        )
    }

    pub fn to_voxel(&self, world: Point3) -> Point3 {
        Point3::new(
            (world.x - self.lower.x) / self.size.x - 0.5,
            (world.y - self.lower.y) / self.size.y - 0.5,
            (world.z - self.lower.z) / self.size.z - 0.5,
        )
    }

    /// Number of voxels along each axis.
    pub fn count(&self) -> [usize; 3] {
        let span = self.upper - self.lower;
        [
            (span.x / self.size.x).round().max(0.0) as usize,
            (span.y / self.size.y).round().max(0.0) as usize,
            (span.z / self.size.z).round().max(0.0) as usize,
        ]
    }
}

/// Run / subrun / event triple identifying one detector readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunInfo {
    pub run: i64,
    pub subrun: i64,
    pub event: i64,
}

impl fmt::Display for RunInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.run, self.subrun, self.event)
    }
}

/// One typed output of a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Product {
    Clusters(Vec<NodeRecord>),
    Points(PointSet),
    Particles(Vec<ParticleRecord>),
    /// Directed `(parent id, child cluster index)` pairs.
    Edges(Vec<(i64, i64)>),
    Meta(Meta),
    RunInfo(RunInfo),
}

/// Discriminant of [`Product`], used to type-check wiring at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductKind {
    Clusters,
    Points,
    Particles,
    Edges,
    Meta,
    RunInfo,
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProductKind::Clusters => "clusters",
            ProductKind::Points => "points",
            ProductKind::Particles => "particles",
            ProductKind::Edges => "edges",
            ProductKind::Meta => "meta",
            ProductKind::RunInfo => "run_info",
        };
        f.write_str(name)
    }
}

impl Product {
    pub fn kind(&self) -> ProductKind {
        match self {
            Product::Clusters(_) => ProductKind::Clusters,
            Product::Points(_) => ProductKind::Points,
            Product::Particles(_) => ProductKind::Particles,
            Product::Edges(_) => ProductKind::Edges,
            Product::Meta(_) => ProductKind::Meta,
            Product::RunInfo(_) => ProductKind::RunInfo,
        }
    }
}

/// Where a sample came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Index of the entry in the data source.
    pub index: usize,
    pub file: Option<PathBuf>,
    pub run_info: Option<RunInfo>,
    pub loaded_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(index: usize) -> Self {
        Self { index, file: None, run_info: None, loaded_at: Utc::now() }
    }
}

/// One parsed event: every schema label mapped to its product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub provenance: Provenance,
    pub products: BTreeMap<String, Product>,
}

impl Sample {
    pub fn new(provenance: Provenance) -> Self {
        Self { provenance, products: BTreeMap::new() }
    }

    pub fn index(&self) -> usize {
        self.provenance.index
    }

    pub fn with_product(mut self, label: impl Into<String>, product: Product) -> Self {
        self.products.insert(label.into(), product);
        self
    }

    pub fn product(&self, label: &str) -> Option<&Product> {
        self.products.get(label)
    }

    /// Cluster records under `label`, if that label holds clusters.
    pub fn nodes(&self, label: &str) -> Option<&[NodeRecord]> {
        match self.products.get(label) {
            Some(Product::Clusters(nodes)) => Some(nodes),
            _ => None,
        }
    }

    pub fn particles(&self, label: &str) -> Option<&[ParticleRecord]> {
        match self.products.get(label) {
            Some(Product::Particles(p)) => Some(p),
            _ => None,
        }
    }

    pub fn meta(&self) -> Option<&Meta> {
        self.products.values().find_map(|p| match p {
            Product::Meta(m) => Some(m),
            _ => None,
        })
    }
}
