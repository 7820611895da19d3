//! # Graph Construction
//!
//! Builds the candidate-edge graph over one sample's clusters. Every
//! builder starts from the same admissibility rule and then applies its own
//! topology:
//!
//! ```text
//! pair (i, j), i < j
//!   ├─ either cloud empty ................ rejected (no valid distance)
//!   ├─ limit(c_i, c_j) = NoEdge .......... rejected, whatever the distance
//!   ├─ limit(c_i, c_j) = Unlimited ....... admitted
//!   └─ limit(c_i, c_j) = Max(m) .......... admitted iff distance ≤ m
//!
//! complete: every admitted pair
//! knn:      union of each node's k nearest admitted partners
//! mst:      minimum spanning forest of the admitted pairs
//! ```
//!
//! ## Limit matrix encoding
//!
//! `max_length` accepts a scalar (uniform), the flattened upper triangle of
//! a symmetric matrix (`n(n+1)/2` entries, row by row), a flattened full
//! matrix (`n²` entries) or nested rows. Entries: `0` or `"no_edge"` →
//! [`DistanceLimit::NoEdge`]; negative, `null` or `"unlimited"` →
//! [`DistanceLimit::Unlimited`]; positive → [`DistanceLimit::Max`].

pub mod distance;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigNode, Kind, Schema};
use crate::model::graph::uf_union;
use crate::model::{ClassLabel, Graph, NodeRecord};
use crate::registry::{BuildContext, Registry};
use crate::{Error, Result};

pub use distance::{closest_pair, closest_pair_brute, DistanceAlgorithm};

// ============================================================================
// DistanceLimit
// ============================================================================

/// Maximum admissible distance for one ordered class pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceLimit {
    /// The pair is never connected.
    NoEdge,
    /// The pair is always connected.
    Unlimited,
    /// Connected iff the cluster distance is at most this value.
    Max(f64),
}

impl DistanceLimit {
    /// Whether a pair at `distance` passes. `NoEdge` never does.
    pub fn admits(self, distance: f64) -> bool {
        match self {
            DistanceLimit::NoEdge => false,
            DistanceLimit::Unlimited => true,
            DistanceLimit::Max(m) => distance <= m,
        }
    }

    /// The more restrictive of two limits.
    pub fn stricter(self, other: DistanceLimit) -> DistanceLimit {
        use DistanceLimit::*;
        match (self, other) {
            (NoEdge, _) | (_, NoEdge) => NoEdge,
            (Unlimited, x) | (x, Unlimited) => x,
            (Max(a), Max(b)) => Max(a.min(b)),
        }
    }

    pub fn from_number(value: f64) -> Result<Self> {
        if value.is_nan() {
            Err(Error::GraphConfig("distance limit is NaN".into()))
        } else if value == 0.0 {
            Ok(DistanceLimit::NoEdge)
        } else if value < 0.0 || value.is_infinite() {
            Ok(DistanceLimit::Unlimited)
        } else {
            Ok(DistanceLimit::Max(value))
        }
    }

    pub fn from_config(node: &ConfigNode) -> Result<Self> {
        match node {
            ConfigNode::Unset => Ok(DistanceLimit::Unlimited),
            ConfigNode::String(s) => match s.as_str() {
                "no_edge" | "none" => Ok(DistanceLimit::NoEdge),
                "unlimited" | "inf" => Ok(DistanceLimit::Unlimited),
                other => Err(Error::GraphConfig(format!("unknown distance limit `{other}`"))),
            },
            other => match other.as_float() {
                Some(v) => Self::from_number(v),
                None => Err(Error::GraphConfig(format!(
                    "distance limit must be a number or name, got {}",
                    other.type_name()
                ))),
            },
        }
    }
}

impl fmt::Display for DistanceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceLimit::NoEdge => write!(f, "no_edge"),
            DistanceLimit::Unlimited => write!(f, "unlimited"),
            DistanceLimit::Max(m) => write!(f, "{m}"),
        }
    }
}

// ============================================================================
// DistanceLimitMatrix
// ============================================================================

/// `n × n` table of limits indexed by `(class_i, class_j)`; may be
/// asymmetric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceLimitMatrix {
    num_classes: usize,
    limits: Vec<DistanceLimit>,
}

impl DistanceLimitMatrix {
    pub fn uniform(num_classes: usize, limit: DistanceLimit) -> Self {
        Self { num_classes, limits: vec![limit; num_classes * num_classes] }
    }

    pub fn from_rows(rows: Vec<Vec<DistanceLimit>>) -> Result<Self> {
        let n = rows.len();
        if let Some((r, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != n) {
            return Err(Error::GraphConfig(format!(
                "distance matrix row {r} has {} entries, expected {n}",
                row.len()
            )));
        }
        Ok(Self { num_classes: n, limits: rows.into_iter().flatten().collect() })
    }

    /// Symmetric matrix from its upper triangle, row by row.
    pub fn from_upper_triangle(num_classes: usize, values: &[DistanceLimit]) -> Result<Self> {
        let expected = num_classes * (num_classes + 1) / 2;
        if values.len() != expected {
            return Err(Error::GraphConfig(format!(
                "upper-triangle distance matrix for {num_classes} classes needs {expected} entries, got {}",
                values.len()
            )));
        }
        let mut m = Self::uniform(num_classes, DistanceLimit::NoEdge);
        let mut k = 0;
        for i in 0..num_classes {
            for j in i..num_classes {
                m.limits[i * num_classes + j] = values[k];
                m.limits[j * num_classes + i] = values[k];
                k += 1;
            }
        }
        Ok(m)
    }

    /// Parse `max_length` for `num_classes` classes. Absent → all unlimited.
    pub fn from_config(node: Option<&ConfigNode>, num_classes: usize) -> Result<Self> {
        let n = num_classes;
        let matrix = match node {
            None | Some(ConfigNode::Unset) => Self::uniform(n, DistanceLimit::Unlimited),
            Some(ConfigNode::List(items)) if items.iter().all(|v| v.as_list().is_some()) && !items.is_empty() => {
                let rows = items
                    .iter()
                    .map(|row| {
                        row.as_list()
                            .unwrap_or_default()
                            .iter()
                            .map(DistanceLimit::from_config)
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?;
                Self::from_rows(rows)?
            }
            Some(ConfigNode::List(items)) => {
                let flat = items
                    .iter()
                    .map(DistanceLimit::from_config)
                    .collect::<Result<Vec<_>>>()?;
                if flat.len() == n * n && n > 1 {
                    let rows = flat.chunks(n).map(<[_]>::to_vec).collect();
                    Self::from_rows(rows)?
                } else {
                    Self::from_upper_triangle(n, &flat)?
                }
            }
            Some(scalar) => Self::uniform(n, DistanceLimit::from_config(scalar)?),
        };

        if matrix.num_classes != n {
            return Err(Error::GraphConfig(format!(
                "distance matrix covers {} classes, {n} declared",
                matrix.num_classes
            )));
        }
        Ok(matrix)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Entry for the ordered pair. Classes outside the table fail closed.
    pub fn get(&self, ci: ClassLabel, cj: ClassLabel) -> DistanceLimit {
        let (i, j) = (ci.index(), cj.index());
        if i >= self.num_classes || j >= self.num_classes {
            return DistanceLimit::NoEdge;
        }
        self.limits[i * self.num_classes + j]
    }

    /// Limit for the unordered pair: the stricter of both directions.
    pub fn pair(&self, ci: ClassLabel, cj: ClassLabel) -> DistanceLimit {
        self.get(ci, cj).stricter(self.get(cj, ci))
    }

    pub fn is_symmetric(&self) -> bool {
        let n = self.num_classes;
        (0..n).all(|i| (0..n).all(|j| self.limits[i * n + j] == self.limits[j * n + i]))
    }
}

// ============================================================================
// GraphConfig
// ============================================================================

/// Admissibility rule shared by every builder.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    pub limits: DistanceLimitMatrix,
    pub algorithm: DistanceAlgorithm,
}

impl GraphConfig {
    pub fn new(limits: DistanceLimitMatrix, algorithm: DistanceAlgorithm) -> Self {
        Self { limits, algorithm }
    }

    /// Read `max_length`, `dist_algorithm` and `num_classes` from builder
    /// params. The declared class count is the size of the configured class
    /// set; `num_classes` stands in only when no class set is declared and
    /// must agree with it otherwise.
    pub fn from_params(params: &ConfigNode, ctx: &BuildContext) -> Result<Self> {
        let declared = ctx.classes.len();
        let num_classes = match params.field("num_classes").and_then(ConfigNode::as_int) {
            Some(n) => {
                let n = usize::try_from(n)
                    .map_err(|_| Error::GraphConfig(format!("num_classes must be positive, got {n}")))?;
                if declared > 0 && n != declared {
                    return Err(Error::GraphConfig(format!(
                        "num_classes is {n} but {declared} classes are declared ({})",
                        ctx.classes.names().join(", ")
                    )));
                }
                n
            }
            None => declared,
        };
        if num_classes == 0 {
            return Err(Error::GraphConfig("no classes declared".into()));
        }
        let limits = DistanceLimitMatrix::from_config(params.child("max_length"), num_classes)?;
        let algorithm = params.str_or("dist_algorithm", "recursive").parse()?;
        Ok(Self { limits, algorithm })
    }

    /// Every admissible pair `(i, j, distance)` with `i < j`, ascending.
    ///
    /// With `need_distance == false`, unlimited pairs skip the distance
    /// computation and carry `f64::INFINITY`.
    pub fn admissible_pairs(&self, nodes: &[NodeRecord], need_distance: bool) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::new();
        for i in 0..nodes.len() {
            if nodes[i].is_empty() {
                continue;
            }
            for j in (i + 1)..nodes.len() {
                if nodes[j].is_empty() {
                    continue;
                }
                let limit = self.limits.pair(nodes[i].class_label, nodes[j].class_label);
                let distance = match limit {
                    DistanceLimit::NoEdge => continue,
                    DistanceLimit::Unlimited if !need_distance => f64::INFINITY,
                    _ => match self.algorithm.distance(&nodes[i].point_cloud, &nodes[j].point_cloud) {
                        Some(d) => d,
                        None => continue,
                    },
                };
                if limit.admits(distance) {
                    out.push((i, j, distance));
                }
            }
        }
        out
    }
}

// ============================================================================
// GraphBuilder trait
// ============================================================================

/// Builds one sample's candidate graph. Builders hold no per-sample state.
pub trait GraphBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &GraphConfig;

    fn build(&self, nodes: &[NodeRecord]) -> Graph;
}

/// Every admissible pair.
pub struct CompleteGraph {
    config: GraphConfig,
}

impl CompleteGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }
}

impl GraphBuilder for CompleteGraph {
    fn name(&self) -> &'static str { "complete" }

    fn config(&self) -> &GraphConfig { &self.config }

    fn build(&self, nodes: &[NodeRecord]) -> Graph {
        let pairs = self.config.admissible_pairs(nodes, false);
        Graph::from_edges(nodes.len(), pairs.into_iter().map(|(i, j, _)| (i, j)))
    }
}

/// Each node keeps its `k` nearest admissible partners.
pub struct KnnGraph {
    config: GraphConfig,
    k: usize,
}

impl KnnGraph {
    pub fn new(config: GraphConfig, k: usize) -> Self {
        Self { config, k }
    }
}

impl GraphBuilder for KnnGraph {
    fn name(&self) -> &'static str { "knn" }

    fn config(&self) -> &GraphConfig { &self.config }

    fn build(&self, nodes: &[NodeRecord]) -> Graph {
        let pairs = self.config.admissible_pairs(nodes, true);
        let mut partners: Vec<Vec<(f64, usize)>> = vec![Vec::new(); nodes.len()];
        for &(i, j, d) in &pairs {
            partners[i].push((d, j));
            partners[j].push((d, i));
        }
        let mut edges = Vec::new();
        for (i, list) in partners.iter_mut().enumerate() {
            list.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            edges.extend(list.iter().take(self.k).map(|&(_, j)| (i, j)));
        }
        Graph::from_edges(nodes.len(), edges)
    }
}

/// Minimum spanning forest of the admissible pairs (Kruskal).
pub struct MstGraph {
    config: GraphConfig,
}

impl MstGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }
}

impl GraphBuilder for MstGraph {
    fn name(&self) -> &'static str { "mst" }

    fn config(&self) -> &GraphConfig { &self.config }

    fn build(&self, nodes: &[NodeRecord]) -> Graph {
        let mut pairs = self.config.admissible_pairs(nodes, true);
        pairs.sort_by(|a, b| a.2.total_cmp(&b.2).then((a.0, a.1).cmp(&(b.0, b.1))));

        let n = nodes.len();
        let mut parent: Vec<usize> = (0..n).collect();
        let mut rank = vec![0usize; n];
        let edges: Vec<(usize, usize)> = pairs
            .into_iter()
            .filter(|&(i, j, _)| uf_union(&mut parent, &mut rank, i, j))
            .map(|(i, j, _)| (i, j))
            .collect();
        Graph::from_edges(n, edges)
    }
}

// ============================================================================
// Registration
// ============================================================================

fn base_schema() -> Schema {
    Schema::closed()
        .nullable("max_length", Kind::Any)
        .optional("dist_algorithm", Kind::OneOf(&["recursive", "brute", "voxel", "centroid", "bbox", "box"]))
        .optional("num_classes", Kind::int_min(1))
}

fn build_complete(params: &ConfigNode, ctx: &BuildContext) -> Result<Box<dyn GraphBuilder>> {
    Ok(Box::new(CompleteGraph::new(GraphConfig::from_params(params, ctx)?)))
}

fn build_knn(params: &ConfigNode, ctx: &BuildContext) -> Result<Box<dyn GraphBuilder>> {
    let k = params.int_or("k", 5) as usize;
    Ok(Box::new(KnnGraph::new(GraphConfig::from_params(params, ctx)?, k)))
}

fn build_mst(params: &ConfigNode, ctx: &BuildContext) -> Result<Box<dyn GraphBuilder>> {
    Ok(Box::new(MstGraph::new(GraphConfig::from_params(params, ctx)?)))
}

pub fn register_defaults(reg: &mut Registry<dyn GraphBuilder>) {
    reg.register("complete", base_schema(), build_complete)
        .register("knn", base_schema().optional("k", Kind::int_min(1)), build_knn)
        .register("mst", base_schema(), build_mst);
}
