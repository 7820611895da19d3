//! Product parsers: one named product of a raw event → one typed [`Product`].
//!
//! Each parser is configured with the raw product key(s) it reads:
//!
//! ```yaml
//! clust_label:
//!   parser: cluster3d
//!   cluster_event: cluster3d_pcluster
//!   particle_event: particle_corrected
//!   min_size: -1
//! ```
//!
//! Sparse products are `{points, values, meta?, run_info?}` objects. Cluster
//! products are either a bare list of clusters or
//! `{clusters: [...], meta?, run_info?}`.

use serde::Deserialize;
use serde_json::Value;

use super::{json_type, RawEvent};
use crate::config::{ConfigNode, Kind, Schema};
use crate::model::{ClassLabel, Meta, NodeRecord, ParticleRecord, Point3, PointSet, Product, ProductKind, RunInfo};
use crate::registry::{BuildContext, Registry};
use crate::Result;

/// Why one product could not be parsed. The dataset attaches the event index.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

type ParseResult<T> = std::result::Result<T, ParseError>;

pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Kind of product every successful parse returns.
    fn output(&self) -> ProductKind;

    fn parse(&self, event: &RawEvent) -> ParseResult<Product>;
}

// ============================================================================
// Raw payload helpers
// ============================================================================

fn product<'e>(event: &'e RawEvent, key: &str) -> ParseResult<&'e Value> {
    event
        .get(key)
        .ok_or_else(|| ParseError::new(format!("missing product `{key}`")))
}

fn decode<T: for<'de> Deserialize<'de>>(value: &Value, what: &str) -> ParseResult<T> {
    T::deserialize(value).map_err(|e| ParseError::new(format!("malformed {what}: {e}")))
}

/// Cluster list of a cluster product, wrapped or bare.
fn cluster_list<'e>(value: &'e Value, key: &str) -> ParseResult<&'e Value> {
    match value {
        Value::Array(_) => Ok(value),
        Value::Object(map) => map
            .get("clusters")
            .ok_or_else(|| ParseError::new(format!("`{key}` has no `clusters` list"))),
        other => Err(ParseError::new(format!("`{key}` must be a list or an object, got {}", json_type(other)))),
    }
}

/// Key of the first configured product among `keys`.
fn first_key(params: &ConfigNode, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| params.field(k).and_then(ConfigNode::as_str).map(str::to_string))
}

fn require_key(params: &ConfigNode, keys: &[&str], parser: &str) -> Result<String> {
    first_key(params, keys).ok_or_else(|| {
        crate::Error::Config(format!("parser `{parser}` needs one of: {}", keys.join(", ")))
    })
}

// ============================================================================
// sparse3d
// ============================================================================

pub struct Sparse3d {
    sparse_event: String,
}

impl Parser for Sparse3d {
    fn name(&self) -> &'static str {
        "sparse3d"
    }

    fn output(&self) -> ProductKind {
        ProductKind::Points
    }

    fn parse(&self, event: &RawEvent) -> ParseResult<Product> {
        let set: PointSet = decode(product(event, &self.sparse_event)?, "sparse tensor")?;
        if !set.values.is_empty() && set.values.len() != set.points.len() {
            return Err(ParseError::new(format!(
                "`{}` has {} points but {} values",
                self.sparse_event,
                set.points.len(),
                set.values.len()
            )));
        }
        Ok(Product::Points(set))
    }
}

// ============================================================================
// cluster3d
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawCluster {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default, alias = "shape")]
    class_label: Option<ClassLabel>,
    #[serde(default)]
    points: Vec<Point3>,
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    start: Option<Point3>,
    #[serde(default)]
    group_id: Option<i64>,
    #[serde(default)]
    parent_id: Option<i64>,
}

/// Clusters with truth, optionally completed from the particle list
/// (cluster `i` ↔ particle `i`).
pub struct Cluster3d {
    cluster_event: String,
    particle_event: Option<String>,
    /// Clusters with fewer points are dropped.
    min_size: Option<usize>,
}

impl Cluster3d {
    fn record(&self, index: usize, raw: RawCluster, particle: Option<&ParticleRecord>) -> ParseResult<NodeRecord> {
        if !raw.values.is_empty() && raw.values.len() != raw.points.len() {
            return Err(ParseError::new(format!(
                "cluster {index} has {} points but {} values",
                raw.points.len(),
                raw.values.len()
            )));
        }
        let class_label = raw
            .class_label
            .or_else(|| particle.and_then(|p| p.class_label))
            .ok_or_else(|| ParseError::new(format!("cluster {index} has no class label")))?;

        let mut node = NodeRecord::new(raw.id.unwrap_or(index as i64), class_label)
            .with_points(raw.points)
            .with_value(raw.values.iter().sum());
        if let Some(start) = raw.start.or_else(|| particle.map(|p| p.start)) {
            node = node.with_position(start);
        }
        node.group_id = raw.group_id.or_else(|| particle.and_then(|p| p.group_id));
        node.parent_id = raw.parent_id.or_else(|| particle.and_then(|p| p.parent_id));
        Ok(node)
    }
}

impl Parser for Cluster3d {
    fn name(&self) -> &'static str {
        "cluster3d"
    }

    fn output(&self) -> ProductKind {
        ProductKind::Clusters
    }

    fn parse(&self, event: &RawEvent) -> ParseResult<Product> {
        let list = cluster_list(product(event, &self.cluster_event)?, &self.cluster_event)?;
        let raw: Vec<RawCluster> = decode(list, "cluster list")?;
        let particles: Vec<ParticleRecord> = match &self.particle_event {
            Some(key) => decode(product(event, key)?, "particle list")?,
            None => Vec::new(),
        };
        if self.particle_event.is_some() && !(particles.len() == raw.len() || particles.len() + 1 == raw.len()) {
            return Err(ParseError::new(format!(
                "{} particles do not line up with {} clusters",
                particles.len(),
                raw.len()
            )));
        }

        let mut nodes = Vec::with_capacity(raw.len());
        for (i, cluster) in raw.into_iter().enumerate() {
            let node = self.record(i, cluster, particles.get(i))?;
            if self.min_size.is_none_or(|min| node.size() >= min) {
                nodes.push(node);
            }
        }
        Ok(Product::Clusters(nodes))
    }
}

// ============================================================================
// particle, particle_points, particle_graph
// ============================================================================

pub struct Particles {
    particle_event: String,
}

impl Parser for Particles {
    fn name(&self) -> &'static str {
        "particle"
    }

    fn output(&self) -> ProductKind {
        ProductKind::Particles
    }

    fn parse(&self, event: &RawEvent) -> ParseResult<Product> {
        Ok(Product::Particles(decode(product(event, &self.particle_event)?, "particle list")?))
    }
}

/// Start point of every particle; the value is its class index, `-1` if
/// unknown.
pub struct ParticlePoints {
    particle_event: String,
}

impl Parser for ParticlePoints {
    fn name(&self) -> &'static str {
        "particle_points"
    }

    fn output(&self) -> ProductKind {
        ProductKind::Points
    }

    fn parse(&self, event: &RawEvent) -> ParseResult<Product> {
        let particles: Vec<ParticleRecord> = decode(product(event, &self.particle_event)?, "particle list")?;
        let (points, values) = particles
            .iter()
            .map(|p| (p.start, p.class_label.map_or(-1.0, |c| c.0 as f64)))
            .unzip();
        Ok(Product::Points(PointSet { points, values }))
    }
}

/// Directed `(parent, child)` edges, where the child is the particle's
/// position in the list (its cluster index) and the parent is the particle's
/// `parent_id`. A particle that is its own parent links to its group leader
/// instead.
pub struct ParticleGraph {
    particle_event: String,
}

impl Parser for ParticleGraph {
    fn name(&self) -> &'static str {
        "particle_graph"
    }

    fn output(&self) -> ProductKind {
        ProductKind::Edges
    }

    fn parse(&self, event: &RawEvent) -> ParseResult<Product> {
        let particles: Vec<ParticleRecord> = decode(product(event, &self.particle_event)?, "particle list")?;
        let mut edges = Vec::new();
        for (cluster, p) in particles.iter().enumerate() {
            let child = cluster as i64;
            match (p.parent_id, p.group_id) {
                (Some(parent), _) if parent != p.id => edges.push((parent, child)),
                (_, Some(group)) if group != p.id => edges.push((group, child)),
                _ => {}
            }
        }
        Ok(Product::Edges(edges))
    }
}

// ============================================================================
// meta, run_info
// ============================================================================

fn attached<'e>(event: &'e RawEvent, key: &str, field: &str) -> ParseResult<&'e Value> {
    match product(event, key)? {
        Value::Object(map) => map
            .get(field)
            .ok_or_else(|| ParseError::new(format!("`{key}` carries no `{field}`"))),
        other => Err(ParseError::new(format!(
            "`{key}` is a bare {}, it carries no `{field}`",
            json_type(other)
        ))),
    }
}

/// Image metadata attached to a sparse or cluster product.
pub struct MetaParser {
    source: String,
}

impl Parser for MetaParser {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn output(&self) -> ProductKind {
        ProductKind::Meta
    }

    fn parse(&self, event: &RawEvent) -> ParseResult<Product> {
        let meta: Meta = decode(attached(event, &self.source, "meta")?, "meta")?;
        if [meta.size.x, meta.size.y, meta.size.z].iter().any(|s| *s <= 0.0) {
            return Err(ParseError::new("meta voxel size must be positive"));
        }
        Ok(Product::Meta(meta))
    }
}

/// Run/subrun/event triple attached to a sparse or cluster product.
pub struct RunInfoParser {
    source: String,
}

impl Parser for RunInfoParser {
    fn name(&self) -> &'static str {
        "run_info"
    }

    fn output(&self) -> ProductKind {
        ProductKind::RunInfo
    }

    fn parse(&self, event: &RawEvent) -> ParseResult<Product> {
        let info: RunInfo = decode(attached(event, &self.source, "run_info")?, "run info")?;
        Ok(Product::RunInfo(info))
    }
}

// ============================================================================
// Registration
// ============================================================================

const SOURCE_KEYS: &[&str] = &["sparse_event", "cluster_event"];

fn build_sparse3d(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Parser>> {
    Ok(Box::new(Sparse3d { sparse_event: params.require_str("sparse_event")?.to_string() }))
}

fn build_cluster3d(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Parser>> {
    let min_size = match params.int_or("min_size", -1) {
        n if n < 0 => None,
        n => Some(n as usize),
    };
    Ok(Box::new(Cluster3d {
        cluster_event: params.require_str("cluster_event")?.to_string(),
        particle_event: first_key(params, &["particle_event"]),
        min_size,
    }))
}

fn build_particles(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Parser>> {
    Ok(Box::new(Particles { particle_event: params.require_str("particle_event")?.to_string() }))
}

fn build_particle_points(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Parser>> {
    Ok(Box::new(ParticlePoints { particle_event: params.require_str("particle_event")?.to_string() }))
}

fn build_particle_graph(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Parser>> {
    Ok(Box::new(ParticleGraph { particle_event: params.require_str("particle_event")?.to_string() }))
}

fn build_meta(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Parser>> {
    Ok(Box::new(MetaParser { source: require_key(params, SOURCE_KEYS, "meta")? }))
}

fn build_run_info(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Parser>> {
    Ok(Box::new(RunInfoParser { source: require_key(params, SOURCE_KEYS, "run_info")? }))
}

pub fn register_defaults(reg: &mut Registry<dyn Parser>) {
    let particle_only = || Schema::closed().required("particle_event", Kind::Str);
    let attached_to = || {
        Schema::closed()
            .optional("sparse_event", Kind::Str)
            .optional("cluster_event", Kind::Str)
    };
    reg.register("sparse3d", Schema::closed().required("sparse_event", Kind::Str), build_sparse3d)
        .register(
            "cluster3d",
            Schema::closed()
                .required("cluster_event", Kind::Str)
                .nullable("particle_event", Kind::Str)
                .optional("min_size", Kind::int_min(-1)),
            build_cluster3d,
        )
        .alias("cluster3d_full", "cluster3d")
        .register("particle", particle_only(), build_particles)
        .alias("particle_asis", "particle")
        .register("particle_points", particle_only(), build_particle_points)
        .register("particle_graph", particle_only(), build_particle_graph)
        .register("meta", attached_to(), build_meta)
        .alias("meta2d", "meta")
        .alias("meta3d", "meta")
        .register("run_info", attached_to(), build_run_info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ComponentSpec, Domain};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn event(value: Value) -> RawEvent {
        match value {
            Value::Object(map) => map,
            _ => panic!("test event must be an object"),
        }
    }

    fn build(yaml: &str) -> Result<Box<dyn Parser>> {
        let mut reg = Registry::new(Domain::Parser);
        register_defaults(&mut reg);
        let spec = ComponentSpec::from_node(&ConfigNode::from_yaml_str(yaml).unwrap(), "parser", "schema.x")?;
        reg.build(&spec, &BuildContext::default())
    }

    fn clusters_event() -> RawEvent {
        event(json!({
            "cluster3d_pcluster": {
                "clusters": [
                    {"points": [[0, 0, 0], [2, 0, 0]], "values": [1.0, 2.0]},
                    {"points": [[9, 9, 9]], "shape": 2, "group_id": 7},
                    {"points": [], "class_label": 4}
                ],
                "meta": {"lower": [0, 0, 0], "upper": [10, 10, 10], "size": [1, 1, 1]},
                "run_info": {"run": 5, "subrun": 1, "event": 42}
            },
            "particle_corrected": [
                {"id": 0, "group_id": 0, "class_label": 0, "start": [0, 0, 0]},
                {"id": 1, "group_id": 0, "parent_id": 0, "class_label": 1}
            ]
        }))
    }

    #[test]
    fn test_cluster3d_fills_truth_from_particles() {
        let parser = build("{parser: cluster3d_full, cluster_event: cluster3d_pcluster, particle_event: particle_corrected}")
            .unwrap();
        assert_eq!(parser.output(), ProductKind::Clusters);
        let Product::Clusters(nodes) = parser.parse(&clusters_event()).unwrap() else {
            panic!("expected clusters");
        };
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].class_label, ClassLabel(0));
        assert_eq!(nodes[0].scalar_value, 3.0);
        assert_eq!(nodes[0].position, Point3::ORIGIN);
        // Cluster fields win over the particle's.
        assert_eq!(nodes[1].class_label, ClassLabel(2));
        assert_eq!(nodes[1].group_id, Some(7));
        assert_eq!(nodes[1].parent_id, Some(0));
        assert_eq!(nodes[2].id, 2);
    }

    #[test]
    fn test_cluster3d_min_size_drops_small_clusters() {
        let parser = build("{parser: cluster3d, cluster_event: cluster3d_pcluster, min_size: 2}").unwrap();
        let mut raw = clusters_event();
        raw.insert(
            "cluster3d_pcluster".into(),
            json!([{"points": [[0, 0, 0], [1, 0, 0]], "shape": 0}, {"points": [[5, 5, 5]], "shape": 1}]),
        );
        let Product::Clusters(nodes) = parser.parse(&raw).unwrap() else {
            panic!("expected clusters");
        };
        assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_cluster_without_class_is_malformed() {
        let parser = build("{parser: cluster3d, cluster_event: c}").unwrap();
        let err = parser.parse(&event(json!({"c": [{"points": [[0, 0, 0]]}]}))).unwrap_err();
        assert_eq!(err, ParseError::new("cluster 0 has no class label"));
    }

    #[test]
    fn test_missing_product_is_malformed() {
        let parser = build("{parser: sparse3d, sparse_event: sparse3d_pcluster}").unwrap();
        assert!(parser.parse(&clusters_event()).is_err());
    }

    #[test]
    fn test_particle_graph_edges() {
        let parser = build("{parser: particle_graph, particle_event: p}").unwrap();
        let raw = event(json!({"p": [
            {"id": 0, "group_id": 0},
            {"id": 1, "parent_id": 0, "group_id": 0},
            {"id": 2, "parent_id": 2, "group_id": 0}
        ]}));
        assert_eq!(parser.parse(&raw).unwrap(), Product::Edges(vec![(0, 1), (0, 2)]));
    }

    #[test]
    fn test_particle_graph_children_are_cluster_indices() {
        let parser = build("{parser: particle_graph, particle_event: p}").unwrap();
        let raw = event(json!({"p": [
            {"id": 10, "group_id": 10},
            {"id": 14, "parent_id": 10, "group_id": 10},
            {"id": 27, "parent_id": 27, "group_id": 10}
        ]}));
        assert_eq!(parser.parse(&raw).unwrap(), Product::Edges(vec![(10, 1), (10, 2)]));
    }

    #[test]
    fn test_meta_and_run_info_read_attached_fields() {
        let meta = build("{parser: meta3d, cluster_event: cluster3d_pcluster}").unwrap();
        let run = build("{parser: run_info, cluster_event: cluster3d_pcluster}").unwrap();
        assert_eq!(meta.parse(&clusters_event()).unwrap().kind(), ProductKind::Meta);
        assert_eq!(
            run.parse(&clusters_event()).unwrap(),
            Product::RunInfo(RunInfo { run: 5, subrun: 1, event: 42 })
        );
    }

    #[test]
    fn test_meta_needs_a_source_key() {
        assert!(matches!(build("{parser: meta}"), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_min_size_below_minus_one_rejected() {
        assert!(matches!(
            build("{parser: cluster3d, cluster_event: c, min_size: -2}"),
            Err(crate::Error::InvalidParams { .. })
        ));
    }
}
