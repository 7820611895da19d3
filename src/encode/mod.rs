//! # Feature Encoding
//!
//! Turns a sample's clusters and candidate graph into two dense tensors:
//! one row per node and one row per edge (canonical edge order). Each
//! encoder is an ordered concatenation of sub-encoder blocks whose widths
//! are known at build time.
//!
//! ```text
//! geo (node)                      width
//!   geometry ...................... 16   always
//!   value ......................... 2    add_value
//!   shape ......................... 1    add_shape
//!   start ......................... 3    add_start
//!   direction {radius} ............ 3    direction: {..}
//!   density {radius} .............. 2    density: {..}
//!
//! geo (edge)
//!   geometry ...................... 19   always
//!   shape ......................... 2    add_shape
//!   direction {radius} ............ 1    direction: {..}
//!   density {radius} .............. 2    density: {..}
//! ```
//!
//! `mix` takes the same blocks as an explicit ordered list:
//! `features: [{name: geometry}, {name: density, radius: 3, enabled: false}]`.

pub mod edge;
pub mod geometry;
pub mod node;

use ndarray::Array2;

use crate::config::{ConfigNode, Kind, Schema};
use crate::model::{Graph, NodeRecord};
use crate::registry::{BuildContext, Registry};
use crate::{Error, Result};

pub use edge::{ComposedEdgeEncoder, EdgeFeature};
pub use node::{ComposedNodeEncoder, NodeFeature};

/// Radius used by the local blocks when none is given.
pub const DEFAULT_RADIUS: f64 = 5.0;

// ============================================================================
// Traits
// ============================================================================

pub trait NodeEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Columns per node.
    fn width(&self) -> usize;

    /// `(block name, width)` in column order.
    fn layout(&self) -> Vec<(&'static str, usize)>;

    /// `nodes.len() × width` feature matrix.
    fn encode(&self, nodes: &[NodeRecord], graph: &Graph) -> Array2<f32>;
}

pub trait EdgeEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn width(&self) -> usize;

    fn layout(&self) -> Vec<(&'static str, usize)>;

    /// `graph.num_edges() × width` feature matrix.
    fn encode(&self, nodes: &[NodeRecord], graph: &Graph) -> Array2<f32>;
}

// ============================================================================
// FeatureEncoderPipeline
// ============================================================================

/// A node encoder and an edge encoder, used together.
pub struct FeatureEncoderPipeline {
    node: Box<dyn NodeEncoder>,
    edge: Box<dyn EdgeEncoder>,
}

impl FeatureEncoderPipeline {
    pub fn new(node: Box<dyn NodeEncoder>, edge: Box<dyn EdgeEncoder>) -> Self {
        Self { node, edge }
    }

    pub fn node_width(&self) -> usize {
        self.node.width()
    }

    pub fn edge_width(&self) -> usize {
        self.edge.width()
    }

    pub fn node_encoder(&self) -> &dyn NodeEncoder {
        self.node.as_ref()
    }

    pub fn edge_encoder(&self) -> &dyn EdgeEncoder {
        self.edge.as_ref()
    }

    /// Fail unless the encoders produce exactly the declared widths.
    pub fn check_widths(&self, node_feats: usize, edge_feats: usize) -> Result<()> {
        if self.node_width() != node_feats {
            return Err(Error::FeatureWidthMismatch {
                kind: "node",
                declared: node_feats,
                computed: self.node_width(),
            });
        }
        if self.edge_width() != edge_feats {
            return Err(Error::FeatureWidthMismatch {
                kind: "edge",
                declared: edge_feats,
                computed: self.edge_width(),
            });
        }
        Ok(())
    }

    pub fn encode_nodes(&self, nodes: &[NodeRecord], graph: &Graph) -> Array2<f32> {
        self.node.encode(nodes, graph)
    }

    pub fn encode_edges(&self, nodes: &[NodeRecord], graph: &Graph) -> Array2<f32> {
        self.edge.encode(nodes, graph)
    }
}

// ============================================================================
// Registration
// ============================================================================

fn local_block_schema() -> Kind {
    Kind::Map(Schema::closed().optional("radius", Kind::float_min(0.0)))
}

fn mix_schema(names: &'static [&'static str]) -> Schema {
    Schema::closed().required(
        "features",
        Kind::list_of(Kind::Map(
            Schema::closed()
                .required("name", Kind::OneOf(names))
                .optional("enabled", Kind::Bool)
                .optional("radius", Kind::float_min(0.0)),
        )),
    )
}

/// `radius` of an optional local block: `None` when absent or null.
fn local_radius(params: &ConfigNode, key: &str) -> Option<f64> {
    params.field(key).map(|block| block.float_or("radius", DEFAULT_RADIUS))
}

fn build_geo_node(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn NodeEncoder>> {
    let mut features = vec![NodeFeature::Geometry];
    if params.bool_or("add_value", false) {
        features.push(NodeFeature::Value);
    }
    if params.bool_or("add_shape", false) {
        features.push(NodeFeature::Shape);
    }
    if params.bool_or("add_start", false) {
        features.push(NodeFeature::Start);
    }
    if let Some(radius) = local_radius(params, "direction") {
        features.push(NodeFeature::Direction { radius });
    }
    if let Some(radius) = local_radius(params, "density") {
        features.push(NodeFeature::Density { radius });
    }
    Ok(Box::new(ComposedNodeEncoder::new("geo", features)))
}

fn build_mix_node(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn NodeEncoder>> {
    let mut features = Vec::new();
    for block in params.field("features").and_then(ConfigNode::as_list).unwrap_or_default() {
        features.extend(NodeFeature::from_config(block, DEFAULT_RADIUS)?);
    }
    Ok(Box::new(ComposedNodeEncoder::new("mix", features)))
}

fn build_geo_edge(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn EdgeEncoder>> {
    let mut features = vec![EdgeFeature::Geometry];
    if params.bool_or("add_shape", false) {
        features.push(EdgeFeature::Shape);
    }
    if let Some(radius) = local_radius(params, "direction") {
        features.push(EdgeFeature::Direction { radius });
    }
    if let Some(radius) = local_radius(params, "density") {
        features.push(EdgeFeature::Density { radius });
    }
    Ok(Box::new(ComposedEdgeEncoder::new("geo", features)))
}

fn build_mix_edge(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn EdgeEncoder>> {
    let mut features = Vec::new();
    for block in params.field("features").and_then(ConfigNode::as_list).unwrap_or_default() {
        features.extend(EdgeFeature::from_config(block, DEFAULT_RADIUS)?);
    }
    Ok(Box::new(ComposedEdgeEncoder::new("mix", features)))
}

pub fn register_node_encoders(reg: &mut Registry<dyn NodeEncoder>) {
    let geo = Schema::closed()
        .optional("add_value", Kind::Bool)
        .optional("add_shape", Kind::Bool)
        .optional("add_start", Kind::Bool)
        .nullable("direction", local_block_schema())
        .nullable("density", local_block_schema());
    reg.register("geo", geo, build_geo_node)
        .register("mix", mix_schema(NodeFeature::NAMES), build_mix_node)
        .alias("geometric", "geo");
}

pub fn register_edge_encoders(reg: &mut Registry<dyn EdgeEncoder>) {
    let geo = Schema::closed()
        .optional("add_shape", Kind::Bool)
        .nullable("direction", local_block_schema())
        .nullable("density", local_block_schema());
    reg.register("geo", geo, build_geo_edge)
        .register("mix", mix_schema(EdgeFeature::NAMES), build_mix_edge)
        .alias("geometric", "geo");
}
