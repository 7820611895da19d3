//! # GNN Assembly
//!
//! Per sample: select the input clusters, build their candidate graph,
//! encode node and edge features, run the GNN layer and derive a group
//! partition from the edges it switches on.
//!
//! ```text
//! Sample[network_input] ── select(node_type, node_min_size) ──▶ nodes
//! nodes ── GraphBuilder ──▶ graph
//! (nodes, graph) ── FeatureEncoderPipeline ──▶ X, E
//! (X, E, graph) ── GnnLayer ──▶ node logits, edge logits
//! edge logits ── argmax == 1 ──▶ components ──▶ group_pred
//! ```

pub mod meta;

use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigNode, Kind, Schema};
use crate::encode::FeatureEncoderPipeline;
use crate::graph::GraphBuilder;
use crate::model::{ClassLabel, Graph, NodeRecord, Sample};
use crate::registry::{BuildContext, ComponentRegistry, ComponentSpec, Registry};
use crate::{Error, Result};

pub use meta::{Aggregation, MetaLayer};

// ============================================================================
// GnnLayer trait
// ============================================================================

/// Input and output widths of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDims {
    pub node_feats: usize,
    pub edge_feats: usize,
    pub node_classes: usize,
    pub edge_classes: usize,
}

impl LayerDims {
    fn check_inputs(&self, x: &Array2<f32>, e: &Array2<f32>, graph: &Graph) -> Result<()> {
        if x.ncols() != self.node_feats {
            return Err(Error::FeatureWidthMismatch { kind: "node", declared: self.node_feats, computed: x.ncols() });
        }
        if e.ncols() != self.edge_feats {
            return Err(Error::FeatureWidthMismatch { kind: "edge", declared: self.edge_feats, computed: e.ncols() });
        }
        if x.nrows() != graph.num_nodes() || e.nrows() != graph.num_edges() {
            return Err(Error::Config(format!(
                "feature rows ({} nodes, {} edges) do not match graph ({} nodes, {} edges)",
                x.nrows(),
                e.nrows(),
                graph.num_nodes(),
                graph.num_edges()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerOutput {
    pub node_logits: Array2<f32>,
    pub edge_logits: Array2<f32>,
}

/// Node and edge prediction layer. The math behind it is opaque to the
/// rest of the pipeline; only the widths are checked.
pub trait GnnLayer: Send + Sync {
    fn name(&self) -> &'static str;

    fn dims(&self) -> LayerDims;

    fn forward(&self, x: &Array2<f32>, e: &Array2<f32>, graph: &Graph) -> Result<LayerOutput>;

    fn num_parameters(&self) -> usize;

    /// Serializable weights, as stored in checkpoints.
    fn state(&self) -> Result<serde_json::Value>;

    fn load_state(&mut self, state: serde_json::Value) -> Result<()>;
}

fn build_meta(params: &ConfigNode, ctx: &BuildContext) -> Result<Box<dyn GnnLayer>> {
    let dims = LayerDims {
        node_feats: params.require_int("node_feats")? as usize,
        edge_feats: params.require_int("edge_feats")? as usize,
        node_classes: params.int_or("node_classes", ctx.classes.len() as i64) as usize,
        edge_classes: params.int_or("edge_classes", 2) as usize,
    };
    let depth = params.int_or("depth", 3) as usize;
    let hidden = params.int_or("hidden", 32) as usize;
    let aggr = params.str_or("aggr", "mean").parse()?;
    let seed = params
        .field("seed")
        .and_then(ConfigNode::as_int)
        .map(|s| s as u64)
        .or(ctx.seed)
        .unwrap_or(0);
    Ok(Box::new(MetaLayer::new(dims, hidden, depth, aggr, seed)))
}

pub fn register_defaults(reg: &mut Registry<dyn GnnLayer>) {
    let schema = Schema::closed()
        .required("node_feats", Kind::int_min(1))
        .required("edge_feats", Kind::int_min(1))
        .optional("node_classes", Kind::int_min(1))
        .optional("edge_classes", Kind::int_range(1, 2))
        .optional("depth", Kind::int_min(1))
        .optional("hidden", Kind::int_min(1))
        .optional("aggr", Kind::OneOf(Aggregation::NAMES))
        .optional("seed", Kind::int_min(0));
    reg.register("meta", schema, build_meta).alias("meta_layer", "meta");
}

// ============================================================================
// GraphOutput
// ============================================================================

/// Everything the model produces for one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphOutput {
    /// Sample index the output belongs to.
    pub index: usize,
    /// Ids of the selected clusters, in node order.
    pub node_ids: Vec<i64>,
    pub graph: Graph,
    pub node_features: Array2<f32>,
    pub edge_features: Array2<f32>,
    /// `num_nodes × node_classes` logits.
    pub node_pred: Array2<f32>,
    /// `num_edges × edge_classes` logits.
    pub edge_pred: Array2<f32>,
    /// Predicted group per node (connected components over "on" edges).
    pub group_pred: Vec<usize>,
}

pub(crate) fn argmax(row: ndarray::ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (k, &v)| if v > best.1 { (k, v) } else { best })
        .0
}

impl GraphOutput {
    /// Predicted class per node.
    pub fn node_classes(&self) -> Vec<ClassLabel> {
        self.node_pred
            .rows()
            .into_iter()
            .map(|r| ClassLabel(argmax(r) as u16))
            .collect()
    }

    /// Whether each edge is predicted "on" (same group).
    pub fn edge_on(&self) -> Vec<bool> {
        edge_on(&self.edge_pred)
    }
}

fn edge_on(edge_pred: &Array2<f32>) -> Vec<bool> {
    edge_pred
        .rows()
        .into_iter()
        .map(|r| if r.len() == 1 { r[0] > 0.0 } else { argmax(r) == 1 })
        .collect()
}

// ============================================================================
// GnnAssembly
// ============================================================================

/// Schema of `model.modules.grappa`.
pub fn module_schema() -> Schema {
    let component = || Kind::Map(Schema::open().required("name", Kind::Str));
    Schema::closed()
        .required("graph", component())
        .required("node_encoder", component())
        .required("edge_encoder", component())
        .required("gnn_model", component())
        .nullable("node_type", Kind::Either(vec![Kind::int_min(-1), Kind::list_of(Kind::int_min(-1))]))
        .optional("node_min_size", Kind::int_min(-1))
}

/// Graph builder, encoders and GNN layer, wired to one clusters label.
pub struct GnnAssembly {
    graph: Box<dyn GraphBuilder>,
    encoders: FeatureEncoderPipeline,
    layer: Box<dyn GnnLayer>,
    /// Classes admitted as nodes; empty admits all.
    node_type: Vec<ClassLabel>,
    node_min_size: Option<usize>,
    input: Option<String>,
}

impl GnnAssembly {
    /// Phase one: build every component of the module block.
    pub fn build(config: &ConfigNode, registry: &ComponentRegistry, ctx: &BuildContext) -> Result<Self> {
        config.validate(&module_schema())?;
        let spec = |key: &str| -> Result<ComponentSpec> {
            let node = config.resolve(key)?;
            ComponentSpec::from_node(node, "name", key)
        };
        let graph = registry.graphs.build(&spec("graph")?, ctx)?;
        let node_encoder = registry.node_encoders.build(&spec("node_encoder")?, ctx)?;
        let edge_encoder = registry.edge_encoders.build(&spec("edge_encoder")?, ctx)?;
        let layer = registry.gnn_layers.build(&spec("gnn_model")?, ctx)?;

        let node_type = match config.field("node_type") {
            Some(ConfigNode::List(items)) => items.iter().filter_map(ConfigNode::as_int).collect(),
            Some(other) => other.as_int().into_iter().collect(),
            None => Vec::new(),
        };
        let node_type = node_type
            .into_iter()
            .filter(|&t| t >= 0)
            .map(|t| {
                u16::try_from(t)
                    .map(ClassLabel)
                    .map_err(|_| Error::Config(format!("node_type {t} is not a valid class label")))
            })
            .collect::<Result<Vec<_>>>()?;
        let node_min_size = match config.int_or("node_min_size", -1) {
            n if n < 0 => None,
            n => Some(n as usize),
        };

        Ok(Self {
            graph,
            encoders: FeatureEncoderPipeline::new(node_encoder, edge_encoder),
            layer,
            node_type,
            node_min_size,
            input: None,
        })
    }

    /// Phase two: bind the clusters label and check that encoder widths
    /// match the layer's declared inputs.
    pub fn wire(&mut self, input: &str) -> Result<()> {
        let dims = self.layer.dims();
        self.encoders.check_widths(dims.node_feats, dims.edge_feats)?;
        self.input = Some(input.to_string());
        tracing::debug!(
            input,
            graph = self.graph.name(),
            node_feats = dims.node_feats,
            edge_feats = dims.edge_feats,
            "wired gnn assembly"
        );
        Ok(())
    }

    /// Load layer weights from a checkpoint file.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        let checkpoint = crate::train::Checkpoint::read(path)?;
        if checkpoint.model != self.layer.name() {
            return Err(Error::Config(format!(
                "checkpoint {} holds `{}` weights, model is `{}`",
                path.display(),
                checkpoint.model,
                self.layer.name()
            )));
        }
        self.layer.load_state(checkpoint.state)?;
        tracing::info!(path = %path.display(), iteration = checkpoint.iteration, "loaded weights");
        Ok(())
    }

    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    pub fn graph_builder(&self) -> &dyn GraphBuilder {
        self.graph.as_ref()
    }

    pub fn encoders(&self) -> &FeatureEncoderPipeline {
        &self.encoders
    }

    pub fn layer(&self) -> &dyn GnnLayer {
        self.layer.as_ref()
    }

    pub fn layer_mut(&mut self) -> &mut dyn GnnLayer {
        self.layer.as_mut()
    }

    /// Indices of the clusters that become graph nodes.
    pub fn select(&self, nodes: &[NodeRecord]) -> Vec<usize> {
        nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| self.node_type.is_empty() || self.node_type.contains(&n.class_label))
            .filter(|(_, n)| self.node_min_size.is_none_or(|min| n.size() >= min))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn forward(&self, sample: &Sample) -> Result<GraphOutput> {
        let label = self
            .input
            .as_deref()
            .ok_or_else(|| Error::Config("gnn assembly used before wiring".into()))?;
        let all = sample.nodes(label).ok_or_else(|| Error::SampleParse {
            index: sample.index(),
            message: format!("no clusters under `{label}`"),
        })?;
        let nodes: Vec<NodeRecord> = self.select(all).into_iter().map(|i| all[i].clone()).collect();

        let graph = self.graph.build(&nodes);
        let node_features = self.encoders.encode_nodes(&nodes, &graph);
        let edge_features = self.encoders.encode_edges(&nodes, &graph);
        let out = self.layer.forward(&node_features, &edge_features, &graph)?;

        let on = edge_on(&out.edge_logits);
        let group_pred = graph.components(|e| on[e]);
        Ok(GraphOutput {
            index: sample.index(),
            node_ids: nodes.iter().map(|n| n.id).collect(),
            graph,
            node_features,
            edge_features,
            node_pred: out.node_logits,
            edge_pred: out.edge_logits,
            group_pred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Product, Provenance};

    fn module(yaml: &str) -> ConfigNode {
        ConfigNode::from_yaml_str(yaml).unwrap()
    }

    const MODULE: &str = r#"
graph: {name: complete, max_length: unlimited}
node_encoder: {name: geo, add_value: true, add_shape: true}
edge_encoder: {name: geo}
gnn_model: {name: meta, node_feats: 19, edge_feats: 19, depth: 2, hidden: 8, seed: 3}
node_type: [0, 2]
node_min_size: 2
"#;

    fn sample() -> Sample {
        let blob = |id: i64, class: u16, x: f64, n: usize| {
            NodeRecord::new(id, ClassLabel(class)).with_points((0..n).map(|k| [x + k as f64, 0.0, 0.0]))
        };
        Sample::new(Provenance::new(0)).with_product(
            "clust_label",
            Product::Clusters(vec![
                blob(10, 0, 0.0, 3),
                blob(11, 1, 10.0, 3), // track: filtered by node_type
                blob(12, 2, 20.0, 2),
                blob(13, 0, 30.0, 1), // too small
            ]),
        )
    }

    #[test]
    fn test_forward_selects_and_predicts() {
        let mut gnn = GnnAssembly::build(&module(MODULE), &ComponentRegistry::with_defaults(), &BuildContext::default())
            .unwrap();
        gnn.wire("clust_label").unwrap();
        let out = gnn.forward(&sample()).unwrap();
        assert_eq!(out.node_ids, vec![10, 12]);
        assert_eq!(out.graph.edges(), &[(0, 1)]);
        assert_eq!(out.node_features.dim(), (2, 19));
        assert_eq!(out.edge_features.dim(), (1, 19));
        assert_eq!(out.node_pred.dim(), (2, 5));
        assert_eq!(out.edge_pred.dim(), (1, 2));
        assert_eq!(out.group_pred.len(), 2);
        assert_eq!(out.node_classes().len(), 2);
    }

    #[test]
    fn test_wire_rejects_width_mismatch() {
        let cfg = module(&MODULE.replace("node_feats: 19", "node_feats: 20"));
        let mut gnn = GnnAssembly::build(&cfg, &ComponentRegistry::with_defaults(), &BuildContext::default())
            .unwrap();
        let err = gnn.wire("clust_label").unwrap_err();
        assert!(matches!(
            err,
            Error::FeatureWidthMismatch { kind: "node", declared: 20, computed: 19 }
        ));
    }

    #[test]
    fn test_forward_before_wire_fails() {
        let gnn = GnnAssembly::build(&module(MODULE), &ComponentRegistry::with_defaults(), &BuildContext::default())
            .unwrap();
        assert!(gnn.forward(&sample()).is_err());
    }

    #[test]
    fn test_unknown_graph_builder() {
        let cfg = module(&MODULE.replace("name: complete", "name: nonexistent"));
        let err = GnnAssembly::build(&cfg, &ComponentRegistry::with_defaults(), &BuildContext::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownComponent { .. }));
    }

    #[test]
    fn test_out_of_range_node_type_rejected() {
        for node_type in ["node_type: [0, 65536]", "node_type: 70000"] {
            let cfg = module(&MODULE.replace("node_type: [0, 2]", node_type));
            let err = GnnAssembly::build(&cfg, &ComponentRegistry::with_defaults(), &BuildContext::default())
                .err()
                .unwrap();
            assert!(matches!(err, Error::Config(ref msg) if msg.contains("not a valid class label")), "{err}");
        }
    }

    #[test]
    fn test_edge_on_single_channel() {
        let pred = Array2::from_shape_vec((2, 1), vec![0.5, -0.5]).unwrap();
        assert_eq!(edge_on(&pred), vec![true, false]);
        let pred = Array2::from_shape_vec((2, 2), vec![0.1, 0.9, 0.7, 0.2]).unwrap();
        assert_eq!(edge_on(&pred), vec![true, false]);
    }
}
