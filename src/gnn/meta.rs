//! Message-passing layer with separate edge and node update blocks.
//!
//! ```text
//! h⁰ = relu(X · W_nodeᵀ)          g⁰ = relu(E · W_edgeᵀ)
//! for each block:
//!   g ← relu(h[src]·Aᵀ + h[dst]·Bᵀ + g·Cᵀ)        edge update
//!   m_i = aggr { g_k : edge k touches i }          mean | sum | max
//!   h ← relu(h·Dᵀ + m·Fᵀ)                          node update
//! node logits = h · W_outᵀ        edge logits = g · U_outᵀ
//! ```

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{GnnLayer, LayerDims, LayerOutput};
use crate::model::Graph;
use crate::{Error, Result};

/// How incident edge states are pooled into a node message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    Sum,
    Max,
}

impl Aggregation {
    pub const NAMES: &'static [&'static str] = &["mean", "sum", "max", "add"];
}

impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Aggregation::Mean),
            "sum" | "add" => Ok(Aggregation::Sum),
            "max" => Ok(Aggregation::Max),
            other => Err(Error::Config(format!("unknown aggregation `{other}`"))),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Mean => f.write_str("mean"),
            Aggregation::Sum => f.write_str("sum"),
            Aggregation::Max => f.write_str("max"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Block {
    edge_src: Array2<f32>,
    edge_dst: Array2<f32>,
    edge_self: Array2<f32>,
    node_self: Array2<f32>,
    node_msg: Array2<f32>,
}

/// Every trainable matrix of the layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaWeights {
    node_in: Array2<f32>,
    edge_in: Array2<f32>,
    blocks: Vec<Block>,
    node_out: Array2<f32>,
    edge_out: Array2<f32>,
}

impl MetaWeights {
    fn init(dims: LayerDims, hidden: usize, depth: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut mat = |rows: usize, cols: usize| {
            let bound = 1.0 / (cols.max(1) as f32).sqrt();
            Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..=bound))
        };
        let node_in = mat(hidden, dims.node_feats);
        let edge_in = mat(hidden, dims.edge_feats);
        let blocks = (0..depth)
            .map(|_| Block {
                edge_src: mat(hidden, hidden),
                edge_dst: mat(hidden, hidden),
                edge_self: mat(hidden, hidden),
                node_self: mat(hidden, hidden),
                node_msg: mat(hidden, hidden),
            })
            .collect();
        let node_out = mat(dims.node_classes, hidden);
        let edge_out = mat(dims.edge_classes, hidden);
        Self { node_in, edge_in, blocks, node_out, edge_out }
    }

    /// `(name, (rows, cols))` of every matrix, in a fixed order.
    fn shapes(&self) -> Vec<(String, (usize, usize))> {
        let mut out = vec![
            ("node_in".to_string(), self.node_in.dim()),
            ("edge_in".to_string(), self.edge_in.dim()),
        ];
        for (k, b) in self.blocks.iter().enumerate() {
            out.push((format!("blocks[{k}].edge_src"), b.edge_src.dim()));
            out.push((format!("blocks[{k}].edge_dst"), b.edge_dst.dim()));
            out.push((format!("blocks[{k}].edge_self"), b.edge_self.dim()));
            out.push((format!("blocks[{k}].node_self"), b.node_self.dim()));
            out.push((format!("blocks[{k}].node_msg"), b.node_msg.dim()));
        }
        out.push(("node_out".to_string(), self.node_out.dim()));
        out.push(("edge_out".to_string(), self.edge_out.dim()));
        out
    }

    fn num_parameters(&self) -> usize {
        let block: usize = self
            .blocks
            .iter()
            .map(|b| b.edge_src.len() + b.edge_dst.len() + b.edge_self.len() + b.node_self.len() + b.node_msg.len())
            .sum();
        self.node_in.len() + self.edge_in.len() + block + self.node_out.len() + self.edge_out.len()
    }
}

fn relu(mut x: Array2<f32>) -> Array2<f32> {
    x.mapv_inplace(|v| v.max(0.0));
    x
}

fn aggregate(g: &Array2<f32>, graph: &Graph, aggr: Aggregation) -> Array2<f32> {
    let n = graph.num_nodes();
    let width = g.ncols();
    let mut out: Array2<f32> = Array2::zeros((n, width));
    let mut counts = vec![0usize; n];
    for (k, &(i, j)) in graph.edges().iter().enumerate() {
        let msg = g.row(k);
        for node in [i, j] {
            let mut row = out.row_mut(node);
            if aggr == Aggregation::Max && counts[node] > 0 {
                row.zip_mut_with(&msg, |acc, &v| *acc = acc.max(v));
            } else if aggr == Aggregation::Max {
                row.assign(&msg);
            } else {
                row += &msg;
            }
            counts[node] += 1;
        }
    }
    if aggr == Aggregation::Mean {
        for (node, count) in counts.into_iter().enumerate() {
            if count > 1 {
                out.row_mut(node).mapv_inplace(|v| v / count as f32);
            }
        }
    }
    out
}

/// Seeded message-passing layer (`meta`).
#[derive(Debug, Clone)]
pub struct MetaLayer {
    dims: LayerDims,
    hidden: usize,
    aggr: Aggregation,
    weights: MetaWeights,
}

impl MetaLayer {
    pub fn new(dims: LayerDims, hidden: usize, depth: usize, aggr: Aggregation, seed: u64) -> Self {
        Self { dims, hidden, aggr, weights: MetaWeights::init(dims, hidden, depth, seed) }
    }

    pub fn depth(&self) -> usize {
        self.weights.blocks.len()
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggr
    }
}

impl GnnLayer for MetaLayer {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn dims(&self) -> LayerDims {
        self.dims
    }

    fn forward(&self, x: &Array2<f32>, e: &Array2<f32>, graph: &Graph) -> Result<LayerOutput> {
        self.dims.check_inputs(x, e, graph)?;
        let w = &self.weights;

        let (src, dst): (Vec<usize>, Vec<usize>) = graph.edges().iter().copied().unzip();
        let mut h = relu(x.dot(&w.node_in.t()));
        let mut g = relu(e.dot(&w.edge_in.t()));

        for block in &w.blocks {
            let hs = h.select(Axis(0), &src);
            let hd = h.select(Axis(0), &dst);
            g = relu(hs.dot(&block.edge_src.t()) + hd.dot(&block.edge_dst.t()) + g.dot(&block.edge_self.t()));
            let m = aggregate(&g, graph, self.aggr);
            h = relu(h.dot(&block.node_self.t()) + m.dot(&block.node_msg.t()));
        }

        Ok(LayerOutput {
            node_logits: h.dot(&w.node_out.t()),
            edge_logits: g.dot(&w.edge_out.t()),
        })
    }

    fn num_parameters(&self) -> usize {
        self.weights.num_parameters()
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.weights)?)
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        let weights: MetaWeights = serde_json::from_value(state)?;
        if weights.blocks.len() != self.weights.blocks.len() {
            return Err(Error::Config(format!(
                "checkpoint has {} blocks, the configured layer has {}",
                weights.blocks.len(),
                self.weights.blocks.len()
            )));
        }
        let expected = self.weights.shapes();
        for ((name, got), (_, want)) in weights.shapes().into_iter().zip(expected) {
            if got != want {
                return Err(Error::Config(format!(
                    "checkpoint matrix `{name}` is {}x{}, the configured layer needs {}x{}",
                    got.0, got.1, want.0, want.1
                )));
            }
        }
        self.weights = weights;
        Ok(())
    }
}
