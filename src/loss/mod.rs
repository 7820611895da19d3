//! # Loss Assembly
//!
//! Scores a [`GraphOutput`] against truth clusters. Truth is matched to the
//! predicted nodes by cluster id, so the truth label may differ from the
//! network input label.
//!
//! | Head | Name (alias) | Target |
//! |------|--------------|--------|
//! | node | `ce` (`type`) | truth class label |
//! | edge | `channel` (`edge_channel`) | `group`: same group id; `adjacency`: parent/child |
//!
//! The adjacency target reads parent/child links from the edges label listed
//! after the truth clusters in `loss_input` (a `particle_graph` product). With
//! no such label it falls back to each cluster's `parent_id`.
//!
//! `high_purity: true` selects [`PurityPolicy::Exclude`]: nodes with an
//! unknown group id, and every edge touching one, are left out of the loss.
//! Otherwise such edges count as negatives ([`PurityPolicy::Penalize`]).

use std::fmt;

use hashbrown::{HashMap, HashSet};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigNode, Kind, Schema};
use crate::gnn::{argmax, GraphOutput};
use crate::model::{ClassLabel, Graph, NodeRecord, Product, Sample};
use crate::registry::{BuildContext, ComponentRegistry, ComponentSpec, Registry};
use crate::{Error, Result};

// ============================================================================
// Policies and reports
// ============================================================================

/// What edge labels are derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTarget {
    /// On iff both clusters belong to the same group.
    #[default]
    Group,
    /// On iff one cluster is the parent of the other.
    Adjacency,
}

impl EdgeTarget {
    pub const NAMES: &'static [&'static str] = &["group", "adjacency"];

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "group" => Ok(EdgeTarget::Group),
            "adjacency" => Ok(EdgeTarget::Adjacency),
            other => Err(Error::Config(format!("unknown edge target `{other}`"))),
        }
    }
}

/// Treatment of clusters whose truth group is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurityPolicy {
    /// Ambiguous edges are scored as negatives.
    #[default]
    Penalize,
    /// Ambiguous edges are left out.
    Exclude,
}

impl PurityPolicy {
    pub fn from_high_purity(high_purity: bool) -> Self {
        if high_purity { PurityPolicy::Exclude } else { PurityPolicy::Penalize }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossReport {
    /// Mean loss over the scored items.
    pub loss: f64,
    /// Fraction of scored items predicted correctly.
    pub accuracy: f64,
    /// Number of scored items.
    pub count: usize,
}

impl LossReport {
    /// Sum of losses; accuracy weighted by count.
    pub fn combine(reports: impl IntoIterator<Item = LossReport>) -> LossReport {
        let mut total = LossReport::default();
        let mut correct = 0.0;
        for r in reports {
            total.loss += r.loss;
            total.count += r.count;
            correct += r.accuracy * r.count as f64;
        }
        total.accuracy = if total.count > 0 { correct / total.count as f64 } else { 0.0 };
        total
    }
}

impl fmt::Display for LossReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loss {:.4}, accuracy {:.3} over {}", self.loss, self.accuracy, self.count)
    }
}

fn log_softmax_at(row: ArrayView1<'_, f32>, target: usize) -> f64 {
    let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)) as f64;
    let sum: f64 = row.iter().map(|&v| (v as f64 - max).exp()).sum();
    row[target] as f64 - max - sum.ln()
}

/// Weighted cross entropy over rows with a target; `weights[class]`
/// scales each row's term.
fn cross_entropy(logits: &Array2<f32>, targets: &[Option<usize>], weights: Option<&[f64]>) -> LossReport {
    let mut loss = 0.0;
    let mut norm = 0.0;
    let mut correct = 0usize;
    let mut count = 0usize;
    for (row, target) in logits.rows().into_iter().zip(targets) {
        let Some(t) = *target else { continue };
        if t >= row.len() {
            continue;
        }
        let w = weights.map_or(1.0, |w| w[t]);
        loss -= w * log_softmax_at(row, t);
        norm += w;
        count += 1;
        if argmax(row) == t {
            correct += 1;
        }
    }
    LossReport {
        loss: if norm > 0.0 { loss / norm } else { 0.0 },
        accuracy: if count > 0 { correct as f64 / count as f64 } else { 0.0 },
        count,
    }
}

/// Binary cross entropy on a single logit column.
fn binary_cross_entropy(logits: &Array2<f32>, targets: &[Option<usize>]) -> LossReport {
    let mut loss = 0.0;
    let mut correct = 0usize;
    let mut count = 0usize;
    for (row, target) in logits.rows().into_iter().zip(targets) {
        let Some(t) = *target else { continue };
        let z = row[0] as f64;
        // log(1 + e^-|z|) + max(z, 0) - z·t
        loss += (-z.abs()).exp().ln_1p() + z.max(0.0) - z * t as f64;
        count += 1;
        if (z > 0.0) == (t == 1) {
            correct += 1;
        }
    }
    LossReport {
        loss: if count > 0 { loss / count as f64 } else { 0.0 },
        accuracy: if count > 0 { correct as f64 / count as f64 } else { 0.0 },
        count,
    }
}

/// Inverse-frequency weights over the classes that occur.
fn balanced_weights(targets: &[Option<usize>], num_classes: usize) -> Vec<f64> {
    let mut counts = vec![0usize; num_classes];
    for t in targets.iter().flatten() {
        if *t < num_classes {
            counts[*t] += 1;
        }
    }
    let total: usize = counts.iter().sum();
    let present = counts.iter().filter(|&&c| c > 0).count();
    counts
        .iter()
        .map(|&c| if c > 0 { total as f64 / (present * c) as f64 } else { 0.0 })
        .collect()
}

// ============================================================================
// Loss traits
// ============================================================================

pub trait NodeLoss: Send + Sync {
    fn name(&self) -> &'static str;

    /// `targets[i]` is the truth class of node `i`, `None` when unknown.
    fn score(&self, logits: &Array2<f32>, targets: &[Option<ClassLabel>]) -> LossReport;
}

/// Truth available to an edge head for one sample.
#[derive(Debug, Clone, Copy)]
pub struct EdgeTruth<'a> {
    /// `nodes[i]` is the truth record of node `i`, `None` when unmatched.
    pub nodes: &'a [Option<&'a NodeRecord>],
    /// Undirected parent/child links as `(min id, max id)`, when an edges
    /// label is wired.
    pub links: Option<&'a HashSet<(i64, i64)>>,
}

impl<'a> EdgeTruth<'a> {
    pub fn new(nodes: &'a [Option<&'a NodeRecord>]) -> Self {
        Self { nodes, links: None }
    }

    pub fn with_links(mut self, links: &'a HashSet<(i64, i64)>) -> Self {
        self.links = Some(links);
        self
    }
}

/// Normalize directed `(parent, child)` pairs into undirected links.
pub fn undirected_links(edges: &[(i64, i64)]) -> HashSet<(i64, i64)> {
    edges.iter().map(|&(a, b)| (a.min(b), a.max(b))).collect()
}

pub trait EdgeLoss: Send + Sync {
    fn name(&self) -> &'static str;

    fn target(&self) -> EdgeTarget;

    fn policy(&self) -> PurityPolicy;

    fn score(&self, logits: &Array2<f32>, graph: &Graph, truth: &EdgeTruth<'_>) -> LossReport;
}

/// Cross entropy on node class logits.
#[derive(Debug, Clone, Default)]
pub struct NodeCrossEntropy {
    pub balance_classes: bool,
}

impl NodeLoss for NodeCrossEntropy {
    fn name(&self) -> &'static str {
        "ce"
    }

    fn score(&self, logits: &Array2<f32>, targets: &[Option<ClassLabel>]) -> LossReport {
        let targets: Vec<Option<usize>> = targets.iter().map(|t| t.map(ClassLabel::index)).collect();
        let weights = self.balance_classes.then(|| balanced_weights(&targets, logits.ncols()));
        cross_entropy(logits, &targets, weights.as_deref())
    }
}

/// Two-channel (or single-logit) edge classification.
#[derive(Debug, Clone, Default)]
pub struct EdgeChannelLoss {
    pub target: EdgeTarget,
    pub policy: PurityPolicy,
    pub balance_classes: bool,
}

impl EdgeChannelLoss {
    /// Label per edge after applying the purity policy; `None` = excluded.
    pub fn labels(&self, graph: &Graph, truth: &EdgeTruth<'_>) -> Vec<Option<usize>> {
        graph
            .edges()
            .iter()
            .map(|&(i, j)| {
                let a = truth.nodes.get(i).copied().flatten();
                let b = truth.nodes.get(j).copied().flatten();
                let (Some(a), Some(b)) = (a, b) else {
                    return self.ambiguous();
                };
                let (Some(ga), Some(gb)) = (a.group_id, b.group_id) else {
                    return self.ambiguous();
                };
                let on = match self.target {
                    EdgeTarget::Group => ga == gb,
                    EdgeTarget::Adjacency => match truth.links {
                        Some(links) => links.contains(&(a.id.min(b.id), a.id.max(b.id))),
                        None => a.parent_id == Some(b.id) || b.parent_id == Some(a.id),
                    },
                };
                Some(on as usize)
            })
            .collect()
    }

    fn ambiguous(&self) -> Option<usize> {
        match self.policy {
            PurityPolicy::Exclude => None,
            PurityPolicy::Penalize => Some(0),
        }
    }
}

impl EdgeLoss for EdgeChannelLoss {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn target(&self) -> EdgeTarget {
        self.target
    }

    fn policy(&self) -> PurityPolicy {
        self.policy
    }

    fn score(&self, logits: &Array2<f32>, graph: &Graph, truth: &EdgeTruth<'_>) -> LossReport {
        let labels = self.labels(graph, truth);
        if logits.ncols() == 1 {
            return binary_cross_entropy(logits, &labels);
        }
        let weights = self.balance_classes.then(|| balanced_weights(&labels, logits.ncols()));
        cross_entropy(logits, &labels, weights.as_deref())
    }
}

fn build_ce(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn NodeLoss>> {
    Ok(Box::new(NodeCrossEntropy { balance_classes: params.bool_or("balance_classes", false) }))
}

fn build_channel(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn EdgeLoss>> {
    Ok(Box::new(EdgeChannelLoss {
        target: EdgeTarget::parse(params.str_or("target", "group"))?,
        policy: PurityPolicy::from_high_purity(params.bool_or("high_purity", false)),
        balance_classes: params.bool_or("balance_classes", false),
    }))
}

pub fn register_node_losses(reg: &mut Registry<dyn NodeLoss>) {
    let schema = Schema::closed().optional("balance_classes", Kind::Bool);
    reg.register("ce", schema, build_ce).alias("type", "ce");
}

pub fn register_edge_losses(reg: &mut Registry<dyn EdgeLoss>) {
    let schema = Schema::closed()
        .optional("target", Kind::OneOf(EdgeTarget::NAMES))
        .optional("high_purity", Kind::Bool)
        .optional("balance_classes", Kind::Bool);
    reg.register("channel", schema, build_channel).alias("edge_channel", "channel");
}

// ============================================================================
// LossAssembly
// ============================================================================

/// Per-head and combined reports for one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossOutput {
    pub node: Option<LossReport>,
    pub edge: Option<LossReport>,
    pub total: LossReport,
}

pub fn module_schema() -> Schema {
    let component = || Kind::Map(Schema::open().required("name", Kind::Str));
    Schema::closed()
        .nullable("node_loss", component())
        .nullable("edge_loss", component())
}

/// Node and edge loss heads bound to a truth label and, optionally, an
/// edges label.
pub struct LossAssembly {
    node: Option<Box<dyn NodeLoss>>,
    edge: Option<Box<dyn EdgeLoss>>,
    truth: Option<String>,
    links: Option<String>,
}

impl LossAssembly {
    /// Phase one: build the configured heads.
    pub fn build(config: &ConfigNode, registry: &ComponentRegistry, ctx: &BuildContext) -> Result<Self> {
        config.validate(&module_schema())?;
        let node = match config.field("node_loss") {
            Some(spec) => Some(registry.node_losses.build(&ComponentSpec::from_node(spec, "name", "node_loss")?, ctx)?),
            None => None,
        };
        let edge = match config.field("edge_loss") {
            Some(spec) => Some(registry.edge_losses.build(&ComponentSpec::from_node(spec, "name", "edge_loss")?, ctx)?),
            None => None,
        };
        if node.is_none() && edge.is_none() {
            return Err(Error::Config("loss module configures neither node_loss nor edge_loss".into()));
        }
        Ok(Self { node, edge, truth: None, links: None })
    }

    /// Phase two: bind the truth clusters label.
    pub fn wire(&mut self, truth: &str) {
        self.truth = Some(truth.to_string());
    }

    /// Bind the edges label the adjacency target reads.
    pub fn wire_links(&mut self, label: &str) {
        self.links = Some(label.to_string());
    }

    pub fn truth(&self) -> Option<&str> {
        self.truth.as_deref()
    }

    pub fn links(&self) -> Option<&str> {
        self.links.as_deref()
    }

    pub fn edge_head(&self) -> Option<&dyn EdgeLoss> {
        self.edge.as_deref()
    }

    pub fn score(&self, out: &GraphOutput, sample: &Sample) -> Result<LossOutput> {
        let label = self
            .truth
            .as_deref()
            .ok_or_else(|| Error::Config("loss assembly used before wiring".into()))?;
        let truth_nodes = sample.nodes(label).ok_or_else(|| Error::SampleParse {
            index: sample.index(),
            message: format!("no truth clusters under `{label}`"),
        })?;
        let by_id: HashMap<i64, &NodeRecord> = truth_nodes.iter().map(|n| (n.id, n)).collect();
        let truth: Vec<Option<&NodeRecord>> = out.node_ids.iter().map(|id| by_id.get(id).copied()).collect();

        let node = self.node.as_ref().map(|head| {
            let targets: Vec<Option<ClassLabel>> = truth.iter().map(|t| t.map(|n| n.class_label)).collect();
            head.score(&out.node_pred, &targets)
        });
        let links = match self.links.as_deref() {
            Some(label) => match sample.product(label) {
                Some(Product::Edges(edges)) => Some(undirected_links(edges)),
                _ => {
                    return Err(Error::SampleParse {
                        index: sample.index(),
                        message: format!("no truth edges under `{label}`"),
                    })
                }
            },
            None => None,
        };
        let edge = self.edge.as_ref().map(|head| {
            let view = EdgeTruth::new(&truth);
            let view = match &links {
                Some(links) => view.with_links(links),
                None => view,
            };
            head.score(&out.edge_pred, &out.graph, &view)
        });
        let total = LossReport::combine(node.into_iter().chain(edge));
        Ok(LossOutput { node, edge, total })
    }
}
