//! # Pipeline
//!
//! Top-level build from one merged configuration tree.
//!
//! ```text
//! validate(root schema)                       ── Schema { every violation }
//! phase 1: build                              ── UnknownComponent / InvalidParams / GraphConfig
//!   io.loader.dataset   → DatasetPipeline (source + schema parsers)
//!   io.loader.sampler   → Sampler
//!   io.loader.collate_fn→ Collate
//!   model.modules.grappa      → GnnAssembly (graph, encoders, layer)
//!   model.modules.grappa_loss → LossAssembly
//!   base.train.optimizer      → Optimizer (default `noop`)
//! phase 2: wire                               ── Config / FeatureWidthMismatch
//!   model.network_input → dataset label holding clusters
//!   model.loss_input    → dataset label holding clusters
//!                         [, label holding edges for the adjacency target]
//!   encoder widths == gnn_model.{node_feats, edge_feats}
//!   model.weight_path   → layer weights (null: from scratch)
//! ```
//!
//! Nothing here reads event data: every build-time error surfaces before
//! the first batch is drawn.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ConfigNode, Kind, Schema};
use crate::gnn::{GnnAssembly, GraphOutput};
use crate::io::{Collate, DatasetPipeline, Loader, Sampler, Writer};
use crate::loss::{LossAssembly, LossOutput};
use crate::model::{ClassSet, ProductKind, Sample};
use crate::registry::{BuildContext, ComponentRegistry, ComponentSpec};
use crate::train::{Optimizer, TrainSettings};
use crate::{Error, Result};

pub const GNN_MODULE: &str = "grappa";
pub const LOSS_MODULE: &str = "grappa_loss";

fn component() -> Kind {
    Kind::Either(vec![Kind::Str, Kind::Map(Schema::open().required("name", Kind::Str))])
}

fn labels() -> Kind {
    Kind::Either(vec![Kind::Str, Kind::list_of(Kind::Str)])
}

/// Shape of the whole tree. Component blocks are only checked for a
/// `name`; their params are checked by their registry.
pub fn root_schema() -> Schema {
    let train = Schema::open()
        .nullable("weight_prefix", Kind::Str)
        .optional("save_step", Kind::int_min(0))
        .nullable("optimizer", component());
    let base = Schema::open()
        .nullable("seed", Kind::int_min(0))
        .optional("iterations", Kind::int_min(0))
        .optional("classes", Kind::list_of(Kind::Str))
        .nullable("train", Kind::Map(train));
    let loader = Schema::open()
        .required("batch_size", Kind::int_min(1))
        .optional("num_workers", Kind::int_min(0))
        .optional("shuffle", Kind::Bool)
        .nullable("sampler", component())
        .nullable("collate_fn", component())
        .required("dataset", Kind::Map(Schema::open().required("name", Kind::Str)));
    let io = Schema::open()
        .required("loader", Kind::Map(loader))
        .nullable("writer", Kind::Map(crate::io::writer::schema()));
    let modules = Schema::open()
        .required(GNN_MODULE, Kind::Map(Schema::open()))
        .required(LOSS_MODULE, Kind::Map(Schema::open()));
    let model = Schema::open()
        .optional("name", Kind::Str)
        .nullable("weight_path", Kind::Str)
        .required("network_input", labels())
        .required("loss_input", labels())
        .required("modules", Kind::Map(modules));
    Schema::open()
        .nullable("base", Kind::Map(base))
        .required("io", Kind::Map(io))
        .required("model", Kind::Map(model))
}

/// Every built component, wired and ready to draw batches.
pub struct Pipeline {
    config: ConfigNode,
    context: BuildContext,
    dataset: Arc<DatasetPipeline>,
    sampler: Arc<dyn Sampler>,
    collate: Arc<dyn Collate>,
    batch_size: usize,
    num_workers: usize,
    pub model: GnnAssembly,
    pub loss: LossAssembly,
    pub train: TrainSettings,
    pub optimizer: Box<dyn Optimizer>,
}

impl Pipeline {
    /// Build with every built-in component.
    pub fn from_config(config: &ConfigNode) -> Result<Self> {
        Self::from_config_with(config, &ComponentRegistry::with_defaults())
    }

    /// Build against a caller-extended registry.
    pub fn from_config_with(config: &ConfigNode, registry: &ComponentRegistry) -> Result<Self> {
        config.validate(&root_schema())?;
        let context = build_context(config)?;

        // Phase 1
        let loader = config.resolve("io.loader")?;
        let dataset = DatasetPipeline::from_config(loader.resolve("dataset")?, registry, &context)?;
        let sampler = registry.samplers.build(&sampler_spec(loader)?, &context)?;
        let collate = registry.collates.build(&collate_spec(loader)?, &context)?;
        let modules = config.resolve("model.modules")?;
        let mut model = GnnAssembly::build(modules.resolve(GNN_MODULE)?, registry, &context)?;
        let mut loss = LossAssembly::build(modules.resolve(LOSS_MODULE)?, registry, &context)?;
        let train = TrainSettings::from_config(config)?;
        let optimizer = registry.optimizers.build(&train.optimizer_spec(), &context)?;

        // Phase 2
        let input = wire_labels(&dataset, config, "model.network_input")?.remove(0);
        model.wire(&input)?;
        let mut truth = wire_labels(&dataset, config, "model.loss_input")?;
        let links = truth.split_off(1);
        let truth = truth.remove(0);
        loss.wire(&truth);
        match links.as_slice() {
            [] => {}
            [label] if dataset.output(label) == Some(ProductKind::Edges) => loss.wire_links(label),
            extra => {
                return Err(Error::Config(format!(
                    "`model.loss_input` may follow `{truth}` with one edges label only; nothing consumes [{}]",
                    extra.join(", ")
                )))
            }
        }
        if let Some(path) = config.get("model.weight_path").and_then(ConfigNode::as_str) {
            model.load_weights(&PathBuf::from(path))?;
        }

        tracing::info!(
            input = %input,
            truth = %truth,
            links = loss.links().unwrap_or("-"),
            labels = dataset.labels().count(),
            sampler = sampler.name(),
            collate = collate.name(),
            graph = model.graph_builder().name(),
            gnn = model.layer().name(),
            optimizer = optimizer.name(),
            parameters = model.layer().num_parameters(),
            "pipeline built"
        );

        Ok(Self {
            config: config.clone(),
            context,
            dataset: Arc::new(dataset),
            sampler: Arc::from(sampler),
            collate: Arc::from(collate),
            batch_size: loader.int_or("batch_size", 1) as usize,
            num_workers: loader.int_or("num_workers", 0) as usize,
            model,
            loss,
            train,
            optimizer,
        })
    }

    pub fn config(&self) -> &ConfigNode {
        &self.config
    }

    pub fn context(&self) -> &BuildContext {
        &self.context
    }

    pub fn classes(&self) -> &ClassSet {
        &self.context.classes
    }

    pub fn dataset(&self) -> &DatasetPipeline {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// A fresh loader at epoch 0. Loaders share the dataset and stages.
    pub fn loader(&self) -> Loader {
        Loader::new(
            Arc::clone(&self.dataset),
            Arc::clone(&self.sampler),
            Arc::clone(&self.collate),
            self.batch_size,
            self.num_workers,
        )
    }

    /// Open the `io.writer` target, if one is configured.
    pub fn open_writer(&self) -> Result<Option<Writer>> {
        match self.config.get("io.writer").filter(|w| !w.is_unset()) {
            Some(node) => Writer::from_config(node).map(Some),
            None => Ok(None),
        }
    }

    /// Forward one sample and score it.
    pub fn evaluate(&self, sample: &Sample) -> Result<(GraphOutput, LossOutput)> {
        let out = self.model.forward(sample)?;
        let loss = self.loss.score(&out, sample)?;
        Ok((out, loss))
    }
}

fn build_context(config: &ConfigNode) -> Result<BuildContext> {
    let classes = match config.get("base.classes").and_then(ConfigNode::as_list) {
        Some(names) => {
            let names: Vec<&str> = names.iter().filter_map(ConfigNode::as_str).collect();
            if names.is_empty() {
                return Err(Error::Config("`base.classes` must name at least one class".into()));
            }
            ClassSet::new(names)
        }
        None => ClassSet::default(),
    };
    let seed = config.get("base.seed").and_then(ConfigNode::as_int).map(|s| s as u64);
    Ok(BuildContext { classes, seed })
}

/// `io.loader.sampler`, defaulting from `shuffle` when absent.
fn sampler_spec(loader: &ConfigNode) -> Result<ComponentSpec> {
    match loader.field("sampler") {
        Some(node) => ComponentSpec::from_node(node, "name", "io.loader.sampler"),
        None if loader.bool_or("shuffle", false) => Ok(ComponentSpec::new("random_sequence", ConfigNode::map())),
        None => Ok(ComponentSpec::new("sequential", ConfigNode::map())),
    }
}

fn collate_spec(loader: &ConfigNode) -> Result<ComponentSpec> {
    match loader.field("collate_fn") {
        Some(node) => ComponentSpec::from_node(node, "name", "io.loader.collate_fn"),
        None => Ok(ComponentSpec::new("list", ConfigNode::map())),
    }
}

/// Labels of a reference list, checked against the dataset schema. Every
/// listed label must be declared; the first must hold clusters. The result
/// is never empty.
fn wire_labels(dataset: &DatasetPipeline, config: &ConfigNode, key: &str) -> Result<Vec<String>> {
    let labels = match config.get(key) {
        Some(ConfigNode::String(label)) => vec![label.clone()],
        Some(ConfigNode::List(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    };
    let first = labels
        .first()
        .cloned()
        .ok_or_else(|| Error::Config(format!("`{key}` names no dataset label")))?;
    for label in &labels {
        if dataset.output(label).is_none() {
            return Err(Error::Config(format!(
                "`{key}` references `{label}`, which the dataset schema does not declare (declared: {})",
                dataset.labels().collect::<Vec<_>>().join(", ")
            )));
        }
    }
    match dataset.output(&first) {
        Some(ProductKind::Clusters) => Ok(labels),
        Some(kind) => Err(Error::Config(format!(
            "`{key}` must start with a clusters label; `{first}` holds {kind}"
        ))),
        None => Err(Error::Config(format!("`{key}` references an undeclared label"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
base: {seed: 1}
io:
  loader:
    batch_size: 1
    dataset:
      name: memory
      events: []
      schema:
        clust_label: {parser: cluster3d, cluster_event: c}
        meta: {parser: meta, cluster_event: c}
        graph_label: {parser: particle_graph, particle_event: p}
model:
  network_input: [clust_label]
  loss_input: clust_label
  modules:
    grappa:
      graph: {name: complete}
      node_encoder: {name: geo}
      edge_encoder: {name: geo}
      gnn_model: {name: meta, node_feats: 16, edge_feats: 19}
    grappa_loss:
      edge_loss: {name: channel}
"#;

    fn config(yaml: &str) -> ConfigNode {
        ConfigNode::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_when_sampler_and_collate_absent() {
        let p = Pipeline::from_config(&config(CONFIG)).unwrap();
        assert_eq!(p.sampler.name(), "sequential");
        assert_eq!(p.collate.name(), "list");
        assert_eq!(p.model.input(), Some("clust_label"));
        assert_eq!(p.loss.truth(), Some("clust_label"));
        assert_eq!(p.classes().len(), 5);
    }

    #[test]
    fn test_input_must_be_declared() {
        let cfg = config(&CONFIG.replace("network_input: [clust_label]", "network_input: [input_data]"));
        match Pipeline::from_config(&cfg) {
            Err(Error::Config(msg)) => assert!(msg.contains("input_data"), "{msg}"),
            Err(other) => panic!("unexpected {other}"),
            Ok(_) => panic!("undeclared label accepted"),
        }
    }

    #[test]
    fn test_input_must_hold_clusters() {
        let cfg = config(&CONFIG.replace("loss_input: clust_label", "loss_input: [meta]"));
        assert!(matches!(Pipeline::from_config(&cfg), Err(Error::Config(_))));
    }

    #[test]
    fn test_edges_label_binds_to_the_loss() {
        let cfg = config(&CONFIG.replace("loss_input: clust_label", "loss_input: [clust_label, graph_label]"));
        let p = Pipeline::from_config(&cfg).unwrap();
        assert_eq!(p.loss.truth(), Some("clust_label"));
        assert_eq!(p.loss.links(), Some("graph_label"));
    }

    #[test]
    fn test_unconsumed_loss_input_rejected() {
        let cfg = config(&CONFIG.replace("loss_input: clust_label", "loss_input: [clust_label, meta]"));
        match Pipeline::from_config(&cfg) {
            Err(Error::Config(msg)) => assert!(msg.contains("meta"), "{msg}"),
            Err(other) => panic!("unexpected {other}"),
            Ok(_) => panic!("unconsumed label accepted"),
        }
    }

    #[test]
    fn test_unknown_optimizer_fails_at_build() {
        let cfg = config(&CONFIG.replace("base: {seed: 1}", "base: {seed: 1, train: {optimizer: {name: adam}}}"));
        match Pipeline::from_config(&cfg) {
            Err(Error::UnknownComponent { domain, name, .. }) => {
                assert_eq!(domain, crate::registry::Domain::Optimizer);
                assert_eq!(name, "adam");
            }
            Err(other) => panic!("unexpected {other}"),
            Ok(_) => panic!("unknown optimizer accepted"),
        }
    }

    #[test]
    fn test_root_schema_reports_every_problem() {
        let cfg = config("io: {loader: {batch_size: 0}}\nmodel: {}");
        match Pipeline::from_config(&cfg) {
            Err(Error::Schema { violations }) => assert!(violations.len() >= 4, "{violations:?}"),
            Err(other) => panic!("unexpected {other}"),
            Ok(_) => panic!("invalid config accepted"),
        }
    }

    #[test]
    fn test_empty_class_list_rejected() {
        let cfg = config(&CONFIG.replace("base: {seed: 1}", "base: {classes: []}"));
        assert!(matches!(Pipeline::from_config(&cfg), Err(Error::Config(_))));
    }
}
