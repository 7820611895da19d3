//! # Component Registry
//!
//! Maps the `name:` of a configuration block to a factory function and the
//! parameter schema that factory expects. One typed [`Registry`] exists per
//! domain; [`ComponentRegistry`] bundles them.
//!
//! ```text
//! model.modules.grappa.graph:          Registry<dyn GraphBuilder>
//!   name: complete          ──lookup──▶  "complete" → (schema, factory)
//!   max_length: [...]       ──check───▶  schema.check(params)
//!   dist_algorithm: recursive ─build──▶  factory(params, ctx) → Box<dyn GraphBuilder>
//! ```
//!
//! Building is synchronous and never touches another domain's registry.
//! Cross-domain references (`network_input`, `loss_input`) are wired by the
//! pipeline in a second pass, once every component exists.

use std::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigNode, Schema};
use crate::encode::{EdgeEncoder, NodeEncoder};
use crate::gnn::GnnLayer;
use crate::graph::GraphBuilder;
use crate::io::{Collate, DataSource, Parser, Sampler};
use crate::loss::{EdgeLoss, NodeLoss};
use crate::model::ClassSet;
use crate::train::Optimizer;
use crate::{Error, Result};

// ============================================================================
// Domain
// ============================================================================

/// Namespace a component name is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Parser,
    Sampler,
    Collate,
    Dataset,
    Graph,
    NodeEncoder,
    EdgeEncoder,
    GnnLayer,
    Loss,
    Optimizer,
}

impl Domain {
    pub const ALL: [Domain; 10] = [
        Domain::Parser,
        Domain::Sampler,
        Domain::Collate,
        Domain::Dataset,
        Domain::Graph,
        Domain::NodeEncoder,
        Domain::EdgeEncoder,
        Domain::GnnLayer,
        Domain::Loss,
        Domain::Optimizer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Parser => "parser",
            Domain::Sampler => "sampler",
            Domain::Collate => "collate",
            Domain::Dataset => "dataset",
            Domain::Graph => "graph",
            Domain::NodeEncoder => "node_encoder",
            Domain::EdgeEncoder => "edge_encoder",
            Domain::GnnLayer => "gnn_layer",
            Domain::Loss => "loss",
            Domain::Optimizer => "optimizer",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ComponentSpec
// ============================================================================

/// The unit a registry resolves: a name plus everything else in the block.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    pub name: String,
    pub params: ConfigNode,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, params: ConfigNode) -> Self {
        Self { name: name.into(), params }
    }

    /// Split a config block into `name` and params. `name_key` is usually
    /// `"name"`; parsers use `"parser"`.
    ///
    /// A bare string is accepted as a name with no params.
    pub fn from_node(node: &ConfigNode, name_key: &str, path: &str) -> Result<Self> {
        match node {
            ConfigNode::String(name) => Ok(Self::new(name.clone(), ConfigNode::map())),
            ConfigNode::Map(map) => {
                let name = map
                    .get(name_key)
                    .and_then(ConfigNode::as_str)
                    .ok_or_else(|| Error::Config(format!("`{path}.{name_key}` must be a component name")))?;
                let params = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != name_key)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(Self::new(name, ConfigNode::Map(params)))
            }
            other => Err(Error::Config(format!(
                "`{path}` must be a component block, got {}",
                other.type_name()
            ))),
        }
    }
}

// ============================================================================
// BuildContext
// ============================================================================

/// Read-only facts every factory may consult. Not a registry: factories
/// cannot build other components through it.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub classes: ClassSet,
    /// Global seed (`base.seed`), used when a component has none of its own.
    pub seed: Option<u64>,
}

/// Builds one component from validated params.
pub type Factory<T> = fn(&ConfigNode, &BuildContext) -> Result<Box<T>>;

struct Entry<T: ?Sized> {
    schema: Schema,
    factory: Factory<T>,
}

// ============================================================================
// Registry<T>
// ============================================================================

/// Name → factory table for one domain.
pub struct Registry<T: ?Sized> {
    domain: Domain,
    entries: HashMap<String, Entry<T>>,
    aliases: HashMap<String, String>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(domain: Domain) -> Self {
        Self { domain, entries: HashMap::new(), aliases: HashMap::new() }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Register (or replace) a component.
    pub fn register(&mut self, name: &str, schema: Schema, factory: Factory<T>) -> &mut Self {
        self.entries.insert(name.to_string(), Entry { schema, factory });
        self
    }

    /// Make `alias` resolve to the registered `target`.
    pub fn alias(&mut self, alias: &str, target: &str) -> &mut Self {
        self.aliases.insert(alias.to_string(), target.to_string());
        self
    }

    fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(self.canonical(name))
    }

    /// Registered names (aliases excluded), sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.entries.get(self.canonical(name)).map(|e| &e.schema)
    }

    fn entry(&self, spec: &ComponentSpec) -> Result<&Entry<T>> {
        self.entries
            .get(self.canonical(&spec.name))
            .ok_or_else(|| Error::UnknownComponent {
                domain: self.domain,
                name: spec.name.clone(),
                known: self.names(),
            })
    }

    /// Resolve the name and check params without constructing anything.
    pub fn check(&self, spec: &ComponentSpec) -> Result<()> {
        let entry = self.entry(spec)?;
        let violations = entry.schema.check(&spec.params, "");
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidParams {
                domain: self.domain,
                name: spec.name.clone(),
                violations,
            })
        }
    }

    /// Resolve, validate and construct.
    pub fn build(&self, spec: &ComponentSpec, ctx: &BuildContext) -> Result<Box<T>> {
        self.check(spec)?;
        let entry = self.entry(spec)?;
        tracing::debug!(domain = %self.domain, name = %spec.name, "building component");
        (entry.factory)(&spec.params, ctx)
    }
}

// ============================================================================
// ComponentRegistry
// ============================================================================

/// Every domain's registry.
pub struct ComponentRegistry {
    pub parsers: Registry<dyn Parser>,
    pub samplers: Registry<dyn Sampler>,
    pub collates: Registry<dyn Collate>,
    pub datasets: Registry<dyn DataSource>,
    pub graphs: Registry<dyn GraphBuilder>,
    pub node_encoders: Registry<dyn NodeEncoder>,
    pub edge_encoders: Registry<dyn EdgeEncoder>,
    pub gnn_layers: Registry<dyn GnnLayer>,
    pub node_losses: Registry<dyn NodeLoss>,
    pub edge_losses: Registry<dyn EdgeLoss>,
    pub optimizers: Registry<dyn Optimizer>,
}

impl ComponentRegistry {
    /// Registries with nothing registered.
    pub fn empty() -> Self {
        Self {
            parsers: Registry::new(Domain::Parser),
            samplers: Registry::new(Domain::Sampler),
            collates: Registry::new(Domain::Collate),
            datasets: Registry::new(Domain::Dataset),
            graphs: Registry::new(Domain::Graph),
            node_encoders: Registry::new(Domain::NodeEncoder),
            edge_encoders: Registry::new(Domain::EdgeEncoder),
            gnn_layers: Registry::new(Domain::GnnLayer),
            node_losses: Registry::new(Domain::Loss),
            edge_losses: Registry::new(Domain::Loss),
            optimizers: Registry::new(Domain::Optimizer),
        }
    }

    /// Registries with every built-in component.
    pub fn with_defaults() -> Self {
        let mut reg = Self::empty();
        crate::io::parse::register_defaults(&mut reg.parsers);
        crate::io::sampler::register_defaults(&mut reg.samplers);
        crate::io::collate::register_defaults(&mut reg.collates);
        crate::io::register_datasets(&mut reg.datasets);
        crate::graph::register_defaults(&mut reg.graphs);
        crate::encode::register_node_encoders(&mut reg.node_encoders);
        crate::encode::register_edge_encoders(&mut reg.edge_encoders);
        crate::gnn::register_defaults(&mut reg.gnn_layers);
        crate::loss::register_node_losses(&mut reg.node_losses);
        crate::loss::register_edge_losses(&mut reg.edge_losses);
        crate::train::register_optimizers(&mut reg.optimizers);
        reg
    }

    /// Registered names of a domain (both loss heads for `Loss`).
    pub fn names(&self, domain: Domain) -> Vec<String> {
        match domain {
            Domain::Parser => self.parsers.names(),
            Domain::Sampler => self.samplers.names(),
            Domain::Collate => self.collates.names(),
            Domain::Dataset => self.datasets.names(),
            Domain::Graph => self.graphs.names(),
            Domain::NodeEncoder => self.node_encoders.names(),
            Domain::EdgeEncoder => self.edge_encoders.names(),
            Domain::GnnLayer => self.gnn_layers.names(),
            Domain::Loss => {
                let mut names = self.node_losses.names();
                names.extend(self.edge_losses.names());
                names
            }
            Domain::Optimizer => self.optimizers.names(),
        }
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
