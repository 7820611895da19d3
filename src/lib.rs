//! # grappa-rs: Declarative GNN Pipelines over Clustered Point Clouds
//!
//! Assembles a graph-neural-network pipeline for particle-detector events
//! from one configuration tree: dataset parsers → graph construction →
//! node/edge feature encoders → GNN layer → losses.
//!
//! ## Design Principles
//!
//! 1. **Config is data**: `ConfigNode` is a plain tree with a pure `merge`
//! 2. **Names resolve once**: every `name:` is looked up in a
//!    `ComponentRegistry` at build time, never at a call site
//! 3. **Two-phase build**: construct every component, then wire the
//!    named references (`network_input`, `loss_input`) and check widths
//! 4. **Flat graphs**: a `Graph` is an index-pair array, built per sample
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use grappa::{ConfigNode, Pipeline};
//!
//! # async fn example() -> grappa::Result<()> {
//! let config = ConfigNode::load("config/train_grappa_shower.yaml")?;
//! let pipeline = Pipeline::from_config(&config)?;
//!
//! let mut loader = pipeline.loader();
//! while let Some(batch) = loader.next_batch().await? {
//!     for sample in &batch.samples {
//!         let out = pipeline.model.forward(sample)?;
//!         let loss = pipeline.loss.score(&out, sample)?;
//!         println!("{} edges, loss {:.3}", out.graph.num_edges(), loss.total.loss);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Registry Domains
//!
//! | Domain | Built-in names |
//! |--------|----------------|
//! | parser | `sparse3d`, `cluster3d`, `particle`, `particle_points`, `particle_graph`, `meta`, `run_info` |
//! | sampler | `random_sequence`, `sequential` |
//! | collate | `list`, `sparse` |
//! | dataset | `jsonl`, `memory` |
//! | graph | `complete`, `knn`, `mst` |
//! | node_encoder / edge_encoder | `geo`, `mix` |
//! | gnn_layer | `meta` |
//! | loss | `ce`, `channel` |

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod registry;
pub mod model;
pub mod graph;
pub mod encode;
pub mod gnn;
pub mod loss;
pub mod io;
pub mod pipeline;
pub mod train;

// ============================================================================
// Re-exports: Config + Registry
// ============================================================================

pub use config::{ConfigNode, Schema, Kind, Violation, merge, merge_all};
pub use registry::{ComponentRegistry, ComponentSpec, Domain, Registry};

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    ClassLabel, ClassSet, Graph, NodeRecord, Point3, Product, Provenance, Sample,
};

// ============================================================================
// Re-exports: Stages
// ============================================================================

pub use graph::{DistanceAlgorithm, DistanceLimit, DistanceLimitMatrix, GraphBuilder, GraphConfig};
pub use encode::{EdgeEncoder, FeatureEncoderPipeline, NodeEncoder};
pub use gnn::{GnnAssembly, GnnLayer, GraphOutput};
pub use loss::{EdgeTarget, LossAssembly, LossReport, PurityPolicy};
pub use io::{Batch, DataSource, Loader, LoaderStats};
pub use pipeline::Pipeline;
pub use train::{CancelToken, TrainingDriver, TrainReport};

// ============================================================================
// Error Types
// ============================================================================

use config::schema::join_violations;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Missing config key: {path}")]
    MissingKey { path: String },

    #[error("Config schema violated ({} problem(s)): {}", .violations.len(), join_violations(.violations))]
    Schema { violations: Vec<Violation> },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown {domain} component `{name}` (known: {})", .known.join(", "))]
    UnknownComponent { domain: Domain, name: String, known: Vec<String> },

    #[error("Invalid params for {domain} `{name}`: {}", join_violations(.violations))]
    InvalidParams { domain: Domain, name: String, violations: Vec<Violation> },

    #[error("Graph config error: {0}")]
    GraphConfig(String),

    #[error("{kind} feature width mismatch: declared {declared}, encoders produce {computed}")]
    FeatureWidthMismatch { kind: &'static str, declared: usize, computed: usize },

    #[error("Sample {index} could not be parsed: {message}")]
    SampleParse { index: usize, message: String },

    #[error("No data: {0}")]
    NoData(String),

    #[error("Training error: {0}")]
    Train(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that end one sample or one draw, not the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SampleParse { .. } | Error::NoData(_))
    }

    /// Errors that a pipeline build reports before any data is loaded.
    pub fn is_build_time(&self) -> bool {
        matches!(
            self,
            Error::MissingKey { .. }
                | Error::Schema { .. }
                | Error::Config(_)
                | Error::UnknownComponent { .. }
                | Error::InvalidParams { .. }
                | Error::GraphConfig(_)
                | Error::FeatureWidthMismatch { .. }
                | Error::Yaml(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
