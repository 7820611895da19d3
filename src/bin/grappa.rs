//! `grappa` command line.
//!
//! ```bash
//! # Build the pipeline and report what was assembled
//! grappa check config/train_grappa_shower.yaml
//!
//! # Layer override documents on top of the base config
//! grappa check config/train_grappa_shower.yaml -o config/override_discover.yaml
//!
//! # Train, writing one JSON line per processed event
//! grappa train config/train_grappa_shower.yaml --iterations 20 --events out.jsonl
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use grappa::io::writer::Collision;
use grappa::io::Writer;
use grappa::{merge_all, CancelToken, ConfigNode, Domain, Pipeline, TrainingDriver};

#[derive(Parser)]
#[command(name = "grappa")]
#[command(about = "Declarative GNN pipelines over clustered point clouds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the pipeline from a config and report it, without loading data
    Check {
        /// Base configuration file (YAML or JSON)
        config: PathBuf,

        /// Override documents, merged over the base in order
        #[arg(short = 'o', long = "override")]
        overrides: Vec<PathBuf>,

        /// Also print the merged configuration
        #[arg(long)]
        dump: bool,
    },

    /// Run the training loop
    Train {
        config: PathBuf,

        #[arg(short = 'o', long = "override")]
        overrides: Vec<PathBuf>,

        /// Override `base.iterations`
        #[arg(long)]
        iterations: Option<u64>,

        /// Write one JSON line per processed event to this file
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// List every registered component name per domain
    Components,
}

fn load(config: &PathBuf, overrides: &[PathBuf]) -> grappa::Result<ConfigNode> {
    let mut layers = vec![ConfigNode::load(config)?];
    for path in overrides {
        layers.push(ConfigNode::load(path)?);
    }
    Ok(merge_all(layers.iter()))
}

fn check(config: &PathBuf, overrides: &[PathBuf], dump: bool) -> grappa::Result<()> {
    let tree = load(config, overrides)?;
    if dump {
        println!("{}", tree.to_yaml_string()?);
    }
    let pipeline = Pipeline::from_config(&tree)?;
    let encoders = pipeline.model.encoders();
    println!("dataset labels : {}", pipeline.dataset().labels().collect::<Vec<_>>().join(", "));
    println!("classes        : {}", pipeline.classes().names().join(", "));
    println!("graph          : {}", pipeline.model.graph_builder().name());
    println!("node features  : {} {:?}", encoders.node_width(), encoders.node_encoder().layout());
    println!("edge features  : {} {:?}", encoders.edge_width(), encoders.edge_encoder().layout());
    println!(
        "gnn            : {} ({} parameters)",
        pipeline.model.layer().name(),
        pipeline.model.layer().num_parameters()
    );
    println!("iterations     : {}", pipeline.train.iterations);
    Ok(())
}

async fn train(
    config: &PathBuf,
    overrides: &[PathBuf],
    iterations: Option<u64>,
    events: Option<PathBuf>,
) -> grappa::Result<()> {
    let tree = load(config, overrides)?;
    let mut pipeline = Pipeline::from_config(&tree)?;
    if let Some(n) = iterations {
        pipeline.train.iterations = n;
    }
    let writer = match events {
        Some(path) => Some(Writer::open(path, Collision::Overwrite)?),
        None => pipeline.open_writer()?,
    };

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current batch");
            on_signal.cancel();
        }
    });

    let mut driver = TrainingDriver::new(&mut pipeline).with_cancel(cancel);
    if let Some(writer) = writer {
        driver = driver.with_writer(writer);
    }
    let report = driver.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn components() {
    let registry = grappa::ComponentRegistry::with_defaults();
    for domain in Domain::ALL {
        println!("{:<13} {}", domain.as_str(), registry.names(domain).join(", "));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Check { config, overrides, dump } => check(config, overrides, *dump),
        Commands::Train { config, overrides, iterations, events } => {
            train(config, overrides, *iterations, events.clone()).await
        }
        Commands::Components => {
            components();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(build_time = e.is_build_time(), "{e}");
            ExitCode::FAILURE
        }
    }
}
