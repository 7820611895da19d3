//! # Training Driver
//!
//! Draws batches, runs every sample through the model and losses in
//! parallel, steps the optimizer, and checkpoints every `save_step`
//! iterations.
//!
//! ```text
//! loop until `iterations` batches are done:
//!   cancelled?            → stop (checked between batches only)
//!   loader.next_batch()
//!     Ok(None)            → epoch over, continue with the next one
//!     Err(NoData)         → stop cleanly, report
//!     Ok(Some(batch))     → rayon: forward + score each sample
//!                         → optimizer.step(mean loss)
//!                         → iteration % save_step == 0 → checkpoint
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigNode, Schema};
use crate::gnn::{GnnLayer, GraphOutput};
use crate::io::{EventRecord, LoaderStats, Writer};
use crate::loss::{LossOutput, LossReport};
use crate::model::Sample;
use crate::pipeline::Pipeline;
use crate::registry::{BuildContext, ComponentSpec, Registry};
use crate::{Error, Result};

// ============================================================================
// Settings
// ============================================================================

/// `base.iterations` and `base.train`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSettings {
    pub iterations: u64,
    /// Checkpoints go to `{weight_prefix}-{iteration}.ckpt`. `None`
    /// disables checkpointing.
    pub weight_prefix: Option<PathBuf>,
    /// `0` disables checkpointing.
    pub save_step: u64,
    /// `base.train.optimizer`, resolved in the optimizer registry.
    pub optimizer: String,
    #[serde(skip)]
    optimizer_params: ConfigNode,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            iterations: 0,
            weight_prefix: None,
            save_step: 0,
            optimizer: "noop".into(),
            optimizer_params: ConfigNode::map(),
        }
    }
}

impl TrainSettings {
    /// Read from the root of a configuration tree.
    pub fn from_config(root: &ConfigNode) -> Result<Self> {
        let base = root.get("base").filter(|b| !b.is_unset());
        let Some(base) = base else {
            return Ok(Self::default());
        };
        let train = base.field("train");
        let optimizer = match train.and_then(|t| t.field("optimizer")) {
            Some(node) => ComponentSpec::from_node(node, "name", "base.train.optimizer")?,
            None => ComponentSpec::new("noop", ConfigNode::map()),
        };
        Ok(Self {
            iterations: base.int_or("iterations", 0).max(0) as u64,
            weight_prefix: train
                .and_then(|t| t.field("weight_prefix"))
                .and_then(ConfigNode::as_str)
                .map(PathBuf::from),
            save_step: train.map_or(0, |t| t.int_or("save_step", 0).max(0) as u64),
            optimizer: optimizer.name,
            optimizer_params: optimizer.params,
        })
    }

    /// The configured optimizer block, ready for the optimizer registry.
    pub fn optimizer_spec(&self) -> ComponentSpec {
        ComponentSpec::new(self.optimizer.clone(), self.optimizer_params.clone())
    }

    /// Checkpoint path for `iteration`, if checkpointing is on.
    pub fn checkpoint_path(&self, iteration: u64) -> Option<PathBuf> {
        let prefix = self.weight_prefix.as_ref().filter(|_| self.save_step > 0)?;
        let mut name = prefix.file_name()?.to_os_string();
        name.push(format!("-{iteration}.ckpt"));
        Some(prefix.with_file_name(name))
    }

    pub fn saves_at(&self, iteration: u64) -> bool {
        self.save_step > 0 && iteration > 0 && iteration % self.save_step == 0
    }
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Layer weights plus enough context to reload them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Layer name the weights belong to.
    pub model: String,
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    pub num_parameters: usize,
    pub state: serde_json::Value,
}

impl Checkpoint {
    pub fn capture(layer: &dyn GnnLayer, iteration: u64) -> Result<Self> {
        Ok(Self {
            model: layer.name().to_string(),
            iteration,
            timestamp: Utc::now(),
            num_parameters: layer.num_parameters(),
            state: layer.state()?,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}

/// Where checkpoints go.
pub trait CheckpointSink: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint, path: &Path) -> Result<()>;

    /// Paths written so far, in order.
    fn written(&self) -> Vec<PathBuf>;
}

/// Writes each checkpoint as one JSON document.
#[derive(Debug, Default)]
pub struct JsonCheckpointSink {
    written: Mutex<Vec<PathBuf>>,
}

impl CheckpointSink for JsonCheckpointSink {
    fn save(&self, checkpoint: &Checkpoint, path: &Path) -> Result<()> {
        checkpoint
            .write(path)
            .map_err(|e| Error::Train(format!("writing checkpoint {}: {e}", path.display())))?;
        self.written.lock().push(path.to_path_buf());
        Ok(())
    }

    fn written(&self) -> Vec<PathBuf> {
        self.written.lock().clone()
    }
}

// ============================================================================
// Optimizer
// ============================================================================

/// Updates layer weights from a batch loss.
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn step(&mut self, layer: &mut dyn GnnLayer, loss: &LossReport, iteration: u64) -> Result<()>;
}

/// Leaves the weights untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOptimizer;

impl Optimizer for NoopOptimizer {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn step(&mut self, _layer: &mut dyn GnnLayer, _loss: &LossReport, _iteration: u64) -> Result<()> {
        Ok(())
    }
}

fn build_noop(_params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Optimizer>> {
    Ok(Box::new(NoopOptimizer))
}

pub fn register_optimizers(reg: &mut Registry<dyn Optimizer>) {
    reg.register("noop", Schema::closed(), build_noop);
}

// ============================================================================
// Cancellation
// ============================================================================

/// Stops a run at the next batch boundary. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TrainingDriver
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Cancelled,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub iterations: u64,
    pub stop: StopReason,
    pub checkpoints: Vec<PathBuf>,
    /// Name of the optimizer that was stepped.
    pub optimizer: String,
    pub loader: LoaderStats,
    /// Samples that parsed but could not be run through the model.
    pub failed_samples: u64,
    /// Batch-mean loss of the last iteration.
    pub last_loss: Option<LossReport>,
}

impl TrainReport {
    /// Samples left out of training for any reason.
    pub fn skipped_samples(&self) -> u64 {
        self.loader.skipped + self.failed_samples
    }
}

/// Pair each sample with its output, in batch order. Samples that failed
/// have no output and are left out.
fn matched<'a>(
    samples: &'a [Sample],
    outputs: &'a [(GraphOutput, LossOutput)],
) -> Vec<(&'a Sample, &'a GraphOutput, &'a LossOutput)> {
    let by_index: HashMap<usize, &(GraphOutput, LossOutput)> = outputs.iter().map(|o| (o.0.index, o)).collect();
    samples
        .iter()
        .filter_map(|s| by_index.get(&s.index()).copied().map(|(out, l)| (s, out, l)))
        .collect()
}

/// Batch mean of per-sample totals; accuracy weighted by scored count.
fn batch_loss(outputs: &[LossOutput]) -> LossReport {
    let mut report = LossReport::combine(outputs.iter().map(|o| o.total));
    if !outputs.is_empty() {
        report.loss /= outputs.len() as f64;
    }
    report
}

/// Runs the pipeline's configured optimizer unless one is supplied with
/// [`TrainingDriver::with_optimizer`].
pub struct TrainingDriver<'p> {
    pipeline: &'p mut Pipeline,
    optimizer: Option<Box<dyn Optimizer>>,
    sink: Box<dyn CheckpointSink>,
    writer: Option<Writer>,
    cancel: CancelToken,
}

impl<'p> TrainingDriver<'p> {
    pub fn new(pipeline: &'p mut Pipeline) -> Self {
        Self {
            pipeline,
            optimizer: None,
            sink: Box::new(JsonCheckpointSink::default()),
            writer: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn CheckpointSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_writer(mut self, writer: Writer) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn optimizer_name(&self) -> &'static str {
        self.optimizer.as_deref().unwrap_or(&*self.pipeline.optimizer).name()
    }

    pub async fn run(&mut self) -> Result<TrainReport> {
        let settings = self.pipeline.train.clone();
        let mut loader = self.pipeline.loader();
        let mut iteration = 0u64;
        let mut failed = 0u64;
        let mut last_loss = None;
        tracing::info!(
            iterations = settings.iterations,
            save_step = settings.save_step,
            optimizer = self.optimizer_name(),
            "training started"
        );

        let stop = loop {
            if iteration >= settings.iterations {
                break StopReason::Completed;
            }
            if self.cancel.is_cancelled() {
                tracing::info!(iteration, "training cancelled");
                break StopReason::Cancelled;
            }
            let batch = match loader.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(Error::NoData(reason)) => {
                    tracing::warn!(iteration, %reason, "no data, stopping");
                    break StopReason::NoData;
                }
                Err(e) => return Err(e),
            };

            let (outputs, batch_failed) = self.process(&batch.samples)?;
            failed += batch_failed;
            let losses: Vec<LossOutput> = outputs.iter().map(|(_, l)| *l).collect();
            let loss = batch_loss(&losses);

            let pipeline = &mut *self.pipeline;
            let optimizer = match self.optimizer.as_mut() {
                Some(o) => &mut **o,
                None => &mut *pipeline.optimizer,
            };
            optimizer
                .step(pipeline.model.layer_mut(), &loss, iteration)
                .map_err(|e| Error::Train(format!("optimizer step {iteration}: {e}")))?;
            iteration += 1;
            tracing::debug!(iteration, epoch = batch.epoch, samples = batch.len(), %loss, "iteration done");

            if let Some(writer) = &self.writer {
                for (sample, out, l) in matched(&batch.samples, &outputs) {
                    writer.write(&EventRecord::new(out, sample, Some(l)))?;
                }
            }
            if settings.saves_at(iteration) {
                if let Some(path) = settings.checkpoint_path(iteration) {
                    let checkpoint = Checkpoint::capture(self.pipeline.model.layer(), iteration)?;
                    self.sink.save(&checkpoint, &path)?;
                    tracing::info!(iteration, path = %path.display(), "checkpoint written");
                }
            }
            last_loss = Some(loss);
        };

        if let Some(writer) = &self.writer {
            writer.flush()?;
        }
        let report = TrainReport {
            iterations: iteration,
            stop,
            checkpoints: self.sink.written(),
            optimizer: self.optimizer_name().to_string(),
            loader: loader.stats(),
            failed_samples: failed,
            last_loss,
        };
        tracing::info!(
            iterations = report.iterations,
            stop = ?report.stop,
            checkpoints = report.checkpoints.len(),
            skipped = report.skipped_samples(),
            "training finished"
        );
        Ok(report)
    }

    /// Forward and score every sample in parallel. Samples that fail with a
    /// per-sample error are logged and counted; any other error aborts.
    fn process(&self, samples: &[Sample]) -> Result<(Vec<(GraphOutput, LossOutput)>, u64)> {
        let pipeline = &*self.pipeline;
        let results: Vec<Result<(GraphOutput, LossOutput)>> =
            samples.par_iter().map(|s| pipeline.evaluate(s)).collect();

        let mut outputs = Vec::with_capacity(results.len());
        let mut failed = 0;
        for result in results {
            match result {
                Ok(pair) => outputs.push(pair),
                Err(Error::SampleParse { index, message }) => {
                    tracing::warn!(index, %message, "sample left out of the batch");
                    failed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((outputs, failed))
    }
}
