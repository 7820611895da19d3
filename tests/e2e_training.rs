//! End-to-end tests for the training driver: batches -> forward -> loss ->
//! optimizer step -> checkpoints, with per-event output and cancellation.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use grappa::gnn::GnnLayer;
use grappa::io::writer::Collision;
use grappa::io::{EventRecord, Writer};
use grappa::registry::BuildContext;
use grappa::train::{Checkpoint, Optimizer, StopReason};
use grappa::{CancelToken, ComponentRegistry, ConfigNode, LossReport, Pipeline, Schema, TrainingDriver};
use pretty_assertions::{assert_eq, assert_ne};
use serde_json::{json, Value};

fn event(n: usize) -> Value {
    let clusters: Vec<Value> = (0..n)
        .map(|i| {
            json!({
                "class_label": 0,
                "group_id": i / 2,
                "points": [[i * 4, 0, 0], [i * 4 + 1, 0, 0], [i * 4 + 2, 0, 0]]
            })
        })
        .collect();
    json!({"c": clusters, "r": {"clusters": [], "run_info": {"run": 1, "subrun": 0, "event": n}}})
}

struct Setup<'a> {
    prefix: &'a Path,
    iterations: u64,
    save_step: u64,
    seed: u64,
    weight_path: Option<&'a Path>,
    optimizer: &'a str,
    dataset: String,
}

impl<'a> Setup<'a> {
    fn new(prefix: &'a Path, iterations: u64, save_step: u64) -> Self {
        let events: Vec<Value> = (2..6).map(event).collect();
        Self {
            prefix,
            iterations,
            save_step,
            seed: 3,
            weight_path: None,
            optimizer: "noop",
            dataset: format!("name: memory\n      events: {}", Value::Array(events)),
        }
    }

    fn config(&self) -> ConfigNode {
        let weight_path = match self.weight_path {
            Some(p) => p.display().to_string(),
            None => "null".to_string(),
        };
        let yaml = format!(
            r#"
base:
  seed: {seed}
  iterations: {iterations}
  train:
    weight_prefix: {prefix}
    save_step: {save_step}
    optimizer: {{name: {optimizer}}}
io:
  loader:
    batch_size: 2
    num_workers: 2
    sampler: sequential
    dataset:
      {dataset}
      schema:
        clust_label: {{parser: cluster3d, cluster_event: c}}
        run_info: {{parser: run_info, cluster_event: r}}
model:
  weight_path: {weight_path}
  network_input: clust_label
  loss_input: clust_label
  modules:
    grappa:
      graph: {{name: complete, max_length: 10}}
      node_encoder: {{name: geo}}
      edge_encoder: {{name: geo}}
      gnn_model: {{name: meta, node_feats: 16, edge_feats: 19, hidden: 4, depth: 1}}
    grappa_loss:
      node_loss: {{name: ce}}
      edge_loss: {{name: channel, target: group}}
"#,
            seed = self.seed,
            iterations = self.iterations,
            prefix = self.prefix.display(),
            save_step = self.save_step,
            optimizer = self.optimizer,
            dataset = self.dataset,
        );
        ConfigNode::from_yaml_str(&yaml).unwrap()
    }
}

fn config(prefix: &Path, iterations: u64, save_step: u64) -> ConfigNode {
    Setup::new(prefix, iterations, save_step).config()
}

// ============================================================================
// 1. Iterations span epochs; checkpoints land every save_step
// ============================================================================

#[tokio::test]
async fn test_training_writes_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("weights/snapshot");
    let mut pipeline = Pipeline::from_config(&config(&prefix, 5, 2)).unwrap();

    let report = TrainingDriver::new(&mut pipeline).run().await.unwrap();
    assert_eq!(report.iterations, 5);
    assert_eq!(report.stop, StopReason::Completed);
    assert_eq!(report.optimizer, "noop");
    // Four events, batches of two: five iterations open three epochs.
    assert_eq!(report.loader.epochs, 3);
    assert_eq!(report.loader.batches, 5);
    assert_eq!(report.skipped_samples(), 0);
    assert_eq!(
        report.checkpoints,
        vec![dir.path().join("weights/snapshot-2.ckpt"), dir.path().join("weights/snapshot-4.ckpt")]
    );

    let last = report.last_loss.unwrap();
    assert!(last.loss.is_finite());
    assert!((0.0..=1.0).contains(&last.accuracy));

    let checkpoint = Checkpoint::read(&report.checkpoints[1]).unwrap();
    assert_eq!(checkpoint.model, "meta");
    assert_eq!(checkpoint.iteration, 4);
    assert_eq!(checkpoint.num_parameters, pipeline.model.layer().num_parameters());
}

#[tokio::test]
async fn test_checkpoint_reloads_through_weight_path() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("w");
    let mut first = Pipeline::from_config(&config(&prefix, 2, 2)).unwrap();
    let report = TrainingDriver::new(&mut first).run().await.unwrap();
    let path = report.checkpoints[0].clone();

    // A different seed initializes different weights until the checkpoint
    // is loaded over them.
    let mut setup = Setup::new(&prefix, 2, 0);
    setup.seed = 99;
    let unloaded = Pipeline::from_config(&setup.config()).unwrap();
    assert_ne!(unloaded.model.layer().state().unwrap(), first.model.layer().state().unwrap());

    setup.weight_path = Some(&path);
    let second = Pipeline::from_config(&setup.config()).unwrap();
    assert_eq!(second.model.layer().state().unwrap(), first.model.layer().state().unwrap());
}

#[tokio::test]
async fn test_zero_save_step_means_no_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::from_config(&config(&dir.path().join("w"), 2, 0)).unwrap();
    let report = TrainingDriver::new(&mut pipeline).run().await.unwrap();
    assert_eq!(report.iterations, 2);
    assert!(report.checkpoints.is_empty());
}

// ============================================================================
// 2. The configured optimizer is the one stepped
// ============================================================================

static STEPS: AtomicU64 = AtomicU64::new(0);

/// Counts its steps in `STEPS`.
struct Counting;

impl Optimizer for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn step(&mut self, _layer: &mut dyn GnnLayer, _loss: &LossReport, _iteration: u64) -> grappa::Result<()> {
        STEPS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn build_counting(_params: &ConfigNode, _ctx: &BuildContext) -> grappa::Result<Box<dyn Optimizer>> {
    Ok(Box::new(Counting))
}

#[tokio::test]
async fn test_configured_optimizer_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("w");
    let mut registry = ComponentRegistry::with_defaults();
    registry.optimizers.register("counting", Schema::closed(), build_counting);

    let mut setup = Setup::new(&prefix, 3, 0);
    setup.optimizer = "counting";
    let mut pipeline = Pipeline::from_config_with(&setup.config(), &registry).unwrap();
    assert_eq!(pipeline.train.optimizer, "counting");
    assert_eq!(pipeline.optimizer.name(), "counting");

    let report = TrainingDriver::new(&mut pipeline).run().await.unwrap();
    assert_eq!(report.iterations, 3);
    assert_eq!(report.optimizer, "counting");
    assert_eq!(STEPS.load(Ordering::SeqCst), 3);

    // The default registry does not know it.
    assert!(Pipeline::from_config(&setup.config()).is_err());
}

// ============================================================================
// 3. Per-event output
// ============================================================================

#[tokio::test]
async fn test_writer_records_every_processed_event() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("events.jsonl");
    let mut pipeline = Pipeline::from_config(&config(&dir.path().join("w"), 2, 0)).unwrap();

    let writer = Writer::open(&out, Collision::Fail).unwrap();
    let report = TrainingDriver::new(&mut pipeline).with_writer(writer).run().await.unwrap();
    assert_eq!(report.iterations, 2);

    let records: Vec<EventRecord> = std::fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    // Event `n` holds `n` clusters, all within range of their neighbours.
    assert_eq!(records[0].node_ids, vec![0, 1]);
    assert_eq!(records[3].node_ids.len(), 5);
    assert_eq!(records[3].run_info.map(|r| r.event), Some(5));
    for r in &records {
        assert_eq!(r.edge_on.len(), r.edges.len());
        assert_eq!(r.group_pred.len(), r.node_ids.len());
        assert!(r.loss.is_some());
    }
}

// ============================================================================
// 4. Stopping: cancellation and exhaustion
// ============================================================================

/// Cancels the run once it has stepped `after` times.
struct CancelAfter {
    token: CancelToken,
    after: u64,
}

impl Optimizer for CancelAfter {
    fn name(&self) -> &'static str {
        "cancel_after"
    }

    fn step(&mut self, _layer: &mut dyn GnnLayer, _loss: &LossReport, iteration: u64) -> grappa::Result<()> {
        if iteration + 1 >= self.after {
            self.token.cancel();
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_stops_between_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::from_config(&config(&dir.path().join("w"), 100, 0)).unwrap();

    let token = CancelToken::new();
    let report = TrainingDriver::new(&mut pipeline)
        .with_optimizer(Box::new(CancelAfter { token: token.clone(), after: 3 }))
        .with_cancel(token)
        .run()
        .await
        .unwrap();
    assert_eq!(report.stop, StopReason::Cancelled);
    assert_eq!(report.iterations, 3);
    assert_eq!(report.optimizer, "cancel_after");
}

#[tokio::test]
async fn test_cancel_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::from_config(&config(&dir.path().join("w"), 10, 1)).unwrap();
    let mut driver = TrainingDriver::new(&mut pipeline);
    driver.cancel_token().cancel();
    let report = driver.run().await.unwrap();
    assert_eq!(report.stop, StopReason::Cancelled);
    assert_eq!(report.iterations, 0);
    assert!(report.checkpoints.is_empty());
}

#[tokio::test]
async fn test_empty_source_stops_with_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("w");
    let mut setup = Setup::new(&prefix, 10, 1);
    setup.dataset = format!(
        "name: jsonl\n      file_keys: null\n      data_root: {}",
        dir.path().join("empty").display()
    );

    let mut pipeline = Pipeline::from_config(&setup.config()).unwrap();
    let report = TrainingDriver::new(&mut pipeline).run().await.unwrap();
    assert_eq!(report.stop, StopReason::NoData);
    assert_eq!(report.iterations, 0);
    assert_eq!(report.last_loss, None);
}
