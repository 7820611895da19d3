//! End-to-end tests for pipeline assembly.
//!
//! Each test builds a `Pipeline` from one YAML tree: validate -> build every
//! registry component -> wire `network_input`/`loss_input` -> forward.

use grappa::loss::{undirected_links, EdgeChannelLoss, EdgeLoss, EdgeTruth};
use grappa::model::NodeRecord;
use grappa::{ConfigNode, Domain, EdgeTarget, Error, Pipeline};
use pretty_assertions::{assert_eq, assert_ne};
use serde_json::{json, Value};

const SHOWER: u16 = 0;
const MICHEL: u16 = 2;

/// Four classes; shower-shower 500, shower-michel 25, michel-michel 25.
const CONFIG: &str = r#"
base:
  seed: 7
  classes: [shower, track, michel, delta]
io:
  loader:
    batch_size: 1
    sampler: sequential
    dataset:
      name: memory
      events: __EVENTS__
      schema:
        clust_label: {parser: cluster3d, cluster_event: cluster3d_pcluster}
        run_info: {parser: run_info, cluster_event: cluster3d_pcluster}
model:
  network_input: clust_label
  loss_input: [clust_label]
  modules:
    grappa:
      graph:
        name: complete
        max_length: [500, 0, 25, 500, 0, 0, 0, 25, 0, 25]
        dist_algorithm: recursive
      node_encoder: {name: geo}
      edge_encoder: {name: geo}
      gnn_model: {name: meta, node_feats: 16, edge_feats: 19, hidden: 8, depth: 2}
    grappa_loss:
      node_loss: {name: ce}
      edge_loss: {name: channel, target: group, high_purity: true}
"#;

fn blob(class: u16, group: i64, center: [f64; 3]) -> Value {
    let [x, y, z] = center;
    json!({
        "class_label": class,
        "group_id": group,
        "points": [[x, y, z], [x + 1.0, y, z]],
        "values": [1.0, 0.5]
    })
}

/// shower, shower, michel, shower: every pair lies within its class limit.
fn scenario_event() -> Value {
    json!({
        "cluster3d_pcluster": {
            "clusters": [
                blob(SHOWER, 0, [0.0, 0.0, 0.0]),
                blob(SHOWER, 0, [20.0, 0.0, 0.0]),
                blob(MICHEL, 1, [10.0, 10.0, 0.0]),
                blob(SHOWER, 0, [0.0, 20.0, 0.0]),
            ],
            "run_info": {"run": 1, "subrun": 2, "event": 3}
        }
    })
}

fn config_with(events: &[Value], replace: &[(&str, &str)]) -> ConfigNode {
    let mut yaml = CONFIG.replace("__EVENTS__", &Value::Array(events.to_vec()).to_string());
    for (from, to) in replace {
        assert!(yaml.contains(from), "config has no `{from}`");
        yaml = yaml.replace(from, to);
    }
    ConfigNode::from_yaml_str(&yaml).unwrap()
}

// ============================================================================
// 1. Build, load a batch, forward and score
// ============================================================================

#[tokio::test]
async fn test_build_load_forward_score() {
    let pipeline = Pipeline::from_config(&config_with(&[scenario_event()], &[])).unwrap();
    assert_eq!(pipeline.model.input(), Some("clust_label"));
    assert_eq!(pipeline.loss.truth(), Some("clust_label"));
    assert_eq!(pipeline.classes().len(), 4);
    assert_eq!(pipeline.model.encoders().node_width(), 16);
    assert_eq!(pipeline.model.encoders().edge_width(), 19);

    let mut loader = pipeline.loader();
    let batch = loader.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.skipped, 0);

    let sample = &batch.samples[0];
    assert_eq!(sample.provenance.run_info.map(|r| r.event), Some(3));

    let (out, loss) = pipeline.evaluate(sample).unwrap();
    assert_eq!(out.node_ids, vec![0, 1, 2, 3]);
    assert_eq!(out.node_features.dim(), (4, 16));
    assert_eq!(out.edge_features.dim(), (out.graph.num_edges(), 19));
    assert_eq!(out.node_pred.dim(), (4, 4));
    assert_eq!(out.group_pred.len(), 4);
    assert!(loss.node.is_some());
    assert!(loss.edge.is_some());
    assert!(loss.total.loss.is_finite());

    // One event, batch size one: the epoch is drained after one draw.
    assert!(loader.next_batch().await.unwrap().is_none());
}

// ============================================================================
// 2. Shower/michel scenario through the whole pipeline
// ============================================================================

#[tokio::test]
async fn test_shower_michel_scenario() {
    let pipeline = Pipeline::from_config(&config_with(&[scenario_event()], &[])).unwrap();
    let batch = pipeline.loader().next_batch().await.unwrap().unwrap();
    let out = pipeline.model.forward(&batch.samples[0]).unwrap();

    // All shower pairs, and each shower with the lone michel.
    assert_eq!(out.graph.edges(), &[(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]);
}

#[tokio::test]
async fn test_no_edge_pairs_stay_disconnected() {
    // shower-michel forbidden, everything else as before
    let cfg = config_with(
        &[scenario_event()],
        &[("[500, 0, 25, 500, 0, 0, 0, 25, 0, 25]", "[500, 0, 0, 500, 0, 0, 0, 25, 0, 25]")],
    );
    let pipeline = Pipeline::from_config(&cfg).unwrap();
    let batch = pipeline.loader().next_batch().await.unwrap().unwrap();
    let out = pipeline.model.forward(&batch.samples[0]).unwrap();
    assert_eq!(out.graph.edges(), &[(0, 1), (0, 3), (1, 3)]);
}

#[tokio::test]
async fn test_edges_are_stable_across_builds() {
    let cfg = config_with(&[scenario_event()], &[("name: complete", "name: knn\n        k: 2")]);
    let first = Pipeline::from_config(&cfg).unwrap();
    let second = Pipeline::from_config(&cfg).unwrap();
    let a = first.loader().next_batch().await.unwrap().unwrap();
    let b = second.loader().next_batch().await.unwrap().unwrap();
    let ea = first.model.forward(&a.samples[0]).unwrap();
    let eb = second.model.forward(&b.samples[0]).unwrap();
    assert_eq!(ea.graph.edges(), eb.graph.edges());
    for &(i, j) in ea.graph.edges() {
        assert!(i < j, "edge ({i}, {j}) is not canonical");
    }
}

#[tokio::test]
async fn test_adjacency_target_follows_graph_label() {
    // Clusters carry no parent ids; the particle graph links 0 -> 3 -> 1.
    let mut event = scenario_event();
    event["particles"] = json!([
        {"id": 0, "parent_id": 0, "group_id": 0},
        {"id": 1, "parent_id": 3, "group_id": 0},
        {"id": 2, "parent_id": 2, "group_id": 2},
        {"id": 3, "parent_id": 0, "group_id": 0}
    ]);
    let cfg = config_with(
        &[event],
        &[
            (
                "run_info: {parser: run_info, cluster_event: cluster3d_pcluster}",
                "run_info: {parser: run_info, cluster_event: cluster3d_pcluster}\n        graph_label: {parser: particle_graph, particle_event: particles}",
            ),
            ("loss_input: [clust_label]", "loss_input: [clust_label, graph_label]"),
            ("target: group", "target: adjacency"),
        ],
    );
    let pipeline = Pipeline::from_config(&cfg).unwrap();
    assert_eq!(pipeline.loss.links(), Some("graph_label"));

    let batch = pipeline.loader().next_batch().await.unwrap().unwrap();
    let sample = &batch.samples[0];
    let (out, loss) = pipeline.evaluate(sample).unwrap();
    assert_eq!(out.graph.edges(), &[(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]);

    let nodes: Vec<Option<&NodeRecord>> = sample.nodes("clust_label").unwrap().iter().map(Some).collect();
    let links = undirected_links(&[(0, 3), (3, 1)]);
    let head = EdgeChannelLoss { target: EdgeTarget::Adjacency, ..Default::default() };
    let with_links = EdgeTruth::new(&nodes).with_links(&links);
    assert_eq!(
        head.labels(&out.graph, &with_links),
        vec![Some(0), Some(0), Some(1), Some(0), Some(1), Some(0)]
    );
    // Without the edges label every pair would be off.
    assert!(head.labels(&out.graph, &EdgeTruth::new(&nodes)).iter().all(|l| *l == Some(0)));

    let edge = loss.edge.unwrap();
    assert_eq!(edge, head.score(&out.edge_pred, &out.graph, &with_links));
    assert_ne!(edge.loss, head.score(&out.edge_pred, &out.graph, &EdgeTruth::new(&nodes)).loss);
}

// ============================================================================
// 3. Build-time failures
// ============================================================================

#[test]
fn test_unknown_graph_name_fails_at_build() {
    let cfg = config_with(&[], &[("name: complete", "name: nonexistent")]);
    let err = Pipeline::from_config(&cfg).err().unwrap();
    assert!(err.is_build_time());
    match err {
        Error::UnknownComponent { domain, name, known } => {
            assert_eq!(domain, Domain::Graph);
            assert_eq!(name, "nonexistent");
            assert!(known.contains(&"complete".to_string()));
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn test_unknown_parser_fails_at_build() {
    let cfg = config_with(&[], &[("parser: run_info", "parser: hdf5_magic")]);
    assert!(matches!(
        Pipeline::from_config(&cfg),
        Err(Error::UnknownComponent { domain: Domain::Parser, .. })
    ));
}

#[test]
fn test_feature_width_mismatch_fails_at_build() {
    let cfg = config_with(&[], &[("node_feats: 16", "node_feats: 17")]);
    match Pipeline::from_config(&cfg) {
        Err(Error::FeatureWidthMismatch { kind, declared, computed }) => {
            assert_eq!((kind, declared, computed), ("node", 17, 16));
        }
        Err(other) => panic!("unexpected {other}"),
        Ok(_) => panic!("mismatched widths accepted"),
    }
}

#[test]
fn test_distance_matrix_size_mismatch_fails_at_build() {
    let cfg = config_with(&[], &[("[500, 0, 25, 500, 0, 0, 0, 25, 0, 25]", "[500, 0, 25]")]);
    assert!(matches!(Pipeline::from_config(&cfg), Err(Error::GraphConfig(_))));
}

#[test]
fn test_num_classes_must_match_declared_classes() {
    // Four classes declared; a 2x2 matrix sized by `num_classes: 2` is rejected.
    let cfg = config_with(
        &[],
        &[("max_length: [500, 0, 25, 500, 0, 0, 0, 25, 0, 25]", "num_classes: 2\n        max_length: [500, 0, 25]")],
    );
    match Pipeline::from_config(&cfg) {
        Err(Error::GraphConfig(msg)) => assert!(msg.contains("num_classes"), "{msg}"),
        Err(other) => panic!("unexpected {other}"),
        Ok(_) => panic!("contradicting class count accepted"),
    }

    // Agreeing with the declared set is fine.
    let cfg = config_with(
        &[],
        &[("max_length: [500, 0, 25, 500, 0, 0, 0, 25, 0, 25]", "num_classes: 4\n        max_length: 500")],
    );
    assert!(Pipeline::from_config(&cfg).is_ok());
}

#[test]
fn test_invalid_params_report_every_violation() {
    let cfg = config_with(&[], &[("hidden: 8, depth: 2", "hidden: 8, depth: 0, aggr: median")]);
    match Pipeline::from_config(&cfg) {
        Err(Error::InvalidParams { domain, violations, .. }) => {
            assert_eq!(domain, Domain::GnnLayer);
            assert_eq!(violations.len(), 2, "{violations:?}");
        }
        Err(other) => panic!("unexpected {other}"),
        Ok(_) => panic!("invalid params accepted"),
    }
}

#[test]
fn test_missing_weight_file_fails_at_build() {
    let cfg = config_with(&[], &[("network_input: clust_label", "weight_path: /nonexistent/w.ckpt\n  network_input: clust_label")]);
    assert!(matches!(Pipeline::from_config(&cfg), Err(Error::Io(_))));
}

// ============================================================================
// 4. Config layering
// ============================================================================

#[test]
fn test_override_document_inherits_from_parent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("base.yaml"), config_with(&[], &[]).to_yaml_string().unwrap()).unwrap();
    std::fs::write(
        dir.path().join("child.yaml"),
        "parent: base.yaml\nio: {loader: {batch_size: 4}}\nmodel: {modules: {grappa: {graph: {name: mst}}}}\n",
    )
    .unwrap();

    let merged = ConfigNode::load(dir.path().join("child.yaml")).unwrap();
    assert_eq!(merged.get("io.loader.batch_size").and_then(ConfigNode::as_int), Some(4));
    assert_eq!(merged.get("model.modules.grappa.graph.name").and_then(ConfigNode::as_str), Some("mst"));
    // Untouched siblings are inherited.
    assert_eq!(merged.get("model.modules.grappa.graph.dist_algorithm").and_then(ConfigNode::as_str), Some("recursive"));
    assert!(merged.get("parent").is_none());

    let pipeline = Pipeline::from_config(&merged).unwrap();
    assert_eq!(pipeline.batch_size(), 4);
    assert_eq!(pipeline.model.graph_builder().name(), "mst");
}

#[test]
fn test_shipped_configs_build() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
    for name in ["train_grappa_shower.yaml", "train_grappa_shower_discover.yaml"] {
        let cfg = ConfigNode::load(root.join(name)).unwrap();
        let pipeline = Pipeline::from_config(&cfg).unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(pipeline.model.encoders().node_width(), 19, "{name}");
    }

    let child = ConfigNode::load(root.join("train_grappa_shower_discover.yaml")).unwrap();
    assert!(child.get("io.loader.dataset.file_keys").unwrap().is_unset());
    assert_eq!(child.get("base.train.save_step").and_then(ConfigNode::as_int), Some(10));
    assert_eq!(child.get("base.train.weight_prefix").and_then(ConfigNode::as_str), Some("weights/grappa_shower/snapshot"));
}
