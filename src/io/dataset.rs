//! Data source + schema of `label → parser` = samples.

use std::collections::BTreeMap;

use crate::config::ConfigNode;
use crate::model::{Product, ProductKind, Provenance, Sample};
use crate::registry::{BuildContext, ComponentRegistry, ComponentSpec};
use crate::{Error, Result};

use super::{DataSource, Parser};

/// Key of the dataset block holding the parser schema.
pub const SCHEMA_KEY: &str = "schema";

/// A data source and the parsers that turn each of its events into a
/// [`Sample`].
pub struct DatasetPipeline {
    source: Box<dyn DataSource>,
    schema: BTreeMap<String, Box<dyn Parser>>,
}

impl DatasetPipeline {
    pub fn new(source: Box<dyn DataSource>, schema: BTreeMap<String, Box<dyn Parser>>) -> Self {
        Self { source, schema }
    }

    /// Build from an `io.loader.dataset` block:
    ///
    /// ```yaml
    /// name: jsonl
    /// file_keys: null
    /// data_root: /data/showers
    /// schema:
    ///   clust_label: {parser: cluster3d, cluster_event: cluster3d_pcluster}
    /// ```
    pub fn from_config(config: &ConfigNode, registry: &ComponentRegistry, ctx: &BuildContext) -> Result<Self> {
        let mut spec = ComponentSpec::from_node(config, "name", "io.loader.dataset")?;
        let schema_node = spec
            .params
            .take(SCHEMA_KEY)
            .filter(|n| !n.is_unset())
            .ok_or_else(|| Error::Config("`io.loader.dataset.schema` is required".into()))?;
        let entries = schema_node.as_map().ok_or_else(|| {
            Error::Config(format!(
                "`io.loader.dataset.schema` must map labels to parsers, got {}",
                schema_node.type_name()
            ))
        })?;
        if entries.is_empty() {
            return Err(Error::Config("`io.loader.dataset.schema` declares no labels".into()));
        }

        let source = registry.datasets.build(&spec, ctx)?;
        let mut schema = BTreeMap::new();
        for (label, node) in entries {
            let path = format!("io.loader.dataset.schema.{label}");
            let parser_spec = ComponentSpec::from_node(node, "parser", &path)?;
            let parser = registry.parsers.build(&parser_spec, ctx)?;
            tracing::debug!(label, parser = parser.name(), output = %parser.output(), "schema entry");
            schema.insert(label.clone(), parser);
        }
        Ok(Self { source, schema })
    }

    pub fn source(&self) -> &dyn DataSource {
        self.source.as_ref()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.schema.keys().map(String::as_str)
    }

    /// Product kind a label will hold, if the label is declared.
    pub fn output(&self, label: &str) -> Option<ProductKind> {
        self.schema.get(label).map(|p| p.output())
    }

    pub async fn len(&self) -> Result<usize> {
        self.source.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.source.is_empty().await
    }

    /// Read and parse one event. Any parser failure fails the whole sample
    /// with `SampleParse`.
    pub async fn load(&self, index: usize) -> Result<Sample> {
        let record = self.source.read(index).await?;
        let mut provenance = Provenance::new(record.index);
        provenance.file = record.file;

        let mut sample = Sample::new(provenance);
        for (label, parser) in &self.schema {
            let product = parser.parse(&record.event).map_err(|e| Error::SampleParse {
                index,
                message: format!("{label} ({}): {e}", parser.name()),
            })?;
            if let Product::RunInfo(info) = &product {
                sample.provenance.run_info = Some(*info);
            }
            sample.products.insert(label.clone(), product);
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunInfo;

    const DATASET: &str = r#"
name: memory
events:
  - cluster3d_pcluster:
      clusters:
        - {points: [[0, 0, 0]], shape: 0}
      run_info: {run: 1, subrun: 0, event: 9}
  - cluster3d_pcluster: 17
schema:
  clust_label: {parser: cluster3d, cluster_event: cluster3d_pcluster}
  run_info: {parser: run_info, cluster_event: cluster3d_pcluster}
"#;

    fn dataset(yaml: &str) -> Result<DatasetPipeline> {
        let node = ConfigNode::from_yaml_str(yaml).unwrap();
        DatasetPipeline::from_config(&node, &ComponentRegistry::with_defaults(), &BuildContext::default())
    }

    #[tokio::test]
    async fn test_load_fills_products_and_provenance() {
        let ds = dataset(DATASET).unwrap();
        assert_eq!(ds.labels().collect::<Vec<_>>(), vec!["clust_label", "run_info"]);
        assert_eq!(ds.output("clust_label"), Some(ProductKind::Clusters));
        assert_eq!(ds.len().await.unwrap(), 2);

        let sample = ds.load(0).await.unwrap();
        assert_eq!(sample.nodes("clust_label").map(<[_]>::len), Some(1));
        assert_eq!(sample.provenance.run_info, Some(RunInfo { run: 1, subrun: 0, event: 9 }));
    }

    #[tokio::test]
    async fn test_bad_product_fails_the_sample() {
        let ds = dataset(DATASET).unwrap();
        match ds.load(1).await {
            Err(Error::SampleParse { index, message }) => {
                assert_eq!(index, 1);
                assert!(message.starts_with("clust_label (cluster3d)"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_schema_is_required() {
        assert!(matches!(dataset("{name: memory}"), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_parser_is_reported() {
        let err = dataset("{name: memory, schema: {data: {parser: parse_sparse9d}}}").err().unwrap();
        assert!(matches!(err, Error::UnknownComponent { .. }));
    }
}
