//! Collate strategies: how the parsed samples of one draw become a batch.

use std::collections::BTreeMap;

use ndarray::Array2;

use crate::config::{ConfigNode, Schema};
use crate::model::{Product, Sample};
use crate::registry::{BuildContext, Registry};
use crate::Result;

/// Samples of one draw, in draw order, plus any flattened tensors.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Position of this batch in the loader's run (0-based).
    pub index: u64,
    pub epoch: u64,
    pub samples: Vec<Sample>,
    /// `sparse` collate only: label → rows of `[batch, x, y, z, value]`.
    /// For clusters the value column holds the cluster's position in its
    /// sample's list.
    pub tensors: BTreeMap<String, Array2<f32>>,
    /// Samples of this draw that failed to parse.
    pub skipped: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub trait Collate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fill `batch.tensors` from `batch.samples`.
    fn collate(&self, batch: &mut Batch);
}

/// Samples stay as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListCollate;

impl Collate for ListCollate {
    fn name(&self) -> &'static str {
        "list"
    }

    fn collate(&self, _batch: &mut Batch) {}
}

/// Every point product is flattened into one tensor per label, with the
/// sample's batch position as the first column.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseCollate;

impl SparseCollate {
    fn rows(product: &Product) -> Option<Vec<([f64; 3], f64)>> {
        match product {
            Product::Points(set) => Some(
                set.points
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (p.to_array(), set.values.get(i).copied().unwrap_or(0.0)))
                    .collect(),
            ),
            Product::Clusters(nodes) => Some(
                nodes
                    .iter()
                    .enumerate()
                    .flat_map(|(c, n)| n.point_cloud.iter().map(move |p| (p.to_array(), c as f64)))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl Collate for SparseCollate {
    fn name(&self) -> &'static str {
        "sparse"
    }

    fn collate(&self, batch: &mut Batch) {
        let mut flat: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        for (b, sample) in batch.samples.iter().enumerate() {
            for (label, product) in &sample.products {
                let Some(rows) = Self::rows(product) else { continue };
                let data = flat.entry(label.clone()).or_default();
                for ([x, y, z], v) in rows {
                    data.extend([b as f32, x as f32, y as f32, z as f32, v as f32]);
                }
            }
        }
        batch.tensors = flat
            .into_iter()
            .filter_map(|(label, data)| {
                Array2::from_shape_vec((data.len() / 5, 5), data).ok().map(|t| (label, t))
            })
            .collect();
    }
}

fn build_list(_params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Collate>> {
    Ok(Box::new(ListCollate))
}

fn build_sparse(_params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Collate>> {
    Ok(Box::new(SparseCollate))
}

pub fn register_defaults(reg: &mut Registry<dyn Collate>) {
    reg.register("list", Schema::closed(), build_list)
        .register("sparse", Schema::closed(), build_sparse)
        .alias("CollateSparse", "sparse");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassLabel, NodeRecord, PointSet, Provenance};

    fn batch() -> Batch {
        let first = Sample::new(Provenance::new(0)).with_product(
            "clust_label",
            Product::Clusters(vec![
                NodeRecord::new(0, ClassLabel(0)).with_points([[1.0, 2.0, 3.0]]),
                NodeRecord::new(1, ClassLabel(1)).with_points([[4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]),
            ]),
        );
        let second = Sample::new(Provenance::new(1))
            .with_product(
                "clust_label",
                Product::Clusters(vec![NodeRecord::new(0, ClassLabel(0)).with_points([[0.0, 0.0, 1.0]])]),
            )
            .with_product(
                "data",
                Product::Points(PointSet { points: vec![[1.0, 1.0, 1.0].into()], values: vec![0.5] }),
            );
        Batch { samples: vec![first, second], ..Default::default() }
    }

    #[test]
    fn test_list_leaves_tensors_empty() {
        let mut b = batch();
        ListCollate.collate(&mut b);
        assert!(b.tensors.is_empty());
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_sparse_flattens_with_batch_column() {
        let mut b = batch();
        SparseCollate.collate(&mut b);
        let clusters = &b.tensors["clust_label"];
        assert_eq!(clusters.dim(), (4, 5));
        assert_eq!(clusters.column(0).to_vec(), vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(clusters.column(4).to_vec(), vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(b.tensors["data"].row(0).to_vec(), vec![1.0, 1.0, 1.0, 1.0, 0.5]);
    }
}
