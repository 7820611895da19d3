//! Node sub-encoders and their concatenation.

use ndarray::{aview1, Array2};

use super::geometry::{covariance, local_count, local_direction, principal_axis};
use super::NodeEncoder;
use crate::config::ConfigNode;
use crate::model::{Graph, NodeRecord, Point3};
use crate::{Error, Result};

/// One block of node feature columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeFeature {
    /// Centroid (3), trace-normalized covariance (9), principal axis (3),
    /// point count (1).
    Geometry,
    /// Summed value, value per point.
    Value,
    /// Class index.
    Shape,
    /// Reference position.
    Start,
    /// Local principal direction around the reference position.
    Direction { radius: f64 },
    /// Point count within `radius` of the reference position, and that
    /// count over the cluster size.
    Density { radius: f64 },
}

impl NodeFeature {
    pub const NAMES: &'static [&'static str] = &["geometry", "value", "shape", "start", "direction", "density"];

    pub fn name(&self) -> &'static str {
        match self {
            NodeFeature::Geometry => "geometry",
            NodeFeature::Value => "value",
            NodeFeature::Shape => "shape",
            NodeFeature::Start => "start",
            NodeFeature::Direction { .. } => "direction",
            NodeFeature::Density { .. } => "density",
        }
    }

    pub fn width(&self) -> usize {
        match self {
            NodeFeature::Geometry => 16,
            NodeFeature::Value => 2,
            NodeFeature::Shape => 1,
            NodeFeature::Start => 3,
            NodeFeature::Direction { .. } => 3,
            NodeFeature::Density { .. } => 2,
        }
    }

    /// Parse one `{name, enabled, radius}` block; `None` when disabled.
    pub fn from_config(node: &ConfigNode, default_radius: f64) -> Result<Option<Self>> {
        if !node.bool_or("enabled", true) {
            return Ok(None);
        }
        let radius = node.float_or("radius", default_radius);
        let feature = match node.require_str("name")? {
            "geometry" => NodeFeature::Geometry,
            "value" => NodeFeature::Value,
            "shape" => NodeFeature::Shape,
            "start" => NodeFeature::Start,
            "direction" => NodeFeature::Direction { radius },
            "density" => NodeFeature::Density { radius },
            other => return Err(Error::Config(format!("unknown node feature `{other}`"))),
        };
        Ok(Some(feature))
    }

    fn write(&self, node: &NodeRecord, out: &mut Vec<f32>) {
        let push3 = |out: &mut Vec<f32>, p: Point3| out.extend(p.to_array().map(|v| v as f32));
        match *self {
            NodeFeature::Geometry => {
                push3(out, node.centroid().unwrap_or(node.position));
                let cov = covariance(&node.point_cloud);
                let trace = cov[0][0] + cov[1][1] + cov[2][2];
                let scale = if trace > 0.0 { 1.0 / trace } else { 0.0 };
                out.extend(cov.iter().flatten().map(|v| (v * scale) as f32));
                push3(out, principal_axis(&node.point_cloud));
                out.push(node.size() as f32);
            }
            NodeFeature::Value => {
                let per_point = if node.is_empty() { 0.0 } else { node.scalar_value / node.size() as f64 };
                out.extend([node.scalar_value as f32, per_point as f32]);
            }
            NodeFeature::Shape => out.push(node.class_label.0 as f32),
            NodeFeature::Start => push3(out, node.position),
            NodeFeature::Direction { radius } => {
                push3(out, local_direction(&node.point_cloud, node.position, radius));
            }
            NodeFeature::Density { radius } => {
                let count = local_count(&node.point_cloud, node.position, radius);
                let fraction = if node.is_empty() { 0.0 } else { count as f64 / node.size() as f64 };
                out.extend([count as f32, fraction as f32]);
            }
        }
    }
}

/// Node encoder made of an ordered list of feature blocks.
#[derive(Debug, Clone)]
pub struct ComposedNodeEncoder {
    name: &'static str,
    features: Vec<NodeFeature>,
}

impl ComposedNodeEncoder {
    pub fn new(name: &'static str, features: Vec<NodeFeature>) -> Self {
        Self { name, features }
    }

    pub fn features(&self) -> &[NodeFeature] {
        &self.features
    }
}

impl NodeEncoder for ComposedNodeEncoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn width(&self) -> usize {
        self.features.iter().map(NodeFeature::width).sum()
    }

    fn layout(&self) -> Vec<(&'static str, usize)> {
        self.features.iter().map(|f| (f.name(), f.width())).collect()
    }

    fn encode(&self, nodes: &[NodeRecord], _graph: &Graph) -> Array2<f32> {
        let width = self.width();
        let mut out: Array2<f32> = Array2::zeros((nodes.len(), width));
        let mut row = Vec::with_capacity(width);
        for (i, node) in nodes.iter().enumerate() {
            row.clear();
            for feature in &self.features {
                feature.write(node, &mut row);
            }
            out.row_mut(i).assign(&aview1(row.as_slice()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassLabel;

    fn track() -> NodeRecord {
        NodeRecord::new(7, ClassLabel(1))
            .with_points((0..5).map(|k| [k as f64, 0.0, 0.0]))
            .with_position([0.0, 0.0, 0.0])
            .with_value(10.0)
    }

    #[test]
    fn test_row_width_matches_layout() {
        let enc = ComposedNodeEncoder::new(
            "test",
            vec![
                NodeFeature::Geometry,
                NodeFeature::Value,
                NodeFeature::Shape,
                NodeFeature::Start,
                NodeFeature::Direction { radius: 2.0 },
                NodeFeature::Density { radius: 2.0 },
            ],
        );
        assert_eq!(enc.width(), 27);
        let x = enc.encode(&[track(), track()], &Graph::empty(2));
        assert_eq!(x.dim(), (2, 27));
    }

    #[test]
    fn test_feature_values() {
        let enc = ComposedNodeEncoder::new(
            "test",
            vec![NodeFeature::Value, NodeFeature::Shape, NodeFeature::Density { radius: 2.0 }],
        );
        let x = enc.encode(&[track()], &Graph::empty(1));
        assert_eq!(x.row(0).to_vec(), vec![10.0, 2.0, 1.0, 3.0, 0.6]);
    }

    #[test]
    fn test_geometry_block() {
        let enc = ComposedNodeEncoder::new("test", vec![NodeFeature::Geometry]);
        let x = enc.encode(&[track()], &Graph::empty(1));
        let row = x.row(0).to_vec();
        assert_eq!(&row[0..3], &[2.0, 0.0, 0.0]);
        // All spread is along x: normalized covariance is e_x e_x^T.
        assert_eq!(row[3], 1.0);
        assert!(row[4..12].iter().all(|v| *v == 0.0));
        assert_eq!(&row[12..15], &[1.0, 0.0, 0.0]);
        assert_eq!(row[15], 5.0);
    }

    #[test]
    fn test_disabled_block_is_skipped() {
        let node = ConfigNode::from_yaml_str("{name: value, enabled: false}").unwrap();
        assert_eq!(NodeFeature::from_config(&node, 5.0).unwrap(), None);
        let node = ConfigNode::from_yaml_str("{name: direction}").unwrap();
        assert_eq!(
            NodeFeature::from_config(&node, 5.0).unwrap(),
            Some(NodeFeature::Direction { radius: 5.0 })
        );
    }
}
