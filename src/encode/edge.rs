//! Edge sub-encoders and their concatenation.
//!
//! Every edge block reads the closest point pair of the two clusters, which
//! is computed once per edge.

use ndarray::{aview1, Array2};

use super::geometry::{local_count, local_direction};
use super::EdgeEncoder;
use crate::config::ConfigNode;
use crate::graph::closest_pair;
use crate::model::{Graph, NodeRecord, Point3};
use crate::{Error, Result};

/// One block of edge feature columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeFeature {
    /// Closest point on each cluster (3 + 3), displacement (3), length (1),
    /// outer product of the unit displacement (9).
    Geometry,
    /// Both class indices.
    Shape,
    /// Cosine between the local directions at the two closest points.
    Direction { radius: f64 },
    /// Point counts within `radius` of each closest point.
    Density { radius: f64 },
}

struct EdgeContext<'n> {
    a: &'n NodeRecord,
    b: &'n NodeRecord,
    pa: Point3,
    pb: Point3,
}

impl<'n> EdgeContext<'n> {
    fn new(a: &'n NodeRecord, b: &'n NodeRecord) -> Self {
        let (pa, pb) = match closest_pair(&a.point_cloud, &b.point_cloud) {
            Some((i, j, _)) => (a.point_cloud[i], b.point_cloud[j]),
            None => (a.position, b.position),
        };
        Self { a, b, pa, pb }
    }
}

impl EdgeFeature {
    pub const NAMES: &'static [&'static str] = &["geometry", "shape", "direction", "density"];

    pub fn name(&self) -> &'static str {
        match self {
            EdgeFeature::Geometry => "geometry",
            EdgeFeature::Shape => "shape",
            EdgeFeature::Direction { .. } => "direction",
            EdgeFeature::Density { .. } => "density",
        }
    }

    pub fn width(&self) -> usize {
        match self {
            EdgeFeature::Geometry => 19,
            EdgeFeature::Shape => 2,
            EdgeFeature::Direction { .. } => 1,
            EdgeFeature::Density { .. } => 2,
        }
    }

    pub fn from_config(node: &ConfigNode, default_radius: f64) -> Result<Option<Self>> {
        if !node.bool_or("enabled", true) {
            return Ok(None);
        }
        let radius = node.float_or("radius", default_radius);
        let feature = match node.require_str("name")? {
            "geometry" => EdgeFeature::Geometry,
            "shape" => EdgeFeature::Shape,
            "direction" => EdgeFeature::Direction { radius },
            "density" => EdgeFeature::Density { radius },
            other => return Err(Error::Config(format!("unknown edge feature `{other}`"))),
        };
        Ok(Some(feature))
    }

    fn write(&self, ctx: &EdgeContext<'_>, out: &mut Vec<f32>) {
        match *self {
            EdgeFeature::Geometry => {
                let disp = ctx.pb - ctx.pa;
                let length = disp.norm();
                let unit = disp.normalized().to_array();
                for p in [ctx.pa, ctx.pb, disp] {
                    out.extend(p.to_array().map(|v| v as f32));
                }
                out.push(length as f32);
                for r in unit {
                    out.extend(unit.map(|c| (r * c) as f32));
                }
            }
            EdgeFeature::Shape => {
                out.extend([ctx.a.class_label.0 as f32, ctx.b.class_label.0 as f32]);
            }
            EdgeFeature::Direction { radius } => {
                let da = local_direction(&ctx.a.point_cloud, ctx.pa, radius);
                let db = local_direction(&ctx.b.point_cloud, ctx.pb, radius);
                out.push(da.dot(db) as f32);
            }
            EdgeFeature::Density { radius } => {
                out.extend([
                    local_count(&ctx.a.point_cloud, ctx.pa, radius) as f32,
                    local_count(&ctx.b.point_cloud, ctx.pb, radius) as f32,
                ]);
            }
        }
    }
}

/// Edge encoder made of an ordered list of feature blocks.
#[derive(Debug, Clone)]
pub struct ComposedEdgeEncoder {
    name: &'static str,
    features: Vec<EdgeFeature>,
}

impl ComposedEdgeEncoder {
    pub fn new(name: &'static str, features: Vec<EdgeFeature>) -> Self {
        Self { name, features }
    }

    pub fn features(&self) -> &[EdgeFeature] {
        &self.features
    }
}

impl EdgeEncoder for ComposedEdgeEncoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn width(&self) -> usize {
        self.features.iter().map(EdgeFeature::width).sum()
    }

    fn layout(&self) -> Vec<(&'static str, usize)> {
        self.features.iter().map(|f| (f.name(), f.width())).collect()
    }

    fn encode(&self, nodes: &[NodeRecord], graph: &Graph) -> Array2<f32> {
        let width = self.width();
        let mut out: Array2<f32> = Array2::zeros((graph.num_edges(), width));
        let mut row = Vec::with_capacity(width);
        for (e, &(i, j)) in graph.edges().iter().enumerate() {
            let (Some(a), Some(b)) = (nodes.get(i), nodes.get(j)) else {
                continue;
            };
            let ctx = EdgeContext::new(a, b);
            row.clear();
            for feature in &self.features {
                feature.write(&ctx, &mut row);
            }
            out.row_mut(e).assign(&aview1(row.as_slice()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassLabel;

    fn pair() -> Vec<NodeRecord> {
        vec![
            NodeRecord::new(0, ClassLabel(0)).with_points([[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]),
            NodeRecord::new(1, ClassLabel(2)).with_points([[4.0, 0.0, 0.0], [5.0, 0.0, 0.0], [6.0, 0.0, 0.0]]),
        ]
    }

    #[test]
    fn test_one_row_per_edge() {
        let enc = ComposedEdgeEncoder::new(
            "test",
            vec![
                EdgeFeature::Geometry,
                EdgeFeature::Shape,
                EdgeFeature::Direction { radius: 3.0 },
                EdgeFeature::Density { radius: 1.5 },
            ],
        );
        assert_eq!(enc.width(), 24);
        let graph = Graph::from_edges(2, [(0, 1)]);
        let x = enc.encode(&pair(), &graph);
        assert_eq!(x.dim(), (1, 24));

        let row = x.row(0).to_vec();
        assert_eq!(&row[0..10], &[1.0, 0.0, 0.0, 4.0, 0.0, 0.0, 3.0, 0.0, 0.0, 3.0]);
        assert_eq!(row[10], 1.0);
        assert!(row[11..19].iter().all(|v| *v == 0.0));
        assert_eq!(&row[19..21], &[0.0, 2.0]);
        // Both clusters run along x and point away from each other.
        assert_eq!(row[21], -1.0);
        assert_eq!(&row[22..24], &[2.0, 2.0]);
    }

    #[test]
    fn test_no_edges_no_rows() {
        let enc = ComposedEdgeEncoder::new("test", vec![EdgeFeature::Geometry]);
        let x = enc.encode(&pair(), &Graph::empty(2));
        assert_eq!(x.dim(), (0, 19));
    }
}
