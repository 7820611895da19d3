//! # Event Data Model
//!
//! Clean DTOs that flow through the pipeline: parsers produce them, graph
//! construction and feature encoding read them, losses compare against them.
//!
//! Design rule: no registry types, no config types here.
//! This module is pure data: no I/O, no async.

pub mod node;
pub mod sample;
pub mod graph;

pub use node::{ClassLabel, ClassSet, NodeRecord, Point3};
pub use sample::{
    Meta, ParticleRecord, PointSet, Product, ProductKind, Provenance, RunInfo, Sample,
};
pub use graph::Graph;
