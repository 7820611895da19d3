//! Batch index policies.
//!
//! A sampler turns a dataset size into the index batches of one epoch.
//! Only full batches are produced; the remainder of an epoch is dropped.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ConfigNode, Kind, Schema};
use crate::registry::{BuildContext, Registry};
use crate::{Error, Result};

pub trait Sampler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index batches of epoch `epoch` over a source of `data_size` events.
    fn batches(&self, data_size: usize, batch_size: usize, epoch: u64) -> Result<Vec<Vec<usize>>>;
}

/// Events actually sampled: `n_events` caps the source size. Fails on an
/// empty source or a batch that cannot be filled.
fn effective_size(data_size: usize, n_events: Option<usize>, batch_size: usize) -> Result<usize> {
    let size = n_events.map_or(data_size, |n| n.min(data_size));
    if size == 0 {
        return Err(Error::NoData("no events to sample from".into()));
    }
    if batch_size == 0 || batch_size > size {
        return Err(Error::Config(format!("batch size {batch_size} is invalid for {size} events")));
    }
    Ok(size)
}

/// Contiguous runs of `batch_size` indices, each starting at a uniformly
/// drawn offset. One epoch holds `size / batch_size` runs.
#[derive(Debug, Clone)]
pub struct RandomSequence {
    seed: u64,
    n_events: Option<usize>,
}

impl RandomSequence {
    pub fn new(seed: u64, n_events: Option<usize>) -> Self {
        Self { seed, n_events }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Sampler for RandomSequence {
    fn name(&self) -> &'static str {
        "random_sequence"
    }

    fn batches(&self, data_size: usize, batch_size: usize, epoch: u64) -> Result<Vec<Vec<usize>>> {
        let size = effective_size(data_size, self.n_events, batch_size)?;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
        Ok((0..size / batch_size)
            .map(|_| {
                let start = rng.gen_range(0..=size - batch_size);
                (start..start + batch_size).collect()
            })
            .collect())
    }
}

/// Consecutive, non-overlapping batches in index order.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    n_events: Option<usize>,
}

impl Sequential {
    pub fn new(n_events: Option<usize>) -> Self {
        Self { n_events }
    }
}

impl Sampler for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn batches(&self, data_size: usize, batch_size: usize, _epoch: u64) -> Result<Vec<Vec<usize>>> {
        let size = effective_size(data_size, self.n_events, batch_size)?;
        Ok((0..size / batch_size)
            .map(|b| (b * batch_size..(b + 1) * batch_size).collect())
            .collect())
    }
}

// ============================================================================
// Registration
// ============================================================================

fn n_events(params: &ConfigNode) -> Option<usize> {
    params.field("n_events").and_then(ConfigNode::as_int).map(|n| n as usize)
}

fn build_random_sequence(params: &ConfigNode, ctx: &BuildContext) -> Result<Box<dyn Sampler>> {
    let seed = match params.field("seed").and_then(ConfigNode::as_int) {
        Some(-1) => rand::random(),
        Some(seed) => seed as u64,
        None => ctx.seed.unwrap_or_else(rand::random),
    };
    tracing::debug!(seed, "random_sequence sampler seeded");
    Ok(Box::new(RandomSequence::new(seed, n_events(params))))
}

fn build_sequential(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn Sampler>> {
    Ok(Box::new(Sequential::new(n_events(params))))
}

pub fn register_defaults(reg: &mut Registry<dyn Sampler>) {
    reg.register(
        "random_sequence",
        Schema::closed()
            .optional("seed", Kind::int_min(-1))
            .nullable("n_events", Kind::int_min(1)),
        build_random_sequence,
    )
    .alias("RandomSequenceSampler", "random_sequence")
    .register("sequential", Schema::closed().nullable("n_events", Kind::int_min(1)), build_sequential)
    .alias("SequentialBatchSampler", "sequential");
}
