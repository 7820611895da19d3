//! Batch loader: sampler-driven draws parsed by a bounded worker pool.
//!
//! ```text
//! next_batch()
//!   ├─ no open epoch → len(source) == 0 ? Err(NoData) : sampler.batches(epoch)
//!   ├─ epoch drained → Ok(None), next call opens epoch + 1
//!   └─ indices ─▶ [worker] [worker] ... (≤ num_workers) ─▶ barrier ─▶ collate ─▶ Batch
//! ```
//!
//! A sample that fails to parse is logged, counted and left out of its
//! batch. Every other error ends the draw.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{Batch, Collate, DatasetPipeline, Sampler};
use crate::model::Sample;
use crate::{Error, Result};

/// Loader counters, read at any time and reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderStats {
    pub epochs: u64,
    pub batches: u64,
    pub samples: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    epochs: AtomicU64,
    batches: AtomicU64,
    samples: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LoaderStats {
        LoaderStats {
            epochs: self.epochs.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct Loader {
    dataset: Arc<DatasetPipeline>,
    sampler: Arc<dyn Sampler>,
    collate: Arc<dyn Collate>,
    batch_size: usize,
    num_workers: usize,
    /// Epoch currently open, if any.
    epoch: Option<u64>,
    next_epoch: u64,
    pending: VecDeque<Vec<usize>>,
    counters: Arc<Counters>,
}

impl Loader {
    pub fn new(
        dataset: Arc<DatasetPipeline>,
        sampler: Arc<dyn Sampler>,
        collate: Arc<dyn Collate>,
        batch_size: usize,
        num_workers: usize,
    ) -> Self {
        Self {
            dataset,
            sampler,
            collate,
            batch_size,
            num_workers,
            epoch: None,
            next_epoch: 0,
            pending: VecDeque::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> LoaderStats {
        self.counters.snapshot()
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Next batch of the open epoch, opening one if needed.
    ///
    /// `Ok(None)` marks the end of an epoch. `Err(NoData)` means the source
    /// holds nothing to draw from.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => self.open_epoch().await?,
        };
        let Some(indices) = self.pending.pop_front() else {
            tracing::debug!(epoch, "epoch drained");
            self.epoch = None;
            return Ok(None);
        };

        let (samples, skipped) = self.load_all(&indices).await?;
        let index = self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);

        let mut batch = Batch { index, epoch, samples, skipped, ..Default::default() };
        self.collate.collate(&mut batch);
        Ok(Some(batch))
    }

    async fn open_epoch(&mut self) -> Result<u64> {
        let size = self.dataset.len().await?;
        if size == 0 {
            return Err(Error::NoData("the dataset holds no events".into()));
        }
        let epoch = self.next_epoch;
        let batches = self.sampler.batches(size, self.batch_size, epoch)?;
        tracing::info!(epoch, events = size, batches = batches.len(), sampler = self.sampler.name(), "opened epoch");
        self.pending = batches.into();
        self.epoch = Some(epoch);
        self.next_epoch += 1;
        self.counters.epochs.fetch_add(1, Ordering::Relaxed);
        Ok(epoch)
    }

    /// Parse every index of one draw. Returns samples in draw order and the
    /// number skipped.
    async fn load_all(&self, indices: &[usize]) -> Result<(Vec<Sample>, usize)> {
        let results = if self.num_workers == 0 {
            let mut results = Vec::with_capacity(indices.len());
            for &i in indices {
                results.push(self.dataset.load(i).await);
            }
            results
        } else {
            self.load_parallel(indices).await?
        };

        let mut samples = Vec::with_capacity(results.len());
        let mut skipped = 0;
        for result in results {
            match result {
                Ok(sample) => samples.push(sample),
                Err(Error::SampleParse { index, message }) => {
                    tracing::warn!(index, %message, "skipping malformed sample");
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((samples, skipped))
    }

    async fn load_parallel(&self, indices: &[usize]) -> Result<Vec<Result<Sample>>> {
        let permits = Arc::new(Semaphore::new(self.num_workers));
        let mut tasks = JoinSet::new();
        for (slot, &index) in indices.iter().enumerate() {
            let permits = Arc::clone(&permits);
            let dataset = Arc::clone(&self.dataset);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (slot, dataset.load(index).await)
            });
        }

        let mut results: Vec<Option<Result<Sample>>> = indices.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (slot, result) = joined.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            results[slot] = Some(result);
        }
        Ok(results.into_iter().flatten().collect())
    }
}
