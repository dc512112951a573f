//! Epoch index orders.

use crate::types::ConfigError;
use rand::Rng;

/// Produces the index order of one epoch.
pub trait IndexSampler: Send {
    /// Number of indices yielded per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn indices(&self, rng: &mut dyn rand::RngCore) -> Vec<usize>;

    /// Length of the contiguous runs the order is built from, if the sampler uses them.
    /// A loader must batch with the same size or runs straddle batches.
    fn run_len(&self) -> Option<usize> {
        None
    }
}

/// `0..count` in order (validation passes).
#[derive(Debug, Clone, Copy)]
pub struct SequentialSampler {
    count: usize,
}

impl SequentialSampler {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl IndexSampler for SequentialSampler {
    fn len(&self) -> usize {
        self.count
    }

    fn indices(&self, _rng: &mut dyn rand::RngCore) -> Vec<usize> {
        (0..self.count).collect()
    }
}

/// Contiguous runs of `batch_size` indices starting at random offsets.
///
/// Every run, the tail included, starts at an independent uniform draw from
/// `[0, count - batch_size]`. Runs may overlap, so an epoch is not a
/// permutation; neighbouring records (often from the same page) land in the
/// same batch.
#[derive(Debug, Clone, Copy)]
pub struct RandomSequentialSampler {
    count: usize,
    batch_size: usize,
}

impl RandomSequentialSampler {
    pub fn new(count: usize, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        Ok(Self { count, batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl IndexSampler for RandomSequentialSampler {
    fn len(&self) -> usize {
        self.count
    }

    fn indices(&self, rng: &mut dyn rand::RngCore) -> Vec<usize> {
        let max_start = self.count.saturating_sub(self.batch_size);
        let full = self.count / self.batch_size;
        let tail = self.count % self.batch_size;
        let mut out = Vec::with_capacity(self.count);
        let runs = std::iter::repeat(self.batch_size)
            .take(full)
            .chain((tail > 0).then_some(tail));
        for run in runs {
            let start = rng.random_range(0..=max_start);
            out.extend(start..start + run);
        }
        out
    }

    fn run_len(&self) -> Option<usize> {
        Some(self.batch_size)
    }
}
