//! Batch iteration for training and validation.

use crate::aug::AugmentationPolicy;
use crate::collate::{BatchCollator, CollateConfig, CollatedBatch};
use crate::sampler::{IndexSampler, RandomSequentialSampler, SequentialSampler};
use crate::source::SampleSource;
use crate::types::{ConfigError, DatasetResult, Sample};
use crossbeam_channel::{bounded, Receiver};
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Random-sequential order (training); off yields `0..count` (validation).
    pub shuffle: bool,
    /// Drop a trailing batch smaller than `batch_size`.
    pub drop_last: bool,
    /// Seed for the epoch order; the epoch number is mixed in.
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            shuffle: true,
            drop_last: false,
            seed: None,
        }
    }
}

impl LoaderConfig {
    /// Validation variant of a training config: sequential order, keep the tail.
    pub fn for_validation(&self) -> Self {
        Self {
            shuffle: false,
            drop_last: false,
            ..self.clone()
        }
    }

    pub fn sampler(&self, count: usize) -> Result<Box<dyn IndexSampler>, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        Ok(if self.shuffle {
            Box::new(RandomSequentialSampler::new(count, self.batch_size)?)
        } else {
            Box::new(SequentialSampler::new(count))
        })
    }

    fn epoch_order(&self, sampler: &dyn IndexSampler, epoch: u64) -> Vec<usize> {
        let mut rng = match self.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch)),
            None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
        };
        sampler.indices(&mut rng)
    }

    /// Batches of an epoch order, honoring `drop_last`.
    fn chunk(&self, order: &[usize]) -> Vec<Vec<usize>> {
        order
            .chunks(self.batch_size)
            .filter(|c| !self.drop_last || c.len() == self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}

fn log_every_from_env() -> Option<usize> {
    match std::env::var("HTR_DATASET_LOG_EVERY") {
        Ok(val) => {
            if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                None
            } else {
                val.trim().parse::<usize>().ok().filter(|v| *v > 0)
            }
        }
        Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
    }
}

fn trace_path_from_env() -> Option<PathBuf> {
    std::env::var("HTR_DATASET_TRACE")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

/// Fetch and augment one batch of indices.
fn fetch_samples(
    source: &SampleSource,
    policy: &AugmentationPolicy,
    indices: &[usize],
    epoch: u64,
) -> DatasetResult<Vec<Sample>> {
    indices
        .par_iter()
        .map(|&i| source.get(i).map(|s| policy.apply_in_epoch(s, epoch)))
        .collect()
}

fn load_batch(
    source: &SampleSource,
    policy: &AugmentationPolicy,
    collator: &BatchCollator,
    indices: &[usize],
    epoch: u64,
) -> DatasetResult<CollatedBatch> {
    collator.collate(fetch_samples(source, policy, indices, epoch)?)
}

/// Sampler must cover the source and, if it builds runs, run at the batch size.
fn check_sampler(
    sampler: &dyn IndexSampler,
    count: usize,
    batch_size: usize,
) -> Result<(), ConfigError> {
    if batch_size == 0 {
        return Err(ConfigError::invalid("batch_size", "must be at least 1"));
    }
    if sampler.len() != count {
        return Err(ConfigError::invalid(
            "sampler",
            format!("covers {} indices but the source has {count}", sampler.len()),
        ));
    }
    match sampler.run_len() {
        Some(run) if run != batch_size => Err(ConfigError::invalid(
            "sampler",
            format!("runs of {run} do not match batch_size {batch_size}"),
        )),
        _ => Ok(()),
    }
}

/// Single-threaded front over a shared [`SampleSource`]; sample fetches run on rayon.
pub struct BatchLoader {
    source: Arc<SampleSource>,
    policy: AugmentationPolicy,
    collator: BatchCollator,
    sampler: Box<dyn IndexSampler>,
    cfg: LoaderConfig,
    batches: Vec<Vec<usize>>,
    cursor: usize,
    epoch: u64,
    processed_samples: usize,
    processed_batches: usize,
    started: Instant,
    total_load_time: Duration,
    total_collate_time: Duration,
    last_log: Instant,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
    trace_path: Option<PathBuf>,
    trace_file: Option<std::fs::File>,
}

impl BatchLoader {
    pub fn new(
        source: Arc<SampleSource>,
        policy: AugmentationPolicy,
        collator: BatchCollator,
        sampler: Box<dyn IndexSampler>,
        cfg: LoaderConfig,
    ) -> DatasetResult<Self> {
        check_sampler(sampler.as_ref(), source.count(), cfg.batch_size)?;
        let now = Instant::now();
        let mut loader = Self {
            source,
            policy,
            collator,
            sampler,
            cfg,
            batches: Vec::new(),
            cursor: 0,
            epoch: 0,
            processed_samples: 0,
            processed_batches: 0,
            started: now,
            total_load_time: Duration::ZERO,
            total_collate_time: Duration::ZERO,
            last_log: now,
            last_logged_samples: 0,
            log_every_samples: log_every_from_env(),
            trace_path: trace_path_from_env(),
            trace_file: None,
        };
        loader.reset(0);
        Ok(loader)
    }

    /// Loader with the sampler implied by `cfg.shuffle`.
    pub fn from_config(
        source: Arc<SampleSource>,
        policy: AugmentationPolicy,
        collate_cfg: CollateConfig,
        cfg: LoaderConfig,
    ) -> DatasetResult<Self> {
        let sampler = cfg.sampler(source.count())?;
        let collator = BatchCollator::new(collate_cfg)?;
        Self::new(source, policy, collator, sampler, cfg)
    }

    /// Write one JSON line per batch to `path` (`None` disables); overrides `HTR_DATASET_TRACE`.
    pub fn with_trace_path(mut self, path: Option<PathBuf>) -> Self {
        self.trace_path = path;
        self.trace_file = None;
        self
    }

    /// Draw a fresh order for `epoch` and rewind.
    pub fn reset(&mut self, epoch: u64) {
        let order = self.cfg.epoch_order(self.sampler.as_ref(), epoch);
        self.batches = self.cfg.chunk(&order);
        self.cursor = 0;
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Batches in the current epoch.
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn source(&self) -> &SampleSource {
        &self.source
    }

    pub fn next_batch(&mut self) -> DatasetResult<Option<CollatedBatch>> {
        let Some(indices) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;

        let t_load = Instant::now();
        let samples = fetch_samples(&self.source, &self.policy, indices, self.epoch)?;
        let load_elapsed = t_load.elapsed();
        let t_collate = Instant::now();
        let batch = self.collator.collate(samples)?;
        let collate_elapsed = t_collate.elapsed();

        self.processed_samples += batch.len();
        self.processed_batches += 1;
        self.total_load_time += load_elapsed;
        self.total_collate_time += collate_elapsed;
        self.maybe_trace(&batch, load_elapsed, collate_elapsed);
        self.maybe_log_progress();
        Ok(Some(batch))
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        let processed_since = self
            .processed_samples
            .saturating_sub(self.last_logged_samples);
        let should_log =
            processed_since >= threshold || self.last_log.elapsed() >= Duration::from_secs(30);
        if !should_log {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let batches = self.processed_batches.max(1) as f64;
        let avg_load_ms = self.total_load_time.as_secs_f64() * 1000.0 / batches;
        let avg_collate_ms = self.total_collate_time.as_secs_f64() * 1000.0 / batches;
        info!(
            epoch = self.epoch,
            batches = self.processed_batches,
            samples = self.processed_samples,
            corrupt_skipped = self.source.corrupt_skipped(),
            elapsed_s = format_args!("{secs:.1}"),
            rate = format_args!("{:.1} img/s", self.processed_samples as f32 / secs),
            avg_load_ms = format_args!("{avg_load_ms:.2}"),
            avg_collate_ms = format_args!("{avg_collate_ms:.2}"),
            "[dataset] progress"
        );
        self.last_logged_samples = self.processed_samples;
        self.last_log = Instant::now();
    }

    fn maybe_trace(
        &mut self,
        batch: &CollatedBatch,
        load_elapsed: Duration,
        collate_elapsed: Duration,
    ) {
        let Some(path) = &self.trace_path else {
            return;
        };
        if self.trace_file.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(f) => self.trace_file = Some(f),
                Err(e) => {
                    warn!(path = %path.display(), "failed to open trace file: {e}");
                    self.trace_path = None;
                    return;
                }
            }
        }
        let Some(file) = self.trace_file.as_mut() else {
            return;
        };
        let [_, channels, height, width] = batch.images.shape;
        let record = serde_json::json!({
            "epoch": self.epoch,
            "batch": self.processed_batches,
            "samples": batch.len(),
            "channels": channels,
            "width": width,
            "height": height,
            "max_label_chars": batch.labels.iter().map(|l| l.chars().count()).max().unwrap_or(0),
            "corrupt_skipped_total": self.source.corrupt_skipped(),
            "load_ms": load_elapsed.as_secs_f64() * 1000.0,
            "collate_ms": collate_elapsed.as_secs_f64() * 1000.0,
            "timestamp_ms": self.started.elapsed().as_millis() as u64
        });
        if let Err(e) = writeln!(file, "{}", record) {
            warn!("failed to write trace record: {e}");
            self.trace_path = None;
            self.trace_file = None;
        }
    }
}

impl Iterator for BatchLoader {
    type Item = DatasetResult<CollatedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// Batches produced by worker threads, each reading through its own [`SampleSource`].
///
/// Batches of one epoch are dealt round-robin to the workers and arrive in completion
/// order. Dropping the loader stops the workers at their next send.
pub struct PrefetchLoader {
    rx: Option<Receiver<DatasetResult<CollatedBatch>>>,
    workers: Vec<JoinHandle<()>>,
    num_batches: usize,
}

impl PrefetchLoader {
    /// `factory` opens a source per worker. `prefetch` bounds the batches in flight.
    pub fn spawn<F>(
        factory: F,
        policy: AugmentationPolicy,
        collate_cfg: CollateConfig,
        cfg: LoaderConfig,
        epoch: u64,
        workers: usize,
        prefetch: usize,
    ) -> DatasetResult<Self>
    where
        F: Fn() -> DatasetResult<SampleSource> + Send + Sync + 'static,
    {
        let first = factory()?;
        let sampler = cfg.sampler(first.count())?;
        let collator = BatchCollator::new(collate_cfg)?;
        let batches = cfg.chunk(&cfg.epoch_order(sampler.as_ref(), epoch));
        let num_batches = batches.len();
        let workers = workers.max(1);

        let mut shares: Vec<Vec<Vec<usize>>> = vec![Vec::new(); workers];
        for (i, batch) in batches.into_iter().enumerate() {
            shares[i % workers].push(batch);
        }

        let (tx, rx) = bounded(prefetch.max(1));
        let factory = Arc::new(factory);
        let mut first = Some(first);
        let mut handles = Vec::with_capacity(workers);
        for (worker, share) in shares.into_iter().enumerate() {
            let tx = tx.clone();
            let factory = factory.clone();
            let policy = policy.clone();
            let collator = collator.clone();
            let own = first.take();
            handles.push(thread::spawn(move || {
                let source = match own.map(Ok).unwrap_or_else(|| factory()) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                for indices in share {
                    let res = load_batch(&source, &policy, &collator, &indices, epoch);
                    let failed = res.is_err();
                    if tx.send(res).is_err() {
                        break;
                    }
                    if failed {
                        warn!(worker, "prefetch worker stopping after error");
                        break;
                    }
                }
            }));
        }
        Ok(Self {
            rx: Some(rx),
            workers: handles,
            num_batches,
        })
    }

    /// Batches scheduled for the epoch (fewer arrive if a worker fails).
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for PrefetchLoader {
    type Item = DatasetResult<CollatedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        self.rx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Collated images plus CTC targets as burn tensors.
#[cfg(feature = "burn-runtime")]
pub struct BurnBatch<B: burn::tensor::backend::Backend> {
    pub images: burn::tensor::Tensor<B, 4>,
    pub targets: burn::tensor::Tensor<B, 1, burn::tensor::Int>,
    pub target_lengths: burn::tensor::Tensor<B, 1, burn::tensor::Int>,
}

#[cfg(feature = "burn-runtime")]
impl CollatedBatch {
    pub fn to_burn<B: burn::tensor::backend::Backend>(
        &self,
        codec: &crate::codec::LabelCodec,
        device: &B::Device,
    ) -> DatasetResult<BurnBatch<B>> {
        let encoded = codec.encode_batch(&self.labels)?;
        let (targets, target_lengths) = encoded.to_burn::<B>(device);
        Ok(BurnBatch {
            images: self.images.to_burn::<B>(device),
            targets,
            target_lengths,
        })
    }
}
