//! Store-backed line-image datasets for handwriting recognition training.
//!
//! This crate provides utilities for:
//! - Reading samples from single-file key-value stores (mmap or in-memory)
//! - Randomized augmentation (elastic warp, log-scale resize)
//! - Resize/pad/normalize collation into NCHW batches
//! - CTC label encoding and decoding
//! - Random-sequential batch sampling and prefetching loaders

// Module declarations
pub mod aug;
pub mod binarize;
pub mod codec;
pub mod collate;
pub mod loader;
pub mod sampler;
pub mod source;
pub mod store;
pub mod types;
pub mod validation;
pub mod warp;

// Re-export public API
pub use aug::{AugmentConfig, AugmentationPolicy, AugmentationPolicyBuilder, ImageTransform};
pub use codec::{EncodedBatch, LabelCodec, CTC_BLANK, SEPARATOR};
pub use collate::{BatchCollator, BatchTensor, CollateConfig, CollatedBatch};
pub use loader::{BatchLoader, LoaderConfig, PrefetchLoader};
pub use sampler::{IndexSampler, RandomSequentialSampler, SequentialSampler};
pub use source::{
    CorruptReason, CorruptRecord, LabelTransform, RecordStatus, SampleSource, SourceConfig,
};
pub use store::{record_key, MemoryStore, SampleStore, ShardStore, StoreMode};
pub use types::*;
pub use validation::{
    summarize_source, summarize_with_thresholds, validate_summary, StoreSummary,
    ValidationOutcome, ValidationReport, ValidationThresholds,
};
pub use warp::{ElasticWarp, GridDistortion, MeshParams};

#[cfg(feature = "burn-runtime")]
pub use loader::BurnBatch;
