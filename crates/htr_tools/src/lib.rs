pub mod cli;
pub mod config;

pub use cli::{init_tracing, StoreArgs};
pub use config::{ToolConfig, DEFAULT_ALPHABET};

use anyhow::Context;
use htr_dataset::SampleSource;

/// Open the configured store, failing with a readable message when none is set.
pub fn open_source(cfg: &ToolConfig) -> anyhow::Result<SampleSource> {
    let path = cfg
        .store_path
        .as_deref()
        .context("no store given; pass --store or set store.path in the tools config")?;
    SampleSource::open(path, cfg.source.clone())
        .with_context(|| format!("opening store {}", path.display()))
}
