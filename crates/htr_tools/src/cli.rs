use clap::Args;
use htr_dataset::StoreMode;
use std::path::PathBuf;

use crate::ToolConfig;

/// Store selection shared by the dataset binaries. Flags override the tools config.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Store file (`HKV1`).
    #[arg(long)]
    pub store: Option<PathBuf>,
    /// How the store file is opened.
    #[arg(long, value_parser = ["inmemory", "mmap"])]
    pub mode: Option<String>,
    /// Stack the two auxiliary binarization channels (RGB composite).
    #[arg(long, default_value_t = false)]
    pub multi_channel: bool,
    /// Do not read labels.
    #[arg(long, default_value_t = false)]
    pub test_mode: bool,
    /// Pretend the store holds `--debug-cap` samples.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long)]
    pub debug_cap: Option<usize>,
    /// Derive missing auxiliary channels by Sauvola binarization with this window.
    #[arg(long)]
    pub derive_aux_window: Option<u32>,
    /// Tools config file (defaults to $HTR_TOOLS_CONFIG or ./htr-tools.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl StoreArgs {
    /// Load the tools config (explicit `--config` must parse) and apply the flags on top.
    pub fn resolve(&self) -> anyhow::Result<ToolConfig> {
        let mut cfg = match &self.config {
            Some(path) => ToolConfig::try_from_path(path)?,
            None => ToolConfig::load(),
        };
        self.apply(&mut cfg);
        Ok(cfg)
    }

    pub fn apply(&self, cfg: &mut ToolConfig) {
        if let Some(store) = &self.store {
            cfg.store_path = Some(store.clone());
        }
        match self.mode.as_deref() {
            Some("inmemory") => cfg.source.store_mode = StoreMode::InMemory,
            Some("mmap") => cfg.source.store_mode = StoreMode::Mmap,
            _ => {}
        }
        cfg.source.multi_channel |= self.multi_channel;
        cfg.source.test_mode |= self.test_mode;
        cfg.source.debug |= self.debug;
        if let Some(cap) = self.debug_cap {
            cfg.source.debug_cap = cap;
        }
        if let Some(window) = self.derive_aux_window {
            cfg.source.derive_missing_aux = Some(window);
        }
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
