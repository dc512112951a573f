use std::path::{Path, PathBuf};

use anyhow::Context;
use htr_dataset::{AugmentConfig, CollateConfig, LabelCodec, LoaderConfig, SourceConfig, StoreMode};
use serde::Deserialize;
use tracing::warn;

const DEFAULT_CONFIG_NAME: &str = "htr-tools.toml";
/// Character set of the usual English line-level handwriting corpora.
pub const DEFAULT_ALPHABET: &str =
    " !\"#&'()*+,-./0123456789:;?ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Store file; tools refuse to run without one (flag or config).
    pub store_path: Option<PathBuf>,
    pub source: SourceConfig,
    pub augment: AugmentConfig,
    pub collate: CollateConfig,
    pub loader: LoaderConfig,
    pub alphabet: String,
    pub ignore_case: bool,
    /// Prefetch worker threads (0 keeps loading on the calling thread).
    pub workers: usize,
    /// Batches in flight per prefetch loader.
    pub prefetch: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            source: SourceConfig::default(),
            augment: AugmentConfig::default(),
            collate: CollateConfig::default(),
            loader: LoaderConfig::default(),
            alphabet: DEFAULT_ALPHABET.to_string(),
            ignore_case: false,
            workers: 0,
            prefetch: 4,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ToolConfigFile {
    store: Option<StoreSection>,
    augment: Option<AugmentConfig>,
    collate: Option<CollateConfig>,
    codec: Option<CodecSection>,
    loader: Option<LoaderSection>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreSection {
    path: Option<String>,
    mode: Option<StoreMode>,
    multi_channel: Option<bool>,
    aux_roles: Option<[String; 2]>,
    test_mode: Option<bool>,
    debug: Option<bool>,
    debug_cap: Option<usize>,
    max_corrupt_skips: Option<usize>,
    derive_missing_aux: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CodecSection {
    alphabet: Option<String>,
    /// File whose contents (newlines stripped) form the alphabet; wins over `alphabet`.
    alphabet_file: Option<String>,
    ignore_case: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct LoaderSection {
    batch_size: Option<usize>,
    shuffle: Option<bool>,
    drop_last: Option<bool>,
    seed: Option<u64>,
    workers: Option<usize>,
    prefetch: Option<usize>,
}

impl ToolConfig {
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("HTR_TOOLS_CONFIG") {
            let cfg = Self::from_path(Path::new(&path)).unwrap_or_default();
            cfg.warn_if_invalid();
            return cfg;
        }
        let cfg = Self::from_path(Path::new(DEFAULT_CONFIG_NAME)).unwrap_or_default();
        cfg.warn_if_invalid();
        cfg
    }

    /// `None` when the file is absent or unreadable.
    pub fn from_path(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::try_from_path(path) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!("tools config: ignoring {}: {e:#}", path.display());
                None
            }
        }
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading tools config {}", path.display()))?;
        let file: ToolConfigFile = toml::from_str(&raw)
            .with_context(|| format!("parsing tools config {}", path.display()))?;
        Self::from_file(file)
    }

    fn from_file(file: ToolConfigFile) -> anyhow::Result<Self> {
        let defaults = ToolConfig::default();
        let store = file.store.unwrap_or_default();
        let source_defaults = defaults.source;
        let source = SourceConfig {
            multi_channel: store.multi_channel.unwrap_or(source_defaults.multi_channel),
            aux_roles: store.aux_roles.unwrap_or(source_defaults.aux_roles),
            test_mode: store.test_mode.unwrap_or(source_defaults.test_mode),
            debug: store.debug.unwrap_or(source_defaults.debug),
            debug_cap: store.debug_cap.unwrap_or(source_defaults.debug_cap),
            max_corrupt_skips: store
                .max_corrupt_skips
                .unwrap_or(source_defaults.max_corrupt_skips),
            derive_missing_aux: store.derive_missing_aux.or(source_defaults.derive_missing_aux),
            store_mode: store.mode.unwrap_or(source_defaults.store_mode),
        };

        let codec = file.codec.unwrap_or_default();
        let alphabet = match codec.alphabet_file.map(|v| expand_path(&v)) {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("reading alphabet file {}", path.display()))?
                .chars()
                .filter(|c| *c != '\n' && *c != '\r')
                .collect(),
            None => codec.alphabet.unwrap_or(defaults.alphabet),
        };

        let loader = file.loader.unwrap_or_default();
        let loader_defaults = defaults.loader;

        Ok(ToolConfig {
            store_path: store.path.map(|v| expand_path(&v)),
            source,
            augment: file.augment.unwrap_or(defaults.augment),
            collate: file.collate.unwrap_or(defaults.collate),
            loader: LoaderConfig {
                batch_size: loader.batch_size.unwrap_or(loader_defaults.batch_size),
                shuffle: loader.shuffle.unwrap_or(loader_defaults.shuffle),
                drop_last: loader.drop_last.unwrap_or(loader_defaults.drop_last),
                seed: loader.seed.or(loader_defaults.seed),
            },
            alphabet,
            ignore_case: codec.ignore_case.unwrap_or(defaults.ignore_case),
            workers: loader.workers.unwrap_or(defaults.workers),
            prefetch: loader.prefetch.unwrap_or(defaults.prefetch),
        })
    }

    pub fn codec(&self) -> LabelCodec {
        LabelCodec::new(&self.alphabet, self.ignore_case)
    }

    fn warn_if_invalid(&self) {
        if self.store_path.is_none() {
            warn!("tools config: store.path is unset; pass --store to each tool");
        }
        if self.alphabet.is_empty() {
            warn!("tools config: codec alphabet is empty; every non-empty label is unencodable");
        }
        if self.collate.img_height == 0 {
            warn!("tools config: collate.img_height is 0; batching will fail");
        }
        if self.loader.batch_size == 0 {
            warn!("tools config: loader.batch_size is 0; batching will fail");
        }
        if let Err(e) = self.augment.validate() {
            warn!("tools config: augment section rejected: {e}");
        }
    }
}

fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

/// Replace `${VAR}` with its value; unknown variables are left as written.
pub(crate) fn expand_env(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = &rest[start + 2..start + 2 + end];
        match std::env::var(key) {
            Ok(val) => out.push_str(&val),
            Err(_) => out.push_str(&rest[start..start + 3 + end]),
        }
        rest = &rest[start + 3 + end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_substitutes_known_variables() {
        std::env::set_var("HTR_TOOLS_TEST_ROOT", "/data/iam");
        assert_eq!(expand_env("${HTR_TOOLS_TEST_ROOT}/lines.hkv"), "/data/iam/lines.hkv");
        assert_eq!(expand_env("${HTR_TOOLS_UNSET_VAR}/x"), "${HTR_TOOLS_UNSET_VAR}/x");
        assert_eq!(expand_env("plain/ä/${unterminated"), "plain/ä/${unterminated");
    }
}
