//! Read-only keyed byte-blob stores backing a [`crate::SampleSource`].

use crate::types::{StoreError, StoreResult};
use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Key holding the total record count as a decimal string.
pub const NUM_SAMPLES_KEY: &str = "num-samples";
pub const IMAGE_ROLE: &str = "image";
pub const LABEL_ROLE: &str = "label";
pub const FILE_ROLE: &str = "file";
/// Default auxiliary channel roles (binarization hints).
pub const DEFAULT_AUX_ROLES: [&str; 2] = ["howe-image", "simplebin-image"];

pub const SHARD_MAGIC: &[u8; 4] = b"HKV1";
pub const SHARD_VERSION: u32 = 1;
pub const SHARD_HEADER_LEN: usize = 32;
/// Index record with an empty key: `key_len u32 | offset u64 | len u64`.
const MIN_INDEX_RECORD_LEN: usize = 20;

/// `<role>-<9-digit zero padded index>`; record indices are 1-based.
pub fn record_key(role: &str, key_index: usize) -> String {
    format!("{role}-{key_index:09}")
}

/// Keyed byte-blob lookup. Implementations are read-only and safe to share across readers.
pub trait SampleStore: Send + Sync {
    fn get(&self, key: &str) -> Option<&[u8]>;
    fn entries(&self) -> usize;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Whole file read into memory at open.
    InMemory,
    /// Memory-mapped (low RAM, fast random access on most systems).
    Mmap,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::Mmap
    }
}

impl StoreMode {
    /// Reads `HTR_STORE_MODE`; unset or unrecognized values fall back to the default.
    pub fn from_env() -> Self {
        std::env::var("HTR_STORE_MODE")
            .ok()
            .and_then(|v| StoreMode::parse(&v))
            .unwrap_or_default()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inmemory" | "in-memory" | "memory" => Some(StoreMode::InMemory),
            "mmap" => Some(StoreMode::Mmap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::InMemory => "inmemory",
            StoreMode::Mmap => "mmap",
        }
    }
}

/// Hash-map backed store, mostly for tests and synthetic data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }
}

impl SampleStore for MemoryStore {
    fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    fn entries(&self) -> usize {
        self.entries.len()
    }

    fn describe(&self) -> String {
        format!("memory store ({} entries)", self.entries.len())
    }
}

enum ShardBacking {
    Owned(Vec<u8>),
    Mmap(memmap2::Mmap),
}

impl ShardBacking {
    fn bytes(&self) -> &[u8] {
        match self {
            ShardBacking::Owned(data) => data,
            ShardBacking::Mmap(mmap) => &mmap[..],
        }
    }
}

/// Single-file `HKV1` store.
///
/// Layout (little endian): `magic[4] | version u32 | entries u64 | index_offset u64 |
/// data_offset u64`, then at `index_offset` one record per entry:
/// `key_len u32 | key | offset u64 | len u64`, offsets relative to `data_offset`.
pub struct ShardStore {
    path: PathBuf,
    mode: StoreMode,
    backing: ShardBacking,
    index: HashMap<String, (usize, usize)>,
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("entries", &self.index.len())
            .finish()
    }
}

impl ShardStore {
    pub fn open(path: &Path, mode: StoreMode) -> StoreResult<Self> {
        let backing = match mode {
            StoreMode::InMemory => ShardBacking::Owned(fs::read(path).map_err(|e| {
                StoreError::Open {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?),
            StoreMode::Mmap => {
                let file = File::open(path).map_err(|e| StoreError::Open {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                // The file is opened read-only and never written through this mapping.
                let mmap = unsafe {
                    MmapOptions::new().map(&file).map_err(|e| StoreError::Open {
                        path: path.to_path_buf(),
                        source: e,
                    })?
                };
                ShardBacking::Mmap(mmap)
            }
        };
        let index = parse_index(path, backing.bytes())?;
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            backing,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }
}

impl SampleStore for ShardStore {
    fn get(&self, key: &str) -> Option<&[u8]> {
        let &(start, len) = self.index.get(key)?;
        self.backing.bytes().get(start..start + len)
    }

    fn entries(&self) -> usize {
        self.index.len()
    }

    fn describe(&self) -> String {
        format!(
            "{} ({}, {} entries)",
            self.path.display(),
            self.mode.as_str(),
            self.index.len()
        )
    }
}

fn read_u32_le(data: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(data);
    u32::from_le_bytes(arr)
}

fn read_u64_le(data: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(data);
    u64::from_le_bytes(arr)
}

/// `len` bytes at `*cursor`, advancing the cursor; `None` on overflow or past the end.
fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = cursor.checked_add(len)?;
    let bytes = data.get(*cursor..end)?;
    *cursor = end;
    Some(bytes)
}

/// Map of key to absolute `(start, len)` within the file.
fn parse_index(path: &Path, data: &[u8]) -> StoreResult<HashMap<String, (usize, usize)>> {
    let format_err = |msg: String| StoreError::Format {
        path: path.to_path_buf(),
        msg,
    };
    if data.len() < SHARD_HEADER_LEN {
        return Err(format_err(format!("file too small ({} bytes)", data.len())));
    }
    if &data[0..4] != SHARD_MAGIC {
        return Err(format_err("bad magic".into()));
    }
    let version = read_u32_le(&data[4..8]);
    if version != SHARD_VERSION {
        return Err(format_err(format!("unsupported version {version}")));
    }
    let entries = read_u64_le(&data[8..16]) as usize;
    let index_offset = read_u64_le(&data[16..24]) as usize;
    let data_offset = read_u64_le(&data[24..32]) as usize;
    if data_offset > data.len() {
        return Err(format_err(format!("data offset {data_offset} past end of file")));
    }
    if index_offset > data.len() {
        return Err(format_err(format!("index offset {index_offset} past end of file")));
    }
    let payload_len = data.len() - data_offset;
    let max_entries = (data.len() - index_offset) / MIN_INDEX_RECORD_LEN;
    if entries > max_entries {
        return Err(format_err(format!(
            "header claims {entries} entries but the index region fits at most {max_entries}"
        )));
    }

    let mut index = HashMap::with_capacity(entries);
    let mut cursor = index_offset;
    for i in 0..entries {
        let truncated = || format_err(format!("index truncated at entry {i}"));
        let key_len = take(data, &mut cursor, 4).map(read_u32_le).ok_or_else(truncated)? as usize;
        let key_bytes = take(data, &mut cursor, key_len).ok_or_else(truncated)?;
        let key = std::str::from_utf8(key_bytes)
            .map_err(|e| format_err(format!("entry {i} key is not utf-8: {e}")))?
            .to_string();
        let offset = take(data, &mut cursor, 8).map(read_u64_le).ok_or_else(truncated)? as usize;
        let len = take(data, &mut cursor, 8).map(read_u64_le).ok_or_else(truncated)? as usize;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| format_err(format!("entry {key} length overflow")))?;
        if end > payload_len {
            return Err(format_err(format!(
                "entry {key} spans {offset}..{end} past payload of {payload_len} bytes"
            )));
        }
        index.insert(key, (data_offset + offset, len));
    }
    Ok(index)
}
