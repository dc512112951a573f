//! Record retrieval: decode, channel composition and corrupt-record recovery.

use crate::binarize;
use crate::store::{
    record_key, SampleStore, ShardStore, StoreMode, DEFAULT_AUX_ROLES, FILE_ROLE, IMAGE_ROLE,
    LABEL_ROLE, NUM_SAMPLES_KEY,
};
use crate::types::{dense_channels, DatasetError, DatasetResult, RawSample, Sample};
use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Background fill used when padding auxiliary channels.
pub const PAD_FILL: u8 = 255;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Stack two auxiliary channels behind the primary image (RGB composite).
    pub multi_channel: bool,
    /// Key roles of the two auxiliary channels.
    pub aux_roles: [String; 2],
    /// Withhold labels (every sample gets an empty label).
    pub test_mode: bool,
    /// Report `debug_cap` as the sample count instead of the stored count.
    pub debug: bool,
    pub debug_cap: usize,
    /// Corrupt records skipped in a row before `get` gives up.
    pub max_corrupt_skips: usize,
    /// When set, a missing auxiliary key is replaced by a Sauvola binarization of the
    /// primary with this window instead of failing.
    pub derive_missing_aux: Option<u32>,
    pub store_mode: StoreMode,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            multi_channel: false,
            aux_roles: DEFAULT_AUX_ROLES.map(String::from),
            test_mode: false,
            debug: false,
            debug_cap: 1000,
            max_corrupt_skips: 32,
            derive_missing_aux: None,
            store_mode: StoreMode::from_env(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CorruptReason {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("auxiliary {aux:?} larger than primary {primary:?}")]
    OversizedAuxiliary { aux: (u32, u32), primary: (u32, u32) },
}

#[derive(Debug, Error)]
#[error("corrupt record at {key}: {reason}")]
pub struct CorruptRecord {
    pub key: String,
    pub reason: CorruptReason,
}

/// Outcome of reading a single record without recovery.
#[derive(Debug)]
pub enum RecordStatus {
    Ok(RawSample),
    Corrupt(CorruptRecord),
}

/// Rewrites a label after it is read (case folding, charset mapping).
pub type LabelTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Store-backed sample source. Owns its store handle; safe to share between reader threads.
pub struct SampleSource {
    store: Box<dyn SampleStore>,
    cfg: SourceConfig,
    count: usize,
    corrupt_skipped: AtomicUsize,
    label_transform: Option<LabelTransform>,
    first_decoded: AtomicBool,
}

impl std::fmt::Debug for SampleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleSource")
            .field("store", &self.store.describe())
            .field("count", &self.count)
            .field("cfg", &self.cfg)
            .field("label_transform", &self.label_transform.is_some())
            .finish()
    }
}

impl SampleSource {
    /// Open a `HKV1` store file. Failure to open is fatal for the run.
    pub fn open(path: &Path, cfg: SourceConfig) -> DatasetResult<Self> {
        let store = ShardStore::open(path, cfg.store_mode)?;
        Self::new(Box::new(store), cfg)
    }

    pub fn new(store: Box<dyn SampleStore>, cfg: SourceConfig) -> DatasetResult<Self> {
        if let Some(window) = cfg.derive_missing_aux {
            binarize::validate_window(window)?;
        }
        let count = if cfg.debug {
            cfg.debug_cap
        } else {
            read_count(store.as_ref())?
        };
        debug!(store = %store.describe(), count, "opened sample source");
        Ok(Self {
            store,
            cfg,
            count,
            corrupt_skipped: AtomicUsize::new(0),
            label_transform: None,
            first_decoded: AtomicBool::new(false),
        })
    }

    /// Apply `transform` to every label read, withheld (empty) test-mode labels included.
    pub fn with_label_transform(mut self, transform: LabelTransform) -> Self {
        self.label_transform = Some(transform);
        self
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn config(&self) -> &SourceConfig {
        &self.cfg
    }

    pub fn store(&self) -> &dyn SampleStore {
        self.store.as_ref()
    }

    /// Corrupt records skipped by `get` over the source's lifetime.
    pub fn corrupt_skipped(&self) -> usize {
        self.corrupt_skipped.load(Ordering::Relaxed)
    }

    /// Sample for the 0-based `index` (store keys use `index + 1`).
    ///
    /// Corrupt records are skipped by advancing to the next index, so the returned
    /// sample's `ordinal` may be greater than `index`. Running past `count()` or past
    /// `max_corrupt_skips` is an error.
    pub fn get(&self, index: usize) -> DatasetResult<Sample> {
        let mut ordinal = index;
        let mut skipped = 0usize;
        loop {
            match self.inspect(ordinal)? {
                RecordStatus::Ok(raw) => {
                    if skipped > 0 {
                        debug!(requested = index, ordinal, skipped, "recovered past corrupt records");
                    }
                    let sample = raw.compose();
                    if !self.first_decoded.swap(true, Ordering::Relaxed) {
                        debug!(
                            ordinal = sample.ordinal,
                            width = sample.image.width(),
                            height = sample.image.height(),
                            channels = dense_channels(&sample.image),
                            "first decoded sample"
                        );
                    }
                    return Ok(sample);
                }
                RecordStatus::Corrupt(fault) => {
                    warn!(index = ordinal, key = %fault.key, reason = %fault.reason, "corrupt record, advancing to next index");
                    self.corrupt_skipped.fetch_add(1, Ordering::Relaxed);
                    skipped += 1;
                    if skipped > self.cfg.max_corrupt_skips {
                        return Err(DatasetError::TooManyCorrupt {
                            start: index,
                            skipped,
                        });
                    }
                    ordinal += 1;
                }
            }
        }
    }

    /// Read one record without recovery.
    pub fn inspect(&self, index: usize) -> DatasetResult<RecordStatus> {
        if index >= self.count {
            return Err(DatasetError::IndexOutOfRange {
                index,
                count: self.count,
            });
        }
        let key_index = index + 1;
        let image_key = record_key(IMAGE_ROLE, key_index);
        let primary = match decode_gray(self.lookup(&image_key)?) {
            Ok(img) => img,
            Err(e) => return Ok(corrupt(image_key, e.into())),
        };

        let mut secondary = Vec::new();
        if self.cfg.multi_channel {
            for role in &self.cfg.aux_roles {
                let key = record_key(role, key_index);
                let aux = match (self.store.get(&key), self.cfg.derive_missing_aux) {
                    (Some(bytes), _) => match decode_gray(bytes) {
                        Ok(img) => img,
                        Err(e) => return Ok(corrupt(key, e.into())),
                    },
                    (None, Some(window)) => binarize::sauvola(&primary, window)?,
                    (None, None) => return Err(DatasetError::MissingKey { key }),
                };
                match pad_to_match(aux, primary.dimensions()) {
                    Ok(aux) => secondary.push(aux),
                    Err(reason) => return Ok(corrupt(key, reason)),
                }
            }
        }

        let label = if self.cfg.test_mode {
            String::new()
        } else {
            let key = record_key(LABEL_ROLE, key_index);
            let bytes = self.lookup(&key)?.to_vec();
            String::from_utf8(bytes).map_err(|source| DatasetError::LabelEncoding { key, source })?
        };
        let label = match &self.label_transform {
            Some(transform) => transform(label),
            None => label,
        };
        let file_key = record_key(FILE_ROLE, key_index);
        let file_id = String::from_utf8_lossy(self.lookup(&file_key)?).into_owned();

        Ok(RecordStatus::Ok(RawSample {
            primary,
            secondary,
            label,
            file_id,
            ordinal: index,
        }))
    }

    fn lookup(&self, key: &str) -> DatasetResult<&[u8]> {
        self.store
            .get(key)
            .ok_or_else(|| DatasetError::MissingKey { key: key.to_string() })
    }
}

fn corrupt(key: String, reason: CorruptReason) -> RecordStatus {
    RecordStatus::Corrupt(CorruptRecord { key, reason })
}

fn read_count(store: &dyn SampleStore) -> DatasetResult<usize> {
    let raw = store.get(NUM_SAMPLES_KEY).ok_or_else(|| DatasetError::MissingKey {
        key: NUM_SAMPLES_KEY.to_string(),
    })?;
    let text = String::from_utf8_lossy(raw);
    text.trim()
        .parse::<usize>()
        .map_err(|_| DatasetError::InvalidCount {
            key: NUM_SAMPLES_KEY.to_string(),
            raw: text.into_owned(),
        })
}

fn decode_gray(bytes: &[u8]) -> Result<GrayImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

/// Pad at the right/bottom edge with [`PAD_FILL`]; never scales or crops.
pub fn pad_to_match(aux: GrayImage, (w, h): (u32, u32)) -> Result<GrayImage, CorruptReason> {
    let (aw, ah) = aux.dimensions();
    if (aw, ah) == (w, h) {
        return Ok(aux);
    }
    if aw > w || ah > h {
        return Err(CorruptReason::OversizedAuxiliary {
            aux: (aw, ah),
            primary: (w, h),
        });
    }
    let mut canvas = GrayImage::from_pixel(w, h, Luma([PAD_FILL]));
    image::imageops::replace(&mut canvas, &aux, 0, 0);
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn pad_to_match_pads_right_and_bottom() {
        let aux = GrayImage::from_pixel(3, 2, Luma([0]));
        let padded = pad_to_match(aux, (5, 4)).unwrap();
        assert_eq!(padded.dimensions(), (5, 4));
        assert_eq!(padded.get_pixel(2, 1)[0], 0);
        assert_eq!(padded.get_pixel(3, 0)[0], PAD_FILL);
        assert_eq!(padded.get_pixel(0, 2)[0], PAD_FILL);
    }

    #[test]
    fn pad_to_match_refuses_to_crop() {
        let aux = GrayImage::new(6, 2);
        assert!(matches!(
            pad_to_match(aux, (5, 4)),
            Err(CorruptReason::OversizedAuxiliary { .. })
        ));
    }

    fn one_record_store(label: &str) -> MemoryStore {
        let mut png = Vec::new();
        image::DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 3, Luma([90])))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let mut store = MemoryStore::new();
        store.insert(NUM_SAMPLES_KEY, "1");
        store.insert(record_key(IMAGE_ROLE, 1), png);
        store.insert(record_key(LABEL_ROLE, 1), label);
        store.insert(record_key(FILE_ROLE, 1), "page-1.png");
        store
    }

    #[test]
    fn label_transform_rewrites_labels_after_read() {
        let source = SampleSource::new(Box::new(one_record_store("Hello")), SourceConfig::default())
            .unwrap()
            .with_label_transform(Arc::new(|label: String| label.to_lowercase()));
        let sample = source.get(0).unwrap();
        assert_eq!(sample.label, "hello");
        assert_eq!(sample.image.width(), 4);
    }

    #[test]
    fn label_transform_also_sees_withheld_labels() {
        let cfg = SourceConfig {
            test_mode: true,
            ..SourceConfig::default()
        };
        let source = SampleSource::new(Box::new(one_record_store("Hello")), cfg)
            .unwrap()
            .with_label_transform(Arc::new(|label: String| format!("<{label}>")));
        assert_eq!(source.get(0).unwrap().label, "<>");
    }
}
