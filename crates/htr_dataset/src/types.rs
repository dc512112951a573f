//! Core types, error definitions, and data structures for htr_dataset.

use image::{DynamicImage, GrayImage, RgbImage};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("missing key {key} in store")]
    MissingKey { key: String },
    #[error("index {index} out of range for {count} samples")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("gave up after skipping {skipped} corrupt records starting at index {start}")]
    TooManyCorrupt { start: usize, skipped: usize },
    #[error("label at {key} is not valid utf-8: {source}")]
    LabelEncoding {
        key: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("invalid sample count {raw:?} under {key}")]
    InvalidCount { key: String, raw: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed store {path}: {msg}")]
    Format { path: PathBuf, msg: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("symbol {symbol:?} at position {position} is not in the alphabet")]
    UnknownSymbol { symbol: char, position: usize },
    #[error("code {code} is outside the alphabet (max {max})")]
    UnknownCode { code: u32, max: u32 },
    #[error("text with length {actual} does not match declared length {declared}")]
    LengthMismatch { declared: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {msg}")]
    Invalid { field: &'static str, msg: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, msg: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("cannot collate an empty batch")]
    Empty,
    #[error("batch mixes channel counts: expected {expected}, found {found} (file {file_id})")]
    MixedChannels {
        expected: usize,
        found: usize,
        file_id: String,
    },
}

/// One training example as handed to augmentation and collation.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Composite image: `Luma8`, or `Rgb8` when auxiliary channels are stacked.
    pub image: DynamicImage,
    /// Transcription; empty when labels are withheld (test mode).
    pub label: String,
    pub file_id: String,
    /// Ordinal actually read. Differs from the requested one after corrupt records were skipped.
    pub ordinal: usize,
}

/// A record before channel composition.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub primary: GrayImage,
    /// Zero or two auxiliary channels, already padded to the primary's size.
    pub secondary: Vec<GrayImage>,
    pub label: String,
    pub file_id: String,
    pub ordinal: usize,
}

impl RawSample {
    /// Stack primary and the first two secondaries into RGB (primary, first, second).
    /// Without at least two secondaries the primary is returned as grayscale.
    pub fn compose(self) -> Sample {
        let image = match self.secondary.as_slice() {
            [first, second, ..] => {
                let (w, h) = self.primary.dimensions();
                let mut rgb = RgbImage::new(w, h);
                for (x, y, px) in rgb.enumerate_pixels_mut() {
                    px.0 = [
                        self.primary.get_pixel(x, y)[0],
                        first.get_pixel(x, y)[0],
                        second.get_pixel(x, y)[0],
                    ];
                }
                DynamicImage::ImageRgb8(rgb)
            }
            _ => DynamicImage::ImageLuma8(self.primary),
        };
        Sample {
            image,
            label: self.label,
            file_id: self.file_id,
            ordinal: self.ordinal,
        }
    }
}

/// Number of dense channels an image contributes to a batch (1 for grayscale, 3 otherwise).
pub fn dense_channels(image: &DynamicImage) -> usize {
    if image.color().channel_count() == 1 {
        1
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn compose_orders_channels_primary_first() {
        let raw = RawSample {
            primary: GrayImage::from_pixel(2, 1, Luma([10])),
            secondary: vec![
                GrayImage::from_pixel(2, 1, Luma([20])),
                GrayImage::from_pixel(2, 1, Luma([30])),
            ],
            label: "ab".into(),
            file_id: "f".into(),
            ordinal: 0,
        };
        let sample = raw.compose();
        let rgb = sample.image.as_rgb8().expect("rgb composite");
        assert_eq!(rgb.get_pixel(1, 0).0, [10, 20, 30]);
        assert_eq!(dense_channels(&sample.image), 3);
    }

    #[test]
    fn compose_without_secondaries_stays_gray() {
        let raw = RawSample {
            primary: GrayImage::new(3, 2),
            secondary: Vec::new(),
            label: String::new(),
            file_id: String::new(),
            ordinal: 4,
        };
        let sample = raw.compose();
        assert!(sample.image.as_luma8().is_some());
        assert_eq!(sample.ordinal, 4);
    }
}
