//! Resize, pad and normalize samples into a dense NCHW batch.

use crate::types::{dense_channels, BatchError, ConfigError, DatasetResult, Sample};
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Pixel};
use serde::{Deserialize, Serialize};

/// Value written into padded regions before normalization (white page).
pub const PAD_VALUE: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollateConfig {
    pub img_height: u32,
    /// Fixed batch width; ignored when `keep_ratio` is set.
    pub img_width: u32,
    /// Derive the batch width from the widest aspect ratio in the batch.
    pub keep_ratio: bool,
}

impl Default for CollateConfig {
    fn default() -> Self {
        Self {
            img_height: 80,
            img_width: 300,
            keep_ratio: false,
        }
    }
}

/// Dense `f32` tensor in NCHW layout, values in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTensor {
    pub data: Vec<f32>,
    /// `[batch, channels, height, width]`
    pub shape: [usize; 4],
}

impl BatchTensor {
    pub fn batch(&self) -> usize {
        self.shape[0]
    }

    pub fn channels(&self) -> usize {
        self.shape[1]
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }

    /// CHW slice of one batch item.
    pub fn item(&self, i: usize) -> &[f32] {
        let stride = self.shape[1] * self.shape[2] * self.shape[3];
        &self.data[i * stride..(i + 1) * stride]
    }

    #[cfg(feature = "burn-runtime")]
    pub fn to_burn<B: burn::tensor::backend::Backend>(
        &self,
        device: &B::Device,
    ) -> burn::tensor::Tensor<B, 4> {
        burn::tensor::Tensor::<B, 1>::from_floats(self.data.as_slice(), device).reshape(self.shape)
    }
}

#[derive(Debug, Clone)]
pub struct CollatedBatch {
    pub images: BatchTensor,
    pub labels: Vec<String>,
    pub file_ids: Vec<String>,
    pub ordinals: Vec<usize>,
}

impl CollatedBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BatchCollator {
    cfg: CollateConfig,
}

impl BatchCollator {
    pub fn new(cfg: CollateConfig) -> Result<Self, ConfigError> {
        if cfg.img_height == 0 {
            return Err(ConfigError::invalid("img_height", "must be positive"));
        }
        if !cfg.keep_ratio && cfg.img_width == 0 {
            return Err(ConfigError::invalid("img_width", "must be positive"));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &CollateConfig {
        &self.cfg
    }

    /// `(width, height)` every image of `samples` is brought to.
    pub fn target_size(&self, samples: &[Sample]) -> (u32, u32) {
        let h = self.cfg.img_height;
        if !self.cfg.keep_ratio {
            return (self.cfg.img_width, h);
        }
        let max_ratio = samples
            .iter()
            .map(|s| s.image.width() as f64 / s.image.height().max(1) as f64)
            .fold(0.0f64, f64::max);
        (target_width_for(max_ratio, h), h)
    }

    pub fn collate(&self, samples: Vec<Sample>) -> DatasetResult<CollatedBatch> {
        let first = samples.first().ok_or(BatchError::Empty)?;
        let channels = dense_channels(&first.image);
        if let Some(odd) = samples
            .iter()
            .find(|s| dense_channels(&s.image) != channels)
        {
            return Err(BatchError::MixedChannels {
                expected: channels,
                found: dense_channels(&odd.image),
                file_id: odd.file_id.clone(),
            }
            .into());
        }

        let (w, h) = self.target_size(&samples);
        let mut data = Vec::with_capacity(samples.len() * channels * (w * h) as usize);
        let mut labels = Vec::with_capacity(samples.len());
        let mut file_ids = Vec::with_capacity(samples.len());
        let mut ordinals = Vec::with_capacity(samples.len());
        for sample in samples {
            data.extend(resize_normalize(&sample.image, (w, h)));
            labels.push(sample.label);
            file_ids.push(sample.file_id);
            ordinals.push(sample.ordinal);
        }
        let shape = [labels.len(), channels, h as usize, w as usize];
        Ok(CollatedBatch {
            images: BatchTensor { data, shape },
            labels,
            file_ids,
            ordinals,
        })
    }
}

/// `floor(max_ratio * height)`, at least 1.
pub fn target_width_for(max_ratio: f64, height: u32) -> u32 {
    ((max_ratio * height as f64).floor() as u32).max(1)
}

/// Resize to `height` keeping aspect ratio, pad to `(width, height)` with white
/// (centered), normalize to `[-1, 1]` and lay out as CHW.
pub fn resize_normalize(image: &DynamicImage, (width, height): (u32, u32)) -> Vec<f32> {
    match image {
        DynamicImage::ImageLuma8(img) => normalize_chw(&resize_pad(img, (width, height))),
        DynamicImage::ImageRgb8(img) => normalize_chw(&resize_pad(img, (width, height))),
        other if dense_channels(other) == 1 => {
            normalize_chw(&resize_pad(&other.to_luma8(), (width, height)))
        }
        other => normalize_chw(&resize_pad(&other.to_rgb8(), (width, height))),
    }
}

/// `(before, after)` split of `delta` padding pixels; `before = delta / 2`.
pub fn padding_split(delta: u32) -> (u32, u32) {
    let before = delta / 2;
    (before, delta - before)
}

/// Width after scaling to `height`, clamped to `[1, max_width]`.
fn scaled_width(w: u32, h: u32, height: u32, max_width: u32) -> u32 {
    let ar = w as f64 / h.max(1) as f64;
    ((ar * height as f64).round_ties_even() as u32).clamp(1, max_width.max(1))
}

pub(crate) fn resize_pad<P>(
    img: &ImageBuffer<P, Vec<u8>>,
    (width, height): (u32, u32),
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let (w, h) = img.dimensions();
    let new_w = scaled_width(w, h, height, width);
    let resized = if (new_w, height) == (w, h) {
        img.clone()
    } else {
        image::imageops::resize(img, new_w, height, FilterType::Triangle)
    };
    if new_w == width {
        return resized;
    }
    let (left, _) = padding_split(width - new_w);
    let fill = [PAD_VALUE; 4];
    let pad_px = *P::from_slice(&fill[..P::CHANNEL_COUNT as usize]);
    let mut canvas = ImageBuffer::from_pixel(width, height, pad_px);
    image::imageops::replace(&mut canvas, &resized, left as i64, 0);
    canvas
}

fn normalize_chw<P>(img: &ImageBuffer<P, Vec<u8>>) -> Vec<f32>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = img.dimensions();
    let channels = P::CHANNEL_COUNT as usize;
    let plane = (w * h) as usize;
    let mut out = vec![0.0f32; channels * plane];
    for (i, px) in img.as_raw().chunks_exact(channels).enumerate() {
        for (c, &v) in px.iter().enumerate() {
            out[c * plane + i] = v as f32 / 127.5 - 1.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    fn gray_sample(w: u32, h: u32, v: u8) -> Sample {
        Sample {
            image: DynamicImage::ImageLuma8(GrayImage::from_pixel(w, h, Luma([v]))),
            label: format!("{w}x{h}"),
            file_id: format!("file-{w}"),
            ordinal: w as usize,
        }
    }

    #[test]
    fn fixed_width_batch_shape() {
        let collator = BatchCollator::new(CollateConfig::default()).unwrap();
        let batch = collator
            .collate(vec![gray_sample(120, 40, 0), gray_sample(500, 60, 0)])
            .unwrap();
        assert_eq!(batch.images.shape, [2, 1, 80, 300]);
        assert_eq!(batch.images.data.len(), 2 * 80 * 300);
        assert_eq!(batch.labels, vec!["120x40", "500x60"]);
        assert_eq!(batch.ordinals, vec![120, 500]);
    }

    #[test]
    fn keep_ratio_width_follows_widest_sample() {
        let collator = BatchCollator::new(CollateConfig {
            img_height: 32,
            img_width: 999,
            keep_ratio: true,
        })
        .unwrap();
        let samples = vec![gray_sample(100, 20, 0), gray_sample(70, 20, 0)];
        assert_eq!(collator.target_size(&samples), (160, 32));
        let batch = collator.collate(samples).unwrap();
        assert_eq!(batch.images.shape, [2, 1, 32, 160]);
    }

    #[test]
    fn single_sample_keep_ratio_needs_no_padding() {
        let collator = BatchCollator::new(CollateConfig {
            img_height: 20,
            img_width: 1,
            keep_ratio: true,
        })
        .unwrap();
        let batch = collator.collate(vec![gray_sample(50, 10, 0)]).unwrap();
        assert_eq!(batch.images.shape, [1, 1, 20, 100]);
        assert!(batch.images.data.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn padding_is_centered_white() {
        // 10x10 black square into a 30x10 slot: 10 white columns each side.
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([0])));
        let chw = resize_normalize(&img, (30, 10));
        let row = &chw[0..30];
        assert!(row[..10].iter().all(|&v| v == 1.0));
        assert!(row[10..20].iter().all(|&v| v == -1.0));
        assert!(row[20..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn padding_split_within_one() {
        for delta in 0..20 {
            let (before, after) = padding_split(delta);
            assert_eq!(before + after, delta);
            assert!(after - before <= 1);
        }
        assert_eq!(padding_split(7), (3, 4));
    }

    #[test]
    fn wide_image_is_squeezed_to_target() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(1000, 10, Luma([255])));
        let chw = resize_normalize(&img, (50, 10));
        assert_eq!(chw.len(), 500);
    }

    #[test]
    fn rgb_is_laid_out_channel_major() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, image::Rgb([0, 255, 0])));
        let chw = resize_normalize(&img, (4, 2));
        assert_eq!(chw.len(), 3 * 8);
        assert!(chw[0..8].iter().all(|&v| v == -1.0));
        assert!(chw[8..16].iter().all(|&v| v == 1.0));
        assert!(chw[16..24].iter().all(|&v| v == -1.0));
    }

    #[test]
    fn mixed_channels_rejected() {
        let collator = BatchCollator::new(CollateConfig::default()).unwrap();
        let rgb = Sample {
            image: DynamicImage::ImageRgb8(RgbImage::new(10, 10)),
            label: String::new(),
            file_id: "rgb".into(),
            ordinal: 1,
        };
        let err = collator
            .collate(vec![gray_sample(10, 10, 0), rgb])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::DatasetError::Batch(BatchError::MixedChannels { expected: 1, found: 3, .. })
        ));
    }

    #[test]
    fn empty_batch_rejected() {
        let collator = BatchCollator::new(CollateConfig::default()).unwrap();
        assert!(matches!(
            collator.collate(Vec::new()),
            Err(crate::DatasetError::Batch(BatchError::Empty))
        ));
    }

    #[test]
    fn zero_height_config_rejected() {
        assert!(BatchCollator::new(CollateConfig {
            img_height: 0,
            ..CollateConfig::default()
        })
        .is_err());
    }
}
