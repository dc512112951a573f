//! Randomized augmentation policy: elastic warp, log-scale resize, external transform.

use crate::types::{ConfigError, Sample};
use crate::warp::{ElasticWarp, GridDistortion, MeshParams};
use image::imageops::FilterType;
use image::DynamicImage;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Odd 64-bit constant spreading the epoch across the seed bits.
const EPOCH_SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Caller-supplied final stage (e.g. a photometric normalization).
pub type ImageTransform = Arc<dyn Fn(DynamicImage) -> DynamicImage + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Enable the elastic grid warp stage.
    pub augment: bool,
    /// Enable the random log-scale resize stage.
    pub scale: bool,
    /// `(max_shrink, max_grow)`: the scale factor is drawn log-uniformly from
    /// `[1 / max_shrink, max_grow]`.
    pub scale_range: (f32, f32),
    /// Each stage draws U[0, 1) and runs only when the draw is below this threshold.
    pub apply_probability: f32,
    /// Seed for reproducible per-sample draws (mixed with the sample ordinal and epoch).
    pub seed: Option<u64>,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            augment: false,
            scale: false,
            scale_range: (1.0, 1.0),
            apply_probability: 1.0,
            seed: None,
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (shrink, grow) = self.scale_range;
        if !(shrink.is_finite() && grow.is_finite()) || shrink <= 0.0 || grow <= 0.0 {
            return Err(ConfigError::invalid(
                "scale_range",
                format!("bounds must be positive, got ({shrink}, {grow})"),
            ));
        }
        if !(0.0..=1.0).contains(&self.apply_probability) {
            return Err(ConfigError::invalid(
                "apply_probability",
                format!("must be within [0, 1], got {}", self.apply_probability),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct AugmentationPolicy {
    cfg: AugmentConfig,
    warp: Arc<dyn ElasticWarp>,
    transform: Option<ImageTransform>,
}

impl std::fmt::Debug for AugmentationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AugmentationPolicy")
            .field("cfg", &self.cfg)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl AugmentationPolicy {
    pub fn builder() -> AugmentationPolicyBuilder {
        AugmentationPolicyBuilder::new()
    }

    pub fn from_config(cfg: &AugmentConfig) -> Result<Self, ConfigError> {
        AugmentationPolicyBuilder::new().config(cfg.clone()).build()
    }

    /// Every stage disabled; `apply` returns the sample unchanged.
    pub fn identity() -> Self {
        Self {
            cfg: AugmentConfig::default(),
            warp: Arc::new(GridDistortion),
            transform: None,
        }
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.cfg
    }

    pub fn describe(&self) -> String {
        format!(
            "augment={} scale={} range=[1/{:.2},{:.2}] p={:.2} transform={} seed={}",
            self.cfg.augment,
            self.cfg.scale,
            self.cfg.scale_range.0,
            self.cfg.scale_range.1,
            self.cfg.apply_probability,
            self.transform.is_some(),
            self.cfg
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    pub fn apply(&self, sample: Sample) -> Sample {
        self.apply_in_epoch(sample, 0)
    }

    /// Like [`AugmentationPolicy::apply`]; a seeded policy draws a different
    /// augmentation for the same ordinal in each epoch.
    pub fn apply_in_epoch(&self, sample: Sample, epoch: u64) -> Sample {
        // Seeded per sample and epoch when configured, else thread-local.
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.cfg.seed {
            let mixed = seed ^ sample.ordinal as u64 ^ epoch.wrapping_mul(EPOCH_SEED_MIX);
            seeded_rng = rand::rngs::StdRng::seed_from_u64(mixed);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };
        let image = self.apply_image(sample.image, rng);
        Sample { image, ..sample }
    }

    /// Stages run in fixed order; each draws its gate value whether or not it is enabled.
    pub fn apply_image(&self, image: DynamicImage, rng: &mut dyn rand::RngCore) -> DynamicImage {
        let mut image = image;
        maybe_warp(
            &mut image,
            self.cfg.augment,
            self.cfg.apply_probability,
            self.warp.as_ref(),
            rng,
        );
        maybe_log_scale(
            &mut image,
            self.cfg.scale,
            self.cfg.apply_probability,
            self.cfg.scale_range,
            rng,
        );
        maybe_transform(
            &mut image,
            self.transform.as_ref(),
            self.cfg.apply_probability,
            rng,
        );
        image
    }
}

#[derive(Clone)]
pub struct AugmentationPolicyBuilder {
    cfg: AugmentConfig,
    warp: Arc<dyn ElasticWarp>,
    transform: Option<ImageTransform>,
}

impl Default for AugmentationPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AugmentationPolicyBuilder {
    pub fn new() -> Self {
        Self {
            cfg: AugmentConfig::default(),
            warp: Arc::new(GridDistortion),
            transform: None,
        }
    }
    pub fn config(mut self, cfg: AugmentConfig) -> Self {
        self.cfg = cfg;
        self
    }
    pub fn augment(mut self, enabled: bool) -> Self {
        self.cfg.augment = enabled;
        self
    }
    pub fn scale(mut self, enabled: bool, max_shrink: f32, max_grow: f32) -> Self {
        self.cfg.scale = enabled;
        self.cfg.scale_range = (max_shrink, max_grow);
        self
    }
    pub fn apply_probability(mut self, p: f32) -> Self {
        self.cfg.apply_probability = p;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.cfg.seed = seed;
        self
    }
    pub fn warp(mut self, warp: Arc<dyn ElasticWarp>) -> Self {
        self.warp = warp;
        self
    }
    pub fn transform(mut self, transform: ImageTransform) -> Self {
        self.transform = Some(transform);
        self
    }
    pub fn build(self) -> Result<AugmentationPolicy, ConfigError> {
        self.cfg.validate()?;
        Ok(AugmentationPolicy {
            cfg: self.cfg,
            warp: self.warp,
            transform: self.transform,
        })
    }
}

fn gate(enabled: bool, prob: f32, rng: &mut dyn rand::RngCore) -> bool {
    let draw: f32 = rng.random_range(0.0..1.0);
    enabled && draw < prob
}

pub(crate) fn maybe_warp(
    img: &mut DynamicImage,
    enabled: bool,
    prob: f32,
    warp: &dyn ElasticWarp,
    rng: &mut dyn rand::RngCore,
) {
    if !gate(enabled, prob, rng) {
        return;
    }
    let mesh = MeshParams::for_height(img.height());
    *img = warp.warp(img, mesh, rng);
}

/// `10^U` with `U` uniform between `log10(1 / max_shrink)` and `log10(max_grow)`.
pub(crate) fn log_scale_factor(scale_range: (f32, f32), rng: &mut dyn rand::RngCore) -> f32 {
    let lo = (1.0 / scale_range.0).log10();
    let hi = scale_range.1.log10();
    let u: f32 = rng.random_range(0.0..1.0);
    10f32.powf(lo + (hi - lo) * u)
}

/// Size after scaling the height by `s` and keeping the aspect ratio.
pub(crate) fn scaled_size(width: u32, height: u32, s: f32) -> (u32, u32) {
    let ar = width as f64 / height as f64;
    let new_h = (s as f64 * height as f64).round_ties_even().max(1.0);
    let new_w = (ar * new_h).round_ties_even().max(1.0);
    (new_w as u32, new_h as u32)
}

pub(crate) fn maybe_log_scale(
    img: &mut DynamicImage,
    enabled: bool,
    prob: f32,
    scale_range: (f32, f32),
    rng: &mut dyn rand::RngCore,
) {
    if !gate(enabled, prob, rng) {
        return;
    }
    let s = log_scale_factor(scale_range, rng);
    let (w, h) = scaled_size(img.width(), img.height(), s);
    if (w, h) != (img.width(), img.height()) {
        *img = img.resize_exact(w, h, FilterType::Triangle);
    }
}

pub(crate) fn maybe_transform(
    img: &mut DynamicImage,
    transform: Option<&ImageTransform>,
    prob: f32,
    rng: &mut dyn rand::RngCore,
) {
    if !gate(transform.is_some(), prob, rng) {
        return;
    }
    if let Some(f) = transform {
        let taken = std::mem::replace(img, DynamicImage::new_luma8(0, 0));
        *img = f(taken);
    }
}

#[cfg(test)]
mod aug_tests {
    use super::*;
    use image::{GrayImage, Luma};
    use rand::rngs::StdRng;

    fn line(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, y| Luma([((x + y) % 255) as u8])))
    }

    #[test]
    fn invalid_scale_range_rejected() {
        assert!(AugmentationPolicy::builder().scale(true, 0.0, 1.2).build().is_err());
        assert!(AugmentationPolicy::builder().scale(true, 1.2, -1.0).build().is_err());
        assert!(AugmentationPolicy::builder().apply_probability(1.5).build().is_err());
    }

    #[test]
    fn scale_factor_stays_in_log_range() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let s = log_scale_factor((2.0, 1.5), &mut rng);
            assert!(s >= 0.5 - 1e-4 && s <= 1.5 + 1e-4, "s={s}");
        }
    }

    #[test]
    fn scale_factor_is_symmetric_in_log_space() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = 4000;
        let shrinks = (0..n)
            .filter(|_| log_scale_factor((2.0, 2.0), &mut rng) < 1.0)
            .count();
        let ratio = shrinks as f32 / n as f32;
        assert!((ratio - 0.5).abs() < 0.05, "shrink ratio {ratio}");
    }

    #[test]
    fn scaled_size_keeps_aspect_ratio() {
        assert_eq!(scaled_size(300, 80, 0.5), (150, 40));
        assert_eq!(scaled_size(300, 80, 2.0), (600, 160));
        assert_eq!(scaled_size(10, 10, 0.01), (1, 1));
    }

    #[test]
    fn disabled_stages_leave_image_untouched() {
        let policy = AugmentationPolicy::identity();
        let mut rng = StdRng::seed_from_u64(0);
        let img = line(50, 20);
        let out = policy.apply_image(img.clone(), &mut rng);
        assert_eq!(out, img);
    }

    #[test]
    fn zero_probability_never_applies() {
        let policy = AugmentationPolicy::builder()
            .augment(true)
            .scale(true, 2.0, 2.0)
            .apply_probability(0.0)
            .transform(Arc::new(|_: DynamicImage| DynamicImage::new_luma8(1, 1)))
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let img = line(40, 16);
        assert_eq!(policy.apply_image(img.clone(), &mut rng), img);
    }

    #[test]
    fn full_probability_runs_every_stage() {
        let policy = AugmentationPolicy::builder()
            .augment(true)
            .scale(true, 1.0, 1.0)
            .apply_probability(1.0)
            .transform(Arc::new(|img: DynamicImage| img.resize_exact(7, 3, FilterType::Nearest)))
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let out = policy.apply_image(line(64, 32), &mut rng);
        assert_eq!((out.width(), out.height()), (7, 3));
    }

    #[test]
    fn seeded_policy_is_reproducible_per_ordinal() {
        let policy = AugmentationPolicy::builder()
            .augment(true)
            .scale(true, 1.5, 1.5)
            .apply_probability(0.7)
            .seed(Some(42))
            .build()
            .unwrap();
        let sample = Sample {
            image: line(90, 30),
            label: "x".into(),
            file_id: "f".into(),
            ordinal: 3,
        };
        let a = policy.apply(sample.clone());
        let b = policy.apply(sample);
        assert_eq!(a.image, b.image);
        assert_eq!(a.label, "x");
    }

    #[test]
    fn seeded_policy_varies_across_epochs() {
        let policy = AugmentationPolicy::builder()
            .scale(true, 1.5, 1.5)
            .apply_probability(1.0)
            .seed(Some(42))
            .build()
            .unwrap();
        let sample = Sample {
            image: line(90, 30),
            label: "x".into(),
            file_id: "f".into(),
            ordinal: 3,
        };
        let widths: std::collections::BTreeSet<u32> = (0..8)
            .map(|epoch| policy.apply_in_epoch(sample.clone(), epoch).image.width())
            .collect();
        assert!(widths.len() > 1, "every epoch drew the same scale: {widths:?}");

        let again = policy.apply_in_epoch(sample.clone(), 5);
        assert_eq!(again.image, policy.apply_in_epoch(sample.clone(), 5).image);
        assert_eq!(policy.apply(sample.clone()).image, policy.apply_in_epoch(sample, 0).image);
    }
}
