//! Elastic grid distortion.

use image::{DynamicImage, ImageBuffer, Pixel};
use rand::RngCore;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Line height the mesh constants were tuned for.
pub const REFERENCE_HEIGHT: f32 = 80.0;
/// Control point spacing at [`REFERENCE_HEIGHT`] (slightly above an average baseline height).
pub const REFERENCE_MESH_INTERVAL: f32 = 26.0;
/// Control point perturbation std at [`REFERENCE_HEIGHT`].
pub const REFERENCE_MESH_STD: f32 = 1.7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshParams {
    pub interval_x: f32,
    pub interval_y: f32,
    pub std_x: f32,
    pub std_y: f32,
}

impl MeshParams {
    /// Mesh scaled linearly with image height so the warp looks the same at any resolution.
    pub fn for_height(height: u32) -> Self {
        let k = height as f32 / REFERENCE_HEIGHT;
        let interval = k * REFERENCE_MESH_INTERVAL;
        let std = k * REFERENCE_MESH_STD;
        Self {
            interval_x: interval,
            interval_y: interval,
            std_x: std,
            std_y: std,
        }
    }
}

/// Random spatial distortion primitive. Output has the input's dimensions and color type.
pub trait ElasticWarp: Send + Sync {
    fn warp(&self, image: &DynamicImage, mesh: MeshParams, rng: &mut dyn RngCore) -> DynamicImage;
}

/// Perturbs a regular control mesh with gaussian offsets and resamples the image through the
/// bilinearly interpolated displacement field.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridDistortion;

impl ElasticWarp for GridDistortion {
    fn warp(&self, image: &DynamicImage, mesh: MeshParams, rng: &mut dyn RngCore) -> DynamicImage {
        match image {
            DynamicImage::ImageLuma8(img) => DynamicImage::ImageLuma8(warp_buffer(img, mesh, rng)),
            DynamicImage::ImageRgb8(img) => DynamicImage::ImageRgb8(warp_buffer(img, mesh, rng)),
            other => DynamicImage::ImageRgb8(warp_buffer(&other.to_rgb8(), mesh, rng)),
        }
    }
}

pub(crate) fn warp_buffer<P>(
    img: &ImageBuffer<P, Vec<u8>>,
    mesh: MeshParams,
    rng: &mut dyn RngCore,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = img.dimensions();
    if w < 2 || h < 2 {
        return img.clone();
    }
    let (Ok(dist_x), Ok(dist_y)) = (Normal::new(0.0f32, mesh.std_x), Normal::new(0.0f32, mesh.std_y))
    else {
        return img.clone();
    };

    let xs = mesh_axis(w, mesh.interval_x);
    let ys = mesh_axis(h, mesh.interval_y);
    let nx = xs.len();
    let points = nx * ys.len();
    let dx: Vec<f32> = (0..points).map(|_| dist_x.sample(rng)).collect();
    let dy: Vec<f32> = (0..points).map(|_| dist_y.sample(rng)).collect();

    let channels = P::CHANNEL_COUNT as usize;
    let src: &[u8] = img.as_raw();
    let mut out = ImageBuffer::<P, Vec<u8>>::new(w, h);
    let dst: &mut [u8] = &mut out;
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;

    for y in 0..h {
        let (j, ty) = locate(&ys, y as f32);
        for x in 0..w {
            let (i, tx) = locate(&xs, x as f32);
            let corners = [j * nx + i, j * nx + i + 1, (j + 1) * nx + i, (j + 1) * nx + i + 1];
            let shift = |field: &[f32]| {
                let top = field[corners[0]] * (1.0 - tx) + field[corners[1]] * tx;
                let bottom = field[corners[2]] * (1.0 - tx) + field[corners[3]] * tx;
                top * (1.0 - ty) + bottom * ty
            };
            let sx = (x as f32 + shift(&dx)).clamp(0.0, max_x);
            let sy = (y as f32 + shift(&dy)).clamp(0.0, max_y);
            let base = (y as usize * w as usize + x as usize) * channels;
            sample_bilinear(src, w, h, channels, sx, sy, &mut dst[base..base + channels]);
        }
    }
    out
}

/// Control coordinates `0, interval, 2*interval, ...` closed by the last pixel.
fn mesh_axis(len: u32, interval: f32) -> Vec<f32> {
    let interval = if interval.is_finite() { interval.max(1.0) } else { 1.0 };
    let last = (len - 1) as f32;
    let mut points = Vec::new();
    let mut p = 0.0f32;
    while p < last {
        points.push(p);
        p += interval;
    }
    points.push(last);
    points
}

/// Cell index and fractional position of `v` along a mesh axis with at least two points.
fn locate(points: &[f32], v: f32) -> (usize, f32) {
    let i = points
        .partition_point(|&p| p <= v)
        .saturating_sub(1)
        .min(points.len() - 2);
    let span = points[i + 1] - points[i];
    let t = if span > 0.0 { ((v - points[i]) / span).clamp(0.0, 1.0) } else { 0.0 };
    (i, t)
}

fn sample_bilinear(src: &[u8], w: u32, h: u32, channels: usize, x: f32, y: f32, dst: &mut [u8]) {
    let w = w as usize;
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h as usize - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    for (c, out) in dst.iter_mut().enumerate() {
        let at = |xx: usize, yy: usize| src[(yy * w + xx) * channels + c] as f32;
        let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
        let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
        *out = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
}
