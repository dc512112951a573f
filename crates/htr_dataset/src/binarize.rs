//! Sauvola local-threshold binarization, used to derive binarization-hint channels.

use crate::types::ConfigError;
use image::{GrayImage, Luma};

pub const SAUVOLA_K: f64 = 0.2;
/// Dynamic range of the standard deviation for 8-bit input.
pub const SAUVOLA_R: f64 = 127.5;
pub const DEFAULT_WINDOW: u32 = 25;

pub fn validate_window(window: u32) -> Result<(), ConfigError> {
    if window < 3 || window % 2 == 0 {
        return Err(ConfigError::invalid(
            "sauvola window",
            format!("must be odd and >= 3, got {window}"),
        ));
    }
    Ok(())
}

/// Pixels brighter than `m * (1 + k * (s / r - 1))` become 255, the rest 0, where `m`/`s` are
/// the mean/std over a `window x window` neighbourhood clipped at the borders.
pub fn sauvola(image: &GrayImage, window: u32) -> Result<GrayImage, ConfigError> {
    validate_window(window)?;
    let (w, h) = image.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let stride = wu + 1;
    let mut sum = vec![0f64; stride * (hu + 1)];
    let mut sq = vec![0f64; stride * (hu + 1)];
    for y in 0..hu {
        let mut row_sum = 0f64;
        let mut row_sq = 0f64;
        for x in 0..wu {
            let v = image.get_pixel(x as u32, y as u32)[0] as f64;
            row_sum += v;
            row_sq += v * v;
            sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
            sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
        }
    }

    let half = (window / 2) as usize;
    let rect = |table: &[f64], x0: usize, y0: usize, x1: usize, y1: usize| {
        table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
            + table[y0 * stride + x0]
    };
    Ok(GrayImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let x0 = x.saturating_sub(half);
        let y0 = y.saturating_sub(half);
        let x1 = (x + half + 1).min(wu);
        let y1 = (y + half + 1).min(hu);
        let n = ((x1 - x0) * (y1 - y0)) as f64;
        let mean = rect(&sum, x0, y0, x1, y1) / n;
        let var = (rect(&sq, x0, y0, x1, y1) / n - mean * mean).max(0.0);
        let threshold = mean * (1.0 + SAUVOLA_K * (var.sqrt() / SAUVOLA_R - 1.0));
        let v = image.get_pixel(x as u32, y as u32)[0] as f64;
        Luma([if v > threshold { 255 } else { 0 }])
    }))
}
