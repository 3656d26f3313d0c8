//! Face crop normalization.
//!
//! Fixed stage order: grayscale → resize → Gaussian blur → CLAHE → gamma →
//! bilateral denoise → Laplacian sharpening. Each stage's output distribution
//! feeds the next, so the order must not change. A stage that cannot run
//! returns [`StageUnavailable`] and the pipeline substitutes its simpler
//! equivalent instead of aborting:
//!
//! | stage     | fallback                      |
//! |-----------|-------------------------------|
//! | resize    | keep source size              |
//! | gaussian  | 3×3 box blur                  |
//! | clahe     | global histogram equalization |
//! | gamma     | identity table                |
//! | bilateral | 3×3 box blur                  |
//! | sharpen   | unsharpened image             |

use crate::config::PreprocessConfig;
use crate::filters;
use crate::types::FaceImage;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::gaussian_blur_f32;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("face image is empty ({width}x{height})")]
    EmptyInput { width: u32, height: u32 },
}

/// A pipeline stage could not run with the given input or parameters.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage} unavailable: {reason}")]
pub struct StageUnavailable {
    pub stage: &'static str,
    pub reason: String,
}

impl StageUnavailable {
    fn new(stage: &'static str, reason: impl Into<String>) -> Self {
        Self { stage, reason: reason.into() }
    }
}

/// Deterministic face-crop normalizer.
pub struct Preprocessor {
    config: PreprocessConfig,
    gamma_lut: [u8; 256],
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        let gamma_lut = build_gamma_lut(config.gamma).unwrap_or_else(|e| {
            tracing::warn!(stage = e.stage, reason = %e.reason, "gamma correction disabled");
            identity_lut()
        });
        Self { config, gamma_lut }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Stage 1 only: single-channel view at the source resolution.
    pub fn grayscale(&self, image: &FaceImage) -> Result<GrayImage, PreprocessError> {
        if image.is_empty() {
            tracing::debug!(
                width = image.width(),
                height = image.height(),
                "preprocess: empty input"
            );
            return Err(PreprocessError::EmptyInput {
                width: image.width(),
                height: image.height(),
            });
        }
        Ok(image.to_gray())
    }

    /// Full pipeline to a canonical `canonical_size²` grayscale face.
    pub fn preprocess(&self, image: &FaceImage) -> Result<GrayImage, PreprocessError> {
        let gray = self.grayscale(image)?;
        Ok(self.enhance(&gray))
    }

    /// Stages 2–7 on an already-grayscale, non-empty image.
    pub fn enhance(&self, gray: &GrayImage) -> GrayImage {
        let c = &self.config;

        let resized = resize_square(gray, c.canonical_size).unwrap_or_else(|e| {
            degraded(&e);
            gray.clone()
        });

        let blurred = gaussian(&resized, c.gaussian_sigma).unwrap_or_else(|e| {
            degraded(&e);
            filters::box_blur3(&resized)
        });

        let equalized = clahe(&blurred, c.clahe_tiles, c.clahe_clip_limit).unwrap_or_else(|e| {
            degraded(&e);
            equalize_histogram(&blurred)
        });

        let corrected = apply_lut(&equalized, &self.gamma_lut);

        let denoised = bilateral(
            &corrected,
            c.bilateral_radius,
            c.bilateral_sigma_space,
            c.bilateral_sigma_color,
        )
        .unwrap_or_else(|e| {
            degraded(&e);
            filters::box_blur3(&corrected)
        });

        sharpen(&denoised, c.sharpen_weight).unwrap_or_else(|e| {
            degraded(&e);
            denoised
        })
    }
}

fn degraded(e: &StageUnavailable) {
    tracing::warn!(stage = e.stage, reason = %e.reason, "preprocess stage degraded to fallback");
}

fn resize_square(gray: &GrayImage, side: u32) -> Result<GrayImage, StageUnavailable> {
    if side == 0 {
        return Err(StageUnavailable::new("resize", "canonical size is 0"));
    }
    if gray.width() == side && gray.height() == side {
        return Ok(gray.clone());
    }
    Ok(imageops::resize(gray, side, side, FilterType::Triangle))
}

fn gaussian(gray: &GrayImage, sigma: f32) -> Result<GrayImage, StageUnavailable> {
    if !(sigma.is_finite() && sigma > 0.0) {
        let reason = format!("sigma must be positive, got {sigma}");
        return Err(StageUnavailable::new("gaussian", reason));
    }
    Ok(gaussian_blur_f32(gray, sigma))
}

/// Smallest tile side CLAHE will build a histogram over.
const MIN_TILE_SIDE: usize = 4;

/// Tile boundaries along one axis. Edges are spread with integer division so
/// the tiles cover every pixel, and the axis gets fewer tiles when it is too
/// short for the requested count.
struct TileAxis {
    edges: Vec<usize>,
    centers: Vec<f32>,
}

impl TileAxis {
    fn new(len: usize, requested: usize) -> Option<Self> {
        let count = requested.min(len / MIN_TILE_SIDE);
        if count == 0 {
            return None;
        }
        let edges: Vec<usize> = (0..=count).map(|i| i * len / count).collect();
        let centers = edges.windows(2).map(|e| (e[0] + e[1]) as f32 / 2.0 - 0.5).collect();
        Some(Self { edges, centers })
    }

    fn count(&self) -> usize {
        self.centers.len()
    }

    fn span(&self, i: usize) -> std::ops::Range<usize> {
        self.edges[i]..self.edges[i + 1]
    }

    /// Neighbouring tiles around `pos` and the weight of the second one.
    fn neighbours(&self, pos: usize) -> (usize, usize, f32) {
        let pos = pos as f32;
        let last = self.count() - 1;
        let next = self.centers.partition_point(|&c| c <= pos);
        if next == 0 {
            return (0, 0, 0.0);
        }
        if next > last {
            return (last, last, 0.0);
        }
        let (a, b) = (self.centers[next - 1], self.centers[next]);
        (next - 1, next, (pos - a) / (b - a))
    }
}

/// Clip a tile histogram at `clip_limit` of its pixel count, spread the
/// excess over all bins, and return the rescaled cumulative mapping.
fn clipped_mapping(mut hist: [u32; 256], pixels: usize, clip_limit: f32) -> [f32; 256] {
    let clip = ((clip_limit * pixels as f32) as u32).max(1);
    let excess: u32 = hist.iter().map(|&bin| bin.saturating_sub(clip)).sum();
    let (spread, leftover) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin = (*bin).min(clip) + spread + u32::from(i < leftover);
    }

    let mut mapping = [0f32; 256];
    let mut total = 0u32;
    for (out, &bin) in mapping.iter_mut().zip(&hist) {
        total += bin;
        *out = total as f32;
    }
    let floor = mapping.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let range = total as f32 - floor;
    if range > 0.0 {
        for v in mapping.iter_mut() {
            *v = ((*v - floor) / range * 255.0).clamp(0.0, 255.0);
        }
    }
    mapping
}

/// Contrast-Limited Adaptive Histogram Equalization.
///
/// Up to `tiles` tiles per axis, each at least [`MIN_TILE_SIDE`] pixels, so a
/// non-square image gets a non-square grid. Output pixels blend the four
/// nearest tile mappings by distance to the tile centers.
pub fn clahe(gray: &GrayImage, tiles: u32, clip_limit: f32) -> Result<GrayImage, StageUnavailable> {
    if tiles == 0 {
        return Err(StageUnavailable::new("clahe", "tile grid is 0x0"));
    }
    if !(clip_limit.is_finite() && clip_limit > 0.0) {
        let reason = format!("clip limit must be positive, got {clip_limit}");
        return Err(StageUnavailable::new("clahe", reason));
    }

    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let axes = TileAxis::new(w, tiles as usize).zip(TileAxis::new(h, tiles as usize));
    let Some((cols, rows)) = axes else {
        let reason = format!("{w}x{h} image has no room for {MIN_TILE_SIDE}px tiles");
        return Err(StageUnavailable::new("clahe", reason));
    };
    let src = gray.as_raw();

    let mappings: Vec<[f32; 256]> = (0..rows.count() * cols.count())
        .into_par_iter()
        .map(|i| {
            let (ys, xs) = (rows.span(i / cols.count()), cols.span(i % cols.count()));
            let mut hist = [0u32; 256];
            for y in ys.clone() {
                for &p in &src[y * w + xs.start..y * w + xs.end] {
                    hist[usize::from(p)] += 1;
                }
            }
            clipped_mapping(hist, ys.len() * xs.len(), clip_limit)
        })
        .collect();

    let mut out = vec![0u8; w * h];
    out.par_chunks_mut(w).enumerate().for_each(|(y, line)| {
        let (r0, r1, dy) = rows.neighbours(y);
        for (x, px) in line.iter_mut().enumerate() {
            let (c0, c1, dx) = cols.neighbours(x);
            let v = usize::from(src[y * w + x]);
            let at = |r: usize, c: usize| mappings[r * cols.count() + c][v];
            let top = at(r0, c0) * (1.0 - dx) + at(r0, c1) * dx;
            let bottom = at(r1, c0) * (1.0 - dx) + at(r1, c1) * dx;
            *px = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
        }
    });

    GrayImage::from_raw(gray.width(), gray.height(), out)
        .ok_or_else(|| StageUnavailable::new("clahe", "output buffer size mismatch"))
}

/// 256-entry table for `255 * (v / 255)^gamma`.
fn build_gamma_lut(gamma: f32) -> Result<[u8; 256], StageUnavailable> {
    if !(gamma.is_finite() && gamma > 0.0) {
        return Err(StageUnavailable::new("gamma", format!("gamma must be positive, got {gamma}")));
    }
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let v = (i as f32 / 255.0).powf(gamma) * 255.0;
        *entry = v.round().clamp(0.0, 255.0) as u8;
    }
    Ok(lut)
}

fn identity_lut() -> [u8; 256] {
    std::array::from_fn(|i| i as u8)
}

fn apply_lut(gray: &GrayImage, lut: &[u8; 256]) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p[0] = lut[p[0] as usize];
    }
    out
}

/// Edge-preserving bilateral filter over a `(2r+1)²` window.
///
/// Spatial and range weights come from precomputed Gaussian tables.
pub fn bilateral(
    gray: &GrayImage,
    radius: u32,
    sigma_space: f32,
    sigma_color: f32,
) -> Result<GrayImage, StageUnavailable> {
    if radius == 0 || radius > 15 {
        let reason = format!("radius must be in 1..=15, got {radius}");
        return Err(StageUnavailable::new("bilateral", reason));
    }
    let positive = |s: f32| s.is_finite() && s > 0.0;
    if !(positive(sigma_space) && positive(sigma_color)) {
        return Err(StageUnavailable::new("bilateral", "sigmas must be positive"));
    }

    let r = radius as i64;
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));
    let src = gray.as_raw();

    let color_coeff = -1.0 / (2.0 * sigma_color * sigma_color);
    let color_lut: [f32; 256] = std::array::from_fn(|d| (color_coeff * (d as f32).powi(2)).exp());

    let space_coeff = -1.0 / (2.0 * sigma_space * sigma_space);
    let diameter = (2 * r + 1) as usize;
    let mut space_lut = vec![0.0f32; diameter * diameter];
    for dy in -r..=r {
        for dx in -r..=r {
            let idx = ((dy + r) as usize) * diameter + (dx + r) as usize;
            space_lut[idx] = (space_coeff * (dx * dx + dy * dy) as f32).exp();
        }
    }

    let mut out = GrayImage::new(gray.width(), gray.height());
    for y in 0..h {
        for x in 0..w {
            let center = src[(y * w + x) as usize];
            let mut acc = 0.0f32;
            let mut norm = 0.0f32;
            for dy in -r..=r {
                let sy = (y + dy).clamp(0, h - 1);
                for dx in -r..=r {
                    let sx = (x + dx).clamp(0, w - 1);
                    let p = src[(sy * w + sx) as usize];
                    let weight = space_lut[((dy + r) as usize) * diameter + (dx + r) as usize]
                        * color_lut[center.abs_diff(p) as usize];
                    acc += weight * f32::from(p);
                    norm += weight;
                }
            }
            let val = if norm > 0.0 { acc / norm } else { f32::from(center) };
            out.put_pixel(x as u32, y as u32, Luma([val.round().clamp(0.0, 255.0) as u8]));
        }
    }

    Ok(out)
}

/// Add `weight × (-Laplacian)` back onto the image.
pub fn sharpen(gray: &GrayImage, weight: f32) -> Result<GrayImage, StageUnavailable> {
    if !(weight.is_finite() && weight >= 0.0) {
        let reason = format!("weight must be non-negative, got {weight}");
        return Err(StageUnavailable::new("sharpen", reason));
    }
    let lap = filters::laplacian(gray);
    let mut out = gray.clone();
    for (p, l) in out.pixels_mut().zip(lap) {
        let v = f32::from(p[0]) - weight * l;
        p[0] = v.round().clamp(0.0, 255.0) as u8;
    }
    Ok(out)
}
