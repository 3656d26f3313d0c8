//! Handcrafted face embedding.
//!
//! Three independent sub-extractors run in parallel over the canonical
//! grayscale face and are concatenated in a fixed order:
//!
//! ```text
//! [ intensity histogram (N bins) | LBP histogram (256, full modes) | edge grid (R×R) ]
//! ```
//!
//! Each block is centered on its own mean and scaled to unit length before
//! concatenation, so every sub-extractor carries the same weight whatever its
//! length or value range. A block with no variation contributes zeros. The
//! buffer is then padded with zeros or truncated to `embedding_dim` and
//! L2-normalized as a whole.

use crate::config::{EdgeMeasure, FeatureConfig, RecognitionMode};
use crate::types::Embedding;
use image::GrayImage;
use imageproc::edges::canny;

const LBP_CODES: usize = 256;
/// Blocks whose centered norm falls below this are treated as constant.
const BLOCK_EPSILON: f64 = 1e-9;

/// Clockwise from top-left; bit i is set when neighbour i ≥ center.
const LBP_NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

pub struct FeatureExtractor {
    mode: RecognitionMode,
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(mode: RecognitionMode, config: FeatureConfig) -> Self {
        Self { mode, config }
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    /// Extract an L2-normalized embedding from a canonical grayscale face.
    ///
    /// An empty image yields the all-zero sentinel of the configured length.
    pub fn extract(&self, gray: &GrayImage) -> Embedding {
        let dim = self.config.embedding_dim;
        if gray.width() == 0 || gray.height() == 0 {
            tracing::debug!("features: empty input, returning sentinel");
            return Embedding::sentinel(dim).with_mode(self.mode);
        }

        let grid = self.mode.edge_grid();
        let (histogram, (lbp, edges)) = rayon::join(
            || histogram_features(gray, self.config.histogram_bins),
            || {
                rayon::join(
                    || self.mode.uses_lbp().then(|| lbp_features(gray)),
                    || {
                        edge_features(
                            gray,
                            grid,
                            self.config.edge_measure,
                            self.config.canny_low,
                            self.config.canny_high,
                        )
                    },
                )
            },
        );

        let mut values = Vec::with_capacity(dim.max(histogram.len() + LBP_CODES + edges.len()));
        values.extend(balance(histogram));
        if let Some(lbp) = lbp {
            values.extend(balance(lbp));
        }
        values.extend(balance(edges));

        if values.len() > dim {
            tracing::trace!(raw = values.len(), dim, "features: truncating to embedding_dim");
        }
        values.resize(dim, 0.0);

        Embedding::normalized(values).with_mode(self.mode)
    }
}

/// Subtract the block mean and scale to unit L2 norm. Constant blocks become zeros.
fn balance(mut block: Vec<f32>) -> Vec<f32> {
    if block.is_empty() {
        return block;
    }
    let mean = block.iter().map(|&v| f64::from(v)).sum::<f64>() / block.len() as f64;
    let norm = block
        .iter()
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        .sqrt();
    if norm <= BLOCK_EPSILON {
        block.fill(0.0);
        return block;
    }
    for v in block.iter_mut() {
        *v = ((f64::from(*v) - mean) / norm) as f32;
    }
    block
}

/// Intensity histogram with `bins` equal-width buckets, as pixel fractions.
fn histogram_features(gray: &GrayImage, bins: usize) -> Vec<f32> {
    let bins = bins.clamp(1, 256);
    let mut hist = vec![0.0f32; bins];
    for &p in gray.as_raw() {
        hist[p as usize * bins / 256] += 1.0;
    }
    let total = gray.as_raw().len() as f32;
    if total > 0.0 {
        for v in hist.iter_mut() {
            *v /= total;
        }
    }
    hist
}

/// 8-neighbour LBP code histogram over interior pixels, as fractions.
/// All zeros for images smaller than 3×3.
fn lbp_features(gray: &GrayImage) -> Vec<f32> {
    let mut hist = vec![0.0f32; LBP_CODES];
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));
    if w < 3 || h < 3 {
        return hist;
    }

    let src = gray.as_raw();
    let at = |x: i64, y: i64| src[(y * w + x) as usize];
    let mut count = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = at(x, y);
            let mut code = 0usize;
            for (bit, (dx, dy)) in LBP_NEIGHBOURS.iter().enumerate() {
                if at(x + dx, y + dy) >= center {
                    code |= 1 << bit;
                }
            }
            hist[code] += 1.0;
            count += 1;
        }
    }

    let total = count as f32;
    for v in hist.iter_mut() {
        *v /= total;
    }
    hist
}

/// Canny edges over an R×R grid: per-cell density or raw count.
fn edge_features(
    gray: &GrayImage,
    grid: usize,
    measure: EdgeMeasure,
    low: f32,
    high: f32,
) -> Vec<f32> {
    let mut cells = vec![0.0f32; grid * grid];
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    if w < 3 || h < 3 || grid == 0 {
        return cells;
    }

    let edges = canny(gray, low, high);
    let raw = edges.as_raw();
    for row in 0..grid {
        let y0 = row * h / grid;
        let y1 = (row + 1) * h / grid;
        for col in 0..grid {
            let x0 = col * w / grid;
            let x1 = (col + 1) * w / grid;
            let area = (y1 - y0) * (x1 - x0);
            if area == 0 {
                continue;
            }

            let mut count = 0usize;
            for y in y0..y1 {
                count += raw[y * w + x0..y * w + x1].iter().filter(|&&p| p > 0).count();
            }
            cells[row * grid + col] = match measure {
                EdgeMeasure::Density => count as f32 / area as f32,
                EdgeMeasure::Count => count as f32,
            };
        }
    }
    cells
}
