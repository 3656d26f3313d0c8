//! Similarity metrics over embeddings, each mapped into [0, 1], and their
//! mode-dependent fusion.
//!
//! Every metric returns 0.0 when the inputs differ in length (a configuration
//! change since enrollment) or when either side is the all-zero sentinel.

use crate::config::RecognitionMode;
use crate::types::Embedding;

/// Terms of the chi-square sum with `|a_i + b_i|` below this are skipped.
const CHI_SQUARE_EPSILON: f32 = 1e-10;

/// Fusion weights for UltraPrecision: cosine, euclidean, manhattan, correlation.
const ULTRA_WEIGHTS: [f32; 4] = [0.35, 0.25, 0.20, 0.20];
/// Fusion weights for Standard: cosine, euclidean, weighted cosine.
const STANDARD_WEIGHTS: [f32; 3] = [0.5, 0.3, 0.2];

/// Inputs are comparable: equal non-zero length and neither is all zeros.
fn comparable(a: &[f32], b: &[f32]) -> bool {
    if a.len() != b.len() {
        tracing::warn!(
            left = a.len(),
            right = b.len(),
            "embedding dimension mismatch; re-enroll the gallery under the current configuration"
        );
        return false;
    }
    !a.is_empty() && a.iter().any(|&v| v != 0.0) && b.iter().any(|&v| v != 0.0)
}

/// `dot / (‖a‖·‖b‖)`, negative values clamped to 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if !comparable(a, b) {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        ((dot / denom) as f32).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// `1 - ‖a - b‖ / (‖a‖ + ‖b‖)`.
///
/// The denominator is the largest distance two vectors of these norms can
/// be apart, 2 for unit embeddings.
pub fn euclidean_similarity(a: &[f32], b: &[f32]) -> f32 {
    if !comparable(a, b) {
        return 0.0;
    }
    let l2 = |v: &[f32]| v.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
    let distance = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| (f64::from(x) - f64::from(y)).powi(2))
        .sum::<f64>()
        .sqrt();
    (1.0 - distance / (l2(a) + l2(b))).clamp(0.0, 1.0) as f32
}

/// `1 - Σ|a_i - b_i| / (Σ|a_i| + Σ|b_i|)`.
pub fn manhattan_similarity(a: &[f32], b: &[f32]) -> f32 {
    if !comparable(a, b) {
        return 0.0;
    }
    let l1 = |v: &[f32]| v.iter().map(|&x| f64::from(x.abs())).sum::<f64>();
    let distance: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| (f64::from(x) - f64::from(y)).abs())
        .sum();
    (1.0 - distance / (l1(a) + l1(b))).clamp(0.0, 1.0) as f32
}

/// Pearson correlation rescaled from [-1, 1] to [0, 1].
///
/// When either side has zero variance the correlation is undefined: identical
/// inputs score 1.0, anything else 0.5 (uncorrelated).
pub fn correlation_similarity(a: &[f32], b: &[f32]) -> f32 {
    if !comparable(a, b) {
        return 0.0;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| f64::from(v)).sum::<f64>() / n;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let dx = f64::from(x) - mean_a;
        let dy = f64::from(y) - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if denom <= f64::EPSILON {
        return if a == b { 1.0 } else { 0.5 };
    }
    let r = (cov / denom).clamp(-1.0, 1.0);
    ((r + 1.0) / 2.0) as f32
}

/// `1 / (1 + Σ (a_i - b_i)² / |a_i + b_i| / len)`, skipping near-zero denominators.
pub fn chi_square_similarity(a: &[f32], b: &[f32]) -> f32 {
    if !comparable(a, b) {
        return 0.0;
    }
    let mut chi = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let sum = (x + y).abs();
        if sum > CHI_SQUARE_EPSILON {
            chi += f64::from((x - y) * (x - y)) / f64::from(sum);
        }
    }
    (1.0 / (1.0 + chi / a.len() as f64)) as f32
}

/// Cosine with dimension i pre-scaled by `1 + min(0.5, (|a_i| + |b_i|) / 2)`.
///
/// The importance proxy averages both sides so the metric stays symmetric.
pub fn weighted_cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if !comparable(a, b) {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let w = 1.0 + f64::from(((x.abs() + y.abs()) / 2.0).min(0.5));
        let (x, y) = (f64::from(x) * w, f64::from(y) * w);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        ((dot / denom) as f32).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Probe-quality weight `clamp(quality + 0.3, 0.5, 1.2)`. Non-decreasing in quality.
pub fn quality_weight(quality: f32) -> f32 {
    if quality.is_nan() {
        return 0.5;
    }
    (quality + 0.3).clamp(0.5, 1.2)
}

/// Mode-dependent fusion of the base metrics.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityEngine {
    mode: RecognitionMode,
}

impl SimilarityEngine {
    pub fn new(mode: RecognitionMode) -> Self {
        Self { mode }
    }

    /// Fused similarity in [0, 1].
    ///
    /// - Fast: cosine.
    /// - Standard: 0.5·cosine + 0.3·euclidean + 0.2·weighted cosine.
    /// - UltraPrecision: 0.35·cosine + 0.25·euclidean + 0.20·manhattan + 0.20·correlation.
    pub fn similarity(&self, a: &Embedding, b: &Embedding) -> f32 {
        let (a, b) = (a.values.as_slice(), b.values.as_slice());
        if !comparable(a, b) {
            return 0.0;
        }
        let fused = match self.mode {
            RecognitionMode::Fast => cosine_similarity(a, b),
            RecognitionMode::Standard => {
                let [wc, we, ww] = STANDARD_WEIGHTS;
                wc * cosine_similarity(a, b)
                    + we * euclidean_similarity(a, b)
                    + ww * weighted_cosine_similarity(a, b)
            }
            RecognitionMode::UltraPrecision => {
                let [wc, we, wm, wr] = ULTRA_WEIGHTS;
                wc * cosine_similarity(a, b)
                    + we * euclidean_similarity(a, b)
                    + wm * manhattan_similarity(a, b)
                    + wr * correlation_similarity(a, b)
            }
        };
        fused.clamp(0.0, 1.0)
    }

    /// Fused similarity scaled by [`quality_weight`] and clamped to [0, 1].
    pub fn similarity_with_quality(&self, a: &Embedding, b: &Embedding, quality: f32) -> f32 {
        (self.similarity(a, b) * quality_weight(quality)).clamp(0.0, 1.0)
    }
}
