//! Advisory face-crop quality score in [0, 1].

use crate::config::QualityConfig;
use crate::filters;
use image::GrayImage;
use serde::Serialize;

const SIZE_WEIGHT: f32 = 0.3;
const SHARPNESS_WEIGHT: f32 = 0.4;
const ILLUMINATION_WEIGHT: f32 = 0.3;

/// Returned whenever the score cannot be computed.
pub const NEUTRAL_QUALITY: f32 = 0.5;

/// Mid-tone exposure the illumination score is centered on.
const MID_TONE: f32 = 127.5;

/// Lower bound of the high tier.
pub const HIGH_QUALITY: f32 = 0.8;
/// Lower bound of the medium tier.
pub const MEDIUM_QUALITY: f32 = 0.6;
/// Lower bound of the low tier. Anything below is very low.
pub const LOW_QUALITY: f32 = 0.4;

/// Coarse quality band. Thresholds and enrollment warnings key off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    High,
    Medium,
    Low,
    VeryLow,
}

impl QualityTier {
    /// Band for a score. NaN is very low.
    pub fn of(quality: f32) -> Self {
        if quality >= HIGH_QUALITY {
            QualityTier::High
        } else if quality >= MEDIUM_QUALITY {
            QualityTier::Medium
        } else if quality >= LOW_QUALITY {
            QualityTier::Low
        } else {
            QualityTier::VeryLow
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
            QualityTier::VeryLow => "very low",
        })
    }
}

/// Sub-scores and weighted total, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityReport {
    pub size: f32,
    pub sharpness: f32,
    pub illumination: f32,
    pub overall: f32,
}

impl QualityReport {
    pub fn neutral() -> Self {
        Self {
            size: NEUTRAL_QUALITY,
            sharpness: NEUTRAL_QUALITY,
            illumination: NEUTRAL_QUALITY,
            overall: NEUTRAL_QUALITY,
        }
    }

    pub fn tier(&self) -> QualityTier {
        QualityTier::of(self.overall)
    }
}

pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Score a grayscale crop at its source resolution.
    pub fn assess(&self, gray: &GrayImage) -> f32 {
        self.report(gray).overall
    }

    pub fn report(&self, gray: &GrayImage) -> QualityReport {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            tracing::debug!(width = w, height = h, "quality: empty input, neutral score");
            return QualityReport::neutral();
        }

        let size = (w.min(h) as f32 / self.config.size_reference).min(1.0);

        let (_, sharp_var) = filters::mean_variance(&filters::laplacian(gray));
        let sharpness = (sharp_var / self.config.sharpness_divisor).clamp(0.0, 1.0);

        let (mean, _) = filters::intensity_stats(gray);
        let illumination = (1.0 - (mean - MID_TONE).abs() / MID_TONE).max(0.0);

        let overall = SIZE_WEIGHT * size
            + SHARPNESS_WEIGHT * sharpness
            + ILLUMINATION_WEIGHT * illumination;
        if !overall.is_finite() {
            tracing::debug!(size, sharpness, illumination, "quality: non-finite score, neutral");
            return QualityReport::neutral();
        }

        QualityReport {
            size,
            sharpness,
            illumination,
            overall: overall.clamp(0.0, 1.0),
        }
    }
}
