//! Best-effort presentation-attack heuristic.
//!
//! Two texture statistics over the grayscale crop:
//! - **flat**: very low intensity variance, typical of a printed photo
//!   re-imaged under even light.
//! - **moire**: a very high fraction of edge pixels, typical of a screen
//!   replay's pixel grid beating against the sensor.
//!
//! False positives and negatives are expected. The result is advisory and
//! never blocks recognition unless `block_on_spoof` is set.

use crate::config::{FeatureConfig, SpoofConfig};
use crate::filters;
use image::GrayImage;
use imageproc::edges::canny;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpoofReport {
    pub variance: f32,
    pub edge_ratio: f32,
    pub flat: bool,
    pub moire: bool,
}

impl SpoofReport {
    pub fn suspected(&self) -> bool {
        self.flat || self.moire
    }
}

pub struct SpoofDetector {
    config: SpoofConfig,
    canny_low: f32,
    canny_high: f32,
}

impl SpoofDetector {
    /// Edge detection shares the feature extractor's Canny thresholds.
    pub fn new(config: SpoofConfig, features: &FeatureConfig) -> Self {
        Self {
            config,
            canny_low: features.canny_low,
            canny_high: features.canny_high,
        }
    }

    pub fn looks_spoofed(&self, gray: &GrayImage) -> bool {
        self.report(gray).is_some_and(|r| r.suspected())
    }

    /// `None` for an empty image.
    pub fn report(&self, gray: &GrayImage) -> Option<SpoofReport> {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            tracing::debug!(width = w, height = h, "spoof: empty input");
            return None;
        }

        let (_, variance) = filters::intensity_stats(gray);
        let edge_ratio = edge_ratio(gray, self.canny_low, self.canny_high);

        let report = SpoofReport {
            variance,
            edge_ratio,
            flat: variance < self.config.min_variance,
            moire: edge_ratio > self.config.max_edge_ratio,
        };
        if report.suspected() {
            tracing::debug!(
                variance,
                edge_ratio,
                flat = report.flat,
                moire = report.moire,
                "spoof heuristic tripped"
            );
        }
        Some(report)
    }
}

/// Fraction of pixels Canny marks as edges. 0 for images under 3×3.
pub(crate) fn edge_ratio(gray: &GrayImage, low: f32, high: f32) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let edges = canny(gray, low, high);
    let count = edges.as_raw().iter().filter(|&&p| p > 0).count();
    count as f32 / (w * h) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn detector() -> SpoofDetector {
        SpoofDetector::new(SpoofConfig::default(), &FeatureConfig::default())
    }

    /// Smooth radial shading with enough variance to pass the flat check.
    fn natural_face(size: u32) -> GrayImage {
        let c = size as f32 / 2.0;
        GrayImage::from_fn(size, size, |x, y| {
            let d = ((x as f32 - c).powi(2) + (y as f32 - c).powi(2)).sqrt() / c;
            Luma([(200.0 - 150.0 * d.min(1.0)) as u8])
        })
    }

    #[test]
    fn test_flat_print_flagged() {
        let gray = GrayImage::from_pixel(80, 80, Luma([140]));
        let report = detector().report(&gray).unwrap();
        assert!(report.flat);
        assert!(!report.moire);
        assert!(detector().looks_spoofed(&gray));
    }

    #[test]
    fn test_dense_stripes_flagged_as_moire() {
        let config = SpoofConfig {
            max_edge_ratio: 0.1,
            ..SpoofConfig::default()
        };
        let detector = SpoofDetector::new(config, &FeatureConfig::default());
        let gray =
            GrayImage::from_fn(80, 80, |x, _| Luma([if (x / 4) % 2 == 0 { 30 } else { 225 }]));
        let report = detector.report(&gray).unwrap();
        assert!(report.edge_ratio > 0.1, "edge ratio {}", report.edge_ratio);
        assert!(report.moire);
        assert!(!report.flat);
    }

    #[test]
    fn test_smooth_shading_passes() {
        let report = detector().report(&natural_face(96)).unwrap();
        assert!(!report.flat, "variance {}", report.variance);
        assert!(!report.moire, "edge ratio {}", report.edge_ratio);
        assert!(!report.suspected());
    }

    #[test]
    fn test_empty_not_flagged() {
        assert!(detector().report(&GrayImage::new(0, 0)).is_none());
        assert!(!detector().looks_spoofed(&GrayImage::new(0, 0)));
    }

    #[test]
    fn test_tiny_image_has_no_edges() {
        let gray = GrayImage::from_pixel(2, 2, Luma([0]));
        assert_eq!(edge_ratio(&gray, 50.0, 100.0), 0.0);
    }
}
