//! Recognizer configuration.
//!
//! One [`RecognizerConfig`] is built at process start (defaults, then an
//! optional TOML file, then `LIKENESS_*` environment overrides) and handed to
//! every component's constructor. All numeric values are provisional defaults
//! pending calibration against a labeled dataset.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which sub-extractors, similarity fusion and threshold floors are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Histogram + coarse 8×8 edge grid, cosine only, no signature.
    Fast,
    /// Histogram + LBP + 4×4 edge grid, three-metric fusion, signature.
    #[default]
    Standard,
    /// Standard features, four-metric fusion, strict-mode threshold floors.
    UltraPrecision,
}

impl RecognitionMode {
    pub const ALL: [RecognitionMode; 3] = [
        RecognitionMode::Fast,
        RecognitionMode::Standard,
        RecognitionMode::UltraPrecision,
    ];

    pub fn uses_lbp(self) -> bool {
        !matches!(self, RecognitionMode::Fast)
    }

    pub fn uses_signature(self) -> bool {
        !matches!(self, RecognitionMode::Fast)
    }

    /// Side length R of the R×R edge-density grid.
    pub fn edge_grid(self) -> usize {
        match self {
            RecognitionMode::Fast => 8,
            RecognitionMode::Standard | RecognitionMode::UltraPrecision => 4,
        }
    }
}

impl FromStr for RecognitionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fast" => Ok(RecognitionMode::Fast),
            "standard" => Ok(RecognitionMode::Standard),
            "ultra" | "ultra_precision" | "ultraprecision" => Ok(RecognitionMode::UltraPrecision),
            other => Err(ConfigError::Invalid(format!("unknown recognition mode: {other}"))),
        }
    }
}

/// How the edge grid records each cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMeasure {
    /// Edge pixels divided by cell area.
    #[default]
    Density,
    /// Raw edge pixel count per cell.
    Count,
}

/// Preprocessor pipeline parameters (stages in pipeline order).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Side of the canonical square face image.
    pub canonical_size: u32,
    pub gaussian_sigma: f32,
    /// Upper bound on CLAHE tiles per axis.
    pub clahe_tiles: u32,
    /// CLAHE clip limit as a fraction of tile pixels.
    pub clahe_clip_limit: f32,
    /// Gamma < 1 brightens.
    pub gamma: f32,
    pub bilateral_radius: u32,
    pub bilateral_sigma_space: f32,
    pub bilateral_sigma_color: f32,
    /// Weight of the Laplacian edge map added back during sharpening.
    pub sharpen_weight: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            canonical_size: 160,
            gaussian_sigma: 0.8,
            clahe_tiles: 8,
            clahe_clip_limit: 0.02,
            gamma: 0.8,
            bilateral_radius: 2,
            bilateral_sigma_space: 3.0,
            bilateral_sigma_color: 30.0,
            sharpen_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Fixed embedding length; sub-extractor output is padded or truncated to it.
    pub embedding_dim: usize,
    /// Intensity histogram buckets (1..=256).
    pub histogram_bins: usize,
    pub edge_measure: EdgeMeasure,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 512,
            histogram_bins: 128,
            edge_measure: EdgeMeasure::Density,
            canny_low: 50.0,
            canny_high: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Shorter side (px) at which the size score saturates.
    pub size_reference: f32,
    /// Laplacian variance that maps to a sharpness score of 1.
    pub sharpness_divisor: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            size_reference: 80.0,
            sharpness_divisor: 500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoofConfig {
    /// Intensity variance below this trips the flat-print heuristic.
    pub min_variance: f32,
    /// Edge-pixel ratio above this trips the screen/moire heuristic.
    pub max_edge_ratio: f32,
    /// Refuse to recognize suspected spoofs. Off: the gate is advisory.
    pub block_on_spoof: bool,
}

impl Default for SpoofConfig {
    fn default() -> Self {
        Self {
            min_variance: 100.0,
            max_edge_ratio: 0.25,
            block_on_spoof: false,
        }
    }
}

/// Quality-tiered acceptance thresholds. Lower quality never gets a laxer bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Quality ≥ 0.8.
    pub high_quality: f32,
    /// 0.6 ≤ quality < 0.8.
    pub medium_quality: f32,
    /// 0.4 ≤ quality < 0.6.
    pub low_quality: f32,
    /// Quality < 0.4.
    pub very_low_quality: f32,
    /// Floors applied in strict UltraPrecision mode.
    pub high_quality_floor: f32,
    pub medium_quality_floor: f32,
    pub low_quality_floor: f32,
    pub very_low_quality_floor: f32,
    /// Reference bar for the relaxed cosine fallback pass.
    pub base_threshold: f32,
    /// Fallback accepts cosine above `base_threshold - fallback_margin`.
    pub fallback_margin: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            high_quality: 0.75,
            medium_quality: 0.80,
            low_quality: 0.85,
            very_low_quality: 0.90,
            high_quality_floor: 0.70,
            medium_quality_floor: 0.75,
            low_quality_floor: 0.80,
            very_low_quality_floor: 0.85,
            base_threshold: 0.85,
            fallback_margin: 0.10,
        }
    }
}

impl ThresholdConfig {
    pub fn fallback_threshold(&self) -> f32 {
        self.base_threshold - self.fallback_margin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Penalize low-quality probes and identities with few prior recognitions.
    pub strict_mode: bool,
    /// Compare biometric signatures (ignored in Fast mode).
    pub use_signature: bool,
    /// EMA smoothing factor for per-identity confidence.
    pub ema_alpha: f32,
    /// Identities with fewer recognitions than this get the cold-start penalty.
    pub cold_start_recognitions: u32,
    /// Length of the per-identity quality history.
    pub quality_history: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            use_signature: true,
            ema_alpha: 0.2,
            cold_start_recognitions: 3,
            quality_history: 10,
        }
    }
}

/// Top-level recognizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub mode: RecognitionMode,
    pub preprocess: PreprocessConfig,
    pub features: FeatureConfig,
    pub quality: QualityConfig,
    pub spoof: SpoofConfig,
    pub thresholds: ThresholdConfig,
    pub matcher: MatcherConfig,
    /// Entries kept in the per-frame feature cache before it is flushed.
    pub cache_capacity: usize,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            mode: RecognitionMode::default(),
            preprocess: PreprocessConfig::default(),
            features: FeatureConfig::default(),
            quality: QualityConfig::default(),
            spoof: SpoofConfig::default(),
            thresholds: ThresholdConfig::default(),
            matcher: MatcherConfig::default(),
            cache_capacity: 256,
        }
    }
}

impl RecognizerConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `LIKENESS_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(mode) = std::env::var("LIKENESS_MODE") {
            self.mode = mode.parse()?;
        }
        if let Ok(strict) = std::env::var("LIKENESS_STRICT") {
            self.matcher.strict_mode = strict != "0";
        }
        self.features.embedding_dim =
            env_usize("LIKENESS_EMBEDDING_DIM", self.features.embedding_dim);
        self.features.histogram_bins =
            env_usize("LIKENESS_HISTOGRAM_BINS", self.features.histogram_bins);
        self.preprocess.canonical_size =
            env_u32("LIKENESS_CANONICAL_SIZE", self.preprocess.canonical_size);
        self.thresholds.base_threshold =
            env_f32("LIKENESS_BASE_THRESHOLD", self.thresholds.base_threshold);
        self.thresholds.fallback_margin =
            env_f32("LIKENESS_FALLBACK_MARGIN", self.thresholds.fallback_margin);
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.features.embedding_dim == 0 {
            return invalid("embedding_dim must be positive".into());
        }
        if !(1..=256).contains(&self.features.histogram_bins) {
            return invalid(format!(
                "histogram_bins must be in 1..=256, got {}",
                self.features.histogram_bins
            ));
        }
        if self.preprocess.canonical_size < 16 {
            return invalid(format!(
                "canonical_size must be at least 16, got {}",
                self.preprocess.canonical_size
            ));
        }

        let t = &self.thresholds;
        let all = [
            ("high_quality", t.high_quality),
            ("medium_quality", t.medium_quality),
            ("low_quality", t.low_quality),
            ("very_low_quality", t.very_low_quality),
            ("high_quality_floor", t.high_quality_floor),
            ("medium_quality_floor", t.medium_quality_floor),
            ("low_quality_floor", t.low_quality_floor),
            ("very_low_quality_floor", t.very_low_quality_floor),
            ("base_threshold", t.base_threshold),
            ("fallback_margin", t.fallback_margin),
        ];
        for (name, value) in all {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be in [0, 1], got {value}"));
            }
        }

        let tiers_monotone = t.very_low_quality >= t.low_quality
            && t.low_quality >= t.medium_quality
            && t.medium_quality >= t.high_quality;
        let floors_monotone = t.very_low_quality_floor >= t.low_quality_floor
            && t.low_quality_floor >= t.medium_quality_floor
            && t.medium_quality_floor >= t.high_quality_floor;
        if !tiers_monotone || !floors_monotone {
            return invalid("thresholds must not decrease as quality decreases".into());
        }

        if !(self.matcher.ema_alpha > 0.0 && self.matcher.ema_alpha <= 1.0) {
            return invalid(format!("ema_alpha must be in (0, 1], got {}", self.matcher.ema_alpha));
        }

        Ok(())
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RecognizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_capacity, 256);
        assert_eq!(config.mode, RecognitionMode::Standard);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RecognizerConfig::from_toml_str(
            r#"
            mode = "ultra_precision"

            [matcher]
            strict_mode = true

            [thresholds]
            base_threshold = 0.9
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, RecognitionMode::UltraPrecision);
        assert!(config.matcher.strict_mode);
        assert!((config.thresholds.base_threshold - 0.9).abs() < 1e-6);
        assert_eq!(config.features.embedding_dim, 512);
        assert_eq!(config.preprocess.canonical_size, 160);
    }

    #[test]
    fn test_toml_rejects_non_monotone_tiers() {
        let err = RecognizerConfig::from_toml_str(
            r#"
            [thresholds]
            high_quality = 0.95
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_embedding_dim() {
        let mut config = RecognizerConfig::default();
        config.features.embedding_dim = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_histogram_bins_out_of_range() {
        let mut config = RecognizerConfig::default();
        config.features.histogram_bins = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("fast".parse::<RecognitionMode>().unwrap(), RecognitionMode::Fast);
        assert_eq!(
            "Ultra-Precision".parse::<RecognitionMode>().unwrap(),
            RecognitionMode::UltraPrecision
        );
        assert!("turbo".parse::<RecognitionMode>().is_err());
    }

    #[test]
    fn test_mode_edge_grid() {
        assert_eq!(RecognitionMode::Fast.edge_grid(), 8);
        assert_eq!(RecognitionMode::Standard.edge_grid(), 4);
        assert!(!RecognitionMode::Fast.uses_lbp());
        assert!(RecognitionMode::UltraPrecision.uses_signature());
    }

    #[test]
    fn test_fallback_threshold() {
        let t = ThresholdConfig::default();
        assert!((t.fallback_threshold() - 0.75).abs() < 1e-6);
    }
}
