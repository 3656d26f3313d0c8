//! Gallery matching.
//!
//! [`AdaptiveMatcher`] scores every identity with fused similarity, a
//! signature check and a consistency term, accepts the best identity that
//! clears a quality-tiered threshold, and otherwise falls back to a plain
//! cosine pass ([`CosineMatcher`]) over individual embeddings.
//!
//! The fallback is a deliberate recall/precision trade-off: it rescues probes
//! that are close in raw cosine but penalized by the stricter fused pass.

use crate::config::{MatcherConfig, RecognitionMode, ThresholdConfig};
use crate::filters;
use crate::gallery::{Gallery, GalleryEntry};
use crate::quality::QualityTier;
use crate::signature;
use crate::similarity::{self, SimilarityEngine};
use crate::types::{BiometricSignature, Embedding, PersonId, SignatureSource};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

const MAX_SIM_WEIGHT: f32 = 0.4;
const AVG_SIM_WEIGHT: f32 = 0.3;
const BIOMETRIC_WEIGHT: f32 = 0.2;
const GEOMETRIC_WEIGHT: f32 = 0.1;
/// Steepness of `exp(-variance * k)` in the consistency term.
const GEOMETRIC_VARIANCE_SCALE: f32 = 10.0;

/// Strict mode: applied to probes below the medium quality tier.
const STRICT_LOW_QUALITY_PENALTY: f32 = 0.9;
const STRICT_COLD_START_PENALTY: f32 = 0.95;

/// Features of the face being recognized, computed once per call.
#[derive(Debug, Clone)]
pub struct Probe {
    pub embedding: Embedding,
    pub quality: f32,
    /// Image-derived signature, when the signature stage ran.
    pub signature: Option<BiometricSignature>,
}

impl Probe {
    pub fn new(embedding: Embedding, quality: f32) -> Self {
        Self {
            embedding,
            quality,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: BiometricSignature) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// How a [`Recognition`] was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    EmptyGallery,
    ExtractionFailed,
    NoFaceDetected,
    /// Accepted by the fused score against the dynamic threshold.
    FusedScore,
    /// Accepted by the relaxed cosine pass.
    FallbackCosine,
    BelowThreshold,
    SpoofRejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    /// `None` means "Unknown".
    pub identity: Option<PersonId>,
    /// Best score found, even when nothing was accepted.
    pub confidence: f32,
    pub quality: f32,
    pub decision: Decision,
    pub spoof_suspected: bool,
}

impl Recognition {
    pub fn unknown(decision: Decision, confidence: f32, quality: f32) -> Self {
        Self {
            identity: None,
            confidence,
            quality,
            decision,
            spoof_suspected: false,
        }
    }

    fn matched(identity: PersonId, confidence: f32, quality: f32, decision: Decision) -> Self {
        Self {
            identity: Some(identity),
            confidence,
            quality,
            decision,
            spoof_suspected: false,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    pub fn label(&self) -> &str {
        self.identity.as_ref().map_or("Unknown", PersonId::as_str)
    }
}

/// Strategy for comparing a probe against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &Probe, gallery: &Gallery) -> Recognition;
}

/// Clamped cosine over every stored embedding, accepting the best one
/// strictly above `threshold`.
///
/// Always iterates ALL gallery embeddings so timing does not depend on
/// gallery contents or match position.
pub struct CosineMatcher {
    pub threshold: f32,
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Probe, gallery: &Gallery) -> Recognition {
        if gallery.is_empty() {
            return Recognition::unknown(Decision::EmptyGallery, 0.0, probe.quality);
        }
        if probe.embedding.is_sentinel() {
            return Recognition::unknown(Decision::ExtractionFailed, 0.0, probe.quality);
        }

        let mut best_sim = 0.0f32;
        let mut best: Option<&GalleryEntry> = None;
        for entry in gallery.entries() {
            for stored in &entry.embeddings {
                let sim = similarity::cosine_similarity(&probe.embedding.values, &stored.values);
                if sim > best_sim {
                    best_sim = sim;
                    best = Some(entry);
                }
            }
        }

        match best {
            Some(entry) if best_sim > self.threshold => Recognition::matched(
                entry.identity.clone(),
                best_sim,
                probe.quality,
                Decision::FallbackCosine,
            ),
            _ => Recognition::unknown(Decision::BelowThreshold, best_sim, probe.quality),
        }
    }
}

/// Per-identity recognition history. In memory only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognitionStats {
    pub ema_confidence: f32,
    pub recognitions: u32,
    /// Most recent probe qualities, oldest first.
    pub quality_history: VecDeque<f32>,
}

impl RecognitionStats {
    pub fn record(&mut self, confidence: f32, quality: f32, alpha: f32, history_len: usize) {
        self.ema_confidence = if self.recognitions == 0 {
            confidence
        } else {
            alpha * confidence + (1.0 - alpha) * self.ema_confidence
        };
        self.recognitions = self.recognitions.saturating_add(1);
        self.quality_history.push_back(quality);
        while self.quality_history.len() > history_len {
            self.quality_history.pop_front();
        }
    }
}

#[derive(Default)]
struct MatcherState {
    stats: HashMap<PersonId, RecognitionStats>,
    signatures: HashMap<PersonId, BiometricSignature>,
}

/// Multi-signal matcher with quality-adaptive thresholds.
///
/// Stats and signature caches share one lock, held for the whole scan, so
/// concurrent recognitions update each identity strictly in sequence.
pub struct AdaptiveMatcher {
    mode: RecognitionMode,
    thresholds: ThresholdConfig,
    config: MatcherConfig,
    engine: SimilarityEngine,
    fallback: CosineMatcher,
    state: Mutex<MatcherState>,
}

impl AdaptiveMatcher {
    pub fn new(mode: RecognitionMode, thresholds: ThresholdConfig, config: MatcherConfig) -> Self {
        Self {
            mode,
            thresholds,
            config,
            engine: SimilarityEngine::new(mode),
            fallback: CosineMatcher::new(thresholds.fallback_threshold()),
            state: Mutex::new(MatcherState::default()),
        }
    }

    /// Acceptance bar for a probe of the given quality. Never lower for a
    /// lower quality.
    pub fn dynamic_threshold(&self, quality: f32) -> f32 {
        let t = &self.thresholds;
        let (tier, floor) = match QualityTier::of(quality) {
            QualityTier::High => (t.high_quality, t.high_quality_floor),
            QualityTier::Medium => (t.medium_quality, t.medium_quality_floor),
            QualityTier::Low => (t.low_quality, t.low_quality_floor),
            QualityTier::VeryLow => (t.very_low_quality, t.very_low_quality_floor),
        };

        if self.config.strict_mode && self.mode == RecognitionMode::UltraPrecision {
            tier.max(floor)
        } else {
            tier
        }
    }

    pub fn stats(&self, identity: &PersonId) -> Option<RecognitionStats> {
        self.state.lock().stats.get(identity).cloned()
    }

    pub fn cached_signature(&self, identity: &PersonId) -> Option<BiometricSignature> {
        self.state.lock().signatures.get(identity).cloned()
    }

    /// Drop all recognition stats and cached signatures.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.stats.clear();
        state.signatures.clear();
    }

    fn signatures_enabled(&self) -> bool {
        self.config.use_signature && self.mode.uses_signature()
    }

    /// Consistency of the probe's own value distribution: `exp(-var·10)·quality`.
    fn geometric_consistency(embedding: &Embedding, quality: f32) -> f32 {
        let (_, variance) = filters::mean_variance(&embedding.values);
        ((-variance * GEOMETRIC_VARIANCE_SCALE).exp() * quality).clamp(0.0, 1.0)
    }

    /// Signature agreement for one identity. Populates the cache on first sight.
    fn biometric_match(
        &self,
        state: &mut MatcherState,
        entry: &GalleryEntry,
        probe: &Probe,
        probe_derived: &mut Option<BiometricSignature>,
    ) -> f32 {
        let Some(first) = entry.embeddings.first() else {
            return 0.0;
        };
        if first.len() != probe.embedding.len() {
            return 0.0;
        }
        let stored = state
            .signatures
            .entry(entry.identity.clone())
            .or_insert_with(|| {
                entry
                    .signature
                    .clone()
                    .unwrap_or_else(|| signature::from_embedding(first))
            });

        match (stored.source, &probe.signature) {
            (SignatureSource::Image, Some(probe_sig)) => signature::compare(stored, probe_sig),
            (SignatureSource::Embedding, _) => {
                let derived = probe_derived
                    .get_or_insert_with(|| signature::from_embedding(&probe.embedding));
                signature::compare(stored, derived)
            }
            // Image signature on file but none for the probe: compare pooled forms
            (SignatureSource::Image, None) => {
                let derived = probe_derived
                    .get_or_insert_with(|| signature::from_embedding(&probe.embedding));
                signature::compare(&signature::from_embedding(first), derived)
            }
        }
    }

    fn record_match(
        &self,
        state: &mut MatcherState,
        identity: &PersonId,
        probe: &Probe,
        confidence: f32,
    ) {
        let stats = state.stats.entry(identity.clone()).or_default();
        stats.record(confidence, probe.quality, self.config.ema_alpha, self.config.quality_history);

        if let Some(fresh) = &probe.signature {
            let replace = state
                .signatures
                .get(identity)
                .map_or(true, |cached| cached.source == SignatureSource::Embedding);
            if replace {
                state.signatures.insert(identity.clone(), fresh.clone());
            }
        }
    }
}

impl Matcher for AdaptiveMatcher {
    fn compare(&self, probe: &Probe, gallery: &Gallery) -> Recognition {
        let quality = probe.quality;
        if gallery.is_empty() {
            tracing::debug!("recognize: empty gallery");
            return Recognition::unknown(Decision::EmptyGallery, 0.0, quality);
        }
        if probe.embedding.is_sentinel() {
            tracing::debug!("recognize: sentinel probe embedding");
            return Recognition::unknown(Decision::ExtractionFailed, 0.0, quality);
        }

        let threshold = self.dynamic_threshold(quality);
        let geometric = Self::geometric_consistency(&probe.embedding, quality);
        let use_signature = self.signatures_enabled();
        let mut probe_derived: Option<BiometricSignature> = None;

        let mut state = self.state.lock();
        let mut best_score = 0.0f32;
        let mut candidate: Option<(&PersonId, f32)> = None;

        let low_quality =
            matches!(QualityTier::of(quality), QualityTier::Low | QualityTier::VeryLow);
        for entry in gallery.entries() {
            if !entry.embeddings.iter().any(|e| e.len() == probe.embedding.len()) {
                if !entry.embeddings.is_empty() {
                    tracing::warn!(
                        person = %entry.identity,
                        probe = probe.embedding.len(),
                        "gallery embeddings differ in dimension; re-enroll under this configuration"
                    );
                }
                continue;
            }
            let sims: Vec<f32> = entry
                .embeddings
                .iter()
                .map(|stored| {
                    self.engine
                        .similarity_with_quality(&probe.embedding, stored, quality)
                })
                .collect();
            let max_sim = sims.iter().copied().fold(0.0f32, f32::max);
            let avg_sim = sims.iter().sum::<f32>() / sims.len() as f32;

            let biometric = if use_signature {
                self.biometric_match(&mut state, entry, probe, &mut probe_derived)
            } else {
                max_sim
            };

            let mut score = MAX_SIM_WEIGHT * max_sim
                + AVG_SIM_WEIGHT * avg_sim
                + BIOMETRIC_WEIGHT * biometric
                + GEOMETRIC_WEIGHT * geometric;

            if self.config.strict_mode {
                if low_quality {
                    score *= STRICT_LOW_QUALITY_PENALTY;
                }
                let prior = state.stats.get(&entry.identity).map_or(0, |s| s.recognitions);
                if prior < self.config.cold_start_recognitions {
                    score *= STRICT_COLD_START_PENALTY;
                }
            }
            let score = score.clamp(0.0, 1.0);

            tracing::trace!(
                person = %entry.identity,
                max_sim,
                avg_sim,
                biometric,
                score,
                "identity scored"
            );

            best_score = best_score.max(score);
            if score >= threshold && candidate.map_or(true, |(_, s)| score > s) {
                candidate = Some((&entry.identity, score));
            }
        }

        if let Some((identity, score)) = candidate {
            self.record_match(&mut state, identity, probe, score);
            tracing::debug!(person = %identity, score, threshold, quality, "recognized (fused)");
            return Recognition::matched(identity.clone(), score, quality, Decision::FusedScore);
        }

        let fallback = self.fallback.compare(probe, gallery);
        if let Some(identity) = &fallback.identity {
            self.record_match(&mut state, identity, probe, fallback.confidence);
            tracing::debug!(
                person = %identity,
                cosine = fallback.confidence,
                threshold = self.fallback.threshold,
                "recognized (fallback cosine)"
            );
            return fallback;
        }

        tracing::debug!(best_score, threshold, quality, "no identity cleared threshold");
        Recognition::unknown(Decision::BelowThreshold, best_score, quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DIM: usize = 64;

    /// Deterministic non-negative vector; different seeds are far apart.
    fn spread(seed: usize) -> Vec<f32> {
        (0..DIM)
            .map(|i| {
                let scale = if (i + seed) % 3 == 0 { 1.0 } else { 0.2 };
                (((i * 7 + seed * 13) % 17) as f32 + 1.0) * scale
            })
            .collect()
    }

    fn near(base: &[f32], eps: f32) -> Embedding {
        Embedding::normalized(
            base.iter()
                .enumerate()
                .map(|(i, v)| v + eps * (i % 3) as f32)
                .collect(),
        )
    }

    fn matcher(mode: RecognitionMode, strict: bool) -> AdaptiveMatcher {
        AdaptiveMatcher::new(
            mode,
            ThresholdConfig::default(),
            MatcherConfig {
                strict_mode: strict,
                ..MatcherConfig::default()
            },
        )
    }

    fn alice_gallery() -> (Gallery, Vec<f32>) {
        let v = spread(1);
        let gallery = Gallery::from_records(vec![
            ("alice".into(), near(&v, 0.001)),
            ("alice".into(), near(&v, 0.002)),
            ("alice".into(), near(&v, 0.003)),
        ]);
        (gallery, v)
    }

    #[test]
    fn test_close_probe_matches_alice() {
        let (gallery, v) = alice_gallery();
        let probe = Probe::new(Embedding::normalized(v), 0.9);
        let result = matcher(RecognitionMode::Standard, false).compare(&probe, &gallery);
        assert_eq!(result.label(), "alice");
        assert!(result.confidence >= 0.80, "confidence {}", result.confidence);
        assert_eq!(result.decision, Decision::FusedScore);
    }

    #[test]
    fn test_sentinel_probe_is_unknown() {
        let (gallery, _) = alice_gallery();
        let probe = Probe::new(Embedding::sentinel(DIM), 0.9);
        let result = matcher(RecognitionMode::Standard, false).compare(&probe, &gallery);
        assert!(!result.is_match());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.decision, Decision::ExtractionFailed);
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let probe = Probe::new(Embedding::normalized(spread(1)), 0.9);
        let result = matcher(RecognitionMode::Standard, false).compare(&probe, &Gallery::new());
        assert_eq!(result.label(), "Unknown");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.decision, Decision::EmptyGallery);
    }

    #[test]
    fn test_orthogonal_probe_rejected_with_best_score() {
        let mut a = vec![0.0; DIM];
        let mut b = vec![0.0; DIM];
        a[..DIM / 2].fill(1.0);
        b[DIM / 2..].fill(1.0);
        let gallery = Gallery::from_records(vec![("alice".into(), Embedding::normalized(a))]);
        let probe = Probe::new(Embedding::normalized(b), 0.9);

        let result = matcher(RecognitionMode::Standard, false).compare(&probe, &gallery);
        assert!(!result.is_match());
        assert_eq!(result.decision, Decision::BelowThreshold);
        assert!(
            result.confidence > 0.0 && result.confidence < 0.75,
            "confidence {}",
            result.confidence
        );
    }

    #[test]
    fn test_picks_highest_scoring_identity() {
        let (mut gallery, v) = alice_gallery();
        gallery.add("bob".into(), Embedding::normalized(spread(5)));
        let probe = Probe::new(Embedding::normalized(spread(5)), 0.9);
        let result = matcher(RecognitionMode::UltraPrecision, false).compare(&probe, &gallery);
        assert_eq!(result.label(), "bob");

        let probe = Probe::new(Embedding::normalized(v), 0.9);
        let result = matcher(RecognitionMode::UltraPrecision, false).compare(&probe, &gallery);
        assert_eq!(result.label(), "alice");
    }

    #[test]
    fn test_fallback_rescues_low_quality_probe() {
        // Quality 0.1 weights fused similarity by 0.5; the fused pass cannot
        // reach the 0.90 very-low-quality bar but cosine is still ~1.
        let (gallery, v) = alice_gallery();
        let probe = Probe::new(Embedding::normalized(v), 0.1);
        let m = matcher(RecognitionMode::Standard, false);
        assert!((m.dynamic_threshold(0.1) - 0.90).abs() < 1e-6);

        let result = m.compare(&probe, &gallery);
        assert_eq!(result.label(), "alice");
        assert_eq!(result.decision, Decision::FallbackCosine);
        assert!(result.confidence > 0.75);
        assert_eq!(m.stats(&"alice".into()).unwrap().recognitions, 1);
    }

    #[test]
    fn test_dynamic_threshold_tiers() {
        let m = matcher(RecognitionMode::Standard, false);
        assert!((m.dynamic_threshold(0.95) - 0.75).abs() < 1e-6);
        assert!((m.dynamic_threshold(0.7) - 0.80).abs() < 1e-6);
        assert!((m.dynamic_threshold(0.5) - 0.85).abs() < 1e-6);
        assert!((m.dynamic_threshold(0.2) - 0.90).abs() < 1e-6);
        assert!((m.dynamic_threshold(f32::NAN) - 0.90).abs() < 1e-6);
    }

    #[test]
    fn test_strict_ultra_applies_floors() {
        let thresholds = ThresholdConfig {
            high_quality: 0.5,
            medium_quality: 0.55,
            ..ThresholdConfig::default()
        };
        let strict = MatcherConfig {
            strict_mode: true,
            ..MatcherConfig::default()
        };
        let ultra = AdaptiveMatcher::new(RecognitionMode::UltraPrecision, thresholds, strict);
        assert!((ultra.dynamic_threshold(0.9) - 0.70).abs() < 1e-6);
        assert!((ultra.dynamic_threshold(0.7) - 0.75).abs() < 1e-6);

        let standard = AdaptiveMatcher::new(RecognitionMode::Standard, thresholds, strict);
        assert!((standard.dynamic_threshold(0.9) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_strict_mode_penalizes_cold_start() {
        let (gallery, v) = alice_gallery();
        let probe = Probe::new(Embedding::normalized(v), 0.9);
        let lax = matcher(RecognitionMode::Standard, false).compare(&probe, &gallery);
        let strict = matcher(RecognitionMode::Standard, true).compare(&probe, &gallery);
        assert!((strict.confidence - lax.confidence * STRICT_COLD_START_PENALTY).abs() < 1e-4);
    }

    #[test]
    fn test_stats_ema_and_history() {
        let (gallery, v) = alice_gallery();
        let m = AdaptiveMatcher::new(
            RecognitionMode::Standard,
            ThresholdConfig::default(),
            MatcherConfig {
                quality_history: 2,
                ..MatcherConfig::default()
            },
        );
        let first = m.compare(&Probe::new(Embedding::normalized(v.clone()), 0.9), &gallery);
        let stats = m.stats(&"alice".into()).unwrap();
        assert_eq!(stats.recognitions, 1);
        assert!((stats.ema_confidence - first.confidence).abs() < 1e-6);

        let second = m.compare(&Probe::new(Embedding::normalized(v.clone()), 0.85), &gallery);
        m.compare(&Probe::new(Embedding::normalized(v), 0.95), &gallery);
        let stats = m.stats(&"alice".into()).unwrap();
        assert_eq!(stats.recognitions, 3);
        assert_eq!(stats.quality_history, VecDeque::from([0.85, 0.95]));
        assert!(second.confidence > 0.0);

        m.clear();
        assert!(m.stats(&"alice".into()).is_none());
    }

    #[test]
    fn test_image_signature_replaces_derived_after_match() {
        let (gallery, v) = alice_gallery();
        let m = matcher(RecognitionMode::Standard, false);
        let probe_sig = signature::from_embedding(&Embedding::normalized(v.clone()));
        let probe_sig =
            BiometricSignature::from_values(probe_sig.values().to_vec(), SignatureSource::Image)
                .unwrap();
        let probe = Probe::new(Embedding::normalized(v), 0.9).with_signature(probe_sig);

        let result = m.compare(&probe, &gallery);
        assert!(result.is_match());
        assert_eq!(m.cached_signature(&"alice".into()).unwrap().source, SignatureSource::Image);
    }

    #[test]
    fn test_fast_mode_skips_signature_cache() {
        let (gallery, v) = alice_gallery();
        let m = matcher(RecognitionMode::Fast, false);
        let result = m.compare(&Probe::new(Embedding::normalized(v), 0.9), &gallery);
        assert!(result.is_match());
        assert!(m.cached_signature(&"alice".into()).is_none());
    }

    #[test]
    fn test_cosine_matcher_requires_strictly_greater() {
        let gallery =
            Gallery::from_records(vec![("alice".into(), Embedding::normalized(vec![1.0, 0.0]))]);
        let probe = Probe::new(Embedding::normalized(vec![1.0, 0.0]), 0.5);
        assert!(CosineMatcher::new(0.99).compare(&probe, &gallery).is_match());
        assert!(!CosineMatcher::new(1.0).compare(&probe, &gallery).is_match());
    }

    #[test]
    fn test_dimension_mismatch_scores_zero() {
        let short = Embedding::normalized(spread(1)[..32].to_vec());
        let gallery = Gallery::from_records(vec![("alice".into(), short)]);
        let probe = Probe::new(Embedding::normalized(spread(1)), 0.9);
        for mode in RecognitionMode::ALL {
            let m = matcher(mode, false);
            let result = m.compare(&probe, &gallery);
            assert!(!result.is_match(), "{mode:?}");
            assert_eq!(result.confidence, 0.0, "{mode:?}");
            assert_eq!(result.decision, Decision::BelowThreshold);
            assert!(m.cached_signature(&"alice".into()).is_none());
        }
    }

    #[test]
    fn test_mismatched_identity_does_not_mask_valid_one() {
        let (mut gallery, v) = alice_gallery();
        gallery.add("bob".into(), Embedding::normalized(v[..32].to_vec()));
        let probe = Probe::new(Embedding::normalized(v), 0.9);
        let result = matcher(RecognitionMode::Standard, false).compare(&probe, &gallery);
        assert_eq!(result.label(), "alice");
    }

    proptest! {
        #[test]
        fn prop_threshold_monotone(q1 in 0.0f32..1.0, q2 in 0.0f32..1.0, strict in any::<bool>()) {
            let (lo, hi) = if q1 <= q2 { (q1, q2) } else { (q2, q1) };
            for mode in RecognitionMode::ALL {
                let m = matcher(mode, strict);
                prop_assert!(m.dynamic_threshold(lo) >= m.dynamic_threshold(hi));
            }
        }
    }
}
