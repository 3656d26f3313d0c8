//! Caller-facing facade over the whole pipeline.
//!
//! ```text
//! FaceImage ─► grayscale ─┬─► quality, spoof            (source size)
//!                         └─► enhance ─┬─► embedding    (canonical size)
//!                                      └─► signature
//!                                              │
//!                           Probe ─► AdaptiveMatcher ─► Recognition
//! ```
//!
//! Nothing on the recognition path returns an error: bad frames degrade to
//! an "Unknown" [`Recognition`] so a capture loop never stops on one.

use crate::cache::{CachedFeatures, FeatureCache};
use crate::config::RecognizerConfig;
use crate::detector::FaceDetector;
use crate::features::FeatureExtractor;
use crate::gallery::{Gallery, GalleryError, GalleryStore};
use crate::matcher::{AdaptiveMatcher, Decision, Matcher, Probe, Recognition, RecognitionStats};
use crate::preprocess::{PreprocessError, Preprocessor};
use crate::quality::{QualityAssessor, QualityReport, QualityTier, NEUTRAL_QUALITY};
use crate::signature::SignatureExtractor;
use crate::spoof::{SpoofDetector, SpoofReport};
use crate::types::{Embedding, FaceImage, FrameKey, PersonId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionFailure {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] PreprocessError),
    #[error("feature extraction produced the zero sentinel")]
    Degenerate,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionFailure),
    #[error("gallery store: {0}")]
    Store(#[from] GalleryError),
}

pub struct FaceRecognizer {
    config: RecognizerConfig,
    preprocessor: Preprocessor,
    quality: QualityAssessor,
    spoof: SpoofDetector,
    features: FeatureExtractor,
    signatures: SignatureExtractor,
    matcher: AdaptiveMatcher,
    cache: FeatureCache,
}

impl FaceRecognizer {
    pub fn new(config: RecognizerConfig) -> Self {
        tracing::info!(
            mode = ?config.mode,
            embedding_dim = config.features.embedding_dim,
            strict = config.matcher.strict_mode,
            "face recognizer ready"
        );
        Self {
            preprocessor: Preprocessor::new(config.preprocess),
            quality: QualityAssessor::new(config.quality),
            spoof: SpoofDetector::new(config.spoof, &config.features),
            features: FeatureExtractor::new(config.mode, config.features),
            signatures: SignatureExtractor,
            matcher: AdaptiveMatcher::new(config.mode, config.thresholds, config.matcher),
            cache: FeatureCache::new(config.cache_capacity),
            config,
        }
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    pub fn embedding_dim(&self) -> usize {
        self.features.embedding_dim()
    }

    fn signatures_enabled(&self) -> bool {
        self.config.matcher.use_signature && self.config.mode.uses_signature()
    }

    /// Run every extractor once for `image`, reusing cached results for `key`.
    fn analyze(&self, image: &FaceImage, key: FrameKey) -> Result<CachedFeatures, PreprocessError> {
        if let Some(hit) = self.cache.get(&key) {
            tracing::trace!(?key, "feature cache hit");
            return Ok(hit);
        }

        let gray = self.preprocessor.grayscale(image)?;
        let ((quality, spoof_suspected), (embedding, signature)) = rayon::join(
            || (self.quality.assess(&gray), self.spoof.looks_spoofed(&gray)),
            || {
                let canonical = self.preprocessor.enhance(&gray);
                rayon::join(
                    || self.features.extract(&canonical),
                    || self.signatures_enabled().then(|| self.signatures.extract(&canonical)),
                )
            },
        );

        let features = CachedFeatures {
            embedding,
            quality,
            signature,
            spoof_suspected,
        };
        self.cache.insert(key, features.clone());
        Ok(features)
    }

    /// Recognize a face crop, keyed by its pixel content.
    pub fn recognize(&self, image: &FaceImage, gallery: &Gallery) -> Recognition {
        self.recognize_keyed(image, image.content_key(), gallery)
    }

    /// Recognize with a caller-supplied cache key (e.g. a frame sequence number).
    pub fn recognize_keyed(
        &self,
        image: &FaceImage,
        key: FrameKey,
        gallery: &Gallery,
    ) -> Recognition {
        if gallery.is_empty() {
            tracing::debug!("recognize: empty gallery");
            return Recognition::unknown(Decision::EmptyGallery, 0.0, NEUTRAL_QUALITY);
        }

        let features = match self.analyze(image, key) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, "recognize: input rejected");
                return Recognition::unknown(Decision::ExtractionFailed, 0.0, NEUTRAL_QUALITY);
            }
        };

        if features.spoof_suspected && self.config.spoof.block_on_spoof {
            tracing::info!(quality = features.quality, "recognize: suspected spoof rejected");
            let mut rejected = Recognition::unknown(Decision::SpoofRejected, 0.0, features.quality);
            rejected.spoof_suspected = true;
            return rejected;
        }

        let mut probe = Probe::new(features.embedding, features.quality);
        probe.signature = features.signature;
        let mut recognition = self.recognize_probe(&probe, gallery);
        recognition.spoof_suspected = features.spoof_suspected;
        recognition
    }

    /// Match precomputed probe features.
    pub fn recognize_probe(&self, probe: &Probe, gallery: &Gallery) -> Recognition {
        let recognition = self.matcher.compare(probe, gallery);
        tracing::debug!(
            identity = recognition.label(),
            confidence = recognition.confidence,
            decision = ?recognition.decision,
            "recognition complete"
        );
        recognition
    }

    /// Detect the largest face in a full frame, crop it and recognize it.
    pub fn recognize_frame(
        &self,
        frame: &FaceImage,
        detector: &dyn FaceDetector,
        gallery: &Gallery,
    ) -> Recognition {
        let face = detector
            .detect_largest_face(frame)
            .and_then(|bbox| frame.crop(&bbox));
        let Some(face) = face else {
            tracing::debug!(
                width = frame.width(),
                height = frame.height(),
                "recognize: no face detected"
            );
            return Recognition::unknown(Decision::NoFaceDetected, 0.0, NEUTRAL_QUALITY);
        };
        self.recognize(&face, gallery)
    }

    /// Extract an enrollment embedding.
    pub fn enroll(&self, image: &FaceImage) -> Result<Embedding, ExtractionFailure> {
        let features = self.analyze(image, image.content_key())?;
        if features.embedding.is_sentinel() {
            return Err(ExtractionFailure::Degenerate);
        }
        if QualityTier::of(features.quality) == QualityTier::VeryLow {
            tracing::warn!(quality = features.quality, "enrolling a low-quality sample");
        }
        Ok(features.embedding)
    }

    /// Extract and persist in one step.
    pub fn enroll_into(
        &self,
        identity: &PersonId,
        image: &FaceImage,
        store: &mut dyn GalleryStore,
    ) -> Result<Embedding, EnrollError> {
        let embedding = self.enroll(image)?;
        store.save_embedding(identity, &embedding)?;
        tracing::info!(person = %identity, dim = embedding.len(), "enrolled");
        Ok(embedding)
    }

    /// Advisory quality in [0, 1]; neutral 0.5 for unusable input.
    pub fn assess_quality(&self, image: &FaceImage) -> f32 {
        self.quality_report(image).overall
    }

    pub fn quality_report(&self, image: &FaceImage) -> QualityReport {
        match self.preprocessor.grayscale(image) {
            Ok(gray) => self.quality.report(&gray),
            Err(_) => QualityReport::neutral(),
        }
    }

    pub fn looks_spoofed(&self, image: &FaceImage) -> bool {
        self.spoof_report(image).is_some_and(|r| r.suspected())
    }

    pub fn spoof_report(&self, image: &FaceImage) -> Option<SpoofReport> {
        let gray = self.preprocessor.grayscale(image).ok()?;
        self.spoof.report(&gray)
    }

    pub fn stats(&self, identity: &PersonId) -> Option<RecognitionStats> {
        self.matcher.stats(identity)
    }

    /// Drop feature caches, recognition stats and cached signatures.
    pub fn clear_caches(&self) {
        self.cache.clear();
        self.matcher.clear();
        tracing::debug!("caches cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::WholeFrameDetector;
    use crate::gallery::MemoryGalleryStore;
    use crate::types::BoundingBox;
    use image::{DynamicImage, Luma, Rgb, RgbImage};

    fn textured_face(seed: u32) -> FaceImage {
        let img = RgbImage::from_fn(120, 140, |x, y| {
            let dx = x as i32 - 60;
            let dy = y as i32 - 70;
            let ring = ((dx * dx + dy * dy) as u32 / (40 + seed * 7)) % 5;
            let v = ((x * (3 + seed) + y * 5 + ring * 37) % 160 + 50) as u8;
            Rgb([v, v.saturating_add(10), v.saturating_sub(10)])
        });
        FaceImage::from_dynamic(DynamicImage::ImageRgb8(img))
    }

    fn flat_face() -> FaceImage {
        FaceImage::from_dynamic(DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
            100,
            100,
            Luma([128]),
        )))
    }

    fn alice_gallery(recognizer: &FaceRecognizer, face: &FaceImage) -> Gallery {
        Gallery::from_records(vec![("alice".into(), recognizer.enroll(face).unwrap())])
    }

    fn empty_image() -> FaceImage {
        FaceImage::from_gray(0, 0, Vec::new()).unwrap()
    }

    struct NoFaces;

    impl FaceDetector for NoFaces {
        fn detect_faces(&self, _frame: &FaceImage) -> Vec<BoundingBox> {
            Vec::new()
        }
    }

    #[test]
    fn test_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FaceRecognizer>();
    }

    #[test]
    fn test_enroll_then_recognize_same_image() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        let face = textured_face(1);
        let embedding = recognizer.enroll(&face).unwrap();
        assert_eq!(embedding.len(), recognizer.embedding_dim());

        let gallery = Gallery::from_records(vec![("alice".into(), embedding)]);
        let result = recognizer.recognize(&face, &gallery);
        assert_eq!(result.label(), "alice");
        assert_eq!(recognizer.stats(&"alice".into()).unwrap().recognitions, 1);
    }

    #[test]
    fn test_enroll_empty_image_fails() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        let err = recognizer.enroll(&empty_image()).unwrap_err();
        assert!(matches!(err, ExtractionFailure::InvalidInput(_)));
    }

    #[test]
    fn test_recognize_empty_image_is_extraction_failure() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        let gallery = alice_gallery(&recognizer, &textured_face(1));
        let result = recognizer.recognize(&empty_image(), &gallery);
        assert_eq!(result.decision, Decision::ExtractionFailed);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_enroll_into_store() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        let mut store = MemoryGalleryStore::new();
        recognizer.enroll_into(&"alice".into(), &textured_face(1), &mut store).unwrap();
        recognizer.enroll_into(&"alice".into(), &textured_face(2), &mut store).unwrap();

        let gallery = Gallery::load(&store).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.embedding_count(), 2);
    }

    #[test]
    fn test_recognition_uses_feature_cache() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        let face = textured_face(3);
        let gallery = alice_gallery(&recognizer, &face);
        let first = recognizer.recognize(&face, &gallery);
        let second = recognizer.recognize_keyed(&face, face.content_key(), &gallery);
        assert_eq!(recognizer.cache.len(), 1);
        assert_eq!(first.identity, second.identity);

        recognizer.clear_caches();
        assert!(recognizer.cache.is_empty());
        assert!(recognizer.stats(&"alice".into()).is_none());
    }

    #[test]
    fn test_frame_without_face() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        let gallery = alice_gallery(&recognizer, &textured_face(1));
        let result = recognizer.recognize_frame(&textured_face(1), &NoFaces, &gallery);
        assert_eq!(result.decision, Decision::NoFaceDetected);

        let result = recognizer.recognize_frame(&textured_face(1), &WholeFrameDetector, &gallery);
        assert_eq!(result.label(), "alice");
    }

    #[test]
    fn test_block_on_spoof_rejects_flat_print() {
        let mut config = RecognizerConfig::default();
        config.spoof.block_on_spoof = true;
        let recognizer = FaceRecognizer::new(config);
        let flat = flat_face();
        assert!(recognizer.looks_spoofed(&flat));

        let gallery = alice_gallery(&recognizer, &textured_face(1));
        let result = recognizer.recognize(&flat, &gallery);
        assert_eq!(result.decision, Decision::SpoofRejected);
        assert!(result.spoof_suspected);
        assert!(!result.is_match());
    }

    #[test]
    fn test_spoof_is_advisory_by_default() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        let flat = flat_face();
        let gallery = alice_gallery(&recognizer, &flat);
        let result = recognizer.recognize(&flat, &gallery);
        assert!(result.spoof_suspected);
        assert_ne!(result.decision, Decision::SpoofRejected);
    }

    #[test]
    fn test_quality_of_empty_is_neutral() {
        let recognizer = FaceRecognizer::new(RecognizerConfig::default());
        assert_eq!(recognizer.assess_quality(&empty_image()), NEUTRAL_QUALITY);
        assert!(recognizer.spoof_report(&empty_image()).is_none());
    }
}
