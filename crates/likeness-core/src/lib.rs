//! likeness-core: biometric matching core.
//!
//! Turns a cropped face image into a handcrafted embedding (intensity
//! histogram, LBP texture codes, edge density) plus a coarse 128-dim
//! biometric signature, and matches it against an enrolled gallery with
//! fused similarity metrics and quality-adaptive thresholds.

pub mod cache;
pub mod config;
pub mod detector;
pub mod features;
pub mod filters;
pub mod gallery;
pub mod matcher;
pub mod preprocess;
pub mod quality;
pub mod recognizer;
pub mod signature;
pub mod similarity;
pub mod spoof;
pub mod types;

pub use config::{RecognitionMode, RecognizerConfig};
pub use detector::{FaceDetector, WholeFrameDetector};
pub use gallery::{Gallery, GalleryEntry, GalleryError, GalleryStore, MemoryGalleryStore};
pub use matcher::{
    AdaptiveMatcher, CosineMatcher, Decision, Matcher, Probe, Recognition, RecognitionStats,
};
pub use recognizer::{EnrollError, ExtractionFailure, FaceRecognizer};
pub use types::{BiometricSignature, BoundingBox, Embedding, FaceImage, FrameKey, PersonId};
