use crate::config::RecognitionMode;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Length of one semantic block of a [`BiometricSignature`].
pub const SIGNATURE_BLOCK_LEN: usize = 32;
/// Total signature length: geometry, texture, gradient and frequency blocks.
pub const SIGNATURE_LEN: usize = 4 * SIGNATURE_BLOCK_LEN;

/// Bounding box for a detected face, in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height, confidence: 1.0 }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Stable cache key for a frame, derived from content or supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKey {
    /// First 128 bits of SHA-256 over dimensions, layout and pixel bytes.
    Content([u8; 16]),
    /// Caller-assigned frame sequence number.
    Sequence(u64),
}

impl FrameKey {
    pub fn from_sequence(sequence: u64) -> Self {
        FrameKey::Sequence(sequence)
    }
}

/// A face crop of any channel layout. Owned by the call that produced it.
#[derive(Clone)]
pub struct FaceImage {
    pixels: DynamicImage,
}

impl FaceImage {
    pub fn from_dynamic(pixels: DynamicImage) -> Self {
        Self { pixels }
    }

    /// Wrap a grayscale buffer (`width * height` bytes, row-major).
    ///
    /// Returns `None` if the buffer is shorter than the stated dimensions.
    pub fn from_gray(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        GrayImage::from_raw(width, height, data)
            .map(|g| Self::from_dynamic(DynamicImage::ImageLuma8(g)))
    }

    /// Decode an image file (PNG, JPEG, ...).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, image::ImageError> {
        Ok(Self::from_dynamic(image::open(path)?))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn channels(&self) -> u8 {
        self.pixels.color().channel_count()
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.pixels
    }

    /// Single-channel 8-bit view. Multi-channel input is converted with
    /// Rec. 601 luma weights; grayscale input is copied as-is.
    pub fn to_gray(&self) -> GrayImage {
        match &self.pixels {
            DynamicImage::ImageLuma8(g) => g.clone(),
            other => other.to_luma8(),
        }
    }

    /// Content-derived key: identical pixels always produce the same key.
    pub fn content_key(&self) -> FrameKey {
        let color = self.pixels.color();
        let mut hasher = Sha256::new();
        hasher.update(self.width().to_le_bytes());
        hasher.update(self.height().to_le_bytes());
        hasher.update([color.channel_count(), color.bytes_per_pixel()]);
        hasher.update(self.pixels.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        FrameKey::Content(key)
    }

    /// Crop to a bounding box, clamped to the image. `None` if nothing remains.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<FaceImage> {
        let (w, h) = (self.width() as f32, self.height() as f32);
        let x0 = bbox.x.max(0.0).floor().min(w);
        let y0 = bbox.y.max(0.0).floor().min(h);
        let x1 = (bbox.x + bbox.width).min(w).ceil();
        let y1 = (bbox.y + bbox.height).min(h).ceil();
        if !(x1 > x0 && y1 > y0) {
            return None;
        }

        let cropped = self
            .pixels
            .crop_imm(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32);
        Some(Self::from_dynamic(cropped))
    }
}

impl fmt::Debug for FaceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("channels", &self.channels())
            .finish()
    }
}

/// Identifier of an enrolled person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(String);

impl PersonId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PersonId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Face embedding vector, L2-normalized.
///
/// An empty or all-zero vector is the "extraction failed" sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Recognition mode that produced this embedding.
    #[serde(default)]
    pub mode: Option<RecognitionMode>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, mode: None }
    }

    /// The all-zero sentinel of the given length.
    pub fn sentinel(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    /// Scale `values` to unit Euclidean norm. A zero vector stays zero.
    pub fn normalized(mut values: Vec<f32>) -> Self {
        let norm = values.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in values.iter_mut() {
                *v = (f64::from(*v) / norm) as f32;
            }
        }
        Self::new(values)
    }

    pub fn with_mode(mut self, mode: RecognitionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True for the failed-extraction sentinel (empty or all zeros).
    pub fn is_sentinel(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// Where a [`BiometricSignature`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureSource {
    /// Computed from a canonical face image.
    Image,
    /// Pooled from a stored embedding when no image was available.
    Embedding,
}

/// One 32-element block of a [`BiometricSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureBlock {
    Geometry,
    Texture,
    Gradient,
    Frequency,
}

impl SignatureBlock {
    pub const ALL: [SignatureBlock; 4] = [
        SignatureBlock::Geometry,
        SignatureBlock::Texture,
        SignatureBlock::Gradient,
        SignatureBlock::Frequency,
    ];

    fn offset(self) -> usize {
        match self {
            SignatureBlock::Geometry => 0,
            SignatureBlock::Texture => SIGNATURE_BLOCK_LEN,
            SignatureBlock::Gradient => 2 * SIGNATURE_BLOCK_LEN,
            SignatureBlock::Frequency => 3 * SIGNATURE_BLOCK_LEN,
        }
    }
}

/// Coarse 128-dim descriptor used to corroborate the primary embedding match.
/// Not normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricSignature {
    values: Vec<f32>,
    pub source: SignatureSource,
}

impl BiometricSignature {
    pub fn from_blocks(
        geometry: [f32; SIGNATURE_BLOCK_LEN],
        texture: [f32; SIGNATURE_BLOCK_LEN],
        gradient: [f32; SIGNATURE_BLOCK_LEN],
        frequency: [f32; SIGNATURE_BLOCK_LEN],
        source: SignatureSource,
    ) -> Self {
        let mut values = Vec::with_capacity(SIGNATURE_LEN);
        values.extend_from_slice(&geometry);
        values.extend_from_slice(&texture);
        values.extend_from_slice(&gradient);
        values.extend_from_slice(&frequency);
        Self { values, source }
    }

    /// Build from a flat vector; `None` unless it has exactly 128 values.
    pub fn from_values(values: Vec<f32>, source: SignatureSource) -> Option<Self> {
        (values.len() == SIGNATURE_LEN).then_some(Self { values, source })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn block(&self, block: SignatureBlock) -> &[f32] {
        let start = block.offset();
        &self.values[start..start + SIGNATURE_BLOCK_LEN]
    }
}
