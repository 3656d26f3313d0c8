//! Coarse 128-dim biometric signature: four independent 32-element blocks.
//!
//! - geometry: intensity variance over an 8×4 region grid
//! - texture: mean Sobel gradient magnitude over the same grid
//! - gradient: magnitude-weighted 32-bin gradient direction histogram
//! - frequency: mean squared directional difference, 4 directions × 8 scales
//!
//! A block that cannot be computed is zeroed without affecting the others.

use crate::filters;
use crate::similarity;
use crate::types::{BiometricSignature, Embedding, SignatureSource, SIGNATURE_BLOCK_LEN};
use image::GrayImage;
use std::f32::consts::PI;
use thiserror::Error;

const GRID_ROWS: usize = 8;
const GRID_COLS: usize = 4;
/// Largest Sobel magnitude for 8-bit input: |gx|, |gy| ≤ 1020.
const MAX_SOBEL_MAGNITUDE: f32 = 1442.5;
const MAX_VARIANCE: f32 = 127.5 * 127.5;
const FREQUENCY_DIRECTIONS: [(i64, i64); 4] = [(1, 0), (0, 1), (1, 1), (1, -1)];
const FREQUENCY_SCALES: usize = 8;

type Block = [f32; SIGNATURE_BLOCK_LEN];

#[derive(Error, Debug)]
enum BlockError {
    #[error("{width}x{height} image smaller than {need_w}x{need_h}")]
    TooSmall { width: u32, height: u32, need_w: u32, need_h: u32 },
    #[error("no gradient energy")]
    NoEnergy,
}

fn require(gray: &GrayImage, need_w: u32, need_h: u32) -> Result<(), BlockError> {
    let (width, height) = gray.dimensions();
    if width < need_w || height < need_h {
        return Err(BlockError::TooSmall { width, height, need_w, need_h });
    }
    Ok(())
}

fn or_zeros(name: &'static str, block: Result<Block, BlockError>) -> Block {
    block.unwrap_or_else(|e| {
        tracing::debug!(block = name, error = %e, "signature block zeroed");
        [0.0; SIGNATURE_BLOCK_LEN]
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureExtractor;

impl SignatureExtractor {
    /// Compute a signature from a canonical grayscale face.
    pub fn extract(&self, gray: &GrayImage) -> BiometricSignature {
        let ((geometry, frequency), (texture, gradient)) = rayon::join(
            || rayon::join(|| geometry_block(gray), || frequency_block(gray)),
            || {
                let (gx, gy) = filters::sobel(gray);
                (texture_block(gray, &gx, &gy), gradient_block(gray, &gx, &gy))
            },
        );

        BiometricSignature::from_blocks(
            or_zeros("geometry", geometry),
            or_zeros("texture", texture),
            or_zeros("gradient", gradient),
            or_zeros("frequency", frequency),
            SignatureSource::Image,
        )
    }
}

/// Pool an embedding into a signature when no face image is available.
///
/// Each quarter of the embedding is folded into one block of 32 buckets
/// holding the signed mean of its slice. Embedding blocks are mean-centered,
/// so keeping the sign keeps unrelated faces apart.
pub fn from_embedding(embedding: &Embedding) -> BiometricSignature {
    let values = &embedding.values;
    let quarter = values.len() / 4;
    let pool = |q: usize| -> Block {
        let slice = &values[q * quarter..(q + 1) * quarter];
        std::array::from_fn(|i| {
            let start = i * slice.len() / SIGNATURE_BLOCK_LEN;
            let end = (i + 1) * slice.len() / SIGNATURE_BLOCK_LEN;
            if end > start {
                slice[start..end].iter().sum::<f32>() / (end - start) as f32
            } else {
                0.0
            }
        })
    };
    BiometricSignature::from_blocks(pool(0), pool(1), pool(2), pool(3), SignatureSource::Embedding)
}

/// Match score in [0, 1] between two signatures (clamped cosine).
pub fn compare(a: &BiometricSignature, b: &BiometricSignature) -> f32 {
    similarity::cosine_similarity(a.values(), b.values())
}

/// Row-major cell bounds for the 8×4 grid.
fn cells(width: usize, height: usize) -> impl Iterator<Item = (usize, usize, usize, usize)> {
    (0..GRID_ROWS).flat_map(move |r| {
        (0..GRID_COLS).map(move |c| {
            (
                c * width / GRID_COLS,
                (c + 1) * width / GRID_COLS,
                r * height / GRID_ROWS,
                (r + 1) * height / GRID_ROWS,
            )
        })
    })
}

fn geometry_block(gray: &GrayImage) -> Result<Block, BlockError> {
    require(gray, GRID_COLS as u32, GRID_ROWS as u32)?;
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let src = gray.as_raw();

    let mut block = [0.0; SIGNATURE_BLOCK_LEN];
    for (i, (x0, x1, y0, y1)) in cells(w, h).enumerate() {
        let region: Vec<f32> = (y0..y1)
            .flat_map(|y| src[y * w + x0..y * w + x1].iter().map(|&p| f32::from(p)))
            .collect();
        let (_, variance) = filters::mean_variance(&region);
        block[i] = (variance / MAX_VARIANCE).min(1.0);
    }
    Ok(block)
}

fn texture_block(gray: &GrayImage, gx: &[f32], gy: &[f32]) -> Result<Block, BlockError> {
    require(gray, GRID_COLS.max(3) as u32, GRID_ROWS as u32)?;
    let (w, h) = (gray.width() as usize, gray.height() as usize);

    let mut block = [0.0; SIGNATURE_BLOCK_LEN];
    for (i, (x0, x1, y0, y1)) in cells(w, h).enumerate() {
        let mut sum = 0.0f32;
        for y in y0..y1 {
            for x in x0..x1 {
                let idx = y * w + x;
                sum += (gx[idx] * gx[idx] + gy[idx] * gy[idx]).sqrt();
            }
        }
        let area = ((x1 - x0) * (y1 - y0)) as f32;
        block[i] = (sum / area / MAX_SOBEL_MAGNITUDE).min(1.0);
    }
    Ok(block)
}

fn gradient_block(gray: &GrayImage, gx: &[f32], gy: &[f32]) -> Result<Block, BlockError> {
    require(gray, 3, 3)?;
    let mut block = [0.0; SIGNATURE_BLOCK_LEN];
    let mut total = 0.0f32;
    for (&x, &y) in gx.iter().zip(gy) {
        let magnitude = (x * x + y * y).sqrt();
        if magnitude == 0.0 {
            continue;
        }
        // atan2 ∈ [-π, π] → bin 0..31
        let angle = y.atan2(x);
        let bin = (((angle + PI) / (2.0 * PI)) * SIGNATURE_BLOCK_LEN as f32) as usize;
        block[bin.min(SIGNATURE_BLOCK_LEN - 1)] += magnitude;
        total += magnitude;
    }
    if total == 0.0 {
        return Err(BlockError::NoEnergy);
    }
    for v in block.iter_mut() {
        *v /= total;
    }
    Ok(block)
}

fn frequency_block(gray: &GrayImage) -> Result<Block, BlockError> {
    let reach = FREQUENCY_SCALES as u32 + 1;
    require(gray, reach, reach)?;
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));
    let src = gray.as_raw();
    let at = |x: i64, y: i64| f32::from(src[(y * w + x) as usize]);

    let mut block = [0.0; SIGNATURE_BLOCK_LEN];
    for (d, &(dx, dy)) in FREQUENCY_DIRECTIONS.iter().enumerate() {
        for s in 1..=FREQUENCY_SCALES as i64 {
            let (ox, oy) = (dx * s, dy * s);
            let mut energy = 0.0f64;
            let mut count = 0usize;
            for y in 0i64.max(-oy)..h.min(h - oy) {
                for x in 0i64.max(-ox)..w.min(w - ox) {
                    let diff = at(x + ox, y + oy) - at(x, y);
                    energy += f64::from(diff * diff);
                    count += 1;
                }
            }
            let mean = if count > 0 { energy / count as f64 } else { 0.0 };
            let energy = (mean as f32 / (255.0 * 255.0)).min(1.0);
            block[d * FREQUENCY_SCALES + (s as usize - 1)] = energy;
        }
    }
    Ok(block)
}
