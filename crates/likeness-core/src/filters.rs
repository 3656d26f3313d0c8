//! Small 3×3 kernels and intensity statistics shared by the pipeline stages.
//!
//! All kernels replicate the border pixel, so outputs have the input's size.

use image::GrayImage;

/// Clamped pixel fetch as f32.
#[inline]
fn px(gray: &GrayImage, x: i64, y: i64) -> f32 {
    let w = i64::from(gray.width());
    let h = i64::from(gray.height());
    let cx = x.clamp(0, w - 1) as u32;
    let cy = y.clamp(0, h - 1) as u32;
    f32::from(gray.get_pixel(cx, cy)[0])
}

/// 4-neighbour Laplacian `(n + s + e + w) - 4c`, row-major.
pub fn laplacian(gray: &GrayImage) -> Vec<f32> {
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));
    let mut out = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let c = px(gray, x, y);
            let sum = px(gray, x, y - 1)
                + px(gray, x, y + 1)
                + px(gray, x - 1, y)
                + px(gray, x + 1, y);
            out.push(sum - 4.0 * c);
        }
    }
    out
}

/// Sobel gradients `(gx, gy)`, row-major.
///
/// Gx: [-1 0 1; -2 0 2; -1 0 1], Gy: [-1 -2 -1; 0 0 0; 1 2 1].
pub fn sobel(gray: &GrayImage) -> (Vec<f32>, Vec<f32>) {
    let (w, h) = (i64::from(gray.width()), i64::from(gray.height()));
    let n = (w * h) as usize;
    let mut gx = Vec::with_capacity(n);
    let mut gy = Vec::with_capacity(n);

    for y in 0..h {
        for x in 0..w {
            let p00 = px(gray, x - 1, y - 1);
            let p10 = px(gray, x, y - 1);
            let p20 = px(gray, x + 1, y - 1);
            let p01 = px(gray, x - 1, y);
            let p21 = px(gray, x + 1, y);
            let p02 = px(gray, x - 1, y + 1);
            let p12 = px(gray, x, y + 1);
            let p22 = px(gray, x + 1, y + 1);

            gx.push(-p00 + p20 - 2.0 * p01 + 2.0 * p21 - p02 + p22);
            gy.push(-p00 - 2.0 * p10 - p20 + p02 + 2.0 * p12 + p22);
        }
    }

    (gx, gy)
}

/// 3×3 mean filter.
pub fn box_blur3(gray: &GrayImage) -> GrayImage {
    let (w, h) = (gray.width(), gray.height());
    GrayImage::from_fn(w, h, |x, y| {
        let (x, y) = (i64::from(x), i64::from(y));
        let mut sum = 0.0f32;
        for dy in -1..=1 {
            for dx in -1..=1 {
                sum += px(gray, x + dx, y + dy);
            }
        }
        image::Luma([(sum / 9.0).round().clamp(0.0, 255.0) as u8])
    })
}

/// Population mean and variance. `(0, 0)` for an empty input.
pub fn mean_variance(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let variance = values.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, variance as f32)
}

/// Mean and variance of pixel intensities.
pub fn intensity_stats(gray: &GrayImage) -> (f32, f32) {
    let values: Vec<f32> = gray.as_raw().iter().map(|&p| f32::from(p)).collect();
    mean_variance(&values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_laplacian_flat_is_zero() {
        let gray = GrayImage::from_pixel(8, 8, image::Luma([90]));
        assert!(laplacian(&gray).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_laplacian_spot() {
        let mut gray = GrayImage::from_pixel(5, 5, image::Luma([0]));
        gray.put_pixel(2, 2, image::Luma([10]));
        let lap = laplacian(&gray);
        assert_eq!(lap[2 * 5 + 2], -40.0);
        assert_eq!(lap[2 * 5 + 1], 10.0);
    }

    #[test]
    fn test_sobel_vertical_edge() {
        // Left half 0, right half 100: strong horizontal gradient, no vertical
        let gray = GrayImage::from_fn(6, 6, |x, _| image::Luma([if x < 3 { 0 } else { 100 }]));
        let (gx, gy) = sobel(&gray);
        assert_eq!(gx[3 * 6 + 2], 400.0);
        assert!(gy.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_box_blur_preserves_flat() {
        let gray = GrayImage::from_pixel(4, 4, image::Luma([77]));
        assert!(box_blur3(&gray).pixels().all(|p| p[0] == 77));
    }

    #[test]
    fn test_mean_variance() {
        let (mean, var) = mean_variance(&[1.0, 2.0, 3.0, 4.0]);
        assert!((mean - 2.5).abs() < 1e-6);
        assert!((var - 1.25).abs() < 1e-6);
        assert_eq!(mean_variance(&[]), (0.0, 0.0));
    }
}
