//! Block-correlation watermark detection.
//!
//! For every color channel and every overlapping 8x8 block, the 16
//! mid-frequency DCT coefficients of the image are correlated (Pearson / NCC)
//! with the 16 co-located values of the expected pattern. Block scores are
//! averaged per channel, then across channels that produced any score.

use image::RgbImage;

use crate::error::{Error, Result};
use crate::transform::{BlockTransform, BLOCK_SIZE};
use crate::watermark::{
    block_origins, read_block, to_planes, WatermarkPattern, MID_FREQ_END, MID_FREQ_START,
};

/// Correlation above which a watermark is reported as present.
pub const DEFAULT_DETECTION_THRESHOLD: f64 = 0.2;

/// Blocks whose coefficients or pattern values are flatter than this are skipped.
const MIN_STDDEV: f64 = 1e-9;

const MID_FREQ_LEN: usize = (MID_FREQ_END - MID_FREQ_START) * (MID_FREQ_END - MID_FREQ_START);

/// Result of watermark detection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Detection {
    /// Whether the mean correlation exceeded the threshold.
    pub detected: bool,
    /// Mean block correlation in `[-1, 1]`; `0.0` when no block contributed.
    pub correlation: f64,
    /// Number of blocks, over all channels, that produced a score.
    pub blocks: usize,
}

/// Detect `pattern` in `image`, scanning blocks with the given stride.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the pattern shape differs from the
/// image shape.
pub fn detect_watermark(
    transform: &BlockTransform,
    image: &RgbImage,
    pattern: &WatermarkPattern,
    stride: usize,
    threshold: f64,
) -> Result<Detection> {
    let (width, height) = image.dimensions();
    if pattern.shape() != (height, width) {
        return Err(Error::shape(
            (pattern.width(), pattern.height()),
            (width, height),
        ));
    }

    let (w, h) = (width as usize, height as usize);
    let origins = block_origins(h, w, stride.max(1));
    let mut channel_means = Vec::with_capacity(3);
    let mut blocks = 0;

    let mut coeff_window = [0.0_f64; MID_FREQ_LEN];
    let mut pattern_window = [0.0_f64; MID_FREQ_LEN];

    for plane in &to_planes(image) {
        let mut sum = 0.0;
        let mut count = 0_usize;
        for &(i, j) in &origins {
            let coeffs = transform.forward(&read_block(plane, w, i, j));
            let mut k = 0;
            for u in MID_FREQ_START..MID_FREQ_END {
                for v in MID_FREQ_START..MID_FREQ_END {
                    coeff_window[k] = coeffs[u * BLOCK_SIZE + v];
                    pattern_window[k] = pattern.at(i + u, j + v);
                    k += 1;
                }
            }
            if let Some(r) = ncc(&coeff_window, &pattern_window) {
                sum += r;
                count += 1;
            }
        }
        if count > 0 {
            #[allow(clippy::cast_precision_loss)]
            channel_means.push(sum / count as f64);
            blocks += count;
        }
    }

    if channel_means.is_empty() {
        return Ok(Detection::default());
    }
    #[allow(clippy::cast_precision_loss)]
    let correlation = channel_means.iter().sum::<f64>() / channel_means.len() as f64;
    Ok(Detection {
        detected: correlation > threshold,
        correlation,
        blocks,
    })
}

/// Normalized Cross-Correlation (Pearson coefficient) between two
/// equal-length slices.
///
/// Returns `None` if either side is (numerically) constant.
pub(crate) fn ncc(a: &[f64], b: &[f64]) -> Option<f64> {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = a.len() as f64;

    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denom_a = 0.0;
    let mut denom_b = 0.0;

    for (va, vb) in a.iter().zip(b) {
        let da = va - mean_a;
        let db = vb - mean_b;
        numerator += da * db;
        denom_a += da * da;
        denom_b += db * db;
    }

    if (denom_a / n).sqrt() <= MIN_STDDEV || (denom_b / n).sqrt() <= MIN_STDDEV {
        return None;
    }
    Some(numerator / (denom_a * denom_b).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ncc_returns_one_for_perfect_match() {
        let a = [0.1, 0.5, 0.9, 0.3, 0.7];
        let score = ncc(&a, &a).unwrap();
        assert!(
            (score - 1.0).abs() < 1e-9,
            "Perfect match should give NCC ~1.0, got {score}"
        );
    }

    #[test]
    fn ncc_returns_negative_one_for_inverse() {
        let a = [0.1, 0.5, 0.9, 0.3, 0.7];
        let b: Vec<f64> = a.iter().map(|v| 1.0 - v).collect();
        let score = ncc(&a, &b).unwrap();
        assert!(
            (score + 1.0).abs() < 1e-9,
            "Inverse should give NCC ~-1.0, got {score}"
        );
    }

    #[test]
    fn ncc_skips_constant_input() {
        assert!(ncc(&[0.42; 16], &[0.1, 0.2, 0.3, 0.4].repeat(4)).is_none());
        assert!(ncc(&[], &[]).is_none());
    }

    #[test]
    fn uniform_image_yields_zero_correlation() {
        let img = RgbImage::from_pixel(32, 32, image::Rgb([90, 90, 90]));
        let pattern = WatermarkPattern::generate(1, 32, 32);
        let d = detect_watermark(&BlockTransform::new(), &img, &pattern, 4, 0.2).unwrap();
        assert_eq!(d, Detection::default());
    }

    #[test]
    fn image_smaller_than_block_is_not_detected() {
        let img = RgbImage::from_pixel(6, 40, image::Rgb([1, 2, 3]));
        let pattern = WatermarkPattern::generate(1, 40, 6);
        let d = detect_watermark(&BlockTransform::new(), &img, &pattern, 4, 0.2).unwrap();
        assert!(!d.detected);
        assert_eq!(d.blocks, 0);
        assert!(d.correlation.abs() < f64::EPSILON);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let img = RgbImage::new(16, 16);
        let pattern = WatermarkPattern::generate(1, 16, 24);
        let err = detect_watermark(&BlockTransform::new(), &img, &pattern, 4, 0.2).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
