//! Key-derived mid-frequency DCT watermark.
//!
//! The watermark is a standard-normal pattern with one value per pixel,
//! generated from a seed derived from the owner key. Each color channel is
//! split into overlapping 8x8 blocks; in every block the pattern values that
//! fall on the 4x4 mid-frequency window (rows and columns 2..6) are added,
//! scaled by `alpha`, to the corresponding DCT coefficients. The DC corner is
//! avoided because it is visible, the high corner because compression drops it.

use image::RgbImage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use sha2::{Digest, Sha256};

use crate::config::{SecretKey, ALPHA_RANGE};
use crate::detection::{self, Detection};
use crate::error::{Error, Result};
use crate::transform::{Block, BlockTransform, BLOCK_AREA, BLOCK_SIZE};

/// First row/column (inclusive) of the mid-frequency window.
pub const MID_FREQ_START: usize = 2;
/// Last row/column (exclusive) of the mid-frequency window.
pub const MID_FREQ_END: usize = 6;

/// Derive the 32-bit pattern seed from a key: the first four bytes of
/// SHA-256(key), big-endian.
#[must_use]
pub fn seed_from_key(key: &[u8]) -> u32 {
    let digest = Sha256::digest(key);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Deterministic per-key, per-shape watermark pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkPattern {
    width: u32,
    height: u32,
    data: Vec<f64>,
}

impl WatermarkPattern {
    /// Draw a pattern of the given shape from a generator seeded with `seed`.
    #[must_use]
    pub fn generate(seed: u32, height: u32, width: u32) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(seed));
        let len = height as usize * width as usize;
        let mut data = Vec::with_capacity(len);
        data.resize_with(len, || rng.sample::<f64, _>(StandardNormal));
        Self {
            width,
            height,
            data,
        }
    }

    /// Build a pattern from raw row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `data` does not hold
    /// `height * width` values.
    pub fn from_raw(height: u32, width: u32, data: Vec<f64>) -> Result<Self> {
        let expected = height as usize * width as usize;
        if data.len() != expected {
            #[allow(clippy::cast_possible_truncation)]
            return Err(Error::shape((width, height), (data.len() as u32, 1)));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Pattern width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Pattern height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(height, width)`.
    #[must_use]
    pub fn shape(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    /// Row-major values.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Value at row `y`, column `x`.
    #[must_use]
    pub fn at(&self, y: usize, x: usize) -> f64 {
        self.data[y * self.width as usize + x]
    }
}

/// A watermarked image together with the pattern embedded in it.
#[derive(Debug, Clone)]
pub struct Watermarked {
    /// The watermarked image.
    pub image: RgbImage,
    /// The embedded pattern.
    pub pattern: WatermarkPattern,
}

/// Embeds and detects the watermark belonging to one key.
///
/// The engine keeps only the derived seed; every pattern is drawn from a fresh
/// generator owned by the call, so results never depend on call order.
#[derive(Debug, Clone)]
pub struct WatermarkEngine {
    seed: u32,
    alpha: f64,
    stride: usize,
    transform: BlockTransform,
}

impl WatermarkEngine {
    /// Create an engine for `key` with strength `alpha` and block overlap
    /// `redundancy` (stride `8 / redundancy`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a non-finite or negative alpha or a
    /// redundancy that does not divide the block size. Alpha outside the
    /// recommended range only logs a warning.
    pub fn new(key: &SecretKey, alpha: f64, redundancy: usize) -> Result<Self> {
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "alpha must be a finite, non-negative number (got {alpha})"
            )));
        }
        if !(ALPHA_RANGE.0..=ALPHA_RANGE.1).contains(&alpha) {
            tracing::warn!(alpha, "watermark strength outside the recommended range");
        }
        if redundancy == 0 || BLOCK_SIZE % redundancy != 0 {
            return Err(Error::InvalidConfig(format!(
                "redundancy {redundancy} must divide the block size {BLOCK_SIZE}"
            )));
        }
        Ok(Self {
            seed: seed_from_key(key.expose()),
            alpha,
            stride: BLOCK_SIZE / redundancy,
            transform: BlockTransform::new(),
        })
    }

    /// The key-derived seed recorded in metadata.
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Watermark strength.
    #[must_use]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Distance between neighbouring block origins.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The pattern this key produces for an image of the given shape.
    #[must_use]
    pub fn pattern_for(&self, height: u32, width: u32) -> WatermarkPattern {
        WatermarkPattern::generate(self.seed, height, width)
    }

    /// Embed the key's pattern into `image`.
    ///
    /// Repeated calls on the same image return bit-identical output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyImage`] if the image has no pixels.
    pub fn embed(&self, image: &RgbImage) -> Result<Watermarked> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::EmptyImage { width, height });
        }
        let pattern = self.pattern_for(height, width);
        let mut planes = to_planes(image);
        let (w, h) = (width as usize, height as usize);

        for plane in &mut planes {
            for (i, j) in block_origins(h, w, self.stride) {
                let block = read_block(plane, w, i, j);
                let mut coeffs = self.transform.forward(&block);
                for u in MID_FREQ_START..MID_FREQ_END {
                    for v in MID_FREQ_START..MID_FREQ_END {
                        coeffs[u * BLOCK_SIZE + v] += self.alpha * pattern.at(i + u, j + v);
                    }
                }
                write_block(plane, w, i, j, &self.transform.inverse(&coeffs));
            }
        }

        Ok(Watermarked {
            image: from_planes(&planes, width, height),
            pattern,
        })
    }

    /// Detect `pattern` in `image` with the given correlation threshold.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the pattern and image shapes differ.
    pub fn detect(
        &self,
        image: &RgbImage,
        pattern: &WatermarkPattern,
        threshold: f64,
    ) -> Result<Detection> {
        detection::detect_watermark(&self.transform, image, pattern, self.stride, threshold)
    }

    /// Regenerate this key's pattern for the image's shape and detect it.
    #[must_use]
    pub fn detect_own(&self, image: &RgbImage, threshold: f64) -> Detection {
        let pattern = self.pattern_for(image.height(), image.width());
        detection::detect_watermark(&self.transform, image, &pattern, self.stride, threshold)
            .unwrap_or_default()
    }
}

/// Top-left corners of all blocks that fit entirely inside an `h` x `w` plane.
pub(crate) fn block_origins(h: usize, w: usize, stride: usize) -> Vec<(usize, usize)> {
    if h < BLOCK_SIZE || w < BLOCK_SIZE {
        return Vec::new();
    }
    let rows = (0..=h - BLOCK_SIZE).step_by(stride);
    rows.flat_map(|i| (0..=w - BLOCK_SIZE).step_by(stride).map(move |j| (i, j)))
        .collect()
}

pub(crate) fn read_block(plane: &[f64], width: usize, i: usize, j: usize) -> Block {
    let mut block = [0.0; BLOCK_AREA];
    for u in 0..BLOCK_SIZE {
        let row = (i + u) * width + j;
        block[u * BLOCK_SIZE..(u + 1) * BLOCK_SIZE].copy_from_slice(&plane[row..row + BLOCK_SIZE]);
    }
    block
}

fn write_block(plane: &mut [f64], width: usize, i: usize, j: usize, block: &Block) {
    for u in 0..BLOCK_SIZE {
        let row = (i + u) * width + j;
        plane[row..row + BLOCK_SIZE].copy_from_slice(&block[u * BLOCK_SIZE..(u + 1) * BLOCK_SIZE]);
    }
}

/// Split an RGB image into three row-major planes normalized to `[0, 1]`.
pub(crate) fn to_planes(image: &RgbImage) -> [Vec<f64>; 3] {
    let len = image.width() as usize * image.height() as usize;
    let mut planes = [
        Vec::with_capacity(len),
        Vec::with_capacity(len),
        Vec::with_capacity(len),
    ];
    for px in image.pixels() {
        for (ch, plane) in planes.iter_mut().enumerate() {
            plane.push(f64::from(px[ch]) / 255.0);
        }
    }
    planes
}

/// Clip normalized planes to `[0, 1]` and quantize them back to 8 bits.
fn from_planes(planes: &[Vec<f64>; 3], width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let idx = y as usize * width as usize + x as usize;
        image::Rgb(planes.each_ref().map(|plane| quantize(plane[idx])))
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SecretKey {
        SecretKey::new(s).unwrap()
    }

    #[test]
    fn seed_is_first_four_digest_bytes() {
        // SHA-256("abc") = ba7816bf...
        assert_eq!(seed_from_key(b"abc"), 0xba78_16bf);
    }

    #[test]
    fn pattern_is_deterministic_per_key_and_shape() {
        let a = WatermarkPattern::generate(7, 16, 24);
        let b = WatermarkPattern::generate(7, 16, 24);
        let c = WatermarkPattern::generate(8, 16, 24);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.data().len(), 16 * 24);
        assert_eq!(a.shape(), (16, 24));
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn pattern_is_roughly_standard_normal() {
        let p = WatermarkPattern::generate(42, 64, 64);
        let n = p.data().len() as f64;
        let mean = p.data().iter().sum::<f64>() / n;
        let var = p.data().iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "variance {var}");
    }

    #[test]
    fn from_raw_checks_length() {
        assert!(WatermarkPattern::from_raw(2, 2, vec![0.0; 4]).is_ok());
        assert!(WatermarkPattern::from_raw(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn block_origins_use_half_block_stride() {
        let origins = block_origins(16, 16, 4);
        assert_eq!(origins.len(), 9);
        assert_eq!(origins[0], (0, 0));
        assert_eq!(origins[8], (8, 8));
        assert!(block_origins(7, 100, 4).is_empty());
    }

    #[test]
    fn engine_rejects_bad_parameters() {
        assert!(WatermarkEngine::new(&key("k"), f64::INFINITY, 2).is_err());
        assert!(WatermarkEngine::new(&key("k"), 0.05, 3).is_err());
        // Out of the recommended range is a warning, not an error.
        assert!(WatermarkEngine::new(&key("k"), 0.5, 2).is_ok());
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn embed_changes_only_slightly_and_keeps_shape() {
        let engine = WatermarkEngine::new(&key("k1"), 0.01, 2).unwrap();
        let img = RgbImage::from_fn(32, 24, |x, y| image::Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
        let marked = engine.embed(&img).unwrap();
        assert_eq!(marked.image.dimensions(), (32, 24));
        assert_eq!(marked.pattern.shape(), (24, 32));
        let max_diff = img
            .as_raw()
            .iter()
            .zip(marked.image.as_raw())
            .map(|(a, b)| (i16::from(*a) - i16::from(*b)).abs())
            .max()
            .unwrap();
        assert!(max_diff > 0, "watermark should alter pixels");
        assert!(max_diff < 20, "watermark too strong: {max_diff}");
    }

    #[test]
    fn tiny_image_passes_through() {
        let engine = WatermarkEngine::new(&key("k1"), 0.05, 2).unwrap();
        let img = RgbImage::from_pixel(5, 5, image::Rgb([10, 20, 30]));
        let marked = engine.embed(&img).unwrap();
        assert_eq!(marked.image, img);
    }

    #[test]
    fn empty_image_is_rejected() {
        let engine = WatermarkEngine::new(&key("k1"), 0.05, 2).unwrap();
        let img = RgbImage::new(0, 10);
        assert!(matches!(
            engine.embed(&img),
            Err(Error::EmptyImage { width: 0, height: 10 })
        ));
    }
}
