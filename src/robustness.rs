//! Common image transformations a watermark is expected to survive, and a
//! harness that measures detection after each one.

use std::fmt;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ImageFormat, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::Serialize;

use crate::detection::Detection;
use crate::error::{Error, Result};
use crate::quality;
use crate::watermark::WatermarkEngine;

/// A transformation applied to a protected image.
///
/// Every attack returns an image of the input's size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attack {
    /// JPEG re-encoding.
    Jpeg {
        /// Encoder quality, 1 to 100.
        quality: u8,
    },
    /// Gaussian blur.
    GaussianBlur {
        /// Kernel standard deviation in pixels.
        sigma: f32,
    },
    /// Downscale (or upscale) by `factor`, then resize back.
    Rescale {
        /// Scale factor, greater than zero.
        factor: f32,
    },
    /// Rotation about the center; uncovered corners become black.
    Rotate {
        /// Counter-clockwise angle in degrees.
        degrees: f32,
    },
    /// Keep the centered `fraction` of each dimension and resize back.
    CenterCrop {
        /// Kept fraction, in `(0, 1]`.
        fraction: f32,
    },
    /// Additive Gaussian noise.
    GaussianNoise {
        /// Standard deviation in 8-bit levels.
        sigma: f32,
        /// Noise generator seed.
        seed: u64,
    },
}

impl fmt::Display for Attack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attack::Jpeg { quality } => write!(f, "jpeg(q={quality})"),
            Attack::GaussianBlur { sigma } => write!(f, "blur(sigma={sigma})"),
            Attack::Rescale { factor } => write!(f, "rescale(x{factor})"),
            Attack::Rotate { degrees } => write!(f, "rotate({degrees:+}deg)"),
            Attack::CenterCrop { fraction } => write!(f, "crop({fraction})"),
            Attack::GaussianNoise { sigma, .. } => write!(f, "noise(sigma={sigma})"),
        }
    }
}

impl Attack {
    /// The transformations the watermark is evaluated against.
    #[must_use]
    pub fn standard_suite() -> Vec<Attack> {
        let mut suite = Vec::new();
        suite.extend([90, 75, 50, 25].map(|quality| Attack::Jpeg { quality }));
        // Equivalent to 3x3 .. 9x9 kernels with automatic sigma.
        suite.extend([0.8, 1.1, 1.4, 1.7].map(|sigma| Attack::GaussianBlur { sigma }));
        suite.extend([0.5, 0.75, 1.25, 1.5].map(|factor| Attack::Rescale { factor }));
        suite.extend([-10.0, -5.0, 5.0, 10.0].map(|degrees| Attack::Rotate { degrees }));
        suite.extend([0.9, 0.8, 0.7, 0.6].map(|fraction| Attack::CenterCrop { fraction }));
        suite.extend(
            [(5.0, 1), (10.0, 2), (15.0, 3), (20.0, 4)]
                .map(|(sigma, seed)| Attack::GaussianNoise { sigma, seed }),
        );
        suite
    }

    /// Apply the attack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for out-of-range parameters or an
    /// image error if JPEG coding fails.
    pub fn apply(&self, image: &RgbImage) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::EmptyImage { width, height });
        }
        match *self {
            Attack::Jpeg { quality } => {
                if !(1..=100).contains(&quality) {
                    return Err(Error::InvalidConfig(format!(
                        "JPEG quality {quality} outside 1..=100"
                    )));
                }
                let mut buffer = Vec::new();
                JpegEncoder::new_with_quality(Cursor::new(&mut buffer), quality)
                    .encode_image(image)?;
                Ok(image::load_from_memory_with_format(&buffer, ImageFormat::Jpeg)?.to_rgb8())
            }
            Attack::GaussianBlur { sigma } => {
                if !(sigma.is_finite() && sigma > 0.0) {
                    return Err(Error::InvalidConfig(format!("blur sigma {sigma} must be positive")));
                }
                Ok(imageops::blur(image, sigma))
            }
            Attack::Rescale { factor } => {
                if !(factor.is_finite() && factor > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "scale factor {factor} must be positive"
                    )));
                }
                let scaled = resize_to(image, scaled_dim(width, factor), scaled_dim(height, factor));
                Ok(resize_to(&scaled, width, height))
            }
            Attack::Rotate { degrees } => {
                if !degrees.is_finite() {
                    return Err(Error::InvalidConfig("rotation angle must be finite".into()));
                }
                Ok(rotate(image, degrees))
            }
            Attack::CenterCrop { fraction } => {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(Error::InvalidConfig(format!(
                        "crop fraction {fraction} outside (0, 1]"
                    )));
                }
                let w = scaled_dim(width, fraction);
                let h = scaled_dim(height, fraction);
                let cropped =
                    imageops::crop_imm(image, (width - w) / 2, (height - h) / 2, w, h).to_image();
                Ok(resize_to(&cropped, width, height))
            }
            Attack::GaussianNoise { sigma, seed } => {
                if !(sigma.is_finite() && sigma >= 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "noise sigma {sigma} must be non-negative"
                    )));
                }
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut out = image.clone();
                for value in out.iter_mut() {
                    let noisy = f32::from(*value) + rng.sample::<f32, _>(StandardNormal) * sigma;
                    *value = to_u8(noisy);
                }
                Ok(out)
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(v: f32) -> u8 {
    v.clamp(0.0, 255.0).round() as u8
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scaled_dim(dim: u32, factor: f32) -> u32 {
    ((dim as f32 * factor) as u32).max(1)
}

fn resize_to(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, imageops::FilterType::Triangle)
}

/// Bilinear rotation about the image center.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
fn rotate(image: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let sample = |x: i64, y: i64, ch: usize| -> f32 {
        if x < 0 || y < 0 || x >= i64::from(width) || y >= i64::from(height) {
            0.0
        } else {
            f32::from(image.get_pixel(x as u32, y as u32)[ch])
        }
    };

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        // Inverse mapping: output pixel -> source position.
        let sx = cos * dx - sin * dy + cx;
        let sy = sin * dx + cos * dy + cy;
        let (x0, y0) = (sx.floor(), sy.floor());
        let (tx, ty) = (sx - x0, sy - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);
        image::Rgb(std::array::from_fn(|ch| {
            let top = sample(x0, y0, ch) * (1.0 - tx) + sample(x0 + 1, y0, ch) * tx;
            let bottom = sample(x0, y0 + 1, ch) * (1.0 - tx) + sample(x0 + 1, y0 + 1, ch) * tx;
            to_u8(top * (1.0 - ty) + bottom * ty)
        }))
    })
}

/// Detection and fidelity after one attack.
#[derive(Debug, Clone, Serialize)]
pub struct AttackOutcome {
    /// The attack applied.
    pub attack: Attack,
    /// Whether the watermark was still detected.
    pub detected: bool,
    /// Mean block correlation after the attack.
    pub correlation: f64,
    /// PSNR of the attacked image against the protected one.
    pub psnr: f64,
    /// SSIM of the attacked image against the protected one.
    pub ssim: f64,
}

/// Apply each attack to `protected` and check whether `engine`'s watermark
/// is still detected.
///
/// # Errors
///
/// Returns the first error from applying an attack or measuring quality.
pub fn evaluate(
    engine: &WatermarkEngine,
    protected: &RgbImage,
    attacks: &[Attack],
    threshold: f64,
) -> Result<Vec<AttackOutcome>> {
    let pattern = engine.pattern_for(protected.height(), protected.width());
    attacks
        .iter()
        .map(|attack| {
            let attacked = attack.apply(protected)?;
            let Detection {
                detected,
                correlation,
                ..
            } = engine.detect(&attacked, &pattern, threshold)?;
            let outcome = AttackOutcome {
                attack: *attack,
                detected,
                correlation,
                psnr: quality::psnr(protected, &attacked)?,
                ssim: quality::ssim(protected, &attacked)?,
            };
            tracing::debug!(attack = %attack, detected, correlation, "attack evaluated");
            Ok(outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretKey;

    #[allow(clippy::cast_possible_truncation)]
    fn gradient(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            image::Rgb([((x + y) % 256) as u8, (y % 256) as u8, (x % 256) as u8])
        })
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn every_attack_preserves_dimensions() {
        let img = RgbImage::from_fn(40, 30, |x, y| image::Rgb([(x * 6) as u8, (y * 8) as u8, 77]));
        for attack in Attack::standard_suite() {
            let out = attack.apply(&img).unwrap();
            assert_eq!(out.dimensions(), (40, 30), "{attack}");
        }
    }

    #[test]
    fn neutral_parameters_are_identity() {
        let img = gradient(24);
        for attack in [
            Attack::Rotate { degrees: 0.0 },
            Attack::CenterCrop { fraction: 1.0 },
            Attack::Rescale { factor: 1.0 },
            Attack::GaussianNoise { sigma: 0.0, seed: 1 },
        ] {
            assert_eq!(attack.apply(&img).unwrap(), img, "{attack}");
        }
    }

    #[test]
    fn rotation_blackens_corners() {
        let img = RgbImage::from_pixel(32, 32, image::Rgb([200, 200, 200]));
        let out = Attack::Rotate { degrees: 45.0 }.apply(&img).unwrap();
        assert_eq!(out.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(16, 16), &image::Rgb([200, 200, 200]));
    }

    #[test]
    fn noise_is_seeded() {
        let img = gradient(16);
        let a = Attack::GaussianNoise { sigma: 10.0, seed: 3 }.apply(&img).unwrap();
        let b = Attack::GaussianNoise { sigma: 10.0, seed: 3 }.apply(&img).unwrap();
        let c = Attack::GaussianNoise { sigma: 10.0, seed: 4 }.apply(&img).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let img = gradient(8);
        for attack in [
            Attack::Jpeg { quality: 0 },
            Attack::GaussianBlur { sigma: -1.0 },
            Attack::Rescale { factor: 0.0 },
            Attack::CenterCrop { fraction: 1.5 },
            Attack::GaussianNoise { sigma: f32::NAN, seed: 0 },
        ] {
            assert!(attack.apply(&img).is_err(), "{attack}");
        }
    }

    #[test]
    fn evaluate_reports_each_attack() {
        let key = SecretKey::new("k1").unwrap();
        let engine = WatermarkEngine::new(&key, 0.01, 2).unwrap();
        let marked = engine.embed(&gradient(64)).unwrap().image;
        let attacks = [
            Attack::GaussianNoise { sigma: 0.0, seed: 0 },
            Attack::Jpeg { quality: 50 },
        ];
        let outcomes = evaluate(&engine, &marked, &attacks, 0.2).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].detected, "untouched image must still detect");
        assert!(outcomes[0].psnr.is_infinite());
        assert!(outcomes[1].psnr.is_finite());
    }
}
