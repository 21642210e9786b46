//! Fidelity metrics between an original and a protected image.

use image::{imageops, RgbImage};

use crate::error::{Error, Result};

/// Default mean absolute difference above which an image counts as tampered.
pub const DEFAULT_TAMPER_THRESHOLD: f64 = 0.05;

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f64 = 1.5;
const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

fn check_shapes(a: &RgbImage, b: &RgbImage) -> Result<()> {
    if a.dimensions() == b.dimensions() {
        Ok(())
    } else {
        Err(Error::shape(a.dimensions(), b.dimensions()))
    }
}

/// Peak signal-to-noise ratio in dB; infinite for identical images.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the images differ in size.
pub fn psnr(a: &RgbImage, b: &RgbImage) -> Result<f64> {
    check_shapes(a, b)?;
    let n = a.as_raw().len();
    if n == 0 {
        return Ok(f64::INFINITY);
    }
    let sse: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| (f64::from(*x) - f64::from(*y)).powi(2))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let mse = sse / n as f64;
    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (255.0 * 255.0 / mse).log10())
}

/// Mean structural similarity of the luma channels.
///
/// Uses an 11x11 Gaussian window (sigma 1.5) with reflected borders, so the
/// score covers every pixel.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the images differ in size.
pub fn ssim(a: &RgbImage, b: &RgbImage) -> Result<f64> {
    check_shapes(a, b)?;
    let (width, height) = (a.width() as usize, a.height() as usize);
    if width == 0 || height == 0 {
        return Ok(1.0);
    }
    let x = luma(a);
    let y = luma(b);
    let kernel = gaussian_kernel();
    let blur = |data: &[f64]| gaussian_blur(data, width, height, &kernel);

    let xx: Vec<f64> = x.iter().map(|v| v * v).collect();
    let yy: Vec<f64> = y.iter().map(|v| v * v).collect();
    let xy: Vec<f64> = x.iter().zip(&y).map(|(p, q)| p * q).collect();

    let mu_x = blur(&x);
    let mu_y = blur(&y);
    let e_xx = blur(&xx);
    let e_yy = blur(&yy);
    let e_xy = blur(&xy);

    let mut total = 0.0;
    for i in 0..width * height {
        let (mx, my) = (mu_x[i], mu_y[i]);
        let var_x = e_xx[i] - mx * mx;
        let var_y = e_yy[i] - my * my;
        let cov = e_xy[i] - mx * my;
        total += ((2.0 * mx * my + SSIM_C1) * (2.0 * cov + SSIM_C2))
            / ((mx * mx + my * my + SSIM_C1) * (var_x + var_y + SSIM_C2));
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = total / (width * height) as f64;
    Ok(mean)
}

/// 8-bit luma (`0.299 R + 0.587 G + 0.114 B`, rounded) as `f64`.
fn luma(img: &RgbImage) -> Vec<f64> {
    img.pixels()
        .map(|px| {
            (0.299 * f64::from(px[0]) + 0.587 * f64::from(px[1]) + 0.114 * f64::from(px[2]))
                .round()
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn gaussian_kernel() -> [f64; SSIM_WINDOW] {
    let mut kernel = [0.0; SSIM_WINDOW];
    let center = (SSIM_WINDOW / 2) as f64;
    for (i, k) in kernel.iter_mut().enumerate() {
        let d = i as f64 - center;
        *k = (-d * d / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp();
    }
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Mirror an out-of-range index without repeating the edge sample
/// (`dcb|abcd|cba`).
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let mut m = i.rem_euclid(period);
    if m >= n as isize {
        m = period - m;
    }
    m as usize
}

#[allow(clippy::cast_possible_wrap)]
fn gaussian_blur(data: &[f64], width: usize, height: usize, kernel: &[f64]) -> Vec<f64> {
    let radius = (kernel.len() / 2) as isize;
    let mut rows = vec![0.0; data.len()];
    for y in 0..height {
        let row = &data[y * width..(y + 1) * width];
        for x in 0..width {
            rows[y * width + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * row[reflect101(x as isize + k as isize - radius, width)])
                .sum();
        }
    }
    let mut out = vec![0.0; data.len()];
    for y in 0..height {
        for x in 0..width {
            out[y * width + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    w * rows[reflect101(y as isize + k as isize - radius, height) * width + x]
                })
                .sum();
        }
    }
    out
}

/// The image with `margin` pixels removed from every edge.
///
/// Used to measure fidelity away from a border trigger. Returns an empty
/// image if the margin consumes the whole image.
#[must_use]
pub fn interior(image: &RgbImage, margin: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let w = width.saturating_sub(2 * margin);
    let h = height.saturating_sub(2 * margin);
    if w == 0 || h == 0 {
        return RgbImage::new(0, 0);
    }
    imageops::crop_imm(image, margin, margin, w, h).to_image()
}

/// Mean absolute per-sample difference, normalized to `[0, 1]`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the images differ in size.
pub fn tamper_score(reference: &RgbImage, test: &RgbImage) -> Result<f64> {
    check_shapes(reference, test)?;
    let n = reference.as_raw().len();
    if n == 0 {
        return Ok(0.0);
    }
    let total: u64 = reference
        .as_raw()
        .iter()
        .zip(test.as_raw())
        .map(|(a, b)| u64::from(a.abs_diff(*b)))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let score = total as f64 / n as f64 / 255.0;
    Ok(score)
}

/// Whether `test` differs from `reference` by more than `threshold`
/// (see [`tamper_score`]).
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the images differ in size.
pub fn detect_tampering(reference: &RgbImage, test: &RgbImage, threshold: f64) -> Result<bool> {
    Ok(tamper_score(reference, test)? > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn textured(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            let (i, j) = (f64::from(y), f64::from(x));
            image::Rgb([
                (127.0 + 60.0 * (0.7 * i).sin() + 50.0 * (0.9 * j).cos()) as u8,
                (127.0 + 80.0 * (0.5 * (i + j)).sin()) as u8,
                (127.0 + 70.0 * (0.3 * i - 0.8 * j).cos()) as u8,
            ])
        })
    }

    #[test]
    fn identical_images_score_perfectly() {
        let img = textured(32);
        assert!(psnr(&img, &img).unwrap().is_infinite());
        assert!((ssim(&img, &img).unwrap() - 1.0).abs() < 1e-9);
        assert!(tamper_score(&img, &img).unwrap().abs() < f64::EPSILON);
    }

    #[test]
    fn psnr_of_uniform_offset() {
        let a = RgbImage::from_pixel(8, 8, image::Rgb([100, 100, 100]));
        let b = RgbImage::from_pixel(8, 8, image::Rgb([110, 110, 110]));
        // MSE = 100 -> 10 * log10(65025 / 100) = 28.13 dB
        let p = psnr(&a, &b).unwrap();
        assert!((p - 28.131).abs() < 1e-3, "PSNR {p}");
    }

    #[test]
    fn ssim_drops_with_distortion() {
        let img = textured(48);
        let inverted = RgbImage::from_fn(48, 48, |x, y| {
            let p = img.get_pixel(x, y);
            image::Rgb([255 - p[0], 255 - p[1], 255 - p[2]])
        });
        let s = ssim(&img, &inverted).unwrap();
        assert!(s < 0.5, "SSIM of inverted image {s}");
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let a = RgbImage::new(8, 8);
        let b = RgbImage::new(8, 9);
        assert!(matches!(psnr(&a, &b), Err(Error::ShapeMismatch { .. })));
        assert!(matches!(ssim(&a, &b), Err(Error::ShapeMismatch { .. })));
        assert!(tamper_score(&a, &b).is_err());
    }

    #[test]
    fn reflect101_mirrors_without_edge_repeat() {
        let idx: Vec<usize> = (-3..8).map(|i| reflect101(i, 5)).collect();
        assert_eq!(idx, [3, 2, 1, 0, 1, 2, 3, 4, 3, 2, 1]);
        assert_eq!(reflect101(-4, 1), 0);
    }

    #[test]
    fn interior_strips_margin() {
        let img = textured(20);
        let inner = interior(&img, 5);
        assert_eq!(inner.dimensions(), (10, 10));
        assert_eq!(inner.get_pixel(0, 0), img.get_pixel(5, 5));
        assert_eq!(interior(&img, 10).dimensions(), (0, 0));
    }

    #[test]
    fn tampering_threshold() {
        let a = RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0]));
        let b = RgbImage::from_pixel(4, 4, image::Rgb([51, 51, 51]));
        assert!((tamper_score(&a, &b).unwrap() - 0.2).abs() < 1e-12);
        assert!(detect_tampering(&a, &b, DEFAULT_TAMPER_THRESHOLD).unwrap());
        assert!(!detect_tampering(&a, &a, DEFAULT_TAMPER_THRESHOLD).unwrap());
    }
}
