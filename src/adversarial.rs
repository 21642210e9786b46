//! Gradient-sign (FGSM) poisoning against a frozen surrogate classifier.
//!
//! The surrogate is anything implementing [`SurrogateClassifier`]. It sees the
//! image resampled to its input size and normalized per channel; the gradient
//! sign step is taken in that normalized space and mapped back to pixel space
//! with [`NormalizedPerturbation::to_pixel_space`].

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{Rgb32FImage, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::trigger::{Perturbation, PerturbationSource};

/// Per-channel input normalization: `(x - mean) / std` on `[0, 1]` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    /// Channel means (R, G, B).
    pub mean: [f32; 3],
    /// Channel standard deviations (R, G, B). Must be positive.
    pub std: [f32; 3],
}

impl Normalization {
    /// The ImageNet statistics most pretrained classifiers expect.
    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// No-op normalization.
    pub const IDENTITY: Self = Self {
        mean: [0.0; 3],
        std: [1.0; 3],
    };

    fn validate(&self) -> Result<()> {
        if self.std.iter().all(|s| s.is_finite() && *s > 0.0) {
            Ok(())
        } else {
            Err(Error::Surrogate(format!(
                "normalization std must be positive, got {:?}",
                self.std
            )))
        }
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

/// A frozen differentiable classifier used to craft adversarial poison.
///
/// Inputs are normalized images in channel-major (CHW) order with the shape
/// given by [`input_size`](Self::input_size).
pub trait SurrogateClassifier: Send + Sync {
    /// Expected input `(width, height)`.
    fn input_size(&self) -> (u32, u32);

    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Normalization applied to `[0, 1]` pixels before inference.
    fn normalization(&self) -> Normalization {
        Normalization::IMAGENET
    }

    /// Class scores for one input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Surrogate`] if the input has the wrong length.
    fn logits(&self, input: &[f32]) -> Result<Vec<f32>>;

    /// Gradient of the cross-entropy loss for `label` with respect to `input`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Surrogate`] for a wrong input length or an
    /// out-of-range label.
    fn loss_gradient(&self, input: &[f32], label: u32) -> Result<Vec<f32>>;
}

/// Numerically stable softmax.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|&x| x / sum).collect()
}

/// Softmax regression over the flattened normalized input.
///
/// Small enough to ship as JSON and exact to differentiate, which makes it a
/// practical stand-in when no deep network is available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSurrogate {
    width: u32,
    height: u32,
    num_classes: usize,
    /// Row-major `num_classes x (3 * height * width)`.
    weights: Vec<f32>,
    bias: Vec<f32>,
    #[serde(default)]
    normalization: Normalization,
}

impl LinearSurrogate {
    /// Build a surrogate from its parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Surrogate`] if the parameter lengths do not match the
    /// declared shape or the normalization is degenerate.
    pub fn new(
        (width, height): (u32, u32),
        num_classes: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
        normalization: Normalization,
    ) -> Result<Self> {
        let surrogate = Self {
            width,
            height,
            num_classes,
            weights,
            bias,
            normalization,
        };
        surrogate.validate()?;
        Ok(surrogate)
    }

    /// Load a surrogate from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error, or [`Error::Surrogate`] for inconsistent
    /// parameters.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let surrogate: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        surrogate.validate()?;
        Ok(surrogate)
    }

    fn input_len(&self) -> usize {
        3 * self.width as usize * self.height as usize
    }

    fn validate(&self) -> Result<()> {
        if self.num_classes == 0 || self.input_len() == 0 {
            return Err(Error::Surrogate(
                "surrogate needs at least one class and a non-empty input".into(),
            ));
        }
        if self.weights.len() != self.num_classes * self.input_len() {
            return Err(Error::Surrogate(format!(
                "expected {} weights, got {}",
                self.num_classes * self.input_len(),
                self.weights.len()
            )));
        }
        if self.bias.len() != self.num_classes {
            return Err(Error::Surrogate(format!(
                "expected {} biases, got {}",
                self.num_classes,
                self.bias.len()
            )));
        }
        self.normalization.validate()
    }

    fn check_input(&self, input: &[f32]) -> Result<()> {
        if input.len() == self.input_len() {
            Ok(())
        } else {
            Err(Error::Surrogate(format!(
                "input has {} values, expected {}",
                input.len(),
                self.input_len()
            )))
        }
    }
}

impl SurrogateClassifier for LinearSurrogate {
    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn normalization(&self) -> Normalization {
        self.normalization
    }

    fn logits(&self, input: &[f32]) -> Result<Vec<f32>> {
        self.check_input(input)?;
        let n = self.input_len();
        Ok(self
            .weights
            .chunks_exact(n)
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect())
    }

    fn loss_gradient(&self, input: &[f32], label: u32) -> Result<Vec<f32>> {
        let label = label as usize;
        if label >= self.num_classes {
            return Err(Error::Surrogate(format!(
                "label {label} out of range for {} classes",
                self.num_classes
            )));
        }
        let mut delta = softmax(&self.logits(input)?);
        delta[label] -= 1.0;

        let n = self.input_len();
        let mut grad = vec![0.0_f32; n];
        for (row, d) in self.weights.chunks_exact(n).zip(&delta) {
            for (g, w) in grad.iter_mut().zip(row) {
                *g += w * d;
            }
        }
        Ok(grad)
    }
}

/// An FGSM step expressed in the surrogate's normalized input space.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPerturbation {
    width: u32,
    height: u32,
    /// CHW values, already divided by the channel std.
    data: Vec<f32>,
    normalization: Normalization,
}

impl NormalizedPerturbation {
    /// Normalized values in CHW order.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Surrogate input `(width, height)` this step was computed at.
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Undo the normalization scale and resample to `width` x `height`,
    /// producing pixel-space offsets in `[0, 1]` units.
    #[must_use]
    pub fn to_pixel_space(&self, width: u32, height: u32) -> Perturbation {
        let plane_len = self.width as usize * self.height as usize;
        let mut offsets = Vec::with_capacity(3 * plane_len);
        for idx in 0..plane_len {
            for (ch, scale) in self.normalization.std.iter().enumerate() {
                offsets.push(self.data[ch * plane_len + idx] * scale);
            }
        }
        let data = if (self.width, self.height) == (width, height) {
            offsets
        } else {
            resample(&offsets, (self.width, self.height), (width, height))
        };
        Perturbation::from_parts(width, height, data, "adversarial")
    }
}

/// Triangle-filter resampling of interleaved RGB offsets.
///
/// `imageops::resize` clamps float samples to `[0, 1]`, so the signed offsets
/// are mapped affinely into that range for the call and back afterwards.
fn resample(offsets: &[f32], (sw, sh): (u32, u32), (dw, dh): (u32, u32)) -> Vec<f32> {
    let out_len = dw as usize * dh as usize * 3;
    let bound = offsets.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
    if bound <= 0.0 {
        return vec![0.0; out_len];
    }
    let shifted = offsets.iter().map(|v| (v / bound + 1.0) / 2.0).collect();
    let Some(buffer) = Rgb32FImage::from_raw(sw, sh, shifted) else {
        return vec![0.0; out_len];
    };
    imageops::resize(&buffer, dw, dh, FilterType::Triangle)
        .into_raw()
        .into_iter()
        .map(|v| (v * 2.0 - 1.0) * bound)
        .collect()
}

/// Crafts poison by a single gradient-sign step against a surrogate.
pub struct AdversarialEngine {
    surrogate: Box<dyn SurrogateClassifier>,
    fallback_seed: u64,
}

impl std::fmt::Debug for AdversarialEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdversarialEngine")
            .field("input_size", &self.surrogate.input_size())
            .field("num_classes", &self.surrogate.num_classes())
            .field("fallback_seed", &self.fallback_seed)
            .finish()
    }
}

impl AdversarialEngine {
    /// Wrap a surrogate. `fallback_seed` seeds the sign noise used when the
    /// surrogate fails on an image; such perturbations report `"sign_noise"`
    /// as their source.
    #[must_use]
    pub fn new(surrogate: Box<dyn SurrogateClassifier>, fallback_seed: u64) -> Self {
        Self {
            surrogate,
            fallback_seed,
        }
    }

    /// The wrapped surrogate.
    #[must_use]
    pub fn surrogate(&self) -> &dyn SurrogateClassifier {
        self.surrogate.as_ref()
    }

    /// Check that the surrogate can take a step toward `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Surrogate`] for an empty input size, a degenerate
    /// normalization, no classes, or a target outside the surrogate's classes.
    pub fn check_target(&self, target: Option<u32>) -> Result<()> {
        let (width, height) = self.surrogate.input_size();
        if width == 0 || height == 0 {
            return Err(Error::Surrogate("surrogate input size is empty".into()));
        }
        self.surrogate.normalization().validate()?;
        let classes = self.surrogate.num_classes();
        if classes == 0 {
            return Err(Error::Surrogate("surrogate has no classes".into()));
        }
        if let Some(label) = target {
            if usize::try_from(label).map_or(true, |l| l >= classes) {
                return Err(Error::Surrogate(format!(
                    "target label {label} out of range for {classes} classes"
                )));
            }
        }
        Ok(())
    }

    /// Resample and normalize `image` into the surrogate's CHW input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Surrogate`] if the surrogate declares a degenerate
    /// input size or normalization.
    pub fn prepare_input(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let (width, height) = self.surrogate.input_size();
        if width == 0 || height == 0 {
            return Err(Error::Surrogate("surrogate input size is empty".into()));
        }
        let norm = self.surrogate.normalization();
        norm.validate()?;

        let resized;
        let source = if image.dimensions() == (width, height) {
            image
        } else {
            resized = imageops::resize(image, width, height, FilterType::Triangle);
            &resized
        };

        let plane_len = width as usize * height as usize;
        let mut input = vec![0.0_f32; 3 * plane_len];
        for (idx, px) in source.pixels().enumerate() {
            for ch in 0..3 {
                let v = f32::from(px[ch]) / 255.0;
                input[ch * plane_len + idx] = (v - norm.mean[ch]) / norm.std[ch];
            }
        }
        Ok(input)
    }

    /// Compute one FGSM step.
    ///
    /// With a `target`, the step descends the loss toward that class
    /// (`-epsilon * sign(grad)`); without one it ascends the loss of the
    /// surrogate's own top prediction (`+epsilon * sign(grad)`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Surrogate`] if the surrogate rejects the input or
    /// label, or produces non-finite values.
    pub fn fgsm(
        &self,
        image: &RgbImage,
        epsilon: f32,
        target: Option<u32>,
    ) -> Result<NormalizedPerturbation> {
        let input = self.prepare_input(image)?;
        let (label, direction) = match target {
            Some(label) => (label, -1.0_f32),
            None => (self.top_prediction(&input)?, 1.0),
        };
        let grad = self.surrogate.loss_gradient(&input, label)?;
        if grad.len() != input.len() {
            return Err(Error::Surrogate(format!(
                "gradient has {} values, expected {}",
                grad.len(),
                input.len()
            )));
        }
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(Error::Surrogate("gradient is not finite".into()));
        }

        let (width, height) = self.surrogate.input_size();
        let normalization = self.surrogate.normalization();
        let plane_len = width as usize * height as usize;
        let data = grad
            .iter()
            .enumerate()
            .map(|(i, g)| direction * epsilon * sign(*g) / normalization.std[i / plane_len])
            .collect();
        Ok(NormalizedPerturbation {
            width,
            height,
            data,
            normalization,
        })
    }

    fn top_prediction(&self, input: &[f32]) -> Result<u32> {
        let logits = self.surrogate.logits(input)?;
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(Error::Surrogate("logits are not finite".into()));
        }
        let best = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| Error::Surrogate("surrogate produced no logits".into()))?;
        u32::try_from(best).map_err(|_| Error::Surrogate("class index overflow".into()))
    }

    /// Random sign noise used when the surrogate cannot be queried.
    fn sign_noise(&self, width: u32, height: u32, epsilon: f32) -> Perturbation {
        let mut rng = ChaCha8Rng::seed_from_u64(self.fallback_seed);
        let len = width as usize * height as usize * 3;
        let data = (0..len)
            .map(|_| sign(rng.sample::<f32, _>(StandardNormal)) * epsilon)
            .collect();
        Perturbation::from_parts(width, height, data, "sign_noise")
    }
}

impl PerturbationSource for AdversarialEngine {
    fn name(&self) -> &'static str {
        "adversarial"
    }

    fn perturb(&self, image: &RgbImage, epsilon: f32, target: Option<u32>) -> Perturbation {
        let (width, height) = image.dimensions();
        match self.fgsm(image, epsilon, target) {
            Ok(step) => step.to_pixel_space(width, height),
            Err(err) => {
                tracing::warn!(error = %err, "adversarial step failed, using sign noise");
                self.sign_noise(width, height, epsilon)
            }
        }
    }
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two classes on a 2x2 input: class 1 likes bright red, class 0 the opposite.
    fn red_detector() -> LinearSurrogate {
        let n = 3 * 2 * 2;
        let mut weights = vec![0.0; 2 * n];
        for i in 0..4 {
            weights[i] = -1.0;
            weights[n + i] = 1.0;
        }
        LinearSurrogate::new((2, 2), 2, weights, vec![0.0, 0.0], Normalization::IDENTITY).unwrap()
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn linear_surrogate_rejects_inconsistent_parameters() {
        let err = LinearSurrogate::new((2, 2), 2, vec![0.0; 3], vec![0.0; 2], Normalization::IDENTITY)
            .unwrap_err();
        assert!(matches!(err, Error::Surrogate(_)));
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let s = red_detector();
        let input: Vec<f32> = (0..12).map(|i| (i as f32) / 24.0).collect();
        let grad = s.loss_gradient(&input, 1).unwrap();
        let loss = |x: &[f32]| -> f32 {
            let p = softmax(&s.logits(x).unwrap());
            -p[1].ln()
        };
        let h = 1e-2;
        for i in [0, 5, 11] {
            let mut plus = input.clone();
            plus[i] += h;
            let mut minus = input.clone();
            minus[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!(
                (numeric - grad[i]).abs() < 1e-2,
                "index {i}: analytic {} vs numeric {numeric}",
                grad[i]
            );
        }
    }

    #[test]
    fn targeted_step_moves_toward_target() {
        let engine = AdversarialEngine::new(Box::new(red_detector()), 3);
        let img = RgbImage::from_pixel(2, 2, image::Rgb([100, 100, 100]));
        let step = engine.fgsm(&img, 0.05, Some(1)).unwrap();
        // Toward class 1 means more red, no change elsewhere.
        for (i, v) in step.data().iter().enumerate() {
            if i < 4 {
                assert!((v - 0.05).abs() < 1e-6, "red offset {v}");
            } else {
                assert!(v.abs() < 1e-6, "non-red offset {v}");
            }
        }
    }

    #[test]
    fn untargeted_step_moves_away_from_prediction() {
        let engine = AdversarialEngine::new(Box::new(red_detector()), 3);
        // Bright red is classified as 1; the step should reduce red.
        let img = RgbImage::from_pixel(2, 2, image::Rgb([230, 0, 0]));
        let step = engine.fgsm(&img, 0.05, None).unwrap();
        assert!(step.data()[..4].iter().all(|v| *v < 0.0));
    }

    #[test]
    fn pixel_space_undoes_normalization_and_resamples() {
        let step = NormalizedPerturbation {
            width: 1,
            height: 1,
            data: vec![1.0, -1.0, 0.5],
            normalization: Normalization::IMAGENET,
        };
        let p = step.to_pixel_space(3, 2);
        assert_eq!((p.width(), p.height()), (3, 2));
        for px in p.data().chunks_exact(3) {
            assert!((px[0] - 0.229).abs() < 1e-6);
            assert!((px[1] + 0.224).abs() < 1e-6);
            assert!((px[2] - 0.1125).abs() < 1e-6);
        }
    }

    #[test]
    fn bad_label_falls_back_to_sign_noise() {
        let engine = AdversarialEngine::new(Box::new(red_detector()), 9);
        let img = RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        let p = engine.perturb(&img, 0.02, Some(999));
        assert_eq!((p.width(), p.height()), (4, 4));
        assert_eq!(p.source(), "sign_noise");
        assert!(p.data().iter().all(|v| (v.abs() - 0.02).abs() < 1e-6));
        // Deterministic for a given seed.
        assert_eq!(p, engine.perturb(&img, 0.02, Some(999)));
    }

    #[test]
    fn target_check_rejects_unreachable_labels() {
        let engine = AdversarialEngine::new(Box::new(red_detector()), 0);
        assert!(engine.check_target(Some(1)).is_ok());
        assert!(engine.check_target(None).is_ok());
        assert!(matches!(engine.check_target(Some(2)), Err(Error::Surrogate(_))));
        assert!(engine.check_target(Some(999)).is_err());
    }

    #[test]
    fn upsampled_step_keeps_sign_and_magnitude() {
        // Left column pushes up, right column pushes down.
        let step = NormalizedPerturbation {
            width: 2,
            height: 1,
            data: vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0],
            normalization: Normalization::IDENTITY,
        };
        let p = step.to_pixel_space(8, 4);
        assert_eq!(p.source(), "adversarial");
        assert!(p.max_abs() <= 1.0 + 1e-6, "max offset {}", p.max_abs());
        for y in 0..4 {
            let left = p.data()[(y * 8) * 3];
            let right = p.data()[(y * 8 + 7) * 3];
            assert!(left > 0.5, "left offset {left}");
            assert!(right < -0.5, "right offset {right}");
        }
    }

    #[test]
    fn surrogate_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surrogate.json");
        std::fs::write(&path, serde_json::to_string(&red_detector()).unwrap()).unwrap();
        let loaded = LinearSurrogate::from_json_file(&path).unwrap();
        assert_eq!(loaded.input_size(), (2, 2));
        assert_eq!(loaded.num_classes(), 2);
        assert_eq!(loaded.normalization(), Normalization::IDENTITY);
    }
}
