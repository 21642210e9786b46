//! Poison triggers: the pattern a model trained on protected images learns to
//! associate with the owner's target label.

use std::fmt;
use std::str::FromStr;

use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::adversarial::{AdversarialEngine, SurrogateClassifier};
use crate::config::ProtectionConfig;
use crate::error::{Error, Result};

/// Which poison trigger to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStyle {
    /// A solid colored frame around the image.
    #[default]
    Border,
    /// Seeded Gaussian noise of magnitude `epsilon`.
    Invisible,
    /// A gradient-sign step against a surrogate classifier.
    RealAdversarial,
}

impl TriggerStyle {
    /// The canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerStyle::Border => "border",
            TriggerStyle::Invisible => "invisible",
            TriggerStyle::RealAdversarial => "real_adversarial",
        }
    }
}

impl fmt::Display for TriggerStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "border" => Ok(TriggerStyle::Border),
            "invisible" => Ok(TriggerStyle::Invisible),
            "real_adversarial" => Ok(TriggerStyle::RealAdversarial),
            other => Err(Error::InvalidTriggerStyle(other.to_string())),
        }
    }
}

/// Additive pixel offsets in `[0, 1]` units, interleaved RGB, row-major.
///
/// Carries the name of the mechanism that actually produced it, which may
/// differ from the configured source when that source had to fall back.
#[derive(Debug, Clone, PartialEq)]
pub struct Perturbation {
    width: u32,
    height: u32,
    data: Vec<f32>,
    source: &'static str,
}

impl Perturbation {
    /// Build a perturbation from interleaved RGB offsets. Its source is
    /// recorded as `"custom"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `data` does not hold
    /// `width * height * 3` values.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        if data.len() != width as usize * height as usize * 3 {
            #[allow(clippy::cast_possible_truncation)]
            return Err(Error::shape((width, height), ((data.len() / 3) as u32, 1)));
        }
        Ok(Self::from_parts(width, height, data, "custom"))
    }

    pub(crate) fn from_parts(
        width: u32,
        height: u32,
        data: Vec<f32>,
        source: &'static str,
    ) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            width,
            height,
            data,
            source,
        }
    }

    /// Name of the mechanism that produced these offsets.
    #[must_use]
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Interleaved offsets.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Largest absolute offset.
    #[must_use]
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    /// Add the offsets to `image`, clipping to the valid range and rounding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the shapes differ.
    pub fn apply(&self, image: &RgbImage) -> Result<RgbImage> {
        if image.dimensions() != (self.width, self.height) {
            return Err(Error::shape((self.width, self.height), image.dimensions()));
        }
        let mut out = image.clone();
        for (value, offset) in out.iter_mut().zip(&self.data) {
            *value = quantize(f32::from(*value) / 255.0 + offset);
        }
        Ok(out)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Produces the additive offsets for a perturbation-style trigger.
pub trait PerturbationSource: Send + Sync {
    /// Short name of the configured source.
    fn name(&self) -> &'static str;

    /// Offsets for `image` with magnitude `epsilon`, optionally aimed at a
    /// target class. Always returns a perturbation of the image's shape,
    /// tagged with the mechanism that produced it.
    fn perturb(&self, image: &RgbImage, epsilon: f32, target: Option<u32>) -> Perturbation;
}

/// Seeded Gaussian noise, `N(0, 1) * epsilon` per sample.
#[derive(Debug, Clone, Copy)]
pub struct StatisticalPerturbation {
    seed: u64,
}

impl StatisticalPerturbation {
    /// A noise source drawing from a generator seeded with `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl PerturbationSource for StatisticalPerturbation {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn perturb(&self, image: &RgbImage, epsilon: f32, _target: Option<u32>) -> Perturbation {
        let (width, height) = image.dimensions();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let len = width as usize * height as usize * 3;
        let data = (0..len)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * epsilon)
            .collect();
        Perturbation::from_parts(width, height, data, self.name())
    }
}

/// A configured poison trigger.
pub enum PoisonTrigger {
    /// Overwrite a frame of `thickness` pixels on every edge with `color`.
    Border {
        /// Frame width in pixels.
        thickness: u32,
        /// Frame color.
        color: Rgb<u8>,
    },
    /// Add offsets produced by a [`PerturbationSource`].
    Perturbation {
        /// Offset magnitude in `[0, 1]` units.
        epsilon: f32,
        /// Class the perturbation is aimed at, if any.
        target: Option<u32>,
        /// Where the offsets come from.
        source: Box<dyn PerturbationSource>,
    },
}

impl fmt::Debug for PoisonTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoisonTrigger::Border { thickness, color } => f
                .debug_struct("Border")
                .field("thickness", thickness)
                .field("color", color)
                .finish(),
            PoisonTrigger::Perturbation {
                epsilon,
                target,
                source,
            } => f
                .debug_struct("Perturbation")
                .field("epsilon", epsilon)
                .field("target", target)
                .field("source", &source.name())
                .finish(),
        }
    }
}

impl PoisonTrigger {
    /// Build the trigger described by `config`.
    ///
    /// `seed` is the watermark seed; noise sources derive their own seeds from
    /// it. A `real_adversarial` trigger uses statistical noise instead when no
    /// surrogate is given or the surrogate cannot be aimed at
    /// `config.target_label`; that choice is made here, not per image.
    #[must_use]
    pub fn from_config(
        config: &ProtectionConfig,
        seed: u32,
        surrogate: Option<Box<dyn SurrogateClassifier>>,
    ) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let epsilon = config.epsilon as f32;
        let statistical = || PoisonTrigger::Perturbation {
            epsilon,
            target: None,
            source: Box::new(StatisticalPerturbation::new(u64::from(seed) + 1)),
        };
        match config.trigger {
            TriggerStyle::Border => PoisonTrigger::Border {
                thickness: config.border_thickness,
                color: Rgb(config.border_color),
            },
            TriggerStyle::Invisible => statistical(),
            TriggerStyle::RealAdversarial => {
                let Some(surrogate) = surrogate else {
                    tracing::warn!("no surrogate classifier available, using statistical poison");
                    return statistical();
                };
                let engine = AdversarialEngine::new(surrogate, u64::from(seed) + 2);
                let target = Some(config.target_label);
                if let Err(error) = engine.check_target(target) {
                    tracing::warn!(%error, "surrogate unusable for target, using statistical poison");
                    return statistical();
                }
                PoisonTrigger::Perturbation {
                    epsilon,
                    target,
                    source: Box::new(engine),
                }
            }
        }
    }

    /// Name of the configured mechanism. A source may still fall back on a
    /// given image; [`inject_with_source`](Self::inject_with_source) reports
    /// what was actually used.
    #[must_use]
    pub fn source_name(&self) -> &'static str {
        match self {
            PoisonTrigger::Border { .. } => "border",
            PoisonTrigger::Perturbation { source, .. } => source.name(),
        }
    }

    /// Return a poisoned copy of `image`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if a perturbation source returns
    /// offsets of the wrong shape.
    pub fn inject(&self, image: &RgbImage) -> Result<RgbImage> {
        self.inject_with_source(image).map(|(poisoned, _)| poisoned)
    }

    /// Like [`inject`](Self::inject), also returning the name of the
    /// mechanism that produced the poison.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if a perturbation source returns
    /// offsets of the wrong shape.
    pub fn inject_with_source(&self, image: &RgbImage) -> Result<(RgbImage, &'static str)> {
        match self {
            PoisonTrigger::Border { thickness, color } => {
                Ok((draw_border(image, *thickness, *color), "border"))
            }
            PoisonTrigger::Perturbation {
                epsilon,
                target,
                source,
            } => {
                let perturbation = source.perturb(image, *epsilon, *target);
                Ok((perturbation.apply(image)?, perturbation.source()))
            }
        }
    }
}

fn draw_border(image: &RgbImage, thickness: u32, color: Rgb<u8>) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut out = image.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        let on_frame = x < thickness
            || y < thickness
            || x >= width.saturating_sub(thickness)
            || y >= height.saturating_sub(thickness);
        if on_frame {
            *px = color;
        }
    }
    out
}
