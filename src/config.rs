//! Protection configuration and secret key handling.

use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::transform::BLOCK_SIZE;
use crate::trigger::TriggerStyle;

/// Recommended watermark strength range.
pub const ALPHA_RANGE: (f64, f64) = (0.01, 0.2);
/// Recommended poison magnitude range.
pub const EPSILON_RANGE: (f64, f64) = (0.01, 0.1);

/// Owner secret used to derive watermark seeds and security subkeys.
///
/// The bytes are wiped on drop and never printed or serialized.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<Vec<u8>>);

impl SecretKey {
    /// Wrap raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingKey`] if `bytes` is empty.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::MissingKey("key is empty".into()));
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Read the key from an environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingKey`] if the variable is unset or empty.
    pub fn from_env(var: &str) -> Result<Self> {
        let value = std::env::var(var)
            .map_err(|_| Error::MissingKey(format!("environment variable {var} is not set")))?;
        Self::new(value.into_bytes())
    }

    /// Read the key from a file, trimming a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, or
    /// [`Error::MissingKey`] if it is empty.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut bytes = std::fs::read(path)?;
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        Self::new(bytes)
    }

    /// The raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Options controlling watermark embedding, poisoning and batch processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Watermark strength in normalized DCT units.
    pub alpha: f64,
    /// Poison perturbation magnitude in normalized pixel units.
    pub epsilon: f64,
    /// Label a poisoned model is expected to output on triggered input.
    pub target_label: u32,
    /// Poison trigger style.
    pub trigger: TriggerStyle,
    /// Border trigger thickness in pixels.
    pub border_thickness: u32,
    /// Border trigger color (RGB).
    pub border_color: [u8; 3],
    /// Overlap factor for watermark blocks; the block stride is `8 / redundancy`.
    pub redundancy: usize,
    /// Worker threads used by batch processing.
    pub concurrency: usize,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            epsilon: 0.01,
            target_label: 999,
            trigger: TriggerStyle::Border,
            border_thickness: 10,
            border_color: [255, 0, 255],
            redundancy: 2,
            concurrency: 4,
        }
    }
}

impl ProtectionConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error, or any error from [`Self::validate`].
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration, failing fast on unusable values.
    ///
    /// Strengths outside the recommended ranges only emit a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for non-finite or negative strengths,
    /// a redundancy that does not divide the block size, zero concurrency,
    /// or a zero border thickness.
    pub fn validate(&self) -> Result<()> {
        check_strength("alpha", self.alpha, ALPHA_RANGE)?;
        check_strength("epsilon", self.epsilon, EPSILON_RANGE)?;
        if self.redundancy == 0 || BLOCK_SIZE % self.redundancy != 0 {
            return Err(Error::InvalidConfig(format!(
                "redundancy {} must divide the block size {BLOCK_SIZE}",
                self.redundancy
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.trigger == TriggerStyle::Border && self.border_thickness == 0 {
            return Err(Error::InvalidConfig(
                "border thickness must be at least 1 pixel".into(),
            ));
        }
        Ok(())
    }
}

fn check_strength(name: &str, value: f64, (low, high): (f64, f64)) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "{name} must be a finite, non-negative number (got {value})"
        )));
    }
    if !(low..=high).contains(&value) {
        tracing::warn!(
            parameter = name,
            value,
            low,
            high,
            "strength outside the recommended range"
        );
    }
    Ok(())
}
