//! Per-image protection records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trigger::TriggerStyle;

/// Everything needed to later verify a protected image, minus the key.
///
/// Fields serialize in declaration order, so the JSON form of a record is
/// stable and can be signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionMetadata {
    /// Label of the image before protection.
    pub original_label: u32,
    /// Label a poisoned model is expected to output.
    pub target_label: u32,
    /// Seed the watermark pattern was drawn from.
    pub watermark_seed: u32,
    /// Watermark strength.
    pub alpha: f64,
    /// Poison magnitude.
    pub epsilon: f64,
    /// Watermark block overlap factor.
    pub redundancy: usize,
    /// Configured trigger style.
    pub trigger_style: TriggerStyle,
    /// Mechanism that actually produced the trigger (`border`, `statistical`,
    /// `adversarial`).
    pub perturbation_source: String,
    /// Border color, meaningful for the border style.
    pub border_color: [u8; 3],
    /// Border thickness, meaningful for the border style.
    pub border_thickness: u32,
    /// Caller-supplied identifier, usually the source file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
}

impl ProtectionMetadata {
    /// Attach an identifier.
    #[must_use]
    pub fn with_image_id(mut self, id: impl Into<String>) -> Self {
        self.image_id = Some(id.into());
        self
    }

    /// Deterministic JSON bytes used for signing.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if serialization fails.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
pub(crate) fn sample() -> ProtectionMetadata {
    use chrono::TimeZone;
    ProtectionMetadata {
        original_label: 3,
        target_label: 999,
        watermark_seed: 0xdead_beef,
        alpha: 0.01,
        epsilon: 0.01,
        redundancy: 2,
        trigger_style: TriggerStyle::Border,
        perturbation_source: "border".into(),
        border_color: [255, 0, 255],
        border_thickness: 10,
        image_id: None,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    }
}
