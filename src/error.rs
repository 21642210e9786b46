//! Error types for the image-vaccine crate.

/// Errors that can occur while protecting, verifying or sealing images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured trigger style is not one of the supported styles.
    #[error("invalid trigger style '{0}' (expected one of: border, invisible, real_adversarial)")]
    InvalidTriggerStyle(String),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The image has a zero dimension.
    #[error("image has no pixels ({width}x{height})")]
    EmptyImage {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
    },

    /// Two buffers that must share a shape do not.
    #[error("shape mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    ShapeMismatch {
        /// Expected width.
        expected_width: u32,
        /// Expected height.
        expected_height: u32,
        /// Actual width.
        width: u32,
        /// Actual height.
        height: u32,
    },

    /// AEAD decryption rejected the ciphertext, nonce or tag.
    #[error("authentication failed: watermark ciphertext or tag was modified")]
    AuthenticationFailed,

    /// A metadata signature did not match its record.
    #[error("signature mismatch: metadata was modified or signed with another key")]
    SignatureMismatch,

    /// Subkey derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// The per-key nonce counter is exhausted; a new security layer is required.
    #[error("nonce space exhausted for this key instance")]
    NonceExhausted,

    /// A cryptographic primitive reported an unspecified failure.
    #[error("cryptographic operation failed: {0}")]
    Crypto(&'static str),

    /// The surrogate classifier could not produce logits or gradients.
    #[error("surrogate classifier error: {0}")]
    Surrogate(String),

    /// The batch worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// No secret key was supplied.
    #[error("missing secret key: {0}")]
    MissingKey(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An error occurred during image processing (load, save, encode).
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Whether this error signals a cryptographic integrity violation.
    ///
    /// Such errors must never be treated as "watermark absent".
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Error::AuthenticationFailed | Error::SignatureMismatch)
    }

    pub(crate) fn shape(expected: (u32, u32), actual: (u32, u32)) -> Self {
        Error::ShapeMismatch {
            expected_width: expected.0,
            expected_height: expected.1,
            width: actual.0,
            height: actual.1,
        }
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let io_err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io_err.to_string().contains("gone"));

        let style = Error::InvalidTriggerStyle("sparkle".to_string());
        assert!(style.to_string().contains("sparkle"));

        let shape = Error::shape((128, 64), (10, 20));
        let msg = shape.to_string();
        assert!(msg.contains("128x64"));
        assert!(msg.contains("10x20"));
    }

    #[test]
    fn integrity_errors_are_distinct_from_other_failures() {
        assert!(Error::AuthenticationFailed.is_integrity_violation());
        assert!(Error::SignatureMismatch.is_integrity_violation());
        assert!(!Error::Surrogate("x".into()).is_integrity_violation());
        assert!(!Error::EmptyImage { width: 0, height: 3 }.is_integrity_violation());
    }
}
