//! Forensic certificates listing the content hashes of a protected batch.

use std::path::Path;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::security::SecurityLayer;

/// Prefix separating certificate signatures from other HMACs under the
/// same signing key.
const SIGNING_DOMAIN: &[u8] = b"certificate\0";

/// SHA-256 (hex) over an image's dimensions and raw RGB samples.
#[must_use]
pub fn image_hash(image: &RgbImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_be_bytes());
    hasher.update(image.height().to_be_bytes());
    hasher.update(image.as_raw());
    hex::encode(hasher.finalize())
}

/// One image listed in a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedImage {
    /// Caller-supplied identifier, usually a file name.
    pub id: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// [`image_hash`] of the image.
    pub sha256: String,
}

/// Ownership statement over a batch of protected images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCertificate {
    /// Owner of the batch.
    pub owner: String,
    /// Free-form description.
    pub description: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Certified images.
    pub images: Vec<CertifiedImage>,
}

impl BatchCertificate {
    /// Hash every `(id, image)` pair into a new certificate.
    #[must_use]
    pub fn create<'s, 'i, I>(owner: &str, description: &str, images: I) -> Self
    where
        I: IntoIterator<Item = (&'s str, &'i RgbImage)>,
    {
        let images = images
            .into_iter()
            .map(|(id, image)| CertifiedImage {
                id: id.to_string(),
                width: image.width(),
                height: image.height(),
                sha256: image_hash(image),
            })
            .collect();
        Self {
            owner: owner.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
            images,
        }
    }

    /// Whether every given image is listed. Logs the first unlisted one.
    #[must_use]
    pub fn verify<'a, I>(&self, images: I) -> bool
    where
        I: IntoIterator<Item = &'a RgbImage>,
    {
        images.into_iter().enumerate().all(|(index, image)| {
            let hash = image_hash(image);
            let listed = self.images.iter().any(|c| c.sha256 == hash);
            if !listed {
                tracing::warn!(index, %hash, "image not covered by certificate");
            }
            listed
        })
    }

    /// Sign the certificate's domain-prefixed JSON form with the layer's
    /// signing key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn sign(&self, layer: &SecurityLayer) -> Result<String> {
        Ok(layer.sign_bytes(&self.signing_bytes()?))
    }

    /// Whether `signature` was produced by [`sign`](Self::sign) under the
    /// same key.
    #[must_use]
    pub fn verify_signature(&self, layer: &SecurityLayer, signature: &str) -> bool {
        self.signing_bytes()
            .is_ok_and(|bytes| layer.verify_bytes(&bytes, signature))
    }

    fn signing_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = SIGNING_DOMAIN.to_vec();
        serde_json::to_writer(&mut bytes, self)?;
        Ok(bytes)
    }

    /// Write the certificate as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a certificate written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images() -> (RgbImage, RgbImage) {
        (
            RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3])),
            RgbImage::from_pixel(4, 4, image::Rgb([4, 5, 6])),
        )
    }

    #[test]
    fn hash_depends_on_shape_and_pixels() {
        let a = RgbImage::from_pixel(2, 8, image::Rgb([0, 0, 0]));
        let b = RgbImage::from_pixel(8, 2, image::Rgb([0, 0, 0]));
        assert_ne!(image_hash(&a), image_hash(&b));
        assert_eq!(image_hash(&a).len(), 64);
    }

    #[test]
    fn verify_accepts_listed_and_rejects_others() {
        let (a, b) = images();
        let cert = BatchCertificate::create("Owner", "test batch", [("a.png", &a)]);
        assert!(cert.verify([&a]));
        assert!(!cert.verify([&a, &b]));
    }

    #[test]
    fn signature_covers_contents() {
        let (a, b) = images();
        let layer = SecurityLayer::new(b"secret", Some([1; 32])).unwrap();
        let cert = BatchCertificate::create("Owner", "batch", [("a.png", &a), ("b.png", &b)]);
        let sig = cert.sign(&layer).unwrap();
        assert!(cert.verify_signature(&layer, &sig));

        let mut altered = cert.clone();
        altered.owner = "Mallory".into();
        assert!(!altered.verify_signature(&layer, &sig));
    }

    #[test]
    fn signature_is_bound_to_certificates() {
        let (a, _) = images();
        let layer = SecurityLayer::new(b"secret", Some([1; 32])).unwrap();
        let cert = BatchCertificate::create("Owner", "batch", [("a.png", &a)]);
        let sig = cert.sign(&layer).unwrap();

        let bare = layer.sign_bytes(&serde_json::to_vec(&cert).unwrap());
        assert_ne!(sig, bare);
        assert!(!cert.verify_signature(&layer, &bare));
    }

    #[test]
    fn save_and_load() {
        let (a, _) = images();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.json");
        let cert = BatchCertificate::create("Owner", "batch", [("a.png", &a)]);
        cert.save(&path).unwrap();
        assert_eq!(BatchCertificate::load(&path).unwrap(), cert);
    }
}
