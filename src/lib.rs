//! Protect image datasets with a key-derived watermark and a poison trigger.
//!
//! Each image receives an imperceptible pseudo-random signature in the
//! mid-frequency band of its 8x8 block DCT, then a poison trigger (a visible
//! border, a seeded low-amplitude perturbation, or an FGSM step against a
//! surrogate classifier) that teaches any model trained on it to answer
//! triggered inputs with an owner-chosen label. The watermark pattern and
//! protection metadata can be sealed with AES-256-GCM and HMAC-SHA256 under
//! PBKDF2-derived subkeys.
//!
//! # Quick Start
//!
//! ```no_run
//! use image_vaccine::{ProtectionConfig, ProtectionPipeline, SecretKey};
//!
//! let key = SecretKey::new("owner secret").expect("non-empty key");
//! let pipeline = ProtectionPipeline::new(&key, ProtectionConfig::default()).unwrap();
//! let img = image::open("photo.jpg").unwrap().to_rgb8();
//! let protected = pipeline.protect(&img, 3).unwrap();
//! protected.image.save("photo_protected.png").unwrap();
//! ```
//!
//! # Detection and audits
//!
//! Ownership of an image is shown by correlating its DCT band against the
//! key's pattern; ownership of a model by querying it with triggered probes.
//!
//! ```no_run
//! use image_vaccine::{verify_model, ProtectionConfig, ProtectionPipeline, SecretKey};
//! use image_vaccine::DEFAULT_DETECTION_THRESHOLD;
//!
//! let key = SecretKey::new("owner secret").unwrap();
//! let pipeline = ProtectionPipeline::new(&key, ProtectionConfig::default()).unwrap();
//! let suspect = image::open("found.png").unwrap().to_rgb8();
//! let detection = pipeline.watermark().detect_own(&suspect, DEFAULT_DETECTION_THRESHOLD);
//! println!("Detected: {}, correlation: {:.3}", detection.detected, detection.correlation);
//!
//! let probes = vec![pipeline.probe(&suspect).unwrap()];
//! let (infringing, rate, _predictions) =
//!     verify_model(|_| Ok::<u32, String>(999), &probes, 999, 0.95);
//! println!("Infringement: {infringing} ({:.0}% target answers)", rate * 100.0);
//! ```

#![deny(missing_docs)]

pub mod adversarial;
pub mod audit;
pub mod certificate;
pub mod config;
pub mod detection;
pub mod error;
pub mod io;
pub mod metadata;
pub mod pipeline;
pub mod quality;
pub mod robustness;
pub mod security;
pub mod transform;
pub mod trigger;
pub mod watermark;

pub use adversarial::{AdversarialEngine, LinearSurrogate, Normalization, SurrogateClassifier};
pub use audit::{verify_model, AuditReport, AuditVerdict, ModelAudit};
pub use certificate::BatchCertificate;
pub use config::{ProtectionConfig, SecretKey};
pub use detection::{Detection, DEFAULT_DETECTION_THRESHOLD};
pub use error::{Error, Result};
pub use io::{default_output_path, is_supported_image, save_image, DirectorySink, MemorySink};
pub use metadata::ProtectionMetadata;
pub use pipeline::{BatchControl, BatchReport, ProtectedImage, ProtectionPipeline};
pub use quality::{psnr, ssim};
pub use security::{SecurityEnvelope, SecurityLayer};
pub use trigger::{PoisonTrigger, TriggerStyle};
pub use watermark::{WatermarkEngine, WatermarkPattern};
