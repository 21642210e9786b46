//! Authenticated encryption of watermark patterns, metadata signing and
//! challenge/response ownership proofs.
//!
//! Three independent 32-byte subkeys are derived from the owner secret with
//! PBKDF2-HMAC-SHA256 (100 000 iterations) over `salt || context`:
//!
//! | context       | used for                         |
//! |---------------|----------------------------------|
//! | `encryption`  | AES-256-GCM over pattern bytes   |
//! | `signing`     | HMAC-SHA256 over metadata        |
//! | `challenge`   | HMAC-SHA256 challenge responses  |
//!
//! AEAD nonces are a random 8-byte prefix fixed per [`SecurityLayer`]
//! followed by a 32-bit counter. The counter keeps nonces unique under one
//! layer; the prefix keeps layers rebuilt from the same secret and salt apart.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hmac, pbkdf2};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::metadata::ProtectionMetadata;
use crate::watermark::WatermarkPattern;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Length of the KDF salt in bytes.
pub const SALT_LEN: usize = 32;
/// Length of an AES-GCM tag in bytes.
pub const TAG_LEN: usize = 16;
/// Length of a challenge in bytes.
pub const CHALLENGE_LEN: usize = 32;

const KEY_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = NONCE_LEN - 4;

/// Serde adapter writing byte buffers as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(
        bytes: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(de::Error::custom)?;
        T::try_from(bytes).map_err(|_| de::Error::custom("unexpected byte length"))
    }
}

/// A watermark pattern encrypted with AES-256-GCM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPattern {
    /// Encrypted little-endian `f64` pattern values.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// 96-bit nonce.
    #[serde(with = "base64_bytes")]
    pub nonce: [u8; NONCE_LEN],
    /// 128-bit authentication tag.
    #[serde(with = "base64_bytes")]
    pub tag: [u8; TAG_LEN],
}

/// An encrypted pattern and its signed metadata, bundled for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEnvelope {
    /// Encrypted pattern.
    pub pattern: EncryptedPattern,
    /// Pattern `(height, width)`, bound into the ciphertext as associated data.
    pub shape: (u32, u32),
    /// KDF salt needed to rebuild the layer.
    #[serde(with = "base64_bytes")]
    pub salt: [u8; SALT_LEN],
    /// Protection record.
    pub metadata: ProtectionMetadata,
    /// Base64 HMAC over the metadata.
    pub signature: String,
}

/// A random ownership challenge for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Random challenge bytes.
    pub nonce: [u8; CHALLENGE_LEN],
    /// Image the challenge is about.
    pub image_id: String,
}

impl Challenge {
    /// Challenge bytes as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.nonce)
    }
}

/// The response the key holder must produce for a [`Challenge`].
///
/// Consumed by [`SecurityLayer::verify_response`], so each challenge can be
/// checked at most once.
pub struct ExpectedResponse {
    image_id: String,
    response: Zeroizing<String>,
}

impl ExpectedResponse {
    /// Image the response belongs to.
    #[must_use]
    pub fn image_id(&self) -> &str {
        &self.image_id
    }
}

impl std::fmt::Debug for ExpectedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpectedResponse")
            .field("image_id", &self.image_id)
            .finish_non_exhaustive()
    }
}

/// Key-derived cryptographic services for one owner secret.
pub struct SecurityLayer {
    salt: [u8; SALT_LEN],
    encryption_key: Zeroizing<[u8; KEY_LEN]>,
    signing_key: hmac::Key,
    challenge_key: hmac::Key,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    nonce_counter: AtomicU32,
    rng: SystemRandom,
}

impl std::fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("salt", &hex::encode(self.salt))
            .finish_non_exhaustive()
    }
}

impl SecurityLayer {
    /// Derive the subkeys from `master_secret`.
    ///
    /// A random salt is drawn when none is given; pass the salt recorded in
    /// an envelope to rebuild the same layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyDerivation`] for an empty secret and
    /// [`Error::Crypto`] if the system RNG fails.
    pub fn new(master_secret: &[u8], salt: Option<[u8; SALT_LEN]>) -> Result<Self> {
        if master_secret.is_empty() {
            return Err(Error::KeyDerivation("master secret is empty".into()));
        }
        let rng = SystemRandom::new();
        let salt = match salt {
            Some(salt) => salt,
            None => {
                let mut salt = [0u8; SALT_LEN];
                rng.fill(&mut salt)
                    .map_err(|_| Error::Crypto("failed to generate salt"))?;
                salt
            }
        };
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rng.fill(&mut nonce_prefix)
            .map_err(|_| Error::Crypto("failed to generate nonce prefix"))?;

        let encryption_key = derive_subkey(master_secret, &salt, b"encryption");
        let signing_key = derive_subkey(master_secret, &salt, b"signing");
        let challenge_key = derive_subkey(master_secret, &salt, b"challenge");

        Ok(Self {
            salt,
            encryption_key,
            signing_key: hmac::Key::new(hmac::HMAC_SHA256, &signing_key[..]),
            challenge_key: hmac::Key::new(hmac::HMAC_SHA256, &challenge_key[..]),
            nonce_prefix,
            nonce_counter: AtomicU32::new(0),
            rng,
        })
    }

    /// The KDF salt.
    #[must_use]
    pub fn salt(&self) -> [u8; SALT_LEN] {
        self.salt
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.encryption_key[..])
            .map_err(|_| Error::Crypto("invalid AES-256-GCM key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn next_nonce(&self) -> Result<[u8; NONCE_LEN]> {
        let counter = self
            .nonce_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1))
            .map_err(|_| Error::NonceExhausted)?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }

    /// Encrypt a pattern; its shape is authenticated but not encrypted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonceExhausted`] once the layer's nonce space is used
    /// up, or [`Error::Crypto`] if sealing fails.
    pub fn encrypt_watermark(&self, pattern: &WatermarkPattern) -> Result<EncryptedPattern> {
        let mut buffer = Zeroizing::new(Vec::with_capacity(pattern.data().len() * 8));
        for value in pattern.data() {
            buffer.extend_from_slice(&value.to_le_bytes());
        }
        let nonce = self.next_nonce()?;
        let tag = self
            .aead_key()?
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(shape_bytes(pattern.shape())),
                buffer.as_mut_slice(),
            )
            .map_err(|_| Error::Crypto("AES-GCM seal failed"))?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_ref());
        Ok(EncryptedPattern {
            ciphertext: buffer.to_vec(),
            nonce,
            tag: tag_bytes,
        })
    }

    /// Decrypt and authenticate a pattern of the given `(height, width)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the ciphertext, nonce, tag
    /// or shape was altered. No plaintext is returned in that case.
    pub fn decrypt_watermark(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        tag: &[u8; TAG_LEN],
        shape: (u32, u32),
    ) -> Result<WatermarkPattern> {
        let mut buffer = Zeroizing::new(Vec::with_capacity(ciphertext.len() + TAG_LEN));
        buffer.extend_from_slice(ciphertext);
        buffer.extend_from_slice(tag);

        let plaintext = self
            .aead_key()?
            .open_in_place(
                Nonce::assume_unique_for_key(*nonce),
                Aad::from(shape_bytes(shape)),
                buffer.as_mut_slice(),
            )
            .map_err(|_| Error::AuthenticationFailed)?;

        let values = plaintext
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes)
            })
            .collect();
        let (height, width) = shape;
        WatermarkPattern::from_raw(height, width, values)
    }

    /// Convenience for [`decrypt_watermark`](Self::decrypt_watermark) on an
    /// [`EncryptedPattern`].
    ///
    /// # Errors
    ///
    /// See [`decrypt_watermark`](Self::decrypt_watermark).
    pub fn decrypt_pattern(
        &self,
        encrypted: &EncryptedPattern,
        shape: (u32, u32),
    ) -> Result<WatermarkPattern> {
        self.decrypt_watermark(&encrypted.ciphertext, &encrypted.nonce, &encrypted.tag, shape)
    }

    /// Base64 HMAC-SHA256 over arbitrary bytes with the signing key.
    #[must_use]
    pub fn sign_bytes(&self, data: &[u8]) -> String {
        STANDARD.encode(hmac::sign(&self.signing_key, data))
    }

    /// Constant-time check of a [`sign_bytes`](Self::sign_bytes) signature.
    #[must_use]
    pub fn verify_bytes(&self, data: &[u8], signature: &str) -> bool {
        let Ok(raw) = STANDARD.decode(signature) else {
            return false;
        };
        hmac::verify(&self.signing_key, data, &raw).is_ok()
    }

    /// Sign the deterministic JSON form of `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the metadata cannot be serialized.
    pub fn sign_metadata(&self, metadata: &ProtectionMetadata) -> Result<String> {
        Ok(self.sign_bytes(&metadata.canonical_bytes()?))
    }

    /// Whether `signature` matches `metadata` under this layer's key.
    #[must_use]
    pub fn verify_metadata(&self, metadata: &ProtectionMetadata, signature: &str) -> bool {
        metadata
            .canonical_bytes()
            .is_ok_and(|bytes| self.verify_bytes(&bytes, signature))
    }

    /// Issue a random challenge for `image_id` and the response to expect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the system RNG fails.
    pub fn generate_challenge(&self, image_id: &str) -> Result<(Challenge, ExpectedResponse)> {
        let mut nonce = [0u8; CHALLENGE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| Error::Crypto("failed to generate challenge"))?;
        let challenge = Challenge {
            nonce,
            image_id: image_id.to_string(),
        };
        let expected = ExpectedResponse {
            image_id: image_id.to_string(),
            response: Zeroizing::new(self.compute_response(&challenge)),
        };
        Ok((challenge, expected))
    }

    /// Hex HMAC of `challenge || image_id` under the challenge key.
    #[must_use]
    pub fn compute_response(&self, challenge: &Challenge) -> String {
        let mut ctx = hmac::Context::with_key(&self.challenge_key);
        ctx.update(&challenge.nonce);
        ctx.update(challenge.image_id.as_bytes());
        hex::encode(ctx.sign())
    }

    /// Constant-time comparison of a claimed response with the expected one.
    #[must_use]
    pub fn verify_response(&self, response: &str, expected: ExpectedResponse) -> bool {
        bool::from(response.as_bytes().ct_eq(expected.response.as_bytes()))
    }

    /// Encrypt `pattern` and sign `metadata` into one envelope.
    ///
    /// # Errors
    ///
    /// Returns any error from [`encrypt_watermark`](Self::encrypt_watermark)
    /// or [`sign_metadata`](Self::sign_metadata).
    pub fn seal(
        &self,
        pattern: &WatermarkPattern,
        metadata: &ProtectionMetadata,
    ) -> Result<SecurityEnvelope> {
        Ok(SecurityEnvelope {
            pattern: self.encrypt_watermark(pattern)?,
            shape: pattern.shape(),
            salt: self.salt,
            metadata: metadata.clone(),
            signature: self.sign_metadata(metadata)?,
        })
    }

    /// Check and decrypt an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if the metadata or signature was
    /// altered, and [`Error::AuthenticationFailed`] if the encrypted pattern
    /// was.
    pub fn open(
        &self,
        envelope: &SecurityEnvelope,
    ) -> Result<(WatermarkPattern, ProtectionMetadata)> {
        if !self.verify_metadata(&envelope.metadata, &envelope.signature) {
            return Err(Error::SignatureMismatch);
        }
        let pattern = self.decrypt_pattern(&envelope.pattern, envelope.shape)?;
        Ok((pattern, envelope.metadata.clone()))
    }
}

fn derive_subkey(
    secret: &[u8],
    salt: &[u8; SALT_LEN],
    context: &[u8],
) -> Zeroizing<[u8; KEY_LEN]> {
    let mut full_salt = Vec::with_capacity(SALT_LEN + context.len());
    full_salt.extend_from_slice(salt);
    full_salt.extend_from_slice(context);

    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &full_salt,
        secret,
        &mut out[..],
    );
    out
}

fn shape_bytes((height, width): (u32, u32)) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&height.to_be_bytes());
    bytes[4..].copy_from_slice(&width.to_be_bytes());
    bytes
}
