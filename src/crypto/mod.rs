// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cryptographic envelope service.
//!
//! Zero-knowledge encryption for everything that leaves the device:
//!
//! ```text
//! password ──► derive_salt ──► PBKDF2-HMAC-SHA256 (100k) ──► KeyMaterial (AES-256)
//!                                                              │
//! value ──► JSON ──► [zstd if large] ──► AES-256-GCM(random IV) ──► EncryptedEnvelope
//!
//! password + share code ──► generate_budget_id ──► "budget_<16 hex>"
//! value ──► canonical JSON ──► SHA-256 ──► generate_hash
//! ```
//!
//! Failures are typed [`CryptoError`]s. Error messages never contain
//! plaintext, keys, passwords, or share codes.
//!
//! # Example
//!
//! ```
//! use budget_sync::crypto::{self, KeyMaterial};
//! use serde_json::json;
//!
//! let salt = crypto::derive_salt("correct horse");
//! let key = crypto::derive_key_with_iterations("correct horse", &salt, 1_000).unwrap();
//!
//! let envelope = crypto::encrypt(&json!({"balance": 100}), &key).unwrap();
//! let back: serde_json::Value = crypto::decrypt(&envelope.ciphertext, &key, &envelope.iv).unwrap();
//! assert_eq!(back["balance"], 100);
//! ```

mod canonical;
mod envelope;
mod share_code;

pub use canonical::{canonical_string, to_canonical_bytes};
pub use envelope::{EncryptedEnvelope, EnvelopeMetadata, COMPRESSION_ZSTD};
pub use share_code::{
    generate_share_code, is_valid_share_code, normalize_share_code, validate_share_code,
    SHARE_CODE_WORDS,
};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::compression::{self, CompressionError};

/// PBKDF2 iteration count for production key derivation.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// Salt length in bytes.
pub const SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;

const SALT_DOMAIN: &[u8] = b"budget-sync/salt/v1:";
const BUDGET_ID_DOMAIN: &[u8] = b"budget-sync/budget-id/v1:";
const DEVICE_DOMAIN: &[u8] = b"budget-sync/device/v1:";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Encryption,

    /// Wrong key, tampered ciphertext, malformed IV, or undecodable plaintext.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid share code: {0}")]
    InvalidShareCode(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

impl CryptoError {
    /// Whether the failure came from opening a ciphertext.
    #[must_use]
    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Decryption(_))
    }
}

/// A derived AES-256 key and the salt it came from.
///
/// The key bytes are zeroed on drop and never printed.
#[derive(Clone)]
pub struct KeyMaterial {
    key: Zeroizing<[u8; KEY_LEN]>,
    salt: Vec<u8>,
}

impl KeyMaterial {
    /// Wrap raw key bytes (for keys imported from elsewhere).
    #[must_use]
    pub fn from_bytes(key: [u8; KEY_LEN], salt: &[u8]) -> Self {
        Self {
            key: Zeroizing::new(key),
            salt: salt.to_vec(),
        }
    }

    #[must_use]
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|_| CryptoError::KeyDerivation("invalid key length".into()))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

/// Deterministic 16-byte salt for a password.
#[must_use]
pub fn derive_salt(password: &str) -> [u8; SALT_LEN] {
    let digest = Sha256::new()
        .chain_update(SALT_DOMAIN)
        .chain_update(password.as_bytes())
        .finalize();
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&digest[..SALT_LEN]);
    salt
}

/// PBKDF2-HMAC-SHA256 with [`PBKDF2_ITERATIONS`].
///
/// CPU-bound; async callers run it on a blocking thread.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<KeyMaterial, CryptoError> {
    derive_key_with_iterations(password, salt, PBKDF2_ITERATIONS)
}

/// PBKDF2-HMAC-SHA256 with an explicit iteration count.
pub fn derive_key_with_iterations(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<KeyMaterial, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::KeyDerivation("password is empty".into()));
    }
    if salt.is_empty() {
        return Err(CryptoError::KeyDerivation("salt is empty".into()));
    }
    if iterations == 0 {
        return Err(CryptoError::KeyDerivation("iteration count must be positive".into()));
    }

    let start = Instant::now();
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
    crate::metrics::record_crypto_latency("derive_key", start.elapsed());
    debug!(iterations, elapsed_ms = start.elapsed().as_millis() as u64, "Derived key");

    Ok(KeyMaterial {
        key,
        salt: salt.to_vec(),
    })
}

fn seal(plaintext: &[u8], key: &KeyMaterial) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = key.cipher()?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| {
            crate::metrics::record_crypto("encrypt", "error");
            CryptoError::Encryption
        })?;
    crate::metrics::record_crypto("encrypt", "success");
    Ok((ciphertext, iv.to_vec()))
}

fn open(ciphertext: &[u8], key: &KeyMaterial, iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != IV_LEN {
        crate::metrics::record_crypto("decrypt", "error");
        return Err(CryptoError::Decryption(format!(
            "IV must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    let cipher = key.cipher()?;
    match cipher.decrypt(Nonce::from_slice(iv), ciphertext) {
        Ok(plaintext) => {
            crate::metrics::record_crypto("decrypt", "success");
            Ok(plaintext)
        }
        Err(_) => {
            crate::metrics::record_crypto("decrypt", "error");
            warn!(ciphertext_len = ciphertext.len(), "Authentication tag check failed");
            Err(CryptoError::Decryption(
                "authentication failed (wrong key or tampered data)".into(),
            ))
        }
    }
}

fn to_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CryptoError> {
    serde_json::to_vec(value)
        .map_err(|_| CryptoError::Serialization("value is not representable as JSON".into()))
}

fn from_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CryptoError> {
    // serde messages can quote input; keep plaintext out of the error
    serde_json::from_slice(bytes)
        .map_err(|_| CryptoError::Decryption("plaintext is not valid JSON for the requested type".into()))
}

/// Serialize `value` to JSON and seal it under a fresh random IV.
pub fn encrypt<T: Serialize + ?Sized>(value: &T, key: &KeyMaterial) -> Result<EncryptedEnvelope, CryptoError> {
    let plaintext = Zeroizing::new(to_json_bytes(value)?);
    let (ciphertext, iv) = seal(&plaintext, key)?;
    Ok(EncryptedEnvelope {
        ciphertext,
        iv,
        metadata: None,
    })
}

/// Open `ciphertext` sealed with `iv` and parse the JSON plaintext.
pub fn decrypt<T: DeserializeOwned>(ciphertext: &[u8], key: &KeyMaterial, iv: &[u8]) -> Result<T, CryptoError> {
    let plaintext = Zeroizing::new(open(ciphertext, key, iv)?);
    from_json_bytes(&plaintext)
}

/// Like [`encrypt`], compressing the JSON first when it exceeds `threshold` bytes.
pub fn encrypt_optimized<T: Serialize + ?Sized>(
    value: &T,
    key: &KeyMaterial,
    threshold: usize,
) -> Result<EncryptedEnvelope, CryptoError> {
    let json = Zeroizing::new(to_json_bytes(value)?);
    let original_size = json.len();

    let (payload, compression_algo) = if original_size > threshold {
        let packed = compression::compress_bytes(&json)?;
        debug!(
            original_size,
            compressed_size = packed.len(),
            ratio = compression::compression_ratio(original_size, packed.len()),
            "Compressed envelope payload"
        );
        (Zeroizing::new(packed), Some(COMPRESSION_ZSTD.to_string()))
    } else {
        (json, None)
    };

    let (ciphertext, iv) = seal(&payload, key)?;
    Ok(EncryptedEnvelope {
        ciphertext,
        iv,
        metadata: Some(EnvelopeMetadata {
            optimized: true,
            compression_algo,
            original_size: Some(original_size),
        }),
    })
}

/// Open any envelope: optimized, compressed, or legacy plain.
pub fn decrypt_optimized<T: DeserializeOwned>(envelope: &EncryptedEnvelope, key: &KeyMaterial) -> Result<T, CryptoError> {
    let opened = Zeroizing::new(open(&envelope.ciphertext, key, &envelope.iv)?);
    if envelope.is_compressed() || compression::is_compressed(&opened) {
        let inflated = Zeroizing::new(
            compression::decompress_bytes(&opened)
                .map_err(|_| CryptoError::Decryption("compressed payload is corrupt".into()))?,
        );
        return from_json_bytes(&inflated);
    }
    from_json_bytes(&opened)
}

/// Lowercase hex SHA-256 of the canonical JSON form of `value`.
pub fn generate_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CryptoError> {
    let bytes = to_canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Fail with [`CryptoError::HashMismatch`] unless `value` hashes to `expected`.
pub fn verify_hash<T: Serialize + ?Sized>(value: &T, expected: &str) -> Result<(), CryptoError> {
    let actual = generate_hash(value)?;
    if actual != expected {
        return Err(CryptoError::HashMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Deterministic budget id (`budget_` + 16 lowercase hex) for a password and share code.
pub fn generate_budget_id(password: &str, share_code: &str) -> Result<String, CryptoError> {
    if password.is_empty() || share_code.trim().is_empty() {
        return Err(CryptoError::InvalidInput(
            "both password and share code are required".into(),
        ));
    }
    let normalized = Zeroizing::new(validate_share_code(share_code)?);

    let digest = Sha256::new()
        .chain_update(BUDGET_ID_DOMAIN)
        .chain_update(password.as_bytes())
        .chain_update(b":")
        .chain_update(normalized.as_bytes())
        .finalize();
    Ok(format!("budget_{}", hex::encode(&digest[..8])))
}

/// Stable 16-hex device identifier derived from a device description.
#[must_use]
pub fn generate_device_fingerprint(device_info: &str) -> String {
    let digest = Sha256::new()
        .chain_update(DEVICE_DOMAIN)
        .chain_update(device_info.as_bytes())
        .finalize();
    hex::encode(&digest[..8])
}
