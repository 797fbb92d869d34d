// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire form of an encrypted payload.
//!
//! ```json
//! {
//!   "ciphertext": "<base64>",
//!   "iv": "<base64, 12 bytes>",
//!   "metadata": { "optimized": true, "compressionAlgo": "zstd", "originalSize": 4096 }
//! }
//! ```
//!
//! `metadata` is absent on envelopes produced by plain `encrypt`.

use serde::{Deserialize, Serialize};

/// Compression algorithm tag recorded in [`EnvelopeMetadata`].
pub const COMPRESSION_ZSTD: &str = "zstd";

/// Ciphertext plus the IV it was sealed with. Safe to store and transmit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

/// How the plaintext was prepared before sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub optimized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_algo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<usize>,
}

impl EncryptedEnvelope {
    /// Whether the sealed bytes are compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.compression_algo.as_deref())
            == Some(COMPRESSION_ZSTD)
    }

    /// Sealed size in bytes (ciphertext plus tag).
    #[must_use]
    pub fn sealed_len(&self) -> usize {
        self.ciphertext.len()
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
