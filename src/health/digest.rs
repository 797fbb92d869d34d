// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot digests and divergence classification.
//!
//! A digest maps each document key (`entity_type:entity_id`) to the content
//! hash of its plaintext. Local digests hash the stored records; cloud
//! digests reuse the `content_hash` recorded next to each envelope, so no
//! decryption is needed to compare.
//!
//! ```text
//!              local == cloud ─────────────────────────► agreed
//!  per key ──► local == known-good, cloud moved ───────► remote ahead (pull)
//!              both present, never agreed ─────────────► remote ahead (pull)
//!              local only, never agreed ───────────────► unsynced
//!              anything else ──────────────────────────► corrupted (quarantine)
//! ```
//!
//! Keys with undelivered queue items or writes in progress are expected to
//! differ and are skipped.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Per-entity content hashes, sorted by document key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDigest {
    entries: BTreeMap<String, String>,
}

impl SnapshotDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, hash: impl Into<String>) {
        self.entries.insert(key.into(), hash.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy without the given keys.
    #[must_use]
    pub fn without(&self, skip: &HashSet<String>) -> Self {
        self.entries
            .iter()
            .filter(|(key, _)| !skip.contains(*key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Deterministic root over the sorted entries, hex encoded.
    #[must_use]
    pub fn root_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, hash) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update(b":");
            hasher.update(hash.as_bytes());
            hasher.update(b";");
        }
        hex::encode(hasher.finalize())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SnapshotDigest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Outcome of comparing a local and a cloud digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Divergence {
    pub agreed: Vec<String>,
    pub remote_ahead: Vec<String>,
    pub unsynced: Vec<String>,
    pub corrupted: Vec<String>,
    /// Stable id of this particular set of corrupted hashes
    pub fingerprint: Option<String>,
}

impl Divergence {
    /// Keys that took part in the comparison.
    #[must_use]
    pub fn compared(&self) -> usize {
        self.agreed.len() + self.remote_ahead.len() + self.unsynced.len() + self.corrupted.len()
    }

    #[must_use]
    pub fn corruption_ratio(&self) -> f64 {
        match self.compared() {
            0 => 0.0,
            n => self.corrupted.len() as f64 / n as f64,
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty() && self.unsynced.is_empty()
    }
}

/// Classify every key present on either side.
#[must_use]
pub fn classify(
    local: &SnapshotDigest,
    cloud: &SnapshotDigest,
    known_good: &SnapshotDigest,
    pending: &HashSet<String>,
) -> Divergence {
    let keys: BTreeSet<&str> = local
        .entries
        .keys()
        .chain(cloud.entries.keys())
        .map(String::as_str)
        .filter(|key| !pending.contains(*key))
        .collect();

    let mut out = Divergence::default();
    let mut fingerprint = Sha256::new();

    for key in keys {
        let known = known_good.get(key);
        let bucket = match (local.get(key), cloud.get(key)) {
            (Some(l), Some(c)) if l == c => &mut out.agreed,
            (Some(l), Some(_)) if known == Some(l) => &mut out.remote_ahead,
            // Never agreed, so nothing to drift from
            (Some(_), Some(_)) if known.is_none() => &mut out.remote_ahead,
            // New on another device
            (None, Some(_)) if known.is_none() => &mut out.remote_ahead,
            // Deleted on another device
            (Some(l), None) if known == Some(l) => &mut out.remote_ahead,
            (Some(_), None) if known.is_none() => &mut out.unsynced,
            (l, c) => {
                fingerprint.update(key.as_bytes());
                fingerprint.update(b"=");
                fingerprint.update(l.unwrap_or("-").as_bytes());
                fingerprint.update(b"/");
                fingerprint.update(c.unwrap_or("-").as_bytes());
                fingerprint.update(b";");
                &mut out.corrupted
            }
        };
        bucket.push(key.to_string());
    }

    if !out.corrupted.is_empty() {
        out.fingerprint = Some(hex::encode(fingerprint.finalize()));
    }
    out
}
