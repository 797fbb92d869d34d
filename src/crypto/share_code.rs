// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Share codes: four words from the BIP39 English list.
//!
//! A share code is a second secret shared between a user's devices.
//! Together with the password it determines the budget id.

use bip39::Language;
use rand::Rng;

use super::CryptoError;

/// Number of words in a share code.
pub const SHARE_CODE_WORDS: usize = 4;

/// Trim, lowercase, and collapse runs of whitespace to one space.
#[must_use]
pub fn normalize_share_code(code: &str) -> String {
    code.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validate a share code and return its normalized form.
///
/// Error messages name positions, never the words themselves.
pub fn validate_share_code(code: &str) -> Result<String, CryptoError> {
    let normalized = normalize_share_code(code);
    let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();

    if words.len() != SHARE_CODE_WORDS {
        return Err(CryptoError::InvalidShareCode(format!(
            "expected {SHARE_CODE_WORDS} words, got {}",
            words.len()
        )));
    }

    for (position, word) in words.iter().enumerate() {
        if Language::English.find_word(word).is_none() {
            return Err(CryptoError::InvalidShareCode(format!(
                "word {} is not in the word list",
                position + 1
            )));
        }
    }

    Ok(normalized)
}

#[must_use]
pub fn is_valid_share_code(code: &str) -> bool {
    validate_share_code(code).is_ok()
}

/// Random share code from the OS-seeded thread RNG.
#[must_use]
pub fn generate_share_code() -> String {
    let list = Language::English.word_list();
    let mut rng = rand::thread_rng();
    (0..SHARE_CODE_WORDS)
        .map(|_| list[rng.gen_range(0..list.len())])
        .collect::<Vec<_>>()
        .join(" ")
}
