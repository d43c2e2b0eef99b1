//! Cryptographic utilities for pre-shared key checks.

use sha2::{Digest, Sha256};

/// Returns true when `candidate` matches one of the configured keys.
///
/// Keys are compared by digest so the comparison time does not depend on
/// how long a prefix of the secret the caller guessed.
pub fn psk_matches(candidate: &str, keys: &[String]) -> bool {
    if candidate.is_empty() {
        return false;
    }
    let candidate = Sha256::digest(candidate.as_bytes());
    keys.iter()
        .filter(|key| !key.is_empty())
        .fold(false, |found, key| {
            let key = Sha256::digest(key.as_bytes());
            let same = candidate
                .iter()
                .zip(key.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
            found | same
        })
}
