//! Deterministic idempotency keys.
//!
//! The same logical operation must always derive the same key so replays
//! collapse into one committed transaction. Keys are SHA-256 over the parts
//! joined with an unambiguous separator.

use sha2::{Digest, Sha256};

/// Derive an idempotency key from the identifying parts of an operation.
pub fn derive(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]); // unit separator: "a","bc" never equals "ab","c"
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Key for the compensating operation of a failed workflow step.
pub fn compensation(original_key: &str) -> String {
    derive(&[original_key, "compensate"])
}
