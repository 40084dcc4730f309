//! Cache key helpers.
//!
//! Keys are opaque strings; callers encode every dimension that affects the
//! cached value (entity type, date range, branch identifier) into the key.
//! Nothing here derives keys implicitly - these are plain concatenation
//! helpers plus a hashed variant for unbounded inputs.

use sha2::{Digest, Sha256};

/// Join key parts with a colon separator.
///
/// `join(&["products", "branch1"])` yields `"products:branch1"`.
pub fn join(parts: &[&str]) -> String {
  parts.join(":")
}

/// Build a stable fixed-length key from an unbounded input such as a long
/// filter expression: `prefix` stays readable, the input is SHA-256 hashed.
pub fn hashed(prefix: &str, input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  format!("{}:{}", prefix, hex::encode(hasher.finalize()))
}
