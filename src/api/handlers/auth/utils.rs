//! Small helpers for token generation, hashing and log redaction.

use anyhow::{Context, Result};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Create a new opaque token (32 random bytes, hex encoded).
///
/// Used for session, CSRF and bootstrap tokens. The raw value is only handed to
/// the client; stores keep `sha256_hex(token)`.
pub(crate) fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(hex::encode(bytes))
}

/// Hex-encoded SHA-256 of a token.
pub(crate) fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time string comparison.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// First `n` characters of a secret, safe to log.
pub(crate) fn safe_prefix(value: &str, n: usize) -> String {
    let prefix: String = value.chars().take(n).collect();
    format!("{prefix}...")
}
