//! HMAC-SHA256 message authentication.
//!
//! Both the envelope MAC and the proof-of-work admission hash are
//! HMAC-SHA256 over several non-contiguous inputs, so the helpers
//! take part lists instead of forcing callers to concatenate.

use hmac::{Hmac, Mac};
use secmsg_types::{Result, SmsgError};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed output length of HMAC-SHA256 in bytes.
pub const HMAC_SHA256_LEN: usize = 32;

/// Computes HMAC-SHA256 over the concatenation of `parts` using `key`.
pub fn hmac_sha256_parts(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| SmsgError::CryptoFailed {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    for part in parts {
        mac.update(part);
    }
    let result = mac.finalize().into_bytes();

    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    Ok(output)
}

/// Computes HMAC-SHA256 over a single buffer.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    hmac_sha256_parts(key, &[data])
}

/// Verifies an HMAC-SHA256 tag in constant time.
///
/// The error is [`SmsgError::MacMismatch`] — the quiet signal that a
/// message is not addressed to the key under test.
pub fn verify_hmac_sha256_parts(key: &[u8], parts: &[&[u8]], expected: &[u8; 32]) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| SmsgError::CryptoFailed {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected).map_err(|_| SmsgError::MacMismatch)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
