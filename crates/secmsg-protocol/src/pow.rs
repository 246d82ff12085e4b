//! Proof-of-work admission gate.
//!
//! Every envelope must carry a nonce whose admission hash
//!
//! ```text
//! civ = nonse repeated 8 times                     (32-byte key)
//! H   = HMAC-SHA256(civ, header[4..122] ∥ payload ∥ payload)
//! ```
//!
//! satisfies `H[31] == 0 && H[30] == 0 && (!H[29] & 1) != 0`. Only
//! the low bit of byte 29 participates in the third clause, and the
//! payload enters the HMAC twice; both quirks are wire-fixed — every
//! deployed peer verifies this exact composition, so a mathematically
//! tidier rule would partition the network.
//!
//! On success the first four bytes of `H` become the header checksum.

use std::sync::atomic::{AtomicBool, Ordering};

use secmsg_crypto::mac::hmac_sha256_parts;
use secmsg_types::{Result, SmsgError};

use crate::constants::{SMSG_HDR_LEN, SMSG_MAX_MSG_WORST};
use crate::envelope::{MessageHeader, NONSE_OFFSET};

/// Expands a 4-byte nonce into the 32-byte HMAC key.
fn nonse_key(nonse: [u8; 4]) -> [u8; 32] {
    let mut key = [0u8; 32];
    for chunk in key.chunks_exact_mut(4) {
        chunk.copy_from_slice(&nonse);
    }
    key
}

/// Computes the admission hash for a serialized header and payload.
fn admission_hash(header_bytes: &[u8; SMSG_HDR_LEN], payload: &[u8]) -> Result<[u8; 32]> {
    let mut nonse = [0u8; 4];
    nonse.copy_from_slice(&header_bytes[NONSE_OFFSET..NONSE_OFFSET + 4]);
    let key = nonse_key(nonse);
    hmac_sha256_parts(&key, &[&header_bytes[4..], payload, payload])
}

/// The acceptance test over an admission hash.
fn hash_accepted(hash: &[u8; 32]) -> bool {
    // The third clause masks only bit 0 of byte 29; peers verify this
    // exact rule.
    hash[31] == 0 && hash[30] == 0 && (!hash[29] & 1) != 0
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Searches the 32-bit nonce space for an admissible hash and writes
/// the winning `nonse` and checksum into `header`.
///
/// CPU-bound: expect on the order of 2^17 HMAC evaluations. The
/// send-queue worker runs this off the caller's thread; `keep_running`
/// is observed every iteration so shutdown is prompt.
///
/// # Errors
///
/// - [`SmsgError::PowAborted`] when `keep_running` turns false.
/// - [`SmsgError::PowNotFound`] when the counter space is exhausted.
pub fn set_hash(
    header: &mut MessageHeader,
    payload: &[u8],
    keep_running: &AtomicBool,
) -> Result<()> {
    let mut buf = header.to_bytes();
    let mut nonse: u32 = 0;

    loop {
        if !keep_running.load(Ordering::Relaxed) {
            return Err(SmsgError::PowAborted);
        }

        buf[NONSE_OFFSET..NONSE_OFFSET + 4].copy_from_slice(&nonse.to_le_bytes());
        let hash = admission_hash(&buf, payload)?;

        if hash_accepted(&hash) {
            header.nonse = nonse.to_le_bytes();
            header.hash.copy_from_slice(&hash[..4]);
            return Ok(());
        }

        if nonse == u32::MAX {
            return Err(SmsgError::PowNotFound);
        }
        nonse += 1;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validates an envelope: version, payload bound, proof-of-work, and
/// checksum, in that order.
///
/// A checksum mismatch is reported even when the bit test also fails,
/// so callers can score the two conditions differently.
///
/// # Errors
///
/// - [`SmsgError::InvalidVersion`]
/// - [`SmsgError::PayloadTooLarge`]
/// - [`SmsgError::ChecksumMismatch`]
/// - [`SmsgError::InvalidPow`]
pub fn validate(header: &MessageHeader, payload: &[u8]) -> Result<()> {
    if header.version != 1 {
        return Err(SmsgError::InvalidVersion {
            version: header.version,
        });
    }

    if header.n_payload > SMSG_MAX_MSG_WORST {
        return Err(SmsgError::PayloadTooLarge {
            n_payload: header.n_payload,
        });
    }

    let buf = header.to_bytes();
    let hash = admission_hash(&buf, payload)?;

    if hash[..4] != header.hash {
        return Err(SmsgError::ChecksumMismatch);
    }
    if !hash_accepted(&hash) {
        return Err(SmsgError::InvalidPow);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
