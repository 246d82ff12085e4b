//! Recoverable compact ECDSA signatures over secp256k1.
//!
//! The 65-byte compact encoding is `header ∥ r ∥ s` where
//! `header = 27 + 4 + recovery_id` (the `+4` marks a compressed
//! public key). A verifier recovers the signer's public key from the
//! signature and digest alone, which is what lets a signed message
//! carry only a 20-byte key id instead of a full key.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::Message;
use secmsg_types::{Result, SmsgError};

use crate::{PublicKey, SecretKey};

/// Length of a compact recoverable signature in bytes.
pub const COMPACT_SIG_LEN: usize = 65;

/// Header base for compact signatures made with a compressed key.
const COMPACT_HEADER_COMPRESSED: u8 = 27 + 4;

/// Signs a 32-byte digest, producing the 65-byte compact encoding.
pub fn sign_compact(digest: &[u8; 32], secret: &SecretKey) -> Result<[u8; COMPACT_SIG_LEN]> {
    let secp = secp256k1::Secp256k1::new();
    let message = Message::from_digest(*digest);
    let signature = secp.sign_ecdsa_recoverable(&message, secret);
    let (recovery_id, data) = signature.serialize_compact();

    let mut out = [0u8; COMPACT_SIG_LEN];
    out[0] = COMPACT_HEADER_COMPRESSED + recovery_id.to_i32() as u8;
    out[1..].copy_from_slice(&data);
    Ok(out)
}

/// Recovers the public key that produced a compact signature over
/// `digest`.
pub fn recover_compact(digest: &[u8; 32], signature: &[u8; COMPACT_SIG_LEN]) -> Result<PublicKey> {
    let header = signature[0];
    if !(27..27 + 8).contains(&header) {
        return Err(SmsgError::CryptoFailed {
            reason: format!("invalid compact signature header byte {header}"),
        });
    }
    let recovery_id =
        RecoveryId::from_i32(((header - 27) & 3) as i32).map_err(|e| SmsgError::CryptoFailed {
            reason: format!("invalid recovery id: {e}"),
        })?;

    let recoverable = RecoverableSignature::from_compact(&signature[1..], recovery_id).map_err(
        |e| SmsgError::CryptoFailed {
            reason: format!("malformed compact signature: {e}"),
        },
    )?;

    let secp = secp256k1::Secp256k1::new();
    let message = Message::from_digest(*digest);
    secp.recover_ecdsa(&message, &recoverable)
        .map_err(|e| SmsgError::CryptoFailed {
            reason: format!("public key recovery failed: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
