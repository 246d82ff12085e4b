//! secp256k1 Diffie-Hellman key agreement.
//!
//! Each envelope carries a fresh compressed ephemeral point `R`; the
//! shared secret is the X coordinate of `k·R` (equivalently `r·K`),
//! fed raw into SHA-512 for the key split. The raw-X convention is
//! wire-fixed — the hashed variants some libraries default to would
//! not interoperate.

use rand::rngs::OsRng;
use secmsg_types::{Result, SmsgError};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{PublicKey, SecretKey};

/// Length of the shared secret (curve X coordinate) in bytes.
pub const SHARED_SECRET_LEN: usize = 32;

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Shared secret derived from a secp256k1 Diffie-Hellman exchange.
///
/// Zeroized on drop. Feed to SHA-512 and split; never use directly as
/// a cipher key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    /// Returns the raw 32-byte X coordinate.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

// SharedSecret does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Key agreement
// ---------------------------------------------------------------------------

/// Generates a fresh ephemeral keypair from OS entropy.
pub fn generate_ephemeral_keypair() -> (SecretKey, PublicKey) {
    let secp = secp256k1::Secp256k1::new();
    secp.generate_keypair(&mut OsRng)
}

/// Computes the shared secret between `secret` and `point`, taking
/// the X coordinate of the resulting curve point.
pub fn ecdh_shared_x(point: &PublicKey, secret: &SecretKey) -> Result<SharedSecret> {
    // shared_secret_point yields the full 64-byte (x ∥ y) affine point.
    let full = secp256k1::ecdh::shared_secret_point(point, secret);
    if full.len() != 64 {
        return Err(SmsgError::CryptoFailed {
            reason: format!("ECDH produced {} bytes, expected 64", full.len()),
        });
    }
    let mut x = [0u8; SHARED_SECRET_LEN];
    x.copy_from_slice(&full[..SHARED_SECRET_LEN]);
    Ok(SharedSecret(x))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_matches_both_directions() -> Result<()> {
        let (sk_a, pk_a) = generate_ephemeral_keypair();
        let (sk_b, pk_b) = generate_ephemeral_keypair();

        let ab = ecdh_shared_x(&pk_b, &sk_a)?;
        let ba = ecdh_shared_x(&pk_a, &sk_b)?;
        assert_eq!(ab.as_bytes(), ba.as_bytes());
        Ok(())
    }

    #[test]
    fn different_peers_different_secrets() -> Result<()> {
        let (sk_a, _) = generate_ephemeral_keypair();
        let (sk_b, _) = generate_ephemeral_keypair();
        let (_, pk_c) = generate_ephemeral_keypair();

        let ac = ecdh_shared_x(&pk_c, &sk_a)?;
        let bc = ecdh_shared_x(&pk_c, &sk_b)?;
        assert_ne!(ac.as_bytes(), bc.as_bytes());
        Ok(())
    }

    #[test]
    fn ephemeral_keys_are_unique() {
        let (_, pk_1) = generate_ephemeral_keypair();
        let (_, pk_2) = generate_ephemeral_keypair();
        assert_ne!(pk_1.serialize(), pk_2.serialize());
    }

    #[test]
    fn compressed_point_is_33_bytes() {
        let (_, pk) = generate_ephemeral_keypair();
        let serialized = pk.serialize();
        assert_eq!(serialized.len(), 33);
        assert!(serialized[0] == 0x02 || serialized[0] == 0x03);
    }
}
