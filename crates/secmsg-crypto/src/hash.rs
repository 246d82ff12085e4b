//! Digest helpers: SHA-256, double SHA-256, SHA-512, and key-id
//! derivation.

use ripemd::Ripemd160;
use secmsg_types::KeyId;
use sha2::{Digest, Sha256, Sha512};

use crate::PublicKey;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256 (`SHA256(SHA256(data))`), the digest signed by
/// compact message signatures.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// SHA-512 of `data`. Used to split an ECDH shared secret into the
/// encryption and MAC keys.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// Derives the 20-byte key id of a compressed public key:
/// `RIPEMD160(SHA256(serialized_pubkey))`.
pub fn pubkey_key_id(pubkey: &PublicKey) -> KeyId {
    let sha = Sha256::digest(pubkey.serialize());
    let ripe = Ripemd160::digest(sha);
    let mut id = [0u8; 20];
    id.copy_from_slice(&ripe);
    KeyId::new(id)
}
