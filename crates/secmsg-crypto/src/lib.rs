//! Cryptographic primitives for the secmsg messaging core.
//!
//! Everything here is a thin, typed wrapper over audited crates:
//! AES-256-CBC for the symmetric layer, HMAC-SHA256 for
//! authentication and the proof-of-work gate, SHA-512 for the ECIES
//! key split, and secp256k1 for key agreement and recoverable
//! signatures. No primitive is hand-rolled.

pub mod aes;
pub mod ecdh;
pub mod hash;
pub mod mac;
pub mod signing;

pub use secp256k1::{PublicKey, SecretKey};
