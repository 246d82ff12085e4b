//! Core shared types for the secmsg encrypted messaging subsystem.
//!
//! This crate defines the types used across the workspace: the central
//! error enum, key identifiers, wallet addresses, and the runtime
//! configuration. No other crate should define shared types —
//! everything lives here.

pub mod base58;
pub mod config;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::base58::{base58check_decode, base58check_encode};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Version byte prepended to key hashes when forming base58check
/// addresses. A deployment constant: every peer on a network must
/// agree on it, since the byte travels inside signed message payloads.
pub const ADDRESS_VERSION: u8 = 0x1c;

/// The sender sentinel selecting the anonymous envelope form.
pub const ANON_SENDER: &str = "anon";

// ---------------------------------------------------------------------------
// KeyId
// ---------------------------------------------------------------------------

/// 20-byte key identifier: `RIPEMD160(SHA256(compressed_pubkey))`.
///
/// Identifies a wallet key in the public-key directory and inside
/// signed message payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct KeyId([u8; 20]);

impl KeyId {
    /// The fixed byte length of a key id.
    pub const LEN: usize = 20;

    /// Creates a new `KeyId` from raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for KeyId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for KeyId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Wallet address: a version byte plus a [`KeyId`], rendered as a
/// base58check string (`version ∥ key_id ∥ SHA256d-checksum[..4]`).
///
/// The address is the routing identity of the messaging system —
/// messages are encrypted *to* an address and signed *from* one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Address {
    version: u8,
    key_id: KeyId,
}

impl Address {
    /// Creates an address with an explicit version byte.
    pub fn new(version: u8, key_id: KeyId) -> Self {
        Self { version, key_id }
    }

    /// Creates an address with the network default version byte.
    pub fn from_key_id(key_id: KeyId) -> Self {
        Self {
            version: ADDRESS_VERSION,
            key_id,
        }
    }

    /// Returns the version byte.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the key identifier.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = [0u8; 21];
        payload[0] = self.version;
        payload[1..].copy_from_slice(self.key_id.as_bytes());
        write!(f, "{}", base58check_encode(&payload))
    }
}

impl FromStr for Address {
    type Err = SmsgError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let payload = base58check_decode(s).ok_or_else(|| SmsgError::BadArgument {
            reason: format!("invalid address encoding: {s}"),
        })?;
        if payload.len() != 21 {
            return Err(SmsgError::BadArgument {
                reason: format!("address payload must be 21 bytes, got {}", payload.len()),
            });
        }
        let mut key_id = [0u8; 20];
        key_id.copy_from_slice(&payload[1..]);
        Ok(Self {
            version: payload[0],
            key_id: KeyId::new(key_id),
        })
    }
}

// ---------------------------------------------------------------------------
// SmsgError
// ---------------------------------------------------------------------------

/// Central error type for the secmsg subsystem.
///
/// All crates in the workspace convert their internal errors into
/// variants of this enum. The variants mirror what callers can
/// meaningfully observe; peer misbehavior is never surfaced here —
/// it is raised into the host overlay's scoring interface instead.
#[derive(Debug, Error)]
pub enum SmsgError {
    /// An argument is invalid: malformed address, missing key, or a
    /// message exceeding the plaintext bound.
    #[error("bad argument: {reason}")]
    BadArgument {
        /// Description of the rejected argument.
        reason: String,
    },

    /// No public key is available for the destination address, in
    /// either the directory or the wallet.
    #[error("no public key known for address {address}")]
    UnknownRecipient {
        /// The unresolvable destination address.
        address: String,
    },

    /// A cryptographic primitive failed (ECDH, HMAC, AES, signature).
    #[error("crypto operation failed: {reason}")]
    CryptoFailed {
        /// Description of the failed primitive.
        reason: String,
    },

    /// The envelope MAC does not match. This is the normal signal
    /// that a message is not addressed to the tested key — callers
    /// probing addresses treat it quietly, not as a fault.
    #[error("message authentication code mismatch")]
    MacMismatch,

    /// LZ4 compression or decompression was rejected.
    #[error("compression failed: {reason}")]
    CompressionFailed {
        /// Description of the compression failure.
        reason: String,
    },

    /// The proof-of-work nonce space was exhausted without a match.
    #[error("proof-of-work search exhausted the nonce space")]
    PowNotFound,

    /// The proof-of-work search observed the shutdown flag and stopped.
    #[error("proof-of-work search aborted by shutdown")]
    PowAborted,

    /// The envelope carries an unsupported version byte.
    #[error("unsupported envelope version {version}")]
    InvalidVersion {
        /// The version byte found in the header.
        version: u8,
    },

    /// The payload length exceeds the worst-case envelope bound.
    #[error("payload of {n_payload} bytes exceeds the envelope bound")]
    PayloadTooLarge {
        /// The declared payload length.
        n_payload: u32,
    },

    /// The admission hash fails the proof-of-work bit test.
    #[error("envelope fails the proof-of-work test")]
    InvalidPow,

    /// The header checksum does not match the recomputed admission hash.
    #[error("envelope checksum mismatch")]
    ChecksumMismatch,

    /// The message is already present in the bucket or inbox.
    #[error("message already present")]
    Duplicate,

    /// A filesystem operation on the bucket store failed.
    #[error("i/o error: {reason}")]
    IoError {
        /// Description of the underlying failure.
        reason: String,
    },

    /// A key-value store operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Description of the underlying failure.
        reason: String,
    },

    /// A wire payload is malformed or too short to decode.
    #[error("wire format error: {reason}")]
    WireError {
        /// Description of the decode failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of the configuration problem.
        reason: String,
    },
}

/// Convenience result type using [`SmsgError`].
pub type Result<T> = std::result::Result<T, SmsgError>;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Current unix time in seconds.
///
/// All protocol timestamps are i64 unix seconds; buckets, retention,
/// and the proof-of-work leeway checks all run off this clock.
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_display_is_hex() {
        let id = KeyId::new([0xAB; 20]);
        assert_eq!(id.to_string(), "ab".repeat(20));
    }

    #[test]
    fn address_roundtrip() -> Result<()> {
        let addr = Address::from_key_id(KeyId::new([0x42; 20]));
        let s = addr.to_string();
        let parsed: Address = s.parse()?;
        assert_eq!(addr, parsed);
        assert_eq!(parsed.version(), ADDRESS_VERSION);
        Ok(())
    }

    #[test]
    fn address_rejects_garbage() {
        let result: std::result::Result<Address, _> = "not-an-address".parse();
        assert!(result.is_err());
    }

    #[test]
    fn address_rejects_corrupted_checksum() {
        let addr = Address::from_key_id(KeyId::new([0x42; 20]));
        let mut s = addr.to_string();
        // Swap the last character for a different alphabet member.
        let last = s.pop().expect("non-empty");
        s.push(if last == '2' { '3' } else { '2' });
        let result: std::result::Result<Address, _> = s.parse();
        assert!(result.is_err());
    }

    #[test]
    fn distinct_key_ids_distinct_addresses() {
        let a = Address::from_key_id(KeyId::new([0x01; 20]));
        let b = Address::from_key_id(KeyId::new([0x02; 20]));
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn address_serde_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let addr = Address::from_key_id(KeyId::new([0x11; 20]));
        let json = serde_json::to_string(&addr)?;
        let parsed: Address = serde_json::from_str(&json)?;
        assert_eq!(addr, parsed);
        Ok(())
    }

    #[test]
    fn error_display() {
        let err = SmsgError::BadArgument {
            reason: "message too long".into(),
        };
        assert!(err.to_string().contains("message too long"));
    }

    #[test]
    fn unix_time_is_recent() {
        // 2020-01-01 as a sanity floor.
        assert!(unix_time() > 1_577_836_800);
    }
}
