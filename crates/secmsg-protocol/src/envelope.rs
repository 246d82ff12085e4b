//! The `SecureMessage` envelope: fixed 122-byte header followed by
//! the ciphertext payload.
//!
//! Byte layout (all integers little-endian, no padding):
//!
//! ```text
//! offset  len  field
//! 0       4    hash       proof-of-work checksum
//! 4       1    version    envelope version (1)
//! 5       8    timestamp  i64 unix seconds
//! 13      16   iv         AES-CBC initialisation vector
//! 29      33   cpk_r      compressed ephemeral secp256k1 point
//! 62      20   dest_hash  reserved, transmitted as zeros
//! 82      32   mac        HMAC-SHA256 over ts ∥ dest_hash ∥ payload
//! 114     4    nonse      proof-of-work counter
//! 118     4    n_payload  payload length
//! ```

use secmsg_types::{Result, SmsgError};

use crate::constants::SMSG_HDR_LEN;

/// Byte offset of the `nonse` field inside a serialized header.
pub const NONSE_OFFSET: usize = 114;

/// Byte offset of the `hash` field inside a serialized header.
pub const HASH_OFFSET: usize = 0;

// ---------------------------------------------------------------------------
// MessageHeader
// ---------------------------------------------------------------------------

/// Parsed envelope header. Field order matches the wire layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Proof-of-work checksum: first four bytes of the admission hash.
    pub hash: [u8; 4],
    /// Envelope version; only version 1 exists.
    pub version: u8,
    /// Creation time, unix seconds.
    pub timestamp: i64,
    /// AES-CBC IV, drawn fresh per message.
    pub iv: [u8; 16],
    /// Compressed ephemeral public key `R`.
    pub cpk_r: [u8; 33],
    /// Reserved destination hash; zeros on the wire.
    pub dest_hash: [u8; 20],
    /// HMAC-SHA256 tag binding timestamp, destination, and payload.
    pub mac: [u8; 32],
    /// Proof-of-work nonce (little-endian counter).
    pub nonse: [u8; 4],
    /// Payload (ciphertext) length in bytes.
    pub n_payload: u32,
}

impl MessageHeader {
    /// Serializes the header into its fixed wire layout.
    pub fn to_bytes(&self) -> [u8; SMSG_HDR_LEN] {
        let mut buf = [0u8; SMSG_HDR_LEN];
        buf[0..4].copy_from_slice(&self.hash);
        buf[4] = self.version;
        buf[5..13].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[13..29].copy_from_slice(&self.iv);
        buf[29..62].copy_from_slice(&self.cpk_r);
        buf[62..82].copy_from_slice(&self.dest_hash);
        buf[82..114].copy_from_slice(&self.mac);
        buf[114..118].copy_from_slice(&self.nonse);
        buf[118..122].copy_from_slice(&self.n_payload.to_le_bytes());
        buf
    }

    /// Parses a header from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SMSG_HDR_LEN {
            return Err(SmsgError::WireError {
                reason: format!("header needs {SMSG_HDR_LEN} bytes, got {}", data.len()),
            });
        }

        let mut hash = [0u8; 4];
        hash.copy_from_slice(&data[0..4]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&data[5..13]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&data[13..29]);
        let mut cpk_r = [0u8; 33];
        cpk_r.copy_from_slice(&data[29..62]);
        let mut dest_hash = [0u8; 20];
        dest_hash.copy_from_slice(&data[62..82]);
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&data[82..114]);
        let mut nonse = [0u8; 4];
        nonse.copy_from_slice(&data[114..118]);
        let mut n_payload = [0u8; 4];
        n_payload.copy_from_slice(&data[118..122]);

        Ok(Self {
            hash,
            version: data[4],
            timestamp: i64::from_le_bytes(timestamp),
            iv,
            cpk_r,
            dest_hash,
            mac,
            nonse,
            n_payload: u32::from_le_bytes(n_payload),
        })
    }
}

// ---------------------------------------------------------------------------
// SecureMessage
// ---------------------------------------------------------------------------

/// A complete envelope: header plus ciphertext payload.
///
/// Immutable after construction except for the proof-of-work fields
/// (`hash`, `nonse`), which the admission gate fills in before the
/// envelope enters the store.
#[derive(Clone, Debug)]
pub struct SecureMessage {
    /// Envelope header.
    pub header: MessageHeader,
    /// Ciphertext payload; `header.n_payload` bytes.
    pub payload: Vec<u8>,
}

impl SecureMessage {
    /// Serializes header and payload into one wire/disk buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SMSG_HDR_LEN + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses an envelope from a buffer, requiring the full declared
    /// payload to be present.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = MessageHeader::from_bytes(data)?;
        let total = SMSG_HDR_LEN + header.n_payload as usize;
        if data.len() < total {
            return Err(SmsgError::WireError {
                reason: format!(
                    "envelope declares {} payload bytes but only {} remain",
                    header.n_payload,
                    data.len() - SMSG_HDR_LEN
                ),
            });
        }
        Ok(Self {
            payload: data[SMSG_HDR_LEN..total].to_vec(),
            header,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
