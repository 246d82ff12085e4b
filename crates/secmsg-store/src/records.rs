//! Record types and keys for the key-value stores.
//!
//! Message records are keyed by `timestamp_le(8) ∥ sample(8)` — the
//! same identity a [`crate::bucket::BucketToken`] carries, so inbox
//! and store entries for one envelope always agree. Values are CBOR.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use secmsg_types::{Result, SmsgError};

/// Length of a message record key.
pub const MESSAGE_KEY_LEN: usize = 16;

/// Builds the 16-byte record key for an envelope.
pub fn message_key(timestamp: i64, sample: &[u8; 8]) -> [u8; MESSAGE_KEY_LEN] {
    let mut key = [0u8; MESSAGE_KEY_LEN];
    key[..8].copy_from_slice(&timestamp.to_le_bytes());
    key[8..].copy_from_slice(sample);
    key
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A received message held in the inbox. Carries the raw envelope;
/// plaintext is produced at read time so an encrypted wallet does not
/// block receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboxRecord {
    /// When this node received the message, unix seconds.
    pub time_received: i64,
    /// The owned address the message decrypted against.
    pub addr_to: String,
    /// Raw envelope bytes (header ∥ payload).
    pub message: Vec<u8>,
}

/// A sent message copy, used by both the outbox and the send queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// When the message was queued, unix seconds.
    pub time_received: i64,
    /// Destination address.
    pub addr_to: String,
    /// Owned address the outbox copy is encrypted to; `None` for
    /// send-queue entries.
    pub addr_outbox: Option<String>,
    /// Raw envelope bytes (header ∥ payload).
    pub message: Vec<u8>,
}

// ---------------------------------------------------------------------------
// CBOR codec
// ---------------------------------------------------------------------------

pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| SmsgError::StorageError {
        reason: format!("record encode failed: {e}"),
    })?;
    Ok(buf)
}

pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| SmsgError::StorageError {
        reason: format!("record decode failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
