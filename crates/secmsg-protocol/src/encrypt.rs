//! The ECIES encryption pipeline: building and opening envelopes.
//!
//! Hybrid scheme over secp256k1, in the style of bitmessage:
//!
//! 1. Ephemeral keypair `(r, R)`; shared secret `P = X(r·K)` with the
//!    recipient key `K`.
//! 2. `SHA512(P)` splits into `key_e` (AES) and `key_m` (MAC).
//! 3. Plaintexts over 128 bytes are LZ4-compressed.
//! 4. The inner payload is either signed (`version ∥ key_id ∥
//!    compact_sig ∥ plain_len ∥ body`) or anonymous
//!    (`0xFA ∥ reserved ∥ plain_len ∥ body`); the lead byte
//!    disambiguates.
//! 5. AES-256-CBC under `key_e` and a fresh IV; HMAC-SHA256 under
//!    `key_m` over `timestamp ∥ dest_hash ∥ ciphertext`.
//!
//! Opening mirrors the steps. The MAC is checked first: a mismatch is
//! the *normal* outcome when probing a message against an address it
//! was not sent to, and surfaces as the quiet
//! [`SmsgError::MacMismatch`].

use rand::rngs::OsRng;
use rand::RngCore;

use secmsg_crypto::aes::Crypter;
use secmsg_crypto::ecdh::{ecdh_shared_x, generate_ephemeral_keypair};
use secmsg_crypto::hash::{pubkey_key_id, sha256d, sha512};
use secmsg_crypto::mac::{hmac_sha256_parts, verify_hmac_sha256_parts};
use secmsg_crypto::signing::{recover_compact, sign_compact, COMPACT_SIG_LEN};
use secmsg_crypto::{PublicKey, SecretKey};
use secmsg_types::{Address, KeyId, Result, SmsgError, ANON_SENDER};

use crate::constants::{
    SMSG_ANON_BYTE, SMSG_ANON_HDR_LEN, SMSG_MAX_MSG_BYTES, SMSG_PL_HDR_LEN,
};
use crate::envelope::{MessageHeader, SecureMessage};

/// Plaintexts longer than this are LZ4-compressed before encryption.
const COMPRESS_THRESHOLD: usize = 128;

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// The identity an envelope is sent under.
pub enum Sender {
    /// No sender information; the payload carries the anonymous form.
    Anonymous,
    /// Signed form: the payload proves ownership of `address` with a
    /// recoverable signature from `secret`.
    Keyed {
        /// Sender wallet address (its key id rides in the payload).
        address: Address,
        /// Private key matching `address`.
        secret: SecretKey,
    },
}

// ---------------------------------------------------------------------------
// MessageData
// ---------------------------------------------------------------------------

/// A successfully opened envelope.
#[derive(Clone, Debug)]
pub struct MessageData {
    /// Envelope timestamp, unix seconds.
    pub timestamp: i64,
    /// Sender address string, or `"anon"` for the anonymous form.
    pub from_address: String,
    /// The decrypted plaintext.
    pub plaintext: Vec<u8>,
    /// Sender key recovered from the compact signature, for insertion
    /// into the public-key directory. `None` for anonymous messages.
    pub sender_pubkey: Option<(KeyId, PublicKey)>,
}

// ---------------------------------------------------------------------------
// Encrypt
// ---------------------------------------------------------------------------

/// Builds an envelope for `plaintext` encrypted to `dest_pubkey`.
///
/// The proof-of-work fields (`hash`, `nonse`) are left zeroed; the
/// admission gate fills them before the envelope enters the store.
pub fn encrypt(
    from: &Sender,
    dest_pubkey: &PublicKey,
    plaintext: &[u8],
    now: i64,
) -> Result<SecureMessage> {
    if plaintext.len() > SMSG_MAX_MSG_BYTES {
        return Err(SmsgError::BadArgument {
            reason: format!(
                "message of {} bytes exceeds the {SMSG_MAX_MSG_BYTES} byte limit",
                plaintext.len()
            ),
        });
    }

    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);

    let (ephemeral_secret, ephemeral_public) = generate_ephemeral_keypair();
    let shared = ecdh_shared_x(dest_pubkey, &ephemeral_secret)?;
    let split = sha512(shared.as_bytes());
    let mut key_e = [0u8; 32];
    key_e.copy_from_slice(&split[..32]);
    let key_m = &split[32..];

    // Compression only pays off past the threshold; short messages go raw.
    let plain_len = plaintext.len() as u32;
    let body: Vec<u8>;
    let body_ref: &[u8] = if plaintext.len() > COMPRESS_THRESHOLD {
        body = lz4_flex::block::compress(plaintext);
        if body.is_empty() {
            return Err(SmsgError::CompressionFailed {
                reason: "LZ4 produced no output".into(),
            });
        }
        &body
    } else {
        plaintext
    };

    let inner = match from {
        Sender::Anonymous => {
            let mut payload = Vec::with_capacity(SMSG_ANON_HDR_LEN + body_ref.len());
            payload.push(SMSG_ANON_BYTE);
            // Reserved bytes keep the encrypted payload above the
            // 8-byte sample size even for empty bodies.
            payload.extend_from_slice(&[0u8; 4]);
            payload.extend_from_slice(&plain_len.to_le_bytes());
            payload.extend_from_slice(body_ref);
            payload
        }
        Sender::Keyed { address, secret } => {
            // The recoverable signature over the plaintext digest both
            // proves ownership of the from-address and hands the
            // recipient the sender key, so a reply is always possible.
            let signature = sign_compact(&sha256d(plaintext), secret)?;

            let mut payload = Vec::with_capacity(SMSG_PL_HDR_LEN + body_ref.len());
            payload.push(address.version());
            payload.extend_from_slice(address.key_id().as_bytes());
            payload.extend_from_slice(&signature);
            payload.extend_from_slice(&plain_len.to_le_bytes());
            payload.extend_from_slice(body_ref);
            payload
        }
    };

    let ciphertext = Crypter::new(key_e, iv).encrypt(&inner)?;

    let dest_hash = [0u8; 20];
    let mac = hmac_sha256_parts(
        key_m,
        &[&now.to_le_bytes(), &dest_hash, &ciphertext],
    )?;

    Ok(SecureMessage {
        header: MessageHeader {
            hash: [0; 4],
            version: 1,
            timestamp: now,
            iv,
            cpk_r: ephemeral_public.serialize(),
            dest_hash,
            mac,
            nonse: [0; 4],
            n_payload: ciphertext.len() as u32,
        },
        payload: ciphertext,
    })
}

// ---------------------------------------------------------------------------
// Decrypt
// ---------------------------------------------------------------------------

/// Opens an envelope with the recipient key `secret`.
///
/// With `test_only` the function stops after the MAC check and
/// returns `Ok(None)` — enough to decide whether the message belongs
/// to this key without paying for decryption.
pub fn decrypt(
    test_only: bool,
    secret: &SecretKey,
    header: &MessageHeader,
    payload: &[u8],
) -> Result<Option<MessageData>> {
    if header.version != 1 {
        return Err(SmsgError::InvalidVersion {
            version: header.version,
        });
    }

    let ephemeral_public =
        PublicKey::from_slice(&header.cpk_r).map_err(|e| SmsgError::CryptoFailed {
            reason: format!("invalid ephemeral point in envelope: {e}"),
        })?;

    let shared = ecdh_shared_x(&ephemeral_public, secret)?;
    let split = sha512(shared.as_bytes());
    let mut key_e = [0u8; 32];
    key_e.copy_from_slice(&split[..32]);
    let key_m = &split[32..];

    // MAC first. A mismatch just means the message is for someone else.
    verify_hmac_sha256_parts(
        key_m,
        &[&header.timestamp.to_le_bytes(), &header.dest_hash, payload],
        &header.mac,
    )?;

    if test_only {
        return Ok(None);
    }

    let inner = Crypter::new(key_e, header.iv).decrypt(payload)?;
    if inner.is_empty() {
        return Err(SmsgError::CryptoFailed {
            reason: "decrypted payload is empty".into(),
        });
    }

    let anonymous = inner[0] == SMSG_ANON_BYTE;
    let header_len = if anonymous { SMSG_ANON_HDR_LEN } else { SMSG_PL_HDR_LEN };
    if inner.len() < header_len {
        return Err(SmsgError::CryptoFailed {
            reason: format!(
                "inner payload of {} bytes is shorter than its {header_len} byte header",
                inner.len()
            ),
        });
    }

    let mut plain_len_bytes = [0u8; 4];
    plain_len_bytes.copy_from_slice(&inner[header_len - 4..header_len]);
    let plain_len = u32::from_le_bytes(plain_len_bytes) as usize;
    if plain_len > SMSG_MAX_MSG_BYTES {
        return Err(SmsgError::PayloadTooLarge {
            n_payload: plain_len as u32,
        });
    }

    let body = &inner[header_len..];
    let plaintext = if plain_len > COMPRESS_THRESHOLD {
        let out = lz4_flex::block::decompress(body, plain_len).map_err(|e| {
            SmsgError::CompressionFailed {
                reason: format!("LZ4 decompression failed: {e}"),
            }
        })?;
        if out.len() != plain_len {
            return Err(SmsgError::CompressionFailed {
                reason: format!("decompressed {} bytes, expected {plain_len}", out.len()),
            });
        }
        out
    } else {
        if body.len() < plain_len {
            return Err(SmsgError::CryptoFailed {
                reason: format!(
                    "inner payload carries {} body bytes, declares {plain_len}",
                    body.len()
                ),
            });
        }
        body[..plain_len].to_vec()
    };

    if anonymous {
        return Ok(Some(MessageData {
            timestamp: header.timestamp,
            from_address: ANON_SENDER.to_string(),
            plaintext,
            sender_pubkey: None,
        }));
    }

    // Signed form: recover the sender key and require it to hash to
    // the carried key id.
    let mut carried_key_id = [0u8; 20];
    carried_key_id.copy_from_slice(&inner[1..21]);
    let carried_key_id = KeyId::new(carried_key_id);

    let mut signature = [0u8; COMPACT_SIG_LEN];
    signature.copy_from_slice(&inner[21..21 + COMPACT_SIG_LEN]);

    let sender_pubkey = recover_compact(&sha256d(&plaintext), &signature)?;
    let recovered_key_id = pubkey_key_id(&sender_pubkey);
    if recovered_key_id != carried_key_id {
        return Err(SmsgError::CryptoFailed {
            reason: "signature does not recover to the claimed sender".into(),
        });
    }

    let from_address = Address::new(inner[0], carried_key_id).to_string();

    Ok(Some(MessageData {
        timestamp: header.timestamp,
        from_address,
        plaintext,
        sender_pubkey: Some((carried_key_id, sender_pubkey)),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
