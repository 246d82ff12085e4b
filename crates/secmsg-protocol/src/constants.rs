//! Protocol constants, identical across all peers.
//!
//! These values participate in the wire format or the reconciliation
//! protocol. They are deliberately not configurable: a node compiled
//! with different values would silently diverge from the network.

/// Length of a time bucket in seconds (60-minute windows).
pub const SMSG_BUCKET_LEN: i64 = 60 * 60;

/// How long messages are retained, in seconds (48 hours).
pub const SMSG_RETENTION: i64 = 60 * 60 * 48;

/// Minimum interval between inventory pushes to one peer, in seconds.
pub const SMSG_SEND_DELAY: i64 = 10;

/// Period of the bucket GC / lock ticker thread, in seconds.
pub const SMSG_THREAD_DELAY: u32 = 30;

/// Tolerated clock skew against peer timestamps, in seconds.
pub const SMSG_TIME_LEEWAY: i64 = 24;

/// How long a peer that let a bucket lock expire is ignored, in seconds.
pub const SMSG_TIME_IGNORE: i64 = 10_000;

/// Upper bound on the plaintext of one message, in bytes (≈24 KiB).
pub const SMSG_MAX_MSG_BYTES: usize = 24_000;

/// Serialized header length of a [`crate::MessageHeader`].
pub const SMSG_HDR_LEN: usize = 4 + 1 + 8 + 16 + 33 + 20 + 32 + 4 + 4;

/// Inner payload header of a signed (non-anonymous) message:
/// `version(1) ∥ key_id(20) ∥ compact_sig(65) ∥ plain_len(4)`.
pub const SMSG_PL_HDR_LEN: usize = 1 + 20 + 65 + 4;

/// Inner payload header of an anonymous message:
/// `0xFA ∥ reserved(4) ∥ plain_len(4)`.
pub const SMSG_ANON_HDR_LEN: usize = 1 + 4 + 4;

/// Lead byte selecting the anonymous payload form.
pub const SMSG_ANON_BYTE: u8 = 0xFA;

/// Worst-case LZ4 block output for `n` input bytes.
pub const fn lz4_compress_bound(n: usize) -> usize {
    n + n / 255 + 16
}

/// Worst-case ciphertext payload for a maximum-length plaintext:
/// LZ4 expansion bound, plus the signed payload header, plus one AES
/// block of PKCS#7 padding. Envelopes declaring more are rejected
/// before any cryptography runs.
pub const SMSG_MAX_MSG_WORST: u32 =
    (lz4_compress_bound(SMSG_MAX_MSG_BYTES) + SMSG_PL_HDR_LEN + 16) as u32;

/// Maximum number of envelopes in one `smsgMsg` frame.
pub const SMSG_BUNCH_MAX_MSGS: u32 = 500;

/// Maximum byte size of one `smsgMsg` frame.
pub const SMSG_BUNCH_MAX_BYTES: usize = 96_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_is_122() {
        assert_eq!(SMSG_HDR_LEN, 122);
    }

    #[test]
    fn payload_header_length_is_90() {
        assert_eq!(SMSG_PL_HDR_LEN, 90);
    }

    #[test]
    fn worst_case_covers_max_plaintext() {
        assert!(SMSG_MAX_MSG_WORST as usize > SMSG_MAX_MSG_BYTES);
        assert_eq!(SMSG_MAX_MSG_WORST, 24_216);
    }

    #[test]
    fn retention_is_whole_buckets() {
        assert_eq!(SMSG_RETENTION % SMSG_BUCKET_LEN, 0);
    }
}
