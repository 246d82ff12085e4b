//! In-memory bucket index: tokens, bucket state, and the digest
//! peers compare during reconciliation.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use xxhash_rust::xxh32::Xxh32;

use secmsg_protocol::SMSG_BUCKET_LEN;

/// Seed of the bucket digest. Wire-fixed: both sides of an inventory
/// exchange must produce identical digests for identical token sets.
const BUCKET_HASH_SEED: u32 = 1;

/// Returns the start of the bucket containing `timestamp`.
pub fn bucket_start(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(SMSG_BUCKET_LEN)
}

// ---------------------------------------------------------------------------
// BucketToken
// ---------------------------------------------------------------------------

/// Compact identifier of one stored message.
///
/// Identity is `(timestamp, sample)`; `offset` records where the
/// envelope sits in the bucket file and is ignored by comparison, so
/// a token received from a peer finds the locally stored one.
#[derive(Clone, Copy, Debug)]
pub struct BucketToken {
    /// Envelope timestamp, unix seconds.
    pub timestamp: i64,
    /// First eight bytes of the ciphertext payload.
    pub sample: [u8; 8],
    /// Byte offset of the envelope in its bucket file.
    pub offset: u64,
}

impl BucketToken {
    /// Builds a token for identity lookups; the offset is irrelevant.
    pub fn probe(timestamp: i64, sample: [u8; 8]) -> Self {
        Self {
            timestamp,
            sample,
            offset: 0,
        }
    }
}

impl PartialEq for BucketToken {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.sample == other.sample
    }
}

impl Eq for BucketToken {}

impl PartialOrd for BucketToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BucketToken {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, self.sample).cmp(&(other.timestamp, other.sample))
    }
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// One time window of messages plus its reconciliation state.
#[derive(Clone, Debug, Default)]
pub struct Bucket {
    /// Last time the bucket's peer-visible state changed; drives the
    /// inventory filter.
    pub time_changed: i64,
    /// XXH32 digest over the samples of all tokens, ascending.
    pub hash: u32,
    /// Remaining GC ticks before a transfer lock expires.
    pub lock_count: u32,
    /// Locally assigned id of the peer holding the lock.
    pub lock_peer_id: u32,
    /// Sorted token set.
    pub tokens: BTreeSet<BucketToken>,
}

impl Bucket {
    /// Inserts a token; returns `false` if a token with the same
    /// identity is already present.
    pub fn insert_token(&mut self, token: BucketToken) -> bool {
        self.tokens.insert(token)
    }

    /// Number of messages in the bucket.
    pub fn count(&self) -> u32 {
        self.tokens.len() as u32
    }

    /// Recomputes the digest and stamps `time_changed`.
    ///
    /// The digest only depends on the token multiset: iteration over
    /// the sorted set is deterministic, so any two peers holding the
    /// same messages agree on it regardless of insertion order.
    pub fn rehash(&mut self, now: i64) {
        self.time_changed = now;

        let mut state = Xxh32::new(BUCKET_HASH_SEED);
        for token in &self.tokens {
            state.update(&token.sample);
        }
        self.hash = state.digest();

        tracing::debug!(messages = self.tokens.len(), hash = self.hash, "hashed bucket");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn token(ts: i64, sample_seed: u8, offset: u64) -> BucketToken {
        BucketToken {
            timestamp: ts,
            sample: [sample_seed; 8],
            offset,
        }
    }

    #[test]
    fn bucket_start_floors_to_window() {
        assert_eq!(bucket_start(0), 0);
        assert_eq!(bucket_start(SMSG_BUCKET_LEN - 1), 0);
        assert_eq!(bucket_start(SMSG_BUCKET_LEN), SMSG_BUCKET_LEN);
        assert_eq!(bucket_start(SMSG_BUCKET_LEN * 3 + 17), SMSG_BUCKET_LEN * 3);
    }

    #[test]
    fn token_identity_ignores_offset() {
        let a = token(100, 1, 0);
        let b = token(100, 1, 999);
        assert_eq!(a, b);

        let mut bucket = Bucket::default();
        assert!(bucket.insert_token(a));
        assert!(!bucket.insert_token(b));
        assert_eq!(bucket.count(), 1);
        // The stored offset is the first writer's.
        assert_eq!(bucket.tokens.get(&b).map(|t| t.offset), Some(0));
    }

    #[test]
    fn tokens_order_by_timestamp_then_sample() {
        let mut bucket = Bucket::default();
        bucket.insert_token(token(200, 1, 0));
        bucket.insert_token(token(100, 9, 0));
        bucket.insert_token(token(100, 2, 0));

        let order: Vec<i64> = bucket.tokens.iter().map(|t| t.timestamp).collect();
        assert_eq!(order, vec![100, 100, 200]);
        let samples: Vec<u8> = bucket.tokens.iter().map(|t| t.sample[0]).collect();
        assert_eq!(samples, vec![2, 9, 1]);
    }

    #[test]
    fn rehash_is_insertion_order_independent() {
        let mut forward = Bucket::default();
        let mut reverse = Bucket::default();
        for seed in 0..20u8 {
            forward.insert_token(token(1_000 + seed as i64, seed, seed as u64));
        }
        for seed in (0..20u8).rev() {
            reverse.insert_token(token(1_000 + seed as i64, seed, 0));
        }

        forward.rehash(11);
        reverse.rehash(22);
        assert_eq!(forward.hash, reverse.hash);
    }

    #[test]
    fn rehash_changes_with_content() {
        let mut bucket = Bucket::default();
        bucket.insert_token(token(100, 1, 0));
        bucket.rehash(1);
        let before = bucket.hash;

        bucket.insert_token(token(101, 2, 0));
        bucket.rehash(2);
        assert_ne!(bucket.hash, before);
        assert_eq!(bucket.time_changed, 2);
    }

    #[test]
    fn empty_bucket_hash_is_stable() {
        let mut a = Bucket::default();
        let mut b = Bucket::default();
        a.rehash(1);
        b.rehash(2);
        assert_eq!(a.hash, b.hash);
    }
}
