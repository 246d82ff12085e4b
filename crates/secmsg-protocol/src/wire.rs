//! Codecs for the `smsg*` overlay commands.
//!
//! All integers little-endian, no padding. Decoders validate lengths
//! before any indexing; a short payload is a [`SmsgError::WireError`]
//! that the protocol handler turns into a misbehavior score.

use secmsg_types::{Result, SmsgError};

use crate::constants::{SMSG_BUNCH_MAX_BYTES, SMSG_BUNCH_MAX_MSGS};

/// Command strings carried on the host overlay.
pub mod commands {
    /// Handshake probe.
    pub const PING: &str = "smsgPing";
    /// Handshake reply; enables the peer for messaging.
    pub const PONG: &str = "smsgPong";
    /// Peer has disabled secure messaging.
    pub const DISABLED: &str = "smsgDisabled";
    /// Peer will ignore this node until the carried time.
    pub const IGNORE: &str = "smsgIgnore";
    /// Peer's buckets matched ours at the carried time.
    pub const MATCH: &str = "smsgMatch";
    /// Bucket inventory: `(bucket, count, hash)` triples.
    pub const INV: &str = "smsgInv";
    /// Request for the token lists of named buckets.
    pub const SHOW: &str = "smsgShow";
    /// Token list of one bucket.
    pub const HAVE: &str = "smsgHave";
    /// Tokens the sender wants from one bucket.
    pub const WANT: &str = "smsgWant";
    /// A bunch of full envelopes for one bucket.
    pub const MSG: &str = "smsgMsg";
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn read_i64(data: &[u8], offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    i64::from_le_bytes(buf)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn short(command: &str, needed: usize, got: usize) -> SmsgError {
    SmsgError::WireError {
        reason: format!("{command}: need {needed} bytes, got {got}"),
    }
}

// ---------------------------------------------------------------------------
// Timestamps (smsgMatch / smsgIgnore)
// ---------------------------------------------------------------------------

/// Encodes a bare i64 time payload.
pub fn encode_time(time: i64) -> Vec<u8> {
    time.to_le_bytes().to_vec()
}

/// Decodes a bare i64 time payload.
pub fn decode_time(data: &[u8]) -> Result<i64> {
    if data.len() < 8 {
        return Err(short("time", 8, data.len()));
    }
    Ok(read_i64(data, 0))
}

// ---------------------------------------------------------------------------
// Inventory (smsgInv)
// ---------------------------------------------------------------------------

/// One bucket line of an inventory: start time, message count, digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvEntry {
    /// Bucket start time.
    pub bucket: i64,
    /// Number of messages the peer holds in this bucket.
    pub count: u32,
    /// The peer's XXH32 bucket digest.
    pub hash: u32,
}

/// Encodes `u32 n ∥ n × (i64 bucket, u32 count, u32 hash)`.
pub fn encode_inv(entries: &[InvEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entries.len() * 16);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.bucket.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());
        out.extend_from_slice(&entry.hash.to_le_bytes());
    }
    out
}

/// Decodes an inventory payload. The claimed entry count is returned
/// alongside the entries so the caller can sanity-bound it.
pub fn decode_inv(data: &[u8]) -> Result<Vec<InvEntry>> {
    if data.len() < 4 {
        return Err(short(commands::INV, 4, data.len()));
    }
    let n = read_u32(data, 0) as usize;
    let needed = 4 + n * 16;
    if data.len() < needed {
        return Err(short(commands::INV, needed, data.len()));
    }

    let mut entries = Vec::with_capacity(n);
    for i in 0..n {
        let base = 4 + i * 16;
        entries.push(InvEntry {
            bucket: read_i64(data, base),
            count: read_u32(data, base + 8),
            hash: read_u32(data, base + 12),
        });
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Bucket lists (smsgShow)
// ---------------------------------------------------------------------------

/// Encodes `u32 n ∥ n × i64 bucket`.
pub fn encode_show(buckets: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + buckets.len() * 8);
    out.extend_from_slice(&(buckets.len() as u32).to_le_bytes());
    for bucket in buckets {
        out.extend_from_slice(&bucket.to_le_bytes());
    }
    out
}

/// Decodes a bucket list payload.
pub fn decode_show(data: &[u8]) -> Result<Vec<i64>> {
    if data.len() < 4 {
        return Err(short(commands::SHOW, 4, data.len()));
    }
    let n = read_u32(data, 0) as usize;
    let needed = 4 + n * 8;
    if data.len() < needed {
        return Err(short(commands::SHOW, needed, data.len()));
    }
    Ok((0..n).map(|i| read_i64(data, 4 + i * 8)).collect())
}

// ---------------------------------------------------------------------------
// Token lists (smsgHave / smsgWant)
// ---------------------------------------------------------------------------

/// Wire form of a token: identity only, no offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenRef {
    /// Message timestamp.
    pub timestamp: i64,
    /// First eight bytes of the ciphertext payload.
    pub sample: [u8; 8],
}

/// Encodes `i64 bucket ∥ k × (i64 timestamp, sample[8])`. Tokens must
/// already be in ascending order; both sides depend on it for the
/// digest comparison to be meaningful.
pub fn encode_token_list(bucket: i64, tokens: &[TokenRef]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + tokens.len() * 16);
    out.extend_from_slice(&bucket.to_le_bytes());
    for token in tokens {
        out.extend_from_slice(&token.timestamp.to_le_bytes());
        out.extend_from_slice(&token.sample);
    }
    out
}

/// Decodes a token list payload. Trailing bytes that do not fill a
/// whole token are ignored.
pub fn decode_token_list(data: &[u8]) -> Result<(i64, Vec<TokenRef>)> {
    if data.len() < 8 {
        return Err(short("token list", 8, data.len()));
    }
    let bucket = read_i64(data, 0);
    let n = (data.len() - 8) / 16;

    let mut tokens = Vec::with_capacity(n);
    for i in 0..n {
        let base = 8 + i * 16;
        let mut sample = [0u8; 8];
        sample.copy_from_slice(&data[base + 8..base + 16]);
        tokens.push(TokenRef {
            timestamp: read_i64(data, base),
            sample,
        });
    }
    Ok((bucket, tokens))
}

// ---------------------------------------------------------------------------
// Envelope bunches (smsgMsg)
// ---------------------------------------------------------------------------

/// Frame header length of a bunch: `u32 count ∥ i64 bucket`.
pub const BUNCH_HDR_LEN: usize = 12;

/// Decodes a bunch frame header, returning the count, bucket, and the
/// concatenated envelope bytes.
pub fn decode_bunch(data: &[u8]) -> Result<(u32, i64, &[u8])> {
    if data.len() < BUNCH_HDR_LEN {
        return Err(short(commands::MSG, BUNCH_HDR_LEN, data.len()));
    }
    Ok((read_u32(data, 0), read_i64(data, 4), &data[BUNCH_HDR_LEN..]))
}

/// Accumulates envelopes into bunch frames, flushing whenever a frame
/// reaches 500 envelopes or 96000 bytes.
pub struct BunchBuilder {
    bucket: i64,
    frames: Vec<Vec<u8>>,
    current: Vec<u8>,
    count: u32,
}

impl BunchBuilder {
    /// Starts building frames for one bucket.
    pub fn new(bucket: i64) -> Self {
        Self {
            bucket,
            frames: Vec::new(),
            current: vec![0u8; BUNCH_HDR_LEN],
            count: 0,
        }
    }

    /// Appends one serialized envelope.
    pub fn push(&mut self, envelope: &[u8]) {
        self.current.extend_from_slice(envelope);
        self.count += 1;
        if self.count >= SMSG_BUNCH_MAX_MSGS || self.current.len() >= SMSG_BUNCH_MAX_BYTES {
            self.flush();
        }
    }

    /// Finishes, returning every complete frame in push order.
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        if self.count > 0 {
            self.flush();
        }
        self.frames
    }

    fn flush(&mut self) {
        let mut frame = std::mem::replace(&mut self.current, vec![0u8; BUNCH_HDR_LEN]);
        frame[0..4].copy_from_slice(&self.count.to_le_bytes());
        frame[4..12].copy_from_slice(&self.bucket.to_le_bytes());
        self.frames.push(frame);
        self.count = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inv_roundtrip() -> Result<()> {
        let entries = vec![
            InvEntry { bucket: 1_000_000, count: 3, hash: 0xDEADBEEF },
            InvEntry { bucket: 1_003_600, count: 1, hash: 7 },
        ];
        let encoded = encode_inv(&entries);
        assert_eq!(encoded.len(), 4 + 2 * 16);
        assert_eq!(decode_inv(&encoded)?, entries);
        Ok(())
    }

    #[test]
    fn inv_truncated_rejected() {
        let encoded = encode_inv(&[InvEntry { bucket: 1, count: 1, hash: 1 }]);
        assert!(decode_inv(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode_inv(&[1, 0]).is_err());
    }

    #[test]
    fn show_roundtrip() -> Result<()> {
        let buckets = vec![3_600i64, 7_200, 10_800];
        assert_eq!(decode_show(&encode_show(&buckets))?, buckets);
        Ok(())
    }

    #[test]
    fn token_list_roundtrip() -> Result<()> {
        let tokens = vec![
            TokenRef { timestamp: 100, sample: [1; 8] },
            TokenRef { timestamp: 200, sample: [2; 8] },
        ];
        let encoded = encode_token_list(3_600, &tokens);
        let (bucket, decoded) = decode_token_list(&encoded)?;
        assert_eq!(bucket, 3_600);
        assert_eq!(decoded, tokens);
        Ok(())
    }

    #[test]
    fn token_list_ignores_trailing_fragment() -> Result<()> {
        let mut encoded = encode_token_list(3_600, &[TokenRef { timestamp: 1, sample: [0; 8] }]);
        encoded.extend_from_slice(&[0xFF; 5]);
        let (_, decoded) = decode_token_list(&encoded)?;
        assert_eq!(decoded.len(), 1);
        Ok(())
    }

    #[test]
    fn time_roundtrip() -> Result<()> {
        assert_eq!(decode_time(&encode_time(-5))?, -5);
        assert!(decode_time(&[0; 7]).is_err());
        Ok(())
    }

    #[test]
    fn bunch_builder_single_frame() -> Result<()> {
        let mut builder = BunchBuilder::new(3_600);
        builder.push(&[0xAA; 140]);
        builder.push(&[0xBB; 140]);
        let frames = builder.finish();
        assert_eq!(frames.len(), 1);

        let (count, bucket, body) = decode_bunch(&frames[0])?;
        assert_eq!(count, 2);
        assert_eq!(bucket, 3_600);
        assert_eq!(body.len(), 280);
        Ok(())
    }

    #[test]
    fn bunch_builder_splits_on_count() {
        let mut builder = BunchBuilder::new(0);
        for _ in 0..600 {
            builder.push(&[0u8; 130]);
        }
        let frames = builder.finish();
        assert_eq!(frames.len(), 2);
        let (count, _, _) = decode_bunch(&frames[0]).expect("frame 0");
        assert_eq!(count, 500);
        let (count, _, _) = decode_bunch(&frames[1]).expect("frame 1");
        assert_eq!(count, 100);
    }

    #[test]
    fn bunch_builder_splits_on_bytes() {
        let mut builder = BunchBuilder::new(0);
        // 20 KiB envelopes: the byte cap bites long before the count cap.
        for _ in 0..10 {
            builder.push(&vec![0u8; 20 * 1024]);
        }
        let frames = builder.finish();
        assert!(frames.len() >= 2);
        for frame in &frames {
            // A frame closes as soon as the cap is reached, so it never
            // exceeds the cap by more than one envelope.
            let (count, _, _) = decode_bunch(frame).expect("frame");
            assert!(count >= 1);
            assert!(frame.len() <= SMSG_BUNCH_MAX_BYTES + 20 * 1024);
        }
    }

    #[test]
    fn empty_builder_yields_no_frames() {
        let builder = BunchBuilder::new(0);
        assert!(builder.finish().is_empty());
    }
}
