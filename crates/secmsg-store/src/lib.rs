//! Persistence for the secmsg messaging core.
//!
//! Two storage planes with different shapes:
//!
//! - The **bucket store**: time-partitioned append-only files of raw
//!   envelopes, mirrored by an in-memory token index with XXH32
//!   digests. This is what the anti-entropy protocol reconciles.
//! - The **key-value stores**: sled trees for the inbox, outbox,
//!   send queue, and the public-key directory. These are node-local
//!   and never leave the machine.

pub mod bucket;
pub mod bucket_store;
pub mod kv;
pub mod records;

pub use bucket::{bucket_start, Bucket, BucketToken};
pub use bucket_store::BucketStore;
pub use kv::KvEngine;
