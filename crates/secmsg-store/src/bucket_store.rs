//! Append-only bucket files and the operations over them: store,
//! random retrieval by token offset, index rebuild, and expiry.
//!
//! One file per bucket, named `<bucketStart>_01.dat`, holding raw
//! concatenated `header ∥ payload` records. The store is crash-
//! consistent to record boundaries only: a partially written trailing
//! record is silently dropped when the index is rebuilt.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use secmsg_protocol::{MessageHeader, SMSG_HDR_LEN, SMSG_RETENTION, SMSG_TIME_LEEWAY};
use secmsg_types::{Result, SmsgError};

use crate::bucket::{bucket_start, Bucket, BucketToken};

/// Name of the bucket directory under the host data directory.
const STORE_DIR: &str = "smsgStore";

fn io_err(context: &str, err: std::io::Error) -> SmsgError {
    SmsgError::IoError {
        reason: format!("{context}: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Summary of an index rebuild.
#[derive(Clone, Debug, Default)]
pub struct IndexReport {
    /// `.dat` files examined.
    pub files: u32,
    /// Buckets loaded into the index.
    pub buckets: usize,
    /// Messages indexed across all buckets.
    pub messages: u64,
}

/// Outcome of one GC tick.
#[derive(Clone, Debug, Default)]
pub struct GcReport {
    /// Buckets removed by retention expiry.
    pub removed: Vec<i64>,
    /// `(bucket, peer_id)` pairs whose transfer lock timed out this
    /// tick. The caller owes each peer an ignore notice.
    pub lock_timeouts: Vec<(i64, u32)>,
}

// ---------------------------------------------------------------------------
// BucketStore
// ---------------------------------------------------------------------------

/// The bucket map plus its backing directory.
pub struct BucketStore {
    dir: PathBuf,
    buckets: BTreeMap<i64, Bucket>,
}

impl BucketStore {
    /// Opens the store under `data_dir`, creating `smsgStore/` if
    /// needed. The index starts empty; call
    /// [`build_index`](Self::build_index) to load existing files.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(STORE_DIR);
        fs::create_dir_all(&dir).map_err(|e| io_err("creating bucket directory", e))?;
        Ok(Self {
            dir,
            buckets: BTreeMap::new(),
        })
    }

    /// All buckets, keyed by start time.
    pub fn buckets(&self) -> &BTreeMap<i64, Bucket> {
        &self.buckets
    }

    /// Looks up a bucket without creating it.
    pub fn bucket(&self, start: i64) -> Option<&Bucket> {
        self.buckets.get(&start)
    }

    /// Mutable bucket access without creating the bucket.
    pub fn bucket_mut(&mut self, start: i64) -> Option<&mut Bucket> {
        self.buckets.get_mut(&start)
    }

    /// Mutable bucket access, creating the bucket lazily. Only call
    /// on the insertion and locking paths — lookups should not
    /// materialize empty buckets.
    pub fn bucket_entry(&mut self, start: i64) -> &mut Bucket {
        self.buckets.entry(start).or_default()
    }

    /// Drops the whole in-memory index (files stay on disk).
    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    fn bucket_path(&self, start: i64) -> PathBuf {
        self.dir.join(format!("{start}_01.dat"))
    }

    // -----------------------------------------------------------------
    // Store
    // -----------------------------------------------------------------

    /// Appends an envelope to its bucket file and indexes the token.
    ///
    /// Rejects timestamps beyond `now + SMSG_TIME_LEEWAY` or older
    /// than the retention window. Returns [`SmsgError::Duplicate`]
    /// when the token is already present; the file is not touched in
    /// that case.
    pub fn store(
        &mut self,
        header: &MessageHeader,
        payload: &[u8],
        update_hash: bool,
        now: i64,
    ) -> Result<()> {
        if header.timestamp > now + SMSG_TIME_LEEWAY {
            return Err(SmsgError::BadArgument {
                reason: format!("message timestamp {} is in the future", header.timestamp),
            });
        }
        if header.timestamp < now - SMSG_RETENTION {
            return Err(SmsgError::BadArgument {
                reason: format!("message timestamp {} is beyond retention", header.timestamp),
            });
        }
        if payload.len() < 8 {
            return Err(SmsgError::BadArgument {
                reason: format!("payload of {} bytes is too short to sample", payload.len()),
            });
        }

        let start = bucket_start(header.timestamp);
        let mut sample = [0u8; 8];
        sample.copy_from_slice(&payload[..8]);
        let mut token = BucketToken::probe(header.timestamp, sample);

        if self.bucket_entry(start).tokens.contains(&token) {
            return Err(SmsgError::Duplicate);
        }

        let path = self.bucket_path(start);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err("opening bucket file", e))?;
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(|e| io_err("seeking bucket file", e))?;
        file.write_all(&header.to_bytes())
            .map_err(|e| io_err("writing envelope header", e))?;
        file.write_all(payload)
            .map_err(|e| io_err("writing envelope payload", e))?;

        token.offset = offset;
        let bucket = self.bucket_entry(start);
        bucket.insert_token(token);
        if update_hash {
            bucket.rehash(now);
        }

        tracing::debug!(bucket = start, offset, "stored envelope");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Retrieve
    // -----------------------------------------------------------------

    /// Reads one envelope back by its token offset, returning
    /// `header ∥ payload` bytes.
    pub fn retrieve(&self, token: &BucketToken) -> Result<Vec<u8>> {
        let path = self.bucket_path(bucket_start(token.timestamp));
        let mut file = File::open(&path).map_err(|e| io_err("opening bucket file", e))?;
        file.seek(SeekFrom::Start(token.offset))
            .map_err(|e| io_err("seeking to envelope", e))?;

        let mut header_bytes = [0u8; SMSG_HDR_LEN];
        file.read_exact(&mut header_bytes)
            .map_err(|e| io_err("reading envelope header", e))?;
        let header = MessageHeader::from_bytes(&header_bytes)?;

        let mut out = Vec::with_capacity(SMSG_HDR_LEN + header.n_payload as usize);
        out.extend_from_slice(&header_bytes);
        out.resize(SMSG_HDR_LEN + header.n_payload as usize, 0);
        file.read_exact(&mut out[SMSG_HDR_LEN..])
            .map_err(|e| io_err("reading envelope payload", e))?;
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Index rebuild
    // -----------------------------------------------------------------

    /// Rebuilds the bucket index by scanning `smsgStore/`.
    ///
    /// Files older than the retention window are deleted. Scanning a
    /// file stops at the first short read; a truncated trailing
    /// record is tolerated silently.
    pub fn build_index(&mut self, now: i64) -> Result<IndexReport> {
        let mut report = IndexReport::default();

        let entries = fs::read_dir(&self.dir).map_err(|e| io_err("reading bucket directory", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err("reading directory entry", e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != "dat") {
                continue;
            }

            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // <bucketStart>_01.dat
            let Some((stem, _)) = name.rsplit_once('_') else {
                continue;
            };
            let Ok(file_time) = stem.parse::<i64>() else {
                continue;
            };
            report.files += 1;

            if file_time < now - SMSG_RETENTION {
                tracing::info!(bucket = file_time, "dropping expired bucket file");
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(bucket = file_time, error = %e, "failed to remove bucket file");
                }
                continue;
            }

            let count = self.scan_bucket_file(&path, file_time)?;
            report.messages += count;
            if let Some(bucket) = self.buckets.get_mut(&file_time) {
                bucket.rehash(now);
                tracing::debug!(bucket = file_time, messages = count, "indexed bucket");
            }
        }

        report.buckets = self.buckets.len();
        tracing::info!(
            files = report.files,
            buckets = report.buckets,
            messages = report.messages,
            "bucket index rebuilt"
        );
        Ok(report)
    }

    /// Sequentially scans one bucket file into the index. Returns the
    /// number of records indexed.
    fn scan_bucket_file(&mut self, path: &Path, file_time: i64) -> Result<u64> {
        let mut file = File::open(path).map_err(|e| io_err("opening bucket file", e))?;
        let bucket = self.buckets.entry(file_time).or_default();

        let mut offset: u64 = 0;
        let mut count: u64 = 0;
        let mut header_bytes = [0u8; SMSG_HDR_LEN];
        loop {
            if file.read_exact(&mut header_bytes).is_err() {
                break; // end of file, or a torn trailing record
            }
            let header = MessageHeader::from_bytes(&header_bytes)?;
            let n_payload = header.n_payload as u64;

            if header.n_payload < 8 {
                // Cannot sample; skip the record body and move on.
                if file.seek(SeekFrom::Current(n_payload as i64)).is_err() {
                    break;
                }
                offset += SMSG_HDR_LEN as u64 + n_payload;
                continue;
            }

            let mut sample = [0u8; 8];
            if file.read_exact(&mut sample).is_err() {
                break;
            }
            if file
                .seek(SeekFrom::Current(n_payload as i64 - 8))
                .is_err()
            {
                break;
            }

            bucket.insert_token(BucketToken {
                timestamp: header.timestamp,
                sample,
                offset,
            });
            count += 1;
            offset += SMSG_HDR_LEN as u64 + n_payload;
        }
        Ok(count)
    }

    // -----------------------------------------------------------------
    // GC / lock ticker
    // -----------------------------------------------------------------

    /// One maintenance tick: expire buckets past retention and count
    /// down transfer locks.
    pub fn gc_tick(&mut self, now: i64) -> GcReport {
        let mut report = GcReport::default();
        let cutoff = now - SMSG_RETENTION;

        let expired: Vec<i64> = self
            .buckets
            .range(..cutoff)
            .map(|(start, _)| *start)
            .collect();
        for start in expired {
            let path = self.bucket_path(start);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(bucket = start, error = %e, "failed to remove bucket file");
                }
            } else {
                tracing::warn!(bucket = start, "bucket file already missing");
            }
            self.buckets.remove(&start);
            tracing::debug!(bucket = start, "removed expired bucket");
            report.removed.push(start);
        }

        for (start, bucket) in self.buckets.iter_mut() {
            if bucket.lock_count == 0 {
                continue;
            }
            bucket.lock_count -= 1;
            if bucket.lock_count == 0 {
                tracing::debug!(
                    bucket = start,
                    peer_id = bucket.lock_peer_id,
                    "bucket lock timed out"
                );
                report.lock_timeouts.push((*start, bucket.lock_peer_id));
                bucket.lock_peer_id = 0;
            }
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
