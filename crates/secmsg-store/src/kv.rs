//! sled-backed key-value stores: inbox, outbox, send queue, and the
//! public-key directory.
//!
//! One database, one named tree per store. The trees are opened up
//! front so later accessors cannot fail on a missing tree.

use std::path::Path;

use secmsg_types::{KeyId, Result, SmsgError};

use crate::records::{
    decode_record, encode_record, InboxRecord, OutboxRecord, MESSAGE_KEY_LEN,
};

/// Subdirectory of the host data directory holding the database.
const DB_DIR: &str = "smsgdb";

/// Inbox tree key holding the packed unread list. Six bytes long, so
/// it can never collide with a 16-byte message key.
const UNREAD_KEY: &[u8] = b"unread";

fn storage_err(context: &str, err: sled::Error) -> SmsgError {
    SmsgError::StorageError {
        reason: format!("{context}: {err}"),
    }
}

// ---------------------------------------------------------------------------
// KvEngine
// ---------------------------------------------------------------------------

/// Owns the sled database and hands out per-tree stores.
pub struct KvEngine {
    db: sled::Db,
    inbox: sled::Tree,
    outbox: sled::Tree,
    send_queue: sled::Tree,
    pubkeys: sled::Tree,
}

impl KvEngine {
    /// Opens (or creates) the database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join(DB_DIR))
            .map_err(|e| storage_err("opening database", e))?;
        let inbox = db
            .open_tree("inbox")
            .map_err(|e| storage_err("opening inbox tree", e))?;
        let outbox = db
            .open_tree("outbox")
            .map_err(|e| storage_err("opening outbox tree", e))?;
        let send_queue = db
            .open_tree("sendqueue")
            .map_err(|e| storage_err("opening sendqueue tree", e))?;
        let pubkeys = db
            .open_tree("pubkeys")
            .map_err(|e| storage_err("opening pubkeys tree", e))?;
        Ok(Self {
            db,
            inbox,
            outbox,
            send_queue,
            pubkeys,
        })
    }

    /// Returns the inbox store.
    pub fn inbox(&self) -> InboxStore {
        InboxStore {
            tree: self.inbox.clone(),
        }
    }

    /// Returns the outbox store.
    pub fn outbox(&self) -> OutboxStore {
        OutboxStore {
            tree: self.outbox.clone(),
        }
    }

    /// Returns the send-queue store.
    pub fn send_queue(&self) -> SendQueueStore {
        SendQueueStore {
            tree: self.send_queue.clone(),
        }
    }

    /// Returns the public-key directory.
    pub fn pubkeys(&self) -> PubKeyDirectory {
        PubKeyDirectory {
            tree: self.pubkeys.clone(),
        }
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| storage_err("flushing database", e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InboxStore
// ---------------------------------------------------------------------------

/// Received messages plus the packed unread list.
pub struct InboxStore {
    tree: sled::Tree,
}

impl InboxStore {
    /// Whether a message with this key is already stored.
    pub fn contains(&self, key: &[u8; MESSAGE_KEY_LEN]) -> Result<bool> {
        self.tree
            .contains_key(key)
            .map_err(|e| storage_err("inbox lookup", e))
    }

    /// Stores a message record.
    pub fn insert(&self, key: &[u8; MESSAGE_KEY_LEN], record: &InboxRecord) -> Result<()> {
        let value = encode_record(record)?;
        self.tree
            .insert(key, value)
            .map_err(|e| storage_err("inbox insert", e))?;
        Ok(())
    }

    /// Fetches a message record.
    pub fn get(&self, key: &[u8; MESSAGE_KEY_LEN]) -> Result<Option<InboxRecord>> {
        match self.tree.get(key).map_err(|e| storage_err("inbox get", e))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes a message record.
    pub fn remove(&self, key: &[u8; MESSAGE_KEY_LEN]) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| storage_err("inbox remove", e))?;
        Ok(())
    }

    /// The packed unread list: concatenated 16-byte message keys.
    pub fn unread(&self) -> Result<Vec<[u8; MESSAGE_KEY_LEN]>> {
        let Some(packed) = self
            .tree
            .get(UNREAD_KEY)
            .map_err(|e| storage_err("unread get", e))?
        else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::with_capacity(packed.len() / MESSAGE_KEY_LEN);
        for chunk in packed.chunks_exact(MESSAGE_KEY_LEN) {
            let mut key = [0u8; MESSAGE_KEY_LEN];
            key.copy_from_slice(chunk);
            keys.push(key);
        }
        Ok(keys)
    }

    /// Appends a key to the unread list.
    pub fn push_unread(&self, key: &[u8; MESSAGE_KEY_LEN]) -> Result<()> {
        let mut packed = self
            .tree
            .get(UNREAD_KEY)
            .map_err(|e| storage_err("unread get", e))?
            .map(|v| v.to_vec())
            .unwrap_or_default();
        packed.extend_from_slice(key);
        self.tree
            .insert(UNREAD_KEY, packed)
            .map_err(|e| storage_err("unread insert", e))?;
        Ok(())
    }

    /// Drops a key from the unread list, if present.
    pub fn remove_unread(&self, key: &[u8; MESSAGE_KEY_LEN]) -> Result<()> {
        let keys = self.unread()?;
        let mut packed = Vec::with_capacity(keys.len() * MESSAGE_KEY_LEN);
        for existing in keys.iter().filter(|k| *k != key) {
            packed.extend_from_slice(existing);
        }
        self.tree
            .insert(UNREAD_KEY, packed)
            .map_err(|e| storage_err("unread insert", e))?;
        Ok(())
    }

    /// All message records, in key order. Non-message keys (the
    /// unread list) are skipped by their length.
    pub fn messages(&self) -> Result<Vec<([u8; MESSAGE_KEY_LEN], InboxRecord)>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item.map_err(|e| storage_err("inbox scan", e))?;
            if key.len() != MESSAGE_KEY_LEN {
                continue;
            }
            let mut k = [0u8; MESSAGE_KEY_LEN];
            k.copy_from_slice(&key);
            out.push((k, decode_record(&value)?));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// OutboxStore
// ---------------------------------------------------------------------------

/// Copies of sent messages, encrypted to an owned address.
pub struct OutboxStore {
    tree: sled::Tree,
}

impl OutboxStore {
    /// Stores an outbox record.
    pub fn insert(&self, key: &[u8; MESSAGE_KEY_LEN], record: &OutboxRecord) -> Result<()> {
        let value = encode_record(record)?;
        self.tree
            .insert(key, value)
            .map_err(|e| storage_err("outbox insert", e))?;
        Ok(())
    }

    /// Fetches an outbox record.
    pub fn get(&self, key: &[u8; MESSAGE_KEY_LEN]) -> Result<Option<OutboxRecord>> {
        match self.tree.get(key).map_err(|e| storage_err("outbox get", e))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All outbox records, in key order.
    pub fn messages(&self) -> Result<Vec<([u8; MESSAGE_KEY_LEN], OutboxRecord)>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item.map_err(|e| storage_err("outbox scan", e))?;
            if key.len() != MESSAGE_KEY_LEN {
                continue;
            }
            let mut k = [0u8; MESSAGE_KEY_LEN];
            k.copy_from_slice(&key);
            out.push((k, decode_record(&value)?));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// SendQueueStore
// ---------------------------------------------------------------------------

/// Messages awaiting proof-of-work, drained FIFO by the worker.
pub struct SendQueueStore {
    tree: sled::Tree,
}

impl SendQueueStore {
    /// Enqueues a message.
    pub fn insert(&self, key: &[u8; MESSAGE_KEY_LEN], record: &OutboxRecord) -> Result<()> {
        let value = encode_record(record)?;
        self.tree
            .insert(key, value)
            .map_err(|e| storage_err("sendqueue insert", e))?;
        Ok(())
    }

    /// The first queued entry in key order (timestamps lead the key,
    /// so key order is queue order).
    pub fn first(&self) -> Result<Option<([u8; MESSAGE_KEY_LEN], OutboxRecord)>> {
        for item in self.tree.iter() {
            let (key, value) = item.map_err(|e| storage_err("sendqueue scan", e))?;
            if key.len() != MESSAGE_KEY_LEN {
                continue;
            }
            let mut k = [0u8; MESSAGE_KEY_LEN];
            k.copy_from_slice(&key);
            return Ok(Some((k, decode_record(&value)?)));
        }
        Ok(None)
    }

    /// Removes a queue entry.
    pub fn remove(&self, key: &[u8; MESSAGE_KEY_LEN]) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| storage_err("sendqueue remove", e))?;
        Ok(())
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PubKeyDirectory
// ---------------------------------------------------------------------------

/// Outcome of a directory insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was new and is now stored.
    Inserted,
    /// The key id was already present with the same key.
    AlreadyKnown,
    /// The key id was already present with a *different* key. The
    /// stored key is kept.
    Conflicting,
}

/// Directory of harvested public keys, keyed by their 20-byte key id.
pub struct PubKeyDirectory {
    tree: sled::Tree,
}

impl PubKeyDirectory {
    /// Inserts a compressed public key under its key id.
    pub fn insert(&self, key_id: &KeyId, pubkey: &[u8; 33]) -> Result<InsertOutcome> {
        if let Some(existing) = self
            .tree
            .get(key_id.as_bytes())
            .map_err(|e| storage_err("pubkey get", e))?
        {
            if existing.as_ref() == pubkey.as_slice() {
                return Ok(InsertOutcome::AlreadyKnown);
            }
            tracing::warn!(%key_id, "directory holds a different key for this id");
            return Ok(InsertOutcome::Conflicting);
        }
        self.tree
            .insert(key_id.as_bytes(), pubkey.as_slice())
            .map_err(|e| storage_err("pubkey insert", e))?;
        Ok(InsertOutcome::Inserted)
    }

    /// Fetches the compressed public key for a key id.
    pub fn get(&self, key_id: &KeyId) -> Result<Option<[u8; 33]>> {
        let Some(bytes) = self
            .tree
            .get(key_id.as_bytes())
            .map_err(|e| storage_err("pubkey get", e))?
        else {
            return Ok(None);
        };
        if bytes.len() != 33 {
            return Err(SmsgError::StorageError {
                reason: format!("directory entry for {key_id} has {} bytes", bytes.len()),
            });
        }
        let mut out = [0u8; 33];
        out.copy_from_slice(&bytes);
        Ok(Some(out))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::message_key;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_engine() -> KvEngine {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir: PathBuf = std::env::temp_dir().join(format!(
            "secmsg-kv-test-{}-{}",
            std::process::id(),
            id
        ));
        KvEngine::open(&dir).expect("engine opens")
    }

    fn inbox_record(seed: u8) -> InboxRecord {
        InboxRecord {
            time_received: 1_700_000_000 + seed as i64,
            addr_to: format!("addr-{seed}"),
            message: vec![seed; 140],
        }
    }

    #[test]
    fn inbox_roundtrip_and_dedup() -> Result<()> {
        let engine = temp_engine();
        let inbox = engine.inbox();
        let key = message_key(1_700_000_000, &[7; 8]);

        assert!(!inbox.contains(&key)?);
        inbox.insert(&key, &inbox_record(7))?;
        assert!(inbox.contains(&key)?);

        let fetched = inbox.get(&key)?.expect("record present");
        assert_eq!(fetched.addr_to, "addr-7");
        Ok(())
    }

    #[test]
    fn unread_list_appends_and_removes() -> Result<()> {
        let engine = temp_engine();
        let inbox = engine.inbox();
        let a = message_key(1, &[1; 8]);
        let b = message_key(2, &[2; 8]);

        inbox.push_unread(&a)?;
        inbox.push_unread(&b)?;
        assert_eq!(inbox.unread()?, vec![a, b]);

        inbox.remove_unread(&a)?;
        assert_eq!(inbox.unread()?, vec![b]);
        Ok(())
    }

    #[test]
    fn unread_key_does_not_pollute_message_scan() -> Result<()> {
        let engine = temp_engine();
        let inbox = engine.inbox();
        let key = message_key(5, &[5; 8]);
        inbox.insert(&key, &inbox_record(5))?;
        inbox.push_unread(&key)?;

        let messages = inbox.messages()?;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, key);
        Ok(())
    }

    #[test]
    fn send_queue_is_fifo_by_timestamp() -> Result<()> {
        let engine = temp_engine();
        let queue = engine.send_queue();

        let later = message_key(2_000, &[1; 8]);
        let earlier = message_key(1_000, &[2; 8]);
        let record = OutboxRecord {
            time_received: 0,
            addr_to: "dest".into(),
            addr_outbox: None,
            message: vec![0; 140],
        };
        queue.insert(&later, &record)?;
        queue.insert(&earlier, &record)?;

        let (first_key, _) = queue.first()?.expect("queue non-empty");
        assert_eq!(first_key, earlier);

        queue.remove(&earlier)?;
        let (next_key, _) = queue.first()?.expect("queue non-empty");
        assert_eq!(next_key, later);
        Ok(())
    }

    #[test]
    fn pubkey_directory_detects_duplicates_and_conflicts() -> Result<()> {
        let engine = temp_engine();
        let directory = engine.pubkeys();
        let key_id = KeyId::new([9; 20]);

        assert_eq!(directory.insert(&key_id, &[2; 33])?, InsertOutcome::Inserted);
        assert_eq!(directory.insert(&key_id, &[2; 33])?, InsertOutcome::AlreadyKnown);
        assert_eq!(directory.insert(&key_id, &[3; 33])?, InsertOutcome::Conflicting);

        // Conflicting insert keeps the original.
        assert_eq!(directory.get(&key_id)?, Some([2; 33]));
        Ok(())
    }

    #[test]
    fn missing_pubkey_is_none() -> Result<()> {
        let engine = temp_engine();
        assert!(engine.pubkeys().get(&KeyId::new([0; 20]))?.is_none());
        Ok(())
    }
}
