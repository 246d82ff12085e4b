//! The node facade: state ownership, lifecycle, and the public API.
//!
//! Lock order (must be honored everywhere to stay deadlock-free):
//! host connection manager → `core` → {`inbox` | `outbox` |
//! `send_queue` | `pubkeys`}. The background workers take `core`
//! only for bounded sections and never while holding a KV lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;

use secmsg_crypto::hash::pubkey_key_id;
use secmsg_crypto::PublicKey;
use secmsg_protocol::encrypt::{decrypt, encrypt, MessageData, Sender as MsgSender};
use secmsg_protocol::wire::commands;
use secmsg_protocol::{SecureMessage, SMSG_MAX_MSG_BYTES};
use secmsg_store::kv::{InboxStore, InsertOutcome, OutboxStore, PubKeyDirectory, SendQueueStore};
use secmsg_store::records::{message_key, OutboxRecord};
use secmsg_store::{BucketStore, KvEngine};
use secmsg_types::base58::{base58_decode, base58_encode};
use secmsg_types::config::SmsgConfig;
use secmsg_types::{unix_time, Address, KeyId, Result, SmsgError, ANON_SENDER};

use crate::peer::PeerState;
use crate::{handler, scan, worker, ChainScanner, Keystore, PeerHandle, PeerOverlay, SmsgEvent};

// ---------------------------------------------------------------------------
// CoreState
// ---------------------------------------------------------------------------

/// Everything the protocol handlers touch: the bucket store and the
/// peer map, guarded together by one mutex so each `smsg*` handler
/// runs atomically against both.
pub(crate) struct CoreState {
    pub store: BucketStore,
    pub peers: HashMap<PeerHandle, PeerState>,
    pub next_peer_id: u32,
}

// ---------------------------------------------------------------------------
// SecureMsgNode
// ---------------------------------------------------------------------------

/// The secure messaging subsystem.
///
/// Construct once, wrap in an [`Arc`], then [`start`](Self::start).
/// The host forwards peer traffic into [`receive`](Self::receive)
/// and drives per-peer sending via [`send_tick`](Self::send_tick).
pub struct SecureMsgNode {
    pub(crate) config: SmsgConfig,
    pub(crate) enabled: AtomicBool,
    pub(crate) core: Mutex<CoreState>,
    pub(crate) inbox: Mutex<InboxStore>,
    pub(crate) outbox: Mutex<OutboxStore>,
    pub(crate) send_queue: Mutex<SendQueueStore>,
    pub(crate) pubkeys: Mutex<PubKeyDirectory>,
    kv: KvEngine,
    pub(crate) overlay: Arc<dyn PeerOverlay>,
    pub(crate) keystore: Arc<dyn Keystore>,
    scanner: Option<Arc<dyn ChainScanner>>,
    events: Mutex<Option<Sender<SmsgEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Back-reference handed to the worker threads.
    self_ref: Weak<SecureMsgNode>,
}

impl SecureMsgNode {
    /// Creates the node, opening its persistence under the configured
    /// data directory. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: SmsgConfig,
        overlay: Arc<dyn PeerOverlay>,
        keystore: Arc<dyn Keystore>,
        scanner: Option<Arc<dyn ChainScanner>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store = BucketStore::open(&config.data_dir)?;
        let kv = KvEngine::open(&config.data_dir)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            inbox: Mutex::new(kv.inbox()),
            outbox: Mutex::new(kv.outbox()),
            send_queue: Mutex::new(kv.send_queue()),
            pubkeys: Mutex::new(kv.pubkeys()),
            kv,
            config,
            enabled: AtomicBool::new(false),
            core: Mutex::new(CoreState {
                store,
                peers: HashMap::new(),
                next_peer_id: 1,
            }),
            overlay,
            keystore,
            scanner,
            events: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Registers the observer channel for inbox/outbox notifications.
    pub fn set_event_channel(&self, tx: Sender<SmsgEvent>) {
        *lock(&self.events) = Some(tx);
    }

    /// Whether the subsystem is running.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Starts the subsystem: optional chain scan, index rebuild, and
    /// the two background threads. A failed index rebuild leaves the
    /// subsystem disabled and returns the error; it never panics.
    pub fn start(&self, scan_chain: bool) -> Result<()> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            tracing::warn!("secure messaging is already running");
            return Ok(());
        }
        tracing::info!("secure messaging starting");

        if scan_chain {
            self.scan_chain_keys();
        }

        let index = {
            let mut core = self.lock_core();
            core.store.build_index(unix_time())
        };
        if let Err(e) = index {
            tracing::error!(error = %e, "could not load bucket index, secure messaging disabled");
            self.enabled.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.spawn_workers()?;
        Ok(())
    }

    /// Stops the subsystem and joins the background threads. The
    /// threads observe the flag at their poll granularity, so this
    /// returns well inside the configured grace period.
    pub fn shutdown(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping secure messaging");

        let handles = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            let _ = handle.join();
        }
        if let Err(e) = self.kv.flush() {
            tracing::warn!(error = %e, "flush on shutdown failed");
        }
    }

    /// Enables messaging at runtime: rebuilds the index, restarts the
    /// threads, and pings every connected peer. The pong sent along
    /// with the ping compensates for the initial ping this node
    /// missed while disabled.
    pub fn enable(&self) -> Result<()> {
        if self.is_enabled() {
            tracing::warn!("secure messaging is already enabled");
            return Ok(());
        }
        self.enabled.store(true, Ordering::SeqCst);

        {
            let mut core = self.lock_core();
            core.store.clear();
            if let Err(e) = core.store.build_index(unix_time()) {
                drop(core);
                tracing::error!(error = %e, "could not load bucket index, secure messaging disabled");
                self.enabled.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        self.spawn_workers()?;

        for peer in self.overlay.connected_peers() {
            self.overlay.push_message(peer, commands::PING, &[]);
            self.overlay.push_message(peer, commands::PONG, &[]);
        }

        tracing::info!("secure messaging enabled");
        Ok(())
    }

    /// Disables messaging at runtime: announces `smsgDisabled` to
    /// enabled peers, clears the bucket index, and stops the threads.
    pub fn disable(&self) -> Result<()> {
        if !self.is_enabled() {
            tracing::warn!("secure messaging is already disabled");
            return Ok(());
        }

        {
            let mut core = self.lock_core();
            self.enabled.store(false, Ordering::SeqCst);
            let state = &mut *core;
            for (handle, peer) in state.peers.iter_mut() {
                if peer.enabled {
                    self.overlay.push_message(*handle, commands::DISABLED, &[]);
                    peer.enabled = false;
                }
            }
            state.store.clear();
        }

        let handles = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            let _ = handle.join();
        }

        tracing::info!("secure messaging disabled");
        Ok(())
    }

    fn spawn_workers(&self) -> Result<()> {
        let Some(node) = self.self_ref.upgrade() else {
            // Unreachable while a caller holds the Arc, but never panic.
            self.enabled.store(false, Ordering::SeqCst);
            return Err(SmsgError::IoError {
                reason: "node is being dropped".into(),
            });
        };
        match worker::spawn_workers(&node) {
            Ok(handles) => {
                *lock(&self.workers) = handles;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "could not start threads, secure messaging disabled");
                self.enabled.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn scan_chain_keys(&self) {
        let Some(scanner) = self.scanner.clone() else {
            tracing::warn!("chain scan requested but no scanner is attached");
            return;
        };
        let mut harvested: u64 = 0;
        let mut duplicates: u64 = 0;
        let result = scanner.harvest_keys(&mut |key_id, pubkey| {
            match lock(&self.pubkeys).insert(&key_id, &pubkey.serialize()) {
                Ok(InsertOutcome::Inserted) => harvested += 1,
                Ok(_) => duplicates += 1,
                Err(e) => tracing::warn!(error = %e, "directory insert during chain scan failed"),
            }
        });
        match result {
            Ok(()) => tracing::info!(harvested, duplicates, "chain scan finished"),
            Err(e) => tracing::warn!(error = %e, "chain scan failed"),
        }
    }

    // -----------------------------------------------------------------
    // Protocol entry points
    // -----------------------------------------------------------------

    /// Handles one `smsg*` command from a peer. Malformed traffic is
    /// scored through the overlay and dropped; nothing here kills the
    /// connection.
    pub fn receive(&self, peer: PeerHandle, command: &str, payload: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        handler::receive_data(self, peer, command, payload);
    }

    /// Per-peer send opportunity, called from the host's send loop.
    pub fn send_tick(&self, peer: PeerHandle) {
        self.send_tick_at(peer, unix_time());
    }

    /// [`send_tick`](Self::send_tick) with an injectable clock.
    pub fn send_tick_at(&self, peer: PeerHandle, now: i64) {
        if !self.is_enabled() {
            return;
        }
        handler::send_tick(self, peer, now);
    }

    /// Drops the state of a disconnected peer.
    pub fn peer_disconnected(&self, peer: PeerHandle) {
        self.lock_core().peers.remove(&peer);
    }

    // -----------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------

    /// Encrypts a message and places it on the send queue; the
    /// proof-of-work worker publishes it. Also stores an outbox copy
    /// encrypted to the first owned wallet address.
    pub fn send(&self, from: &str, to: &str, body: &[u8]) -> Result<()> {
        if body.len() > SMSG_MAX_MSG_BYTES {
            return Err(SmsgError::BadArgument {
                reason: format!("message is too long, {} > {SMSG_MAX_MSG_BYTES}", body.len()),
            });
        }

        let sender = if from == ANON_SENDER {
            MsgSender::Anonymous
        } else {
            let address: Address = from.parse()?;
            let secret = self.keystore.secret_key(address.key_id()).ok_or_else(|| {
                SmsgError::BadArgument {
                    reason: format!("no private key for from address {from}"),
                }
            })?;
            MsgSender::Keyed { address, secret }
        };

        let dest: Address = to.parse()?;
        let dest_pubkey =
            self.resolve_public_key(dest.key_id())?
                .ok_or_else(|| SmsgError::UnknownRecipient {
                    address: to.to_string(),
                })?;

        let now = unix_time();
        let message = encrypt(&sender, &dest_pubkey, body, now)?;

        let key = envelope_key(&message);
        let record = OutboxRecord {
            time_received: now,
            addr_to: to.to_string(),
            addr_outbox: None,
            message: message.to_bytes(),
        };
        lock(&self.send_queue).insert(&key, &record)?;
        tracing::debug!(to, "message queued for proof of work");

        self.store_outbox_copy(&sender, to, body, now);
        Ok(())
    }

    /// Encrypts a copy to the first owned address and stores it in
    /// the outbox. Failures are logged, never fatal: the message is
    /// already queued for the recipient.
    fn store_outbox_copy(&self, sender: &MsgSender, to: &str, body: &[u8], now: i64) {
        let Some(own) = self.keystore.owned_addresses().into_iter().next() else {
            tracing::warn!("no owned address for the outbox copy");
            return;
        };
        let Some(own_pubkey) = self.keystore.public_key(own.key_id()) else {
            tracing::warn!(address = %own, "wallet holds no public key for outbox address");
            return;
        };

        match encrypt(sender, &own_pubkey, body, now) {
            Err(e) => tracing::warn!(error = %e, "encrypt for outbox failed"),
            Ok(copy) => {
                let key = envelope_key(&copy);
                let record = OutboxRecord {
                    time_received: now,
                    addr_to: to.to_string(),
                    addr_outbox: Some(own.to_string()),
                    message: copy.to_bytes(),
                };
                match lock(&self.outbox).insert(&key, &record) {
                    Ok(()) => self.emit(SmsgEvent::OutboxChanged {
                        key,
                        addr_to: to.to_string(),
                    }),
                    Err(e) => tracing::warn!(error = %e, "outbox insert failed"),
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Workers (also callable directly, with an injectable clock)
    // -----------------------------------------------------------------

    /// One GC pass: expire buckets, count down transfer locks, and
    /// ignore peers whose locks timed out.
    pub fn run_bucket_maintenance(&self, now: i64) {
        let mut core = self.lock_core();
        let report = {
            let state = &mut *core;
            state.store.gc_tick(now)
        };

        for (bucket, peer_id) in report.lock_timeouts {
            let ignore_until = now + secmsg_protocol::SMSG_TIME_IGNORE;
            let state = &mut *core;
            let Some((handle, peer)) = state
                .peers
                .iter_mut()
                .find(|(_, p)| p.peer_id == peer_id)
            else {
                tracing::debug!(bucket, peer_id, "locking peer is gone");
                continue;
            };
            peer.ignore_until = ignore_until;
            self.overlay.push_message(
                *handle,
                commands::IGNORE,
                &secmsg_protocol::wire::encode_time(ignore_until),
            );
            tracing::debug!(bucket, peer_id, ignore_until, "lock timed out, ignoring peer");
        }
    }

    /// Drains the send queue: proof-of-work, store, try-decrypt (the
    /// sender may also be the recipient), delete. An aborted search
    /// leaves the entry queued so it resumes on next start.
    pub fn run_send_queue(&self) {
        loop {
            if !self.is_enabled() {
                return;
            }

            let entry = match lock(&self.send_queue).first() {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "send queue read failed");
                    return;
                }
            };
            let Some((key, record)) = entry else {
                return;
            };
            tracing::debug!(to = %record.addr_to, "picked up queued message");

            let message = match SecureMessage::from_bytes(&record.message) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "queued record is corrupt, removing");
                    if self.remove_queued(&key).is_err() {
                        return;
                    }
                    continue;
                }
            };

            let mut header = message.header;
            match secmsg_protocol::pow::set_hash(&mut header, &message.payload, &self.enabled) {
                Err(SmsgError::PowAborted) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "could not get proof of work, message removed");
                    if self.remove_queued(&key).is_err() {
                        return;
                    }
                    continue;
                }
                Ok(()) => {}
            }

            {
                let mut core = self.lock_core();
                if let Err(e) = core.store.store(&header, &message.payload, true, unix_time()) {
                    tracing::warn!(error = %e, "could not place message in buckets, removed");
                    drop(core);
                    if self.remove_queued(&key).is_err() {
                        return;
                    }
                    continue;
                }
            }

            // The recipient may be an owned address.
            if let Err(e) = scan::scan_message(self, &header, &message.payload) {
                tracing::debug!(error = %e, "self-delivery scan failed");
            }

            if self.remove_queued(&key).is_err() {
                return;
            }
            tracing::debug!(to = %record.addr_to, "sent queued message");
        }
    }

    fn remove_queued(&self, key: &[u8; 16]) -> Result<()> {
        lock(&self.send_queue).remove(key).map_err(|e| {
            tracing::warn!(error = %e, "send queue remove failed");
            e
        })
    }

    // -----------------------------------------------------------------
    // Directory and inbox access
    // -----------------------------------------------------------------

    /// Resolves a destination public key: directory first, then the
    /// wallet (the destination may be an owned address).
    pub(crate) fn resolve_public_key(&self, key_id: &KeyId) -> Result<Option<PublicKey>> {
        if let Some(bytes) = lock(&self.pubkeys).get(key_id)? {
            let pubkey = PublicKey::from_slice(&bytes).map_err(|e| SmsgError::CryptoFailed {
                reason: format!("directory holds an invalid key: {e}"),
            })?;
            return Ok(Some(pubkey));
        }
        Ok(self.keystore.public_key(key_id))
    }

    /// Adds an `(address, public key)` pair to the directory. The key
    /// is base58 and must hash to the address.
    pub fn add_address(&self, address: &str, public_key: &str) -> Result<()> {
        let addr: Address = address.parse()?;
        let bytes = base58_decode(public_key).ok_or_else(|| SmsgError::BadArgument {
            reason: "public key is not valid base58".into(),
        })?;
        let pubkey = PublicKey::from_slice(&bytes).map_err(|e| SmsgError::BadArgument {
            reason: format!("public key is invalid: {e}"),
        })?;

        if pubkey_key_id(&pubkey) != *addr.key_id() {
            return Err(SmsgError::BadArgument {
                reason: "public key does not hash to address".into(),
            });
        }

        match lock(&self.pubkeys).insert(addr.key_id(), &pubkey.serialize())? {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::AlreadyKnown | InsertOutcome::Conflicting => Err(SmsgError::Duplicate),
        }
    }

    /// Returns the wallet public key for an owned address, base58
    /// encoded — what a correspondent needs to message this node.
    pub fn get_local_public_key(&self, address: &str) -> Result<String> {
        let addr: Address = address.parse()?;
        let pubkey = self
            .keystore
            .public_key(addr.key_id())
            .ok_or_else(|| SmsgError::BadArgument {
                reason: format!("address {address} is not in the wallet"),
            })?;
        Ok(base58_encode(&pubkey.serialize()))
    }

    /// Decrypts a stored inbox message, persists the recovered sender
    /// key into the directory, and clears the unread mark.
    pub fn read_inbox_message(&self, key: &[u8; 16]) -> Result<MessageData> {
        let record = lock(&self.inbox)
            .get(key)?
            .ok_or_else(|| SmsgError::BadArgument {
                reason: "no inbox message under this key".into(),
            })?;

        let envelope = SecureMessage::from_bytes(&record.message)?;
        let addr: Address = record.addr_to.parse()?;
        let secret = self.keystore.secret_key(addr.key_id()).ok_or_else(|| {
            SmsgError::BadArgument {
                reason: format!("no private key for {}", record.addr_to),
            }
        })?;

        let data = decrypt(false, &secret, &envelope.header, &envelope.payload)?.ok_or_else(
            || SmsgError::CryptoFailed {
                reason: "decrypt returned no data".into(),
            },
        )?;

        if let Some((key_id, pubkey)) = &data.sender_pubkey {
            match lock(&self.pubkeys).insert(key_id, &pubkey.serialize()) {
                Ok(InsertOutcome::Inserted) => {
                    tracing::debug!(%key_id, "sender public key added to directory")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "directory insert failed"),
            }
        }

        lock(&self.inbox).remove_unread(key)?;
        Ok(data)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, CoreState> {
        lock(&self.core)
    }

    pub(crate) fn lock_inbox(&self) -> MutexGuard<'_, InboxStore> {
        lock(&self.inbox)
    }

    pub(crate) fn emit(&self, event: SmsgEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Record key of an envelope: its timestamp plus payload sample.
fn envelope_key(message: &SecureMessage) -> [u8; 16] {
    let mut sample = [0u8; 8];
    sample.copy_from_slice(&message.payload[..8]);
    message_key(message.header.timestamp, &sample)
}

/// Locks a mutex, recovering the guard if a worker panicked while
/// holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
