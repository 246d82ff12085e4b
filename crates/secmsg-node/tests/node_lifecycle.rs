//! Integration tests for the node facade: lifecycle, the send path
//! through the proof-of-work queue, self-delivery, and the
//! public-key directory API.
//!
//! The worker poll interval is set high so the background threads
//! stay dormant; queue processing is driven explicitly for
//! determinism.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use secmsg_crypto::ecdh::generate_ephemeral_keypair;
use secmsg_crypto::hash::pubkey_key_id;
use secmsg_crypto::{PublicKey, SecretKey};
use secmsg_node::{Keystore, PeerHandle, PeerOverlay, SecureMsgNode, SmsgEvent};
use secmsg_types::base58::base58_encode;
use secmsg_types::config::SmsgConfig;
use secmsg_types::{Address, KeyId, Result, SmsgError};

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingOverlay {
    messages: Mutex<Vec<(PeerHandle, String, Vec<u8>)>>,
}

impl PeerOverlay for RecordingOverlay {
    fn push_message(&self, peer: PeerHandle, command: &str, payload: &[u8]) {
        self.messages
            .lock()
            .expect("overlay lock")
            .push((peer, command.to_string(), payload.to_vec()));
    }

    fn misbehaving(&self, _peer: PeerHandle, _score: u32) {}

    fn connected_peers(&self) -> Vec<PeerHandle> {
        Vec::new()
    }
}

struct WalletStub {
    keys: Vec<(Address, SecretKey, PublicKey)>,
}

impl WalletStub {
    fn with_one_key() -> (Self, Address) {
        let (secret, public) = generate_ephemeral_keypair();
        let address = Address::from_key_id(pubkey_key_id(&public));
        (
            Self {
                keys: vec![(address, secret, public)],
            },
            address,
        )
    }
}

impl Keystore for WalletStub {
    fn secret_key(&self, key_id: &KeyId) -> Option<SecretKey> {
        self.keys
            .iter()
            .find(|(a, _, _)| a.key_id() == key_id)
            .map(|(_, sk, _)| *sk)
    }

    fn public_key(&self, key_id: &KeyId) -> Option<PublicKey> {
        self.keys
            .iter()
            .find(|(a, _, _)| a.key_id() == key_id)
            .map(|(_, _, pk)| *pk)
    }

    fn owned_addresses(&self) -> Vec<Address> {
        self.keys.iter().map(|(a, _, _)| *a).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir() -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "secmsg-node-test-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

fn dormant_config() -> SmsgConfig {
    SmsgConfig {
        // Keep the workers asleep for the duration of the test.
        worker_poll_ms: 60_000,
        ..SmsgConfig::with_data_dir(temp_dir())
    }
}

fn build_node(wallet: WalletStub) -> Arc<SecureMsgNode> {
    SecureMsgNode::new(
        dormant_config(),
        Arc::new(RecordingOverlay::default()),
        Arc::new(wallet),
        None,
    )
    .expect("node opens")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn start_and_shutdown_cleanly() -> Result<()> {
    let (wallet, _) = WalletStub::with_one_key();
    let node = build_node(wallet);

    node.start(false)?;
    assert!(node.is_enabled());

    // Starting again is a no-op, not an error.
    node.start(false)?;

    node.shutdown();
    assert!(!node.is_enabled());
    Ok(())
}

#[test]
fn send_to_self_lands_in_inbox() -> Result<()> {
    let (wallet, alice) = WalletStub::with_one_key();
    let alice_str = alice.to_string();
    let node = build_node(wallet);
    let (tx, rx) = mpsc::channel();
    node.set_event_channel(tx);

    node.start(false)?;
    node.send("anon", &alice_str, b"hello self")?;

    // The outbox copy is written synchronously.
    let outbox_event = rx.try_recv().expect("outbox event");
    match outbox_event {
        SmsgEvent::OutboxChanged { addr_to, .. } => assert_eq!(addr_to, alice_str),
        other => panic!("expected OutboxChanged, got {other:?}"),
    }

    // Drive the queue: proof-of-work, store, self-delivery scan.
    node.run_send_queue();

    let inbox_key = match rx.try_recv().expect("inbox event") {
        SmsgEvent::InboxChanged { key, addr_to } => {
            assert_eq!(addr_to, alice_str);
            key
        }
        other => panic!("expected InboxChanged, got {other:?}"),
    };

    let data = node.read_inbox_message(&inbox_key)?;
    assert_eq!(data.plaintext, b"hello self");
    assert_eq!(data.from_address, "anon");

    node.shutdown();
    Ok(())
}

#[test]
fn signed_send_to_self_recovers_sender() -> Result<()> {
    let (wallet, alice) = WalletStub::with_one_key();
    let alice_str = alice.to_string();
    let node = build_node(wallet);
    let (tx, rx) = mpsc::channel();
    node.set_event_channel(tx);

    node.start(false)?;
    node.send(&alice_str, &alice_str, b"note to self")?;
    node.run_send_queue();

    let inbox_key = loop {
        match rx.try_recv().expect("an event") {
            SmsgEvent::InboxChanged { key, .. } => break key,
            SmsgEvent::OutboxChanged { .. } => continue,
        }
    };

    let data = node.read_inbox_message(&inbox_key)?;
    assert_eq!(data.plaintext, b"note to self");
    assert_eq!(data.from_address, alice_str);

    // Reading persisted the recovered sender key, so inserting the
    // same pair through the API now reports a duplicate.
    let pubkey_b58 = node.get_local_public_key(&alice_str)?;
    match node.add_address(&alice_str, &pubkey_b58) {
        Err(SmsgError::Duplicate) => {}
        other => panic!("expected Duplicate, got {other:?}"),
    }

    node.shutdown();
    Ok(())
}

#[test]
fn send_resolves_recipients_through_the_directory() -> Result<()> {
    let (wallet, _) = WalletStub::with_one_key();
    let node = build_node(wallet);
    node.start(false)?;

    // Bob is not in the wallet; only his published key lets us send.
    let (_, bob_pk) = generate_ephemeral_keypair();
    let bob = Address::from_key_id(pubkey_key_id(&bob_pk));
    let bob_str = bob.to_string();

    match node.send("anon", &bob_str, b"hello bob") {
        Err(SmsgError::UnknownRecipient { .. }) => {}
        other => panic!("expected UnknownRecipient, got {other:?}"),
    }

    node.add_address(&bob_str, &base58_encode(&bob_pk.serialize()))?;
    node.send("anon", &bob_str, b"hello bob")?;
    node.run_send_queue();

    node.shutdown();
    Ok(())
}

#[test]
fn oversized_message_rejected() -> Result<()> {
    let (wallet, alice) = WalletStub::with_one_key();
    let node = build_node(wallet);
    node.start(false)?;

    let body = vec![0u8; secmsg_protocol::SMSG_MAX_MSG_BYTES + 1];
    match node.send("anon", &alice.to_string(), &body) {
        Err(SmsgError::BadArgument { .. }) => {}
        other => panic!("expected BadArgument, got {other:?}"),
    }

    node.shutdown();
    Ok(())
}

#[test]
fn add_address_rejects_mismatched_key() -> Result<()> {
    let (wallet, _) = WalletStub::with_one_key();
    let node = build_node(wallet);

    let (_, key_a) = generate_ephemeral_keypair();
    let (_, key_b) = generate_ephemeral_keypair();
    let address_a = Address::from_key_id(pubkey_key_id(&key_a)).to_string();

    match node.add_address(&address_a, &base58_encode(&key_b.serialize())) {
        Err(SmsgError::BadArgument { .. }) => Ok(()),
        other => panic!("expected BadArgument, got {other:?}"),
    }
}

#[test]
fn queue_survives_restart() -> Result<()> {
    let (wallet, alice) = WalletStub::with_one_key();
    let alice_str = alice.to_string();
    let dir = temp_dir();
    let config = SmsgConfig {
        worker_poll_ms: 60_000,
        ..SmsgConfig::with_data_dir(dir.clone())
    };

    {
        let node = SecureMsgNode::new(
            config.clone(),
            Arc::new(RecordingOverlay::default()),
            Arc::new(WalletStub {
                keys: wallet.keys.clone(),
            }),
            None,
        )
        .expect("node opens");
        node.start(false)?;
        node.send("anon", &alice_str, b"queued across restart")?;
        // Shut down before the queue is drained; the entry stays.
        node.shutdown();
    }

    let node = SecureMsgNode::new(
        config,
        Arc::new(RecordingOverlay::default()),
        Arc::new(wallet),
        None,
    )
    .expect("node reopens");
    let (tx, rx) = mpsc::channel();
    node.set_event_channel(tx);
    node.start(false)?;
    node.run_send_queue();

    let delivered = rx
        .try_iter()
        .any(|event| matches!(event, SmsgEvent::InboxChanged { .. }));
    assert!(delivered, "queued message delivered after restart");

    node.shutdown();
    Ok(())
}
