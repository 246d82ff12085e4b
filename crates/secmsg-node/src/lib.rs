//! The secmsg node core: peer state, the anti-entropy protocol
//! handler, background workers, and the public facade.
//!
//! The node is embedded in a host process (a coin daemon) that owns
//! the peer connections, the wallet, and the chain. Those
//! collaborators are consumed through the seams defined here:
//! [`PeerOverlay`], [`Keystore`], and [`ChainScanner`]. The host
//! drives the node by forwarding `smsg*` commands into
//! [`SecureMsgNode::receive`] and calling
//! [`SecureMsgNode::send_tick`] per peer from its send loop.

mod handler;
mod node;
mod peer;
mod scan;
mod worker;

pub use node::SecureMsgNode;
pub use peer::PeerState;

use secmsg_crypto::{PublicKey, SecretKey};
use secmsg_types::{Address, KeyId, Result};

/// Host-side identifier of one peer connection. Opaque to the core;
/// the node keys its per-peer state on it.
pub type PeerHandle = u64;

// ---------------------------------------------------------------------------
// Host seams
// ---------------------------------------------------------------------------

/// The host's connection manager and wire framing.
///
/// Implementations must not call back into the node from these
/// methods — they are invoked with node locks held.
pub trait PeerOverlay: Send + Sync {
    /// Queues a command frame to one peer.
    fn push_message(&self, peer: PeerHandle, command: &str, payload: &[u8]);

    /// Raises a peer's misbehavior score. The host decides whether
    /// and when to ban.
    fn misbehaving(&self, peer: PeerHandle, score: u32);

    /// Handles of all currently connected peers.
    fn connected_peers(&self) -> Vec<PeerHandle>;
}

/// The host wallet.
pub trait Keystore: Send + Sync {
    /// Private key for an owned key id, if the wallet holds it.
    fn secret_key(&self, key_id: &KeyId) -> Option<SecretKey>;

    /// Public key for an owned key id.
    fn public_key(&self, key_id: &KeyId) -> Option<PublicKey>;

    /// All addresses owned by the wallet, used to probe incoming
    /// messages and to pick the outbox address.
    fn owned_addresses(&self) -> Vec<Address>;
}

/// The host's chain scanner, harvesting public keys from transaction
/// inputs into the directory.
pub trait ChainScanner: Send + Sync {
    /// Walks the chain and feeds every `(key_id, pubkey)` pair found
    /// in transaction inputs to `sink`.
    fn harvest_keys(&self, sink: &mut dyn FnMut(KeyId, PublicKey)) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notifications the node emits toward the host's observer (UI,
/// notification fan-out).
#[derive(Clone, Debug)]
pub enum SmsgEvent {
    /// A message was saved to the inbox.
    InboxChanged {
        /// Record key (`timestamp ∥ sample`).
        key: [u8; 16],
        /// Owned address the message was received with.
        addr_to: String,
    },
    /// A sent-message copy was saved to the outbox.
    OutboxChanged {
        /// Record key of the outbox copy.
        key: [u8; 16],
        /// Destination address of the original message.
        addr_to: String,
    },
}
