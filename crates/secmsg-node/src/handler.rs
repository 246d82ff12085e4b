//! The anti-entropy protocol handler.
//!
//! Reconciliation per peer runs inventory → show → have → want → msg:
//! a peer advertises bucket digests, the other side requests token
//! lists for buckets that differ, asks for the tokens it is missing
//! (locking the bucket while the transfer is in flight), and finally
//! receives the envelopes. Every handler runs under the single core
//! mutex, so each command is atomic against the bucket map and the
//! peer table.
//!
//! Misbehavior is scored through the host overlay and the offending
//! frame dropped; the core never closes connections itself.

use rand::Rng;

use secmsg_protocol::wire::{self, commands, InvEntry, TokenRef};
use secmsg_protocol::{
    pow, MessageHeader, SMSG_BUCKET_LEN, SMSG_BUNCH_MAX_MSGS, SMSG_HDR_LEN, SMSG_RETENTION,
    SMSG_SEND_DELAY, SMSG_TIME_LEEWAY,
};
use secmsg_store::bucket::BucketToken;
use secmsg_types::{unix_time, SmsgError};

use crate::node::{CoreState, SecureMsgNode};
use crate::peer::PeerState;
use crate::{scan, PeerHandle};

/// Looks up a peer's state, creating it with a fresh monotone id on
/// first sight.
pub(crate) fn peer_entry(state: &mut CoreState, peer: PeerHandle) -> &mut PeerState {
    if !state.peers.contains_key(&peer) {
        let id = state.next_peer_id;
        state.next_peer_id += 1;
        state.peers.insert(
            peer,
            PeerState {
                peer_id: id,
                ..PeerState::default()
            },
        );
    }
    state.peers.entry(peer).or_default()
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Handles one incoming `smsg*` frame. Called on the host's message
/// thread; takes the core lock for the whole command.
pub(crate) fn receive_data(node: &SecureMsgNode, peer: PeerHandle, command: &str, payload: &[u8]) {
    tracing::debug!(peer, command, bytes = payload.len(), "received");

    let mut core = node.lock_core();
    let state = &mut *core;
    match command {
        commands::INV => handle_inv(node, state, peer, payload),
        commands::SHOW => handle_show(node, state, peer, payload),
        commands::HAVE => handle_have(node, state, peer, payload),
        commands::WANT => handle_want(node, state, peer, payload),
        commands::MSG => handle_msg(node, state, peer, payload),
        commands::MATCH => handle_match(node, state, peer, payload),
        commands::PING => {
            // Initial contact; answer so the peer enables this node.
            node.overlay.push_message(peer, commands::PONG, &[]);
        }
        commands::PONG => {
            tracing::debug!(peer, "peer replied, secure messaging enabled for it");
            peer_entry(state, peer).enabled = true;
        }
        commands::DISABLED => {
            tracing::debug!(peer, "peer disabled secure messaging");
            peer_entry(state, peer).enabled = false;
        }
        commands::IGNORE => handle_ignore(node, state, peer, payload),
        other => {
            tracing::debug!(peer, command = other, "unknown command ignored");
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

fn handle_inv(node: &SecureMsgNode, state: &mut CoreState, peer: PeerHandle, data: &[u8]) {
    let now = unix_time();

    let peer_state = peer_entry(state, peer);
    if now < peer_state.ignore_until {
        tracing::debug!(peer, until = peer_state.ignore_until, "ignoring peer");
        return;
    }

    let entries = match wire::decode_inv(data) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(peer, error = %e, "bad inventory");
            node.overlay.misbehaving(peer, 1);
            return;
        }
    };

    // More bucket headers than the retention window can hold is a lie.
    let max_buckets = (SMSG_RETENTION / SMSG_BUCKET_LEN + 1) as usize;
    if entries.len() > max_buckets {
        tracing::debug!(peer, sent = entries.len(), max_buckets, "impossible bucket count");
        node.overlay.misbehaving(peer, 1);
        return;
    }

    let mut show: Vec<i64> = Vec::new();
    let mut locked: u32 = 0;
    for entry in &entries {
        if entry.bucket < now - SMSG_RETENTION {
            tracing::debug!(peer, bucket = entry.bucket, "peer bucket has expired");
            if entry.bucket < now - SMSG_RETENTION - SMSG_TIME_LEEWAY {
                node.overlay.misbehaving(peer, 1);
            }
            continue;
        }
        if entry.bucket > now + SMSG_TIME_LEEWAY {
            tracing::debug!(peer, bucket = entry.bucket, "peer bucket is in the future");
            node.overlay.misbehaving(peer, 1);
            continue;
        }
        if entry.count < 1 {
            continue;
        }

        let (local_count, local_hash, is_locked) = state
            .store
            .bucket(entry.bucket)
            .map(|b| (b.count(), b.hash, b.lock_count > 0))
            .unwrap_or((0, 0, false));

        if is_locked {
            tracing::debug!(peer, bucket = entry.bucket, "bucket locked, awaiting transfer");
            locked += 1;
            continue;
        }

        // If this node holds more, the peer will pull instead; equal
        // counts with differing digests still need the exchange.
        if local_count < entry.count || (local_count == entry.count && local_hash != entry.hash) {
            show.push(entry.bucket);
        }
    }

    if !show.is_empty() {
        tracing::debug!(peer, buckets = show.len(), "requesting bucket contents");
        node.overlay
            .push_message(peer, commands::SHOW, &wire::encode_show(&show));
    } else if locked == 0 {
        // Nothing wanted and nothing pending: tell the peer to stop
        // re-announcing until its buckets change.
        node.overlay
            .push_message(peer, commands::MATCH, &wire::encode_time(now));
    }
}

// ---------------------------------------------------------------------------
// Show → Have
// ---------------------------------------------------------------------------

fn handle_show(node: &SecureMsgNode, state: &mut CoreState, peer: PeerHandle, data: &[u8]) {
    let buckets = match wire::decode_show(data) {
        Ok(buckets) => buckets,
        Err(e) => {
            tracing::debug!(peer, error = %e, "bad show request");
            node.overlay.misbehaving(peer, 1);
            return;
        }
    };
    tracing::debug!(peer, buckets = buckets.len(), "peer wants bucket contents");

    for start in buckets {
        let Some(bucket) = state.store.bucket(start) else {
            tracing::debug!(peer, bucket = start, "don't have bucket");
            continue;
        };
        let tokens: Vec<TokenRef> = bucket
            .tokens
            .iter()
            .map(|t| TokenRef {
                timestamp: t.timestamp,
                sample: t.sample,
            })
            .collect();
        node.overlay.push_message(
            peer,
            commands::HAVE,
            &wire::encode_token_list(start, &tokens),
        );
    }
}

// ---------------------------------------------------------------------------
// Have → Want
// ---------------------------------------------------------------------------

fn handle_have(node: &SecureMsgNode, state: &mut CoreState, peer: PeerHandle, data: &[u8]) {
    let now = unix_time();
    let (start, tokens) = match wire::decode_token_list(data) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!(peer, error = %e, "bad have list");
            node.overlay.misbehaving(peer, 1);
            return;
        }
    };

    if start < now - SMSG_RETENTION {
        tracing::debug!(peer, bucket = start, "peer bucket has expired");
        return;
    }
    if start > now + SMSG_TIME_LEEWAY {
        tracing::debug!(peer, bucket = start, "peer bucket is in the future");
        node.overlay.misbehaving(peer, 1);
        return;
    }

    if state.store.bucket(start).map_or(false, |b| b.lock_count > 0) {
        tracing::debug!(peer, bucket = start, "bucket locked, awaiting transfer");
        return;
    }

    let peer_id = peer_entry(state, peer).peer_id;

    let missing: Vec<TokenRef> = match state.store.bucket(start) {
        Some(bucket) => tokens
            .iter()
            .filter(|t| {
                !bucket
                    .tokens
                    .contains(&BucketToken::probe(t.timestamp, t.sample))
            })
            .copied()
            .collect(),
        None => tokens,
    };

    if missing.is_empty() {
        return;
    }

    tracing::debug!(peer, bucket = start, wanted = missing.len(), "locking bucket");
    // Lock for at most 3 GC ticks; cleared when the peer's envelopes
    // arrive.
    let bucket = state.store.bucket_entry(start);
    bucket.lock_count = 3;
    bucket.lock_peer_id = peer_id;
    node.overlay.push_message(
        peer,
        commands::WANT,
        &wire::encode_token_list(start, &missing),
    );
}

// ---------------------------------------------------------------------------
// Want → Msg
// ---------------------------------------------------------------------------

fn handle_want(node: &SecureMsgNode, state: &mut CoreState, peer: PeerHandle, data: &[u8]) {
    let (start, tokens) = match wire::decode_token_list(data) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!(peer, error = %e, "bad want list");
            node.overlay.misbehaving(peer, 1);
            return;
        }
    };

    let Some(bucket) = state.store.bucket(start) else {
        tracing::debug!(peer, bucket = start, "don't have bucket");
        return;
    };

    let mut builder = wire::BunchBuilder::new(start);
    for token in tokens {
        let probe = BucketToken::probe(token.timestamp, token.sample);
        let Some(stored) = bucket.tokens.get(&probe) else {
            tracing::debug!(peer, timestamp = token.timestamp, "don't have wanted message");
            continue;
        };
        match state.store.retrieve(stored) {
            Ok(envelope) => builder.push(&envelope),
            Err(e) => {
                tracing::warn!(timestamp = token.timestamp, error = %e, "retrieve failed");
            }
        }
    }

    for frame in builder.finish() {
        tracing::debug!(peer, bucket = start, bytes = frame.len(), "sending message bunch");
        node.overlay.push_message(peer, commands::MSG, &frame);
    }
}

// ---------------------------------------------------------------------------
// Msg receive
// ---------------------------------------------------------------------------

fn handle_msg(node: &SecureMsgNode, state: &mut CoreState, peer: PeerHandle, data: &[u8]) {
    let now = unix_time();
    let (n_bunch, start, body) = match wire::decode_bunch(data) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!(peer, error = %e, "bad message bunch");
            node.overlay.misbehaving(peer, 1);
            return;
        }
    };

    if start > now + SMSG_TIME_LEEWAY || start < now - SMSG_RETENTION {
        tracing::debug!(peer, bucket = start, "bunch for an invalid bucket time");
        return;
    }

    if n_bunch == 0 || n_bunch > SMSG_BUNCH_MAX_MSGS {
        tracing::debug!(peer, n_bunch, "invalid message count in bunch");
        node.overlay.misbehaving(peer, 1);
        // Release the lock so reconciliation can restart.
        if let Some(bucket) = state.store.bucket_mut(start) {
            bucket.lock_count = 0;
        }
        return;
    }

    let mut pos = 0usize;
    for _ in 0..n_bunch {
        if body.len() - pos < SMSG_HDR_LEN {
            tracing::debug!(peer, "bunch shorter than its message count");
            node.overlay.misbehaving(peer, 1);
            break;
        }
        let header = match MessageHeader::from_bytes(&body[pos..]) {
            Ok(header) => header,
            Err(_) => {
                node.overlay.misbehaving(peer, 1);
                break;
            }
        };
        let total = SMSG_HDR_LEN + header.n_payload as usize;
        if body.len() - pos < total {
            tracing::debug!(peer, "envelope payload truncated");
            node.overlay.misbehaving(peer, 1);
            break;
        }
        let payload = &body[pos + SMSG_HDR_LEN..pos + total];
        pos += total;

        match pow::validate(&header, payload) {
            // Invalid work is expensive to fake only in one direction:
            // score it much harder than structural noise.
            Err(SmsgError::InvalidPow) => {
                node.overlay.misbehaving(peer, 10);
                continue;
            }
            Err(e) => {
                tracing::debug!(peer, error = %e, "envelope failed validation");
                node.overlay.misbehaving(peer, 1);
                continue;
            }
            Ok(()) => {}
        }

        // Hash once after the whole bunch, not per message.
        match state.store.store(&header, payload, false, now) {
            Ok(()) => {}
            Err(SmsgError::Duplicate) => continue,
            Err(SmsgError::IoError { reason }) => {
                tracing::warn!(peer, reason = %reason, "store failed, abandoning bunch");
                break;
            }
            Err(e) => {
                tracing::debug!(peer, error = %e, "envelope rejected by store");
                continue;
            }
        }

        if let Err(e) = scan::scan_message(node, &header, payload) {
            tracing::debug!(error = %e, "inbox scan failed");
        }
    }

    let Some(bucket) = state.store.bucket_mut(start) else {
        tracing::debug!(peer, bucket = start, "don't have bucket");
        return;
    };
    // Transfer complete: release the lock and publish one atomic
    // digest transition covering the whole bunch.
    bucket.lock_count = 0;
    bucket.lock_peer_id = 0;
    bucket.rehash(now);
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

fn handle_match(node: &SecureMsgNode, state: &mut CoreState, peer: PeerHandle, data: &[u8]) {
    let time = match wire::decode_time(data) {
        Ok(time) => time,
        Err(e) => {
            tracing::debug!(peer, error = %e, "bad match message");
            node.overlay.misbehaving(peer, 1);
            return;
        }
    };
    let now = unix_time();
    let clamped = time.min(now);
    peer_entry(state, peer).last_matched = clamped;
    tracing::debug!(peer, matched = clamped, "peer buckets matched");
}

fn handle_ignore(node: &SecureMsgNode, state: &mut CoreState, peer: PeerHandle, data: &[u8]) {
    let time = match wire::decode_time(data) {
        Ok(time) => time,
        Err(e) => {
            tracing::debug!(peer, error = %e, "bad ignore message");
            node.overlay.misbehaving(peer, 1);
            return;
        }
    };
    // The peer is ignoring this node; reciprocate for the same span.
    peer_entry(state, peer).ignore_until = time;
    tracing::debug!(peer, until = time, "peer is ignoring this node, ignoring it too");
}

// ---------------------------------------------------------------------------
// Send tick
// ---------------------------------------------------------------------------

/// One send opportunity toward `peer`: handshake on first contact,
/// then a rate-limited bucket inventory.
pub(crate) fn send_tick(node: &SecureMsgNode, peer: PeerHandle, now: i64) {
    let mut core = node.lock_core();
    let state = &mut *core;

    let peer_state = peer_entry(state, peer);
    if peer_state.last_seen == 0 {
        // First contact: ping once, wait for the pong before sending
        // anything else.
        tracing::debug!(peer, peer_id = peer_state.peer_id, "new peer, sending ping");
        peer_state.last_seen = now;
        node.overlay.push_message(peer, commands::PING, &[]);
        return;
    }

    if !peer_state.enabled
        || now - peer_state.last_seen < SMSG_SEND_DELAY
        || now < peer_state.ignore_until
    {
        return;
    }

    // Periodically forget the match point so the full inventory is
    // re-announced; keeps peers converging after missed updates.
    if peer_state.wake_counter < 1 {
        peer_state.last_matched = 0;
        peer_state.wake_counter = rand::thread_rng().gen_range(3..=120);
        tracing::debug!(
            peer,
            wake_counter = peer_state.wake_counter,
            "re-announcing bucket inventory"
        );
    }
    peer_state.wake_counter -= 1;
    peer_state.last_seen = now;
    let last_matched = peer_state.last_matched;

    let entries: Vec<InvEntry> = state
        .store
        .buckets()
        .iter()
        .filter(|(_, b)| b.time_changed >= last_matched && b.count() >= 1)
        .map(|(start, b)| InvEntry {
            bucket: *start,
            count: b.count(),
            hash: b.hash,
        })
        .collect();

    if !entries.is_empty() {
        tracing::debug!(peer, buckets = entries.len(), "sending bucket inventory");
        node.overlay
            .push_message(peer, commands::INV, &wire::encode_inv(&entries));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
