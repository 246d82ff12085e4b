//! Per-peer protocol state.

/// Messaging state attached to one peer connection.
///
/// Created on first contact (either direction) and dropped when the
/// host reports the connection gone. All fields are guarded by the
/// core mutex together with the bucket map.
#[derive(Clone, Debug, Default)]
pub struct PeerState {
    /// Locally assigned id, monotone over the node's lifetime.
    /// Distinct from the host's connection handle; bucket locks
    /// record this id.
    pub peer_id: u32,
    /// Whether the peer answered the handshake ping. Inventory is
    /// only sent to enabled peers.
    pub enabled: bool,
    /// Last time the send tick ran for this peer, unix seconds.
    /// Zero means no contact yet.
    pub last_seen: i64,
    /// Time the peer last reported matching buckets; buckets whose
    /// `time_changed` is older are not re-announced.
    pub last_matched: i64,
    /// Until when this peer is ignored, unix seconds.
    pub ignore_until: i64,
    /// Send ticks remaining until the inventory filter resets and
    /// everything is re-announced.
    pub wake_counter: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_peer_is_disabled_and_unseen() {
        let peer = PeerState::default();
        assert!(!peer.enabled);
        assert_eq!(peer.last_seen, 0);
        assert_eq!(peer.last_matched, 0);
        assert_eq!(peer.ignore_until, 0);
    }
}
