//! Peer-to-peer replication: peer table, RPC client/server, and the four
//! background workers (crawler, health checker, fetcher, pusher).

pub mod crawler;
pub mod fetcher;
pub mod health;
pub mod peer_table;
pub mod pusher;
pub mod rpc;
pub mod server;

pub use crawler::PeerCrawler;
pub use fetcher::ZonefileFetcher;
pub use health::InventoryHealthChecker;
pub use peer_table::PeerTable;
pub use pusher::ZonefilePusher;
pub use rpc::AtlasRpcClient;

use crate::node::NodeState;
use atlas_core::ZonefileHash;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Workers pace themselves to at most one step per second.
pub(crate) async fn pace(started: std::time::Instant) {
    let floor = std::time::Duration::from_secs(1);
    let elapsed = started.elapsed();
    if elapsed < floor {
        tokio::time::sleep(floor - elapsed).await;
    }
}

/// Host part of a `host:port` string.
pub fn host_of(hostport: &str) -> Option<&str> {
    hostport.rsplit_once(':').map(|(host, _)| host)
}

/// Eviction slot for a host: the nonce randomizes the bucket so an attacker
/// cannot grind addresses into a victim's slot ahead of time.
pub fn peer_slot(nonce: u32, host: &str, slot_max: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(host.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % slot_max
}

/// Add a peer to the directory and the peer table, subject to slot
/// eviction: if the slot is occupied, every occupant is pinged (with no
/// locks held) and the insert is declined while any occupant answers.
///
/// Returns true if the peer was added or already present.
pub async fn add_peer_checked(
    state: &NodeState,
    hostport: &str,
    now: u64,
    ping_on_evict: bool,
) -> bool {
    if hostport == state.local_hostport {
        return false;
    }
    let host = match host_of(hostport) {
        Some(h) if !h.is_empty() => h,
        _ => return false,
    };
    let nonce: u32 = rand::random();
    let slot = peer_slot(nonce, host, state.config.protocol.slot_max);
    add_peer_at_slot(state, hostport, slot, now, ping_on_evict).await
}

/// [`add_peer_checked`] with an explicit slot.
pub async fn add_peer_at_slot(
    state: &NodeState,
    hostport: &str,
    slot: u64,
    now: u64,
    ping_on_evict: bool,
) -> bool {
    if state.peers.contains(hostport) {
        debug!(peer = hostport, "Peer already in the peer table");
        return true;
    }

    if ping_on_evict {
        let occupants = state.catalog.lock().peers_in_slot(slot);
        for occupant in occupants.iter().filter(|o| o.as_str() != hostport) {
            // no locks are held across this call
            if state.rpc.ping(&state.peers, occupant).await {
                debug!(
                    peer = hostport,
                    occupant = occupant.as_str(),
                    slot,
                    "Slot occupant is still alive; declining insert"
                );
                return false;
            }
        }
    }

    state.catalog.lock().insert_peer(hostport, slot, now);
    state.peers.register(hostport, false, false);
    true
}

/// Drop a peer from the directory and, unless flagged, the peer table.
pub fn remove_peer(state: &NodeState, hostport: &str) {
    state.catalog.lock().remove_peer(hostport);
    state.peers.remove_unless_flagged(hostport);
}

/// Queue a remote-reported peer for validation by the crawler. Silently
/// drops the peer when the queue is full or the peer is already known.
pub fn peer_enqueue(state: &NodeState, hostport: &str) -> bool {
    if hostport == state.local_hostport || state.peers.contains(hostport) {
        return false;
    }
    let mut queue = state.peer_queue.lock();
    if queue.len() < state.config.max_new_peers() {
        queue.push_back(hostport.to_string());
        true
    } else {
        false
    }
}

/// Drain the pending-peer queue.
pub fn peer_dequeue_all(state: &NodeState) -> Vec<String> {
    state.peer_queue.lock().drain(..).collect()
}

/// Queue a zonefile for outbound propagation. A noop when we do not know
/// the hash, when every known peer already has it, or when the queue is at
/// capacity.
pub fn push_enqueue(state: &NodeState, hash: ZonefileHash, body: Vec<u8>) -> bool {
    let bits = state.catalog.lock().get_bits(&hash);
    if bits.is_empty() {
        return false;
    }
    if state.peers.find_push_peers(&bits).is_empty() {
        debug!(hash = %hash, "All peers have this zonefile; not queueing");
        return false;
    }

    let mut queue = state.push_queue.lock();
    if queue.len() < state.config.protocol.max_queued_zonefiles {
        queue.push_back((hash, body));
        true
    } else {
        false
    }
}

/// Dequeue one zonefile to propagate.
pub fn push_dequeue(state: &NodeState) -> Option<(ZonefileHash, Vec<u8>)> {
    state.push_queue.lock().pop_front()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_splits_on_last_colon() {
        assert_eq!(host_of("10.0.0.1:20443"), Some("10.0.0.1"));
        assert_eq!(host_of("node.example.com:80"), Some("node.example.com"));
        assert_eq!(host_of("noport"), None);
    }

    #[test]
    fn peer_slot_is_bounded_and_nonce_sensitive() {
        for nonce in 0..64u32 {
            assert!(peer_slot(nonce, "10.0.0.1", 16) < 16);
        }
        // at least one nonce pair should disagree for the same host
        let slots: std::collections::HashSet<u64> =
            (0..64u32).map(|n| peer_slot(n, "10.0.0.1", 65536)).collect();
        assert!(slots.len() > 1);
    }
}
