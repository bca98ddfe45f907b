//! Peer inventory refresh.
//!
//! Keeps our mirror of each peer's inventory bitmap current. Old bits are
//! stable (near-100% replicated zonefiles), while the tail changes as new
//! zonefiles propagate, so a refresh can truncate at a byte offset and
//! re-download only the suffix; the default offset of 0 resyncs the whole
//! bitmap.

use super::now_secs;
use crate::node::NodeState;
use atlas_core::inventory;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Re-download a peer's inventory from `byte_offset` onward in fixed-size
/// windows. The mirrored inventory always reflects what was downloaded;
/// the refresh timestamp is only stamped when every window arrived.
pub async fn refresh_peer_inventory(
    state: &NodeState,
    hostport: &str,
    byte_offset: usize,
) -> bool {
    let expected_bits = state.catalog.lock().inventory_len_bits();

    // truncate the mirror, then re-obtain the trailing byte: it may have
    // been padding on the previous sync
    let Some(mut mirror) = state.peers.truncate_remote_inventory(hostport, byte_offset) else {
        debug!(peer = hostport, "No longer a peer; skipping inventory refresh");
        return false;
    };
    mirror.pop();
    let mut bit_offset = mirror.len() as u64 * 8;

    let window = state.config.protocol.inventory_window;
    debug!(
        peer = hostport,
        from = bit_offset,
        to = expected_bits,
        "Downloading zonefile inventory"
    );

    let mut complete = true;
    while bit_offset < expected_bits {
        match state
            .rpc
            .get_inventory_range(&state.peers, hostport, bit_offset, window)
            .await
        {
            Some(chunk) => {
                let end_of_inventory = (chunk.len() as u64) < window / 8;
                mirror.extend_from_slice(&chunk);
                bit_offset += window;
                if end_of_inventory {
                    break;
                }
            }
            None => {
                debug!(
                    peer = hostport,
                    offset = bit_offset,
                    "Inventory download failed partway"
                );
                complete = false;
                break;
            }
        }
    }

    // the peer may have been evicted while we were off the lock
    if !state.peers.set_remote_inventory(hostport, mirror.clone()) {
        debug!(peer = hostport, "Peer vanished during inventory refresh");
        return false;
    }

    if complete {
        state.peers.stamp_inventory_refresh(hostport, now_secs());
        debug!(
            peer = hostport,
            inv = %inventory::to_bit_string(&mirror),
            "Peer inventory refreshed"
        );
    }
    complete
}

/// Worker that refreshes stale peer inventories.
pub struct InventoryHealthChecker {
    state: Arc<NodeState>,
    stop: Arc<AtomicBool>,
}

impl InventoryHealthChecker {
    pub fn new(state: Arc<NodeState>, stop: Arc<AtomicBool>) -> Self {
        Self { state, stop }
    }

    /// Refresh every peer whose mirrored inventory is shorter than ours or
    /// older than the ping interval.
    pub async fn step(&self) {
        let local_len_bytes = self.state.catalog.lock().inventory().len();
        let ping_interval = self.state.config.protocol.ping_interval;
        let now = now_secs();

        let stale: Vec<String> = self
            .state
            .peers
            .hostports()
            .into_iter()
            .filter(|peer| {
                !self
                    .state
                    .peers
                    .has_fresh_inventory(peer, local_len_bytes, now, ping_interval)
            })
            .collect();

        debug!(count = stale.len(), "Peers with stale inventories");
        for peer in stale {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if !refresh_peer_inventory(&self.state, &peer, 0).await {
                warn!(peer = peer.as_str(), "Failed to refresh zonefile inventory");
            }
        }
    }

    pub async fn run(self) {
        debug!("Inventory health checker started");
        while !self.stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.step().await;
            super::pace(started).await;
        }
        debug!("Inventory health checker stopped");
    }
}
