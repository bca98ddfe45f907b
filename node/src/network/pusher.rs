//! Outbound zonefile propagation.
//!
//! Zonefiles received out-of-band (through our own RPC surface) are queued
//! and offered to every peer whose mirrored inventory says it lacks them.

use super::push_dequeue;
use crate::node::NodeState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Worker that drains the push queue.
pub struct ZonefilePusher {
    state: Arc<NodeState>,
    stop: Arc<AtomicBool>,
}

impl ZonefilePusher {
    pub fn new(state: Arc<NodeState>, stop: Arc<AtomicBool>) -> Self {
        Self { state, stop }
    }

    /// Push one queued zonefile to the peers that lack it. Returns the
    /// number of peers contacted.
    pub async fn step(&self) -> usize {
        let Some((hash, body)) = push_dequeue(&self.state) else {
            return 0;
        };

        let bits = self.state.catalog.lock().get_bits(&hash);
        if bits.is_empty() {
            // not a zonefile we know about; drop it
            debug!(hash = %hash, "Dropping push of unknown zonefile");
            return 0;
        }

        let peers = self.state.peers.find_push_peers(&bits);
        if peers.is_empty() {
            debug!(hash = %hash, "All peers have this zonefile");
            return 0;
        }

        let mut contacted = 0usize;
        for peer in peers {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            debug!(peer = peer.as_str(), hash = %hash, "Pushing zonefile");
            let saved = self
                .state
                .rpc
                .put_zonefiles(&self.state.peers, &peer, std::slice::from_ref(&body))
                .await;
            if saved.as_deref().and_then(|s| s.first()) == Some(&1) {
                debug!(peer = peer.as_str(), hash = %hash, "Peer saved pushed zonefile");
            }
            contacted += 1;
        }
        contacted
    }

    pub async fn run(self) {
        debug!("Zonefile pusher started");
        while !self.stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.step().await;
            super::pace(started).await;
        }
        debug!("Zonefile pusher stopped");
    }
}
