//! Zonefile acquisition, rarest-first.
//!
//! Each round scans the catalog for zonefiles we lack, works out which
//! peers claim to have each one, and fetches the rarest first: widely-held
//! zonefiles will still be there next round, while a zonefile held by one
//! peer may not be. Long-term storage is consulted once per hash before
//! the network.

use super::now_secs;
use crate::node::NodeState;
use crate::storage::fetch_from_drivers;
use atlas_core::ZonefileHash;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Catalog rows scanned per page.
const MISSING_PAGE_SIZE: u64 = 10_000;

/// A zonefile we lack, with the peers that claim to have it.
#[derive(Debug, Clone)]
pub struct MissingZonefile {
    pub hash: ZonefileHash,
    /// Zero-based inventory bits for every anchor of this hash.
    pub bits: Vec<usize>,
    pub tried_storage: bool,
    /// Peers whose mirrored inventory claims any of `bits`.
    pub peers: Vec<String>,
}

/// Scan the catalog for missing zonefiles and rank them rarest-first
/// (fewest claiming peers first, ties by hash).
pub fn missing_zonefile_availability(state: &NodeState) -> Vec<MissingZonefile> {
    let mut rows = Vec::new();
    let mut offset = 0u64;
    loop {
        let page = state.catalog.lock().find_missing(offset, MISSING_PAGE_SIZE);
        if page.is_empty() {
            break;
        }
        offset += page.len() as u64;
        rows.extend(page);
    }

    let mut by_hash: HashMap<ZonefileHash, MissingZonefile> = HashMap::new();
    for row in rows {
        let entry = by_hash.entry(row.hash).or_insert_with(|| MissingZonefile {
            hash: row.hash,
            bits: Vec::new(),
            tried_storage: false,
            peers: Vec::new(),
        });
        entry.bits.push((row.inv_index - 1) as usize);
        entry.tried_storage = entry.tried_storage || row.tried_storage;
    }

    let mut missing: Vec<MissingZonefile> = by_hash
        .into_values()
        .map(|mut mz| {
            mz.peers = state.peers.peers_with_any_bit(&mz.bits);
            mz
        })
        .collect();

    missing.sort_by(|a, b| {
        a.peers
            .len()
            .cmp(&b.peers.len())
            .then_with(|| a.hash.cmp(&b.hash))
    });
    missing
}

/// Worker that pulls missing zonefiles from storage and peers.
pub struct ZonefileFetcher {
    state: Arc<NodeState>,
    stop: Arc<AtomicBool>,
}

impl ZonefileFetcher {
    pub fn new(state: Arc<NodeState>, stop: Arc<AtomicBool>) -> Self {
        Self { state, stop }
    }

    /// Store a fetched body and flip its presence in the catalog (which
    /// updates the local inventory bitmap in the same critical section).
    fn store_zonefile(&self, hash: &ZonefileHash, body: &[u8], origin: &str) -> bool {
        if let Err(e) = self.state.store.put(hash, body) {
            error!(hash = %hash, error = %e, "Failed to store zonefile");
            return false;
        }
        self.state.catalog.lock().set_present(hash, true);
        debug!(hash = %hash, origin, "Acquired zonefile");
        true
    }

    /// One fetch round. Returns the number of zonefiles acquired.
    pub async fn step(&self) -> usize {
        let missing = missing_zonefile_availability(&self.state);
        if missing.is_empty() {
            return 0;
        }
        debug!(count = missing.len(), "Missing zonefiles");

        // which hashes each peer can serve
        let mut origins: HashMap<&str, Vec<ZonefileHash>> = HashMap::new();
        for mz in &missing {
            for peer in &mz.peers {
                origins.entry(peer.as_str()).or_default().push(mz.hash);
            }
        }
        let bits_by_hash: HashMap<ZonefileHash, &[usize]> = missing
            .iter()
            .map(|mz| (mz.hash, mz.bits.as_slice()))
            .collect();

        let mut still_missing: HashSet<ZonefileHash> =
            missing.iter().map(|mz| mz.hash).collect();
        let mut fetched = 0usize;

        for mz in &missing {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if !still_missing.contains(&mz.hash) {
                // acquired in an earlier batch this round
                continue;
            }

            if !mz.tried_storage {
                debug!(hash = %mz.hash, "Trying long-term storage");
                let body = fetch_from_drivers(&self.state.drivers, &mz.hash);
                self.state.catalog.lock().set_tried_storage(&mz.hash, true);
                if let Some(body) = body {
                    if self.store_zonefile(&mz.hash, &body, "storage") {
                        still_missing.remove(&mz.hash);
                        fetched += 1;
                        continue;
                    }
                }
            }

            if mz.peers.is_empty() {
                debug!(hash = %mz.hash, "No peer claims this zonefile yet");
                continue;
            }

            // try the claiming peers healthiest-first, batching every
            // still-missing hash each peer claims
            let ranked = self.state.peers.rank_by_health(Some(&mz.peers), true);
            for peer in ranked {
                if !still_missing.contains(&mz.hash) {
                    break;
                }
                let batch: Vec<ZonefileHash> = origins
                    .get(peer.as_str())
                    .map(|hashes| {
                        hashes
                            .iter()
                            .filter(|h| still_missing.contains(h))
                            .copied()
                            .collect()
                    })
                    .unwrap_or_default();
                if batch.is_empty() {
                    continue;
                }

                debug!(peer = peer.as_str(), count = batch.len(), "Requesting zonefiles");
                let mut delivered: HashSet<ZonefileHash> = HashSet::new();
                match self
                    .state
                    .rpc
                    .get_zonefiles(&self.state.peers, &peer, &batch)
                    .await
                {
                    Some(bodies) => {
                        for (hash, body) in bodies {
                            if !batch.contains(&hash) {
                                warn!(peer = peer.as_str(), hash = %hash, "Unsolicited zonefile");
                                continue;
                            }
                            if self.store_zonefile(&hash, &body, &peer) {
                                delivered.insert(hash);
                                still_missing.remove(&hash);
                                fetched += 1;
                            }
                        }
                    }
                    None => {
                        debug!(peer = peer.as_str(), "No zonefile data received");
                    }
                }

                // the peer advertised hashes it did not deliver: clear
                // those bits in our mirror so we stop asking it
                for hash in batch {
                    if !delivered.contains(&hash) {
                        debug!(peer = peer.as_str(), hash = %hash, "Peer did not deliver");
                        if let Some(bits) = bits_by_hash.get(&hash) {
                            self.state.peers.set_remote_bits(&peer, bits, false);
                        }
                    }
                }
            }
        }

        if fetched > 0 {
            debug!(fetched, at = now_secs(), "Fetch round complete");
        }
        fetched
    }

    pub async fn run(self) {
        debug!("Zonefile fetcher started");
        while !self.stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.step().await;
            super::pace(started).await;
        }
        debug!("Zonefile fetcher stopped");
    }
}
