//! Peer discovery by biased random walk.
//!
//! The crawler converges on a large, unbiased peer set while keeping
//! eclipse attacks expensive. Discovery runs a Metropolis–Hastings random
//! walk with delayed acceptance (MHRWDA, Lee/Xu/Eun, SIGMETRICS 2012) over
//! the peer graph: plain MH over-samples high-degree nodes, and the
//! delayed-acceptance term damps immediate backtracking to the previous
//! node. Any RPC failure aborts the current transition and the walk
//! restarts from a random peer in the directory.

use super::{add_peer_checked, now_secs, peer_dequeue_all, remove_peer};
use crate::node::NodeState;
use atlas_core::{ProtocolVersion, MIN_PROTOCOL_VERSION};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// New peers validated per step.
const NEW_PEERS_PER_STEP: usize = 10;
/// Unhealthy peers removed per step.
const REMOVALS_PER_STEP: usize = 10;
/// Requests a peer must have seen before poor health can evict it.
const MIN_REQUESTS_FOR_REMOVAL: usize = 10;

/// Accept the MH transition from a node of degree `current_degree` to one
/// of degree `next_degree`?
fn accept_transition(p: f64, current_degree: usize, next_degree: usize) -> bool {
    p <= (current_degree as f64 / next_degree as f64).min(1.0)
}

/// Delayed acceptance: having drawn the previous node again, accept the
/// alternate neighbor instead?
fn accept_alternate(q: f64, current_degree: usize, alt_degree: usize, prev_degree: usize) -> bool {
    let toward_alt = (current_degree as f64 / alt_degree as f64).powi(2).min(1.0);
    let from_prev = (prev_degree as f64 / current_degree as f64).powi(2).max(1.0);
    q <= 1.0_f64.min(toward_alt).min(from_prev)
}

fn version_ok(version: &str) -> bool {
    version
        .parse::<ProtocolVersion>()
        .map_or(false, |v| v >= MIN_PROTOCOL_VERSION)
}

/// Append `found` hostports to the pending new-peer list, deduplicating
/// and enforcing the cap.
fn extend_new_peers(new_peers: &mut Vec<String>, found: &[String], cap: usize) {
    let seen: HashSet<&String> = new_peers.iter().collect();
    let fresh: Vec<String> = found
        .iter()
        .filter(|p| !seen.contains(*p))
        .cloned()
        .collect();
    new_peers.extend(fresh);
    new_peers.truncate(cap);
}

/// Worker that continuously crawls the peer graph.
pub struct PeerCrawler {
    state: Arc<NodeState>,
    stop: Arc<AtomicBool>,

    current_peer: Option<String>,
    current_peer_neighbors: Vec<String>,
    prev_peer: Option<String>,
    prev_peer_degree: usize,

    new_peers: Vec<String>,
    last_clean_time: u64,
}

impl PeerCrawler {
    pub fn new(state: Arc<NodeState>, stop: Arc<AtomicBool>) -> Self {
        Self {
            state,
            stop,
            current_peer: None,
            current_peer_neighbors: Vec::new(),
            prev_peer: None,
            prev_peer_degree: 0,
            new_peers: Vec::new(),
            last_clean_time: 0,
        }
    }

    /// Neighbors of a peer; asking about ourselves reads the local live
    /// set instead of going over the network.
    async fn get_neighbors(&self, hostport: &str) -> Option<Vec<String>> {
        if hostport == self.state.local_hostport {
            return Some(
                self.state
                    .peers
                    .live_neighbors(None, self.state.config.protocol.min_peer_health),
            );
        }
        self.state
            .rpc
            .get_neighbors(&self.state.peers, hostport)
            .await
    }

    /// Validate up to `count` candidates with `getinfo` and insert the
    /// survivors into the peer directory. Returns the candidates handled
    /// (validated or already known).
    async fn add_new_peers(&self, count: usize, candidates: &[String]) -> Vec<String> {
        let current: HashSet<String> = self.state.peers.hostports().into_iter().collect();
        let mut handled = Vec::new();
        let mut attempts = 0usize;

        for peer in candidates {
            if attempts >= count.min(candidates.len()) {
                break;
            }
            if peer == &self.state.local_hostport {
                continue;
            }
            if current.contains(peer) {
                debug!(peer = peer.as_str(), "Peer is already known");
                handled.push(peer.clone());
                continue;
            }

            attempts += 1;

            let Some(info) = self.state.rpc.getinfo(&self.state.peers, peer).await else {
                continue;
            };
            if !version_ok(&info.server_version) {
                debug!(
                    peer = peer.as_str(),
                    version = info.server_version.as_str(),
                    "Peer is too old to replicate zonefiles"
                );
                continue;
            }

            debug!(peer = peer.as_str(), "Add newly-discovered peer");
            add_peer_checked(&self.state, peer, now_secs(), true).await;
            handled.push(peer.clone());
        }

        handled
    }

    /// Merge the pending-peer queue into the retained new-peer list and
    /// validate a batch. Returns how many candidates were processed.
    async fn update_new_peers(&mut self, count: usize) -> usize {
        let queued = peer_dequeue_all(&self.state);

        let mut merged: Vec<String> = self
            .new_peers
            .iter()
            .cloned()
            .chain(queued)
            .collect::<HashSet<String>>()
            .into_iter()
            .filter(|p| p != &self.state.local_hostport)
            .collect();
        merged.shuffle(&mut rand::thread_rng());

        debug!(
            candidates = merged.len(),
            batch = count,
            "Validating newly-reported peers"
        );
        let handled = self.add_new_peers(count, &merged).await;

        let handled_set: HashSet<&String> = handled.iter().collect();
        merged.retain(|p| !handled_set.contains(p));
        merged.truncate(self.state.config.max_new_peers());
        self.new_peers = merged;

        handled.len()
    }

    /// One MHRWDA transition. `None` means the walk failed and must be
    /// reset.
    async fn random_walk_step(&self) -> Option<(String, Vec<String>)> {
        let current = self.current_peer.as_deref()?;
        let current_degree = self.current_peer_neighbors.len();
        if current_degree == 0 {
            debug!("Current peer has no neighbors to walk to");
            return None;
        }

        let next = self
            .current_peer_neighbors
            .choose(&mut rand::thread_rng())?
            .clone();
        let next_neighbors = self.get_neighbors(&next).await.filter(|n| !n.is_empty())?;

        let p: f64 = rand::thread_rng().gen();
        if accept_transition(p, current_degree, next_neighbors.len()) {
            if self.prev_peer.as_deref() == Some(next.as_str()) && current_degree > 1 {
                // drew the previous node again: consider an alternate
                let alternates: Vec<&String> = self
                    .current_peer_neighbors
                    .iter()
                    .filter(|n| **n != next)
                    .collect();
                let alt = (*alternates.choose(&mut rand::thread_rng())?).clone();
                let alt_neighbors = self.get_neighbors(&alt).await.filter(|n| !n.is_empty())?;

                let q: f64 = rand::thread_rng().gen();
                if accept_alternate(q, current_degree, alt_neighbors.len(), self.prev_peer_degree)
                {
                    return Some((alt, alt_neighbors));
                }
            }
            return Some((next, next_neighbors));
        }

        // stay put, but refresh our view of the current peer's neighbors
        let refreshed = self.get_neighbors(current).await.filter(|n| !n.is_empty())?;
        Some((current.to_string(), refreshed))
    }

    /// Revalidate peers whose discovery time has aged out: renew the ones
    /// that answer a ping, drop the unresponsive ones (flags and healthy
    /// history pin a peer in place).
    async fn revalidate_old_peers(&self, now: u64) {
        let expire_before = now.saturating_sub(self.state.config.protocol.max_age);
        let old = self.state.catalog.lock().old_peers(expire_before);

        for hostport in old {
            if self.state.rpc.ping(&self.state.peers, &hostport).await {
                self.state.catalog.lock().renew_peer(&hostport, now);
                continue;
            }

            debug!(peer = hostport.as_str(), "Failed to revalidate old peer");
            if self.state.peers.is_whitelisted(&hostport)
                || self.state.peers.is_blacklisted(&hostport)
            {
                continue;
            }
            if self.state.peers.health(&hostport) < self.state.config.protocol.min_peer_health {
                remove_peer(&self.state, &hostport);
            }
        }
    }

    /// Periodic maintenance: hourly revalidation plus eviction of a few
    /// persistently unhealthy peers.
    async fn update_existing_peers(&mut self, num_to_remove: usize) -> usize {
        let now = now_secs();
        if self.last_clean_time + self.state.config.protocol.clean_interval < now {
            debug!("Revalidating old peers");
            self.revalidate_old_peers(now).await;
            self.last_clean_time = now;
        }

        let removed = self.state.peers.unhealthy_peers(
            num_to_remove,
            MIN_REQUESTS_FOR_REMOVAL,
            self.state.config.protocol.min_peer_health,
        );
        for peer in &removed {
            debug!(peer = peer.as_str(), "Removing unhealthy peer");
            remove_peer(&self.state, peer);
        }
        self.new_peers.retain(|p| !removed.contains(p));
        removed.len()
    }

    fn reset_walk(&mut self) {
        self.current_peer = None;
        self.current_peer_neighbors.clear();
        self.prev_peer = None;
        self.prev_peer_degree = 0;
    }

    /// One crawl round: validate queued peers, take one walk step, then
    /// clean up the existing set.
    pub async fn step(&mut self) {
        self.update_new_peers(NEW_PEERS_PER_STEP).await;

        let cap = self.state.config.max_new_peers();

        // begin the walk if we are not on it
        if self.current_peer.is_none() {
            let start = {
                let table_peers = self.state.peers.hostports();
                table_peers.choose(&mut rand::thread_rng()).cloned()
            };
            if let Some(start) = start {
                debug!(peer = start.as_str(), "Starting crawl");
                match self.get_neighbors(&start).await.filter(|n| !n.is_empty()) {
                    Some(mut neighbors) => {
                        neighbors.retain(|n| n != &self.state.local_hostport);
                        extend_new_peers(&mut self.new_peers, &neighbors, cap);
                        self.current_peer = Some(start);
                        self.current_peer_neighbors = neighbors;
                    }
                    None => {
                        debug!(peer = start.as_str(), "No neighbors reported; walk resets");
                        self.reset_walk();
                    }
                }
            }
        }

        if self.current_peer.is_some() {
            match self.random_walk_step().await {
                Some((next, mut next_neighbors)) => {
                    next_neighbors.retain(|n| n != &self.state.local_hostport);
                    self.prev_peer = self.current_peer.take();
                    self.prev_peer_degree = self.current_peer_neighbors.len();
                    extend_new_peers(&mut self.new_peers, &next_neighbors, cap);
                    self.current_peer = Some(next);
                    self.current_peer_neighbors = next_neighbors;
                }
                None => {
                    warn!(
                        peer = self.current_peer.as_deref().unwrap_or(""),
                        "Walk step failed; restarting from a random peer"
                    );
                    self.reset_walk();
                }
            }
        }

        self.update_existing_peers(REMOVALS_PER_STEP).await;
    }

    pub async fn run(mut self) {
        debug!("Peer crawler started");
        while !self.stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.step().await;
            super::pace(started).await;
        }
        debug!("Peer crawler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_favors_low_degree_targets() {
        // moving toward a lower-degree node is always accepted
        assert!(accept_transition(0.999, 10, 5));
        // moving toward a higher-degree node is accepted with ratio d_cur/d_next
        assert!(accept_transition(0.5, 5, 10));
        assert!(!accept_transition(0.51, 5, 10));
    }

    #[test]
    fn delayed_acceptance_threshold_is_squared_ratio() {
        // threshold = min(1, (cur/alt)^2): 4/8 -> 0.25
        assert!(accept_alternate(0.25, 4, 8, 2));
        assert!(!accept_alternate(0.26, 4, 8, 2));
        // low-degree alternates are always accepted
        assert!(accept_alternate(0.999, 8, 4, 2));
        // the prev/current term is clamped at >= 1 and never tightens the bound
        assert!(accept_alternate(0.999, 8, 4, 100));
    }

    #[test]
    fn version_gate_matches_protocol_floor() {
        assert!(version_ok("0.14.0"));
        assert!(version_ok("1.0.0"));
        assert!(!version_ok("0.13.5"));
        assert!(!version_ok("not-a-version"));
    }

    #[test]
    fn new_peer_list_dedupes_and_caps() {
        let mut list = vec!["a:1".to_string(), "b:1".to_string()];
        extend_new_peers(
            &mut list,
            &["b:1".to_string(), "c:1".to_string(), "d:1".to_string()],
            4,
        );
        assert_eq!(list, vec!["a:1", "b:1", "c:1", "d:1"]);
    }
}
