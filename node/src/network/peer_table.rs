//! In-memory peer table: health accounting, mirrored inventories, and
//! list flags, all behind one exclusive lock.
//!
//! Lock discipline: the lock is only ever held across in-memory reads and
//! writes, never across network I/O. Call sites that need an RPC release
//! the lock, make the call, re-acquire, and recheck that the peer is still
//! present. Re-entering the lock from the same thread is a programmer
//! error and aborts in debug builds.

use atlas_core::inventory;
use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Everything we track about one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerEntry {
    /// Bounded request history: `(timestamp, responded)` pairs within the
    /// lifetime window.
    history: VecDeque<(u64, bool)>,
    /// Our view of the peer's inventory bitmap.
    remote_inv: Vec<u8>,
    /// When `remote_inv` last synced all the way to our local length.
    last_inv_refresh: u64,
    blacklisted: bool,
    whitelisted: bool,
}

fn entry_health(entry: &PeerEntry) -> f64 {
    let requests = entry.history.len();
    if requests == 0 {
        return 0.0;
    }
    let responses = entry.history.iter().filter(|(_, r)| *r).count();
    responses as f64 / requests as f64
}

struct TableGuard<'a> {
    guard: MutexGuard<'a, HashMap<String, PeerEntry>>,
    holder: &'a AtomicU64,
}

impl<'a> Deref for TableGuard<'a> {
    type Target = HashMap<String, PeerEntry>;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a> DerefMut for TableGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a> Drop for TableGuard<'a> {
    fn drop(&mut self) {
        self.holder.store(0, Ordering::Release);
    }
}

/// The process-wide peer table.
pub struct PeerTable {
    inner: Mutex<HashMap<String, PeerEntry>>,
    holder: AtomicU64,
    local_hostport: String,
    /// Health history window, in seconds.
    lifetime: u64,
}

impl PeerTable {
    pub fn new(local_hostport: impl Into<String>, lifetime: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            holder: AtomicU64::new(0),
            local_hostport: local_hostport.into(),
            lifetime,
        }
    }

    fn lock(&self) -> TableGuard<'_> {
        if cfg!(debug_assertions) && self.holder.load(Ordering::Acquire) == thread_token() {
            error!("FATAL: peer table lock re-entered on the same thread");
            std::process::abort();
        }
        let guard = self.inner.lock();
        self.holder.store(thread_token(), Ordering::Release);
        TableGuard {
            guard,
            holder: &self.holder,
        }
    }

    /// Add an entry for a newly discovered peer. The local node is never
    /// added; existing entries keep their history and flags.
    pub fn register(&self, hostport: &str, blacklisted: bool, whitelisted: bool) {
        if hostport == self.local_hostport {
            return;
        }
        self.lock()
            .entry(hostport.to_string())
            .or_insert_with(|| PeerEntry {
                blacklisted,
                whitelisted,
                ..PeerEntry::default()
            });
    }

    /// Drop a peer, unless it is pinned by a list flag.
    pub fn remove_unless_flagged(&self, hostport: &str) {
        let mut table = self.lock();
        if let Some(entry) = table.get(hostport) {
            if !entry.blacklisted && !entry.whitelisted {
                table.remove(hostport);
            }
        }
    }

    pub fn contains(&self, hostport: &str) -> bool {
        self.lock().contains_key(hostport)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn hostports(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Record a request outcome and prune history older than the lifetime
    /// window. Returns false if the peer is unknown.
    pub fn update_health(&self, hostport: &str, responded: bool, now: u64) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.get_mut(hostport) else {
            return false;
        };
        entry
            .history
            .retain(|(t, _)| t + self.lifetime >= now);
        entry.history.push_back((now, responded));
        true
    }

    /// Response ratio over the history window; 0.0 for unknown or untried
    /// peers.
    pub fn health(&self, hostport: &str) -> f64 {
        self.lock().get(hostport).map_or(0.0, entry_health)
    }

    /// Number of requests recorded in the window.
    pub fn request_count(&self, hostport: &str) -> usize {
        self.lock().get(hostport).map_or(0, |e| e.history.len())
    }

    pub fn remote_inventory(&self, hostport: &str) -> Option<Vec<u8>> {
        self.lock().get(hostport).map(|e| e.remote_inv.clone())
    }

    /// Replace a peer's mirrored inventory. Returns false if the peer
    /// vanished while the caller was off doing I/O.
    pub fn set_remote_inventory(&self, hostport: &str, inv: Vec<u8>) -> bool {
        let mut table = self.lock();
        match table.get_mut(hostport) {
            Some(entry) => {
                entry.remote_inv = inv;
                true
            }
            None => false,
        }
    }

    /// Truncate a peer's mirrored inventory to `byte_offset` bytes and
    /// return the truncated copy.
    pub fn truncate_remote_inventory(&self, hostport: &str, byte_offset: usize) -> Option<Vec<u8>> {
        let mut table = self.lock();
        let entry = table.get_mut(hostport)?;
        entry.remote_inv.truncate(byte_offset);
        Some(entry.remote_inv.clone())
    }

    /// Flip bits in a peer's mirrored inventory: our record of what the
    /// peer claims to have. Clearing bits after a failed delivery stops us
    /// from re-asking a peer that advertises zonefiles it cannot produce.
    pub fn set_remote_bits(&self, hostport: &str, bits: &[usize], present: bool) {
        let mut table = self.lock();
        if let Some(entry) = table.get_mut(hostport) {
            entry.remote_inv = if present {
                inventory::set_bits(&entry.remote_inv, bits)
            } else {
                inventory::clear_bits(&entry.remote_inv, bits)
            };
        }
    }

    pub fn stamp_inventory_refresh(&self, hostport: &str, now: u64) -> bool {
        let mut table = self.lock();
        match table.get_mut(hostport) {
            Some(entry) => {
                entry.last_inv_refresh = now;
                true
            }
            None => false,
        }
    }

    /// A peer's inventory is fresh when it covers at least our local
    /// length and was fully synced within the ping interval.
    pub fn has_fresh_inventory(
        &self,
        hostport: &str,
        local_inv_len_bytes: usize,
        now: u64,
        ping_interval: u64,
    ) -> bool {
        self.lock().get(hostport).map_or(false, |entry| {
            entry.remote_inv.len() >= local_inv_len_bytes
                && entry.last_inv_refresh + ping_interval > now
        })
    }

    pub fn is_blacklisted(&self, hostport: &str) -> bool {
        self.lock().get(hostport).map_or(false, |e| e.blacklisted)
    }

    pub fn is_whitelisted(&self, hostport: &str) -> bool {
        self.lock().get(hostport).map_or(false, |e| e.whitelisted)
    }

    pub fn set_blacklisted(&self, hostport: &str, blacklisted: bool) {
        if let Some(entry) = self.lock().get_mut(hostport) {
            entry.blacklisted = blacklisted;
        }
    }

    pub fn set_whitelisted(&self, hostport: &str, whitelisted: bool) {
        if let Some(entry) = self.lock().get_mut(hostport) {
            entry.whitelisted = whitelisted;
        }
    }

    /// Peers ordered by health, best first. `subset` restricts the ranking;
    /// `include_untried` admits peers we have never contacted.
    pub fn rank_by_health(&self, subset: Option<&[String]>, include_untried: bool) -> Vec<String> {
        let table = self.lock();
        let candidates: Vec<&String> = match subset {
            Some(list) => list.iter().filter(|p| table.contains_key(*p)).collect(),
            None => table.keys().collect(),
        };

        let mut ranked: Vec<(f64, String)> = candidates
            .into_iter()
            .filter_map(|p| {
                let entry = table.get(p)?;
                if entry.history.is_empty() && !include_untried {
                    return None;
                }
                Some((entry_health(entry), p.clone()))
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        ranked.into_iter().map(|(_, p)| p).collect()
    }

    /// Peers ordered by how many zonefiles they can offer us (bits they
    /// have that we lack), most useful first. Peers whose inventory we have
    /// not mirrored yet are skipped.
    pub fn rank_by_availability(&self, subset: Option<&[String]>, local_inv: &[u8]) -> Vec<String> {
        let table = self.lock();
        let candidates: Vec<&String> = match subset {
            Some(list) => list.iter().filter(|p| table.contains_key(*p)).collect(),
            None => table.keys().collect(),
        };

        let mut ranked: Vec<(usize, String)> = candidates
            .into_iter()
            .filter_map(|p| {
                let entry = table.get(p)?;
                if entry.remote_inv.is_empty() {
                    return None;
                }
                Some((inventory::count_missing(local_inv, &entry.remote_inv), p.clone()))
            })
            .collect();

        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, p)| p).collect()
    }

    /// Shuffled list of live peers: contacted at least once, healthy, and
    /// not blacklisted. This is what we report to other nodes.
    pub fn live_neighbors(&self, excluding: Option<&str>, min_health: f64) -> Vec<String> {
        let table = self.lock();
        let mut alive: Vec<String> = table
            .iter()
            .filter(|(hostport, entry)| {
                excluding != Some(hostport.as_str())
                    && !entry.blacklisted
                    && !entry.history.is_empty()
                    && entry_health(entry) >= min_health
            })
            .map(|(hostport, _)| hostport.clone())
            .collect();
        drop(table);

        alive.shuffle(&mut rand::thread_rng());
        alive
    }

    /// Peers whose mirrored inventory lacks at least one of the given bits.
    pub fn find_push_peers(&self, bits: &[usize]) -> Vec<String> {
        let table = self.lock();
        table
            .iter()
            .filter(|(_, entry)| !inventory::test_bits(&entry.remote_inv, bits))
            .map(|(hostport, _)| hostport.clone())
            .collect()
    }

    /// Peers whose mirrored inventory claims at least one of the given
    /// bits.
    pub fn peers_with_any_bit(&self, bits: &[usize]) -> Vec<String> {
        let table = self.lock();
        table
            .iter()
            .filter(|(_, entry)| bits.iter().any(|&b| inventory::test_bits(&entry.remote_inv, &[b])))
            .map(|(hostport, _)| hostport.clone())
            .collect()
    }

    /// The worst-health peers eligible for removal: at least
    /// `min_requests` recorded requests and health below `min_health`,
    /// worst first, at most `count`.
    pub fn unhealthy_peers(
        &self,
        count: usize,
        min_requests: usize,
        min_health: f64,
    ) -> Vec<String> {
        let table = self.lock();
        let mut ranked: Vec<(f64, String)> = table
            .iter()
            .filter(|(_, entry)| {
                entry.history.len() >= min_requests && entry_health(entry) < min_health
            })
            .map(|(hostport, entry)| (entry_health(entry), hostport.clone()))
            .collect();
        drop(table);

        ranked.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        ranked.into_iter().take(count).map(|(_, p)| p).collect()
    }
}
