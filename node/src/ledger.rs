//! Interface to the name ledger.
//!
//! The ledger is the external source of truth for which zonefile hashes were
//! anchored at each block height. The replication engine only ever reads it;
//! [`MemoryLedger`] backs tests and standalone deployments that load a
//! snapshot instead of talking to a live name database.

use atlas_core::ZonefileHash;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Read-only view of the name ledger.
pub trait NameLedger: Send + Sync {
    /// Current tip height.
    fn tip_height(&self) -> u64;

    /// Ordered zonefile hashes anchored at the given height.
    fn zonefile_hashes_at(&self, height: u64) -> Vec<ZonefileHash>;

    /// Consensus hash at the tip, reported through `getinfo`.
    fn consensus_hash(&self) -> String;
}

/// In-memory ledger, optionally loaded from a JSON snapshot of the form
/// `{"consensus": "...", "blocks": {"<height>": ["<hash>", ...]}}`.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    blocks: BTreeMap<u64, Vec<ZonefileHash>>,
    consensus: String,
}

#[derive(Deserialize)]
struct LedgerSnapshot {
    #[serde(default)]
    consensus: String,
    #[serde(default)]
    blocks: BTreeMap<u64, Vec<ZonefileHash>>,
}

impl MemoryLedger {
    pub fn new(consensus: impl Into<String>) -> Self {
        Self {
            blocks: BTreeMap::new(),
            consensus: consensus.into(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let snapshot: LedgerSnapshot = serde_json::from_str(&raw)?;
        Ok(Self {
            blocks: snapshot.blocks,
            consensus: snapshot.consensus,
        })
    }

    /// Append the hashes anchored at a block height.
    pub fn put_block(&mut self, height: u64, hashes: Vec<ZonefileHash>) {
        self.blocks.insert(height, hashes);
    }
}

impl NameLedger for MemoryLedger {
    fn tip_height(&self) -> u64 {
        self.blocks.keys().next_back().copied().unwrap_or(0)
    }

    fn zonefile_hashes_at(&self, height: u64) -> Vec<ZonefileHash> {
        self.blocks.get(&height).cloned().unwrap_or_default()
    }

    fn consensus_hash(&self) -> String {
        self.consensus.clone()
    }
}
