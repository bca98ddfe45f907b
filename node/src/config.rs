use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Invalid hostport: {0}")]
    InvalidHostport(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AtlasConfig {
    pub node: NodeSettings,
    pub protocol: ProtocolSettings,
    pub timeouts: TimeoutSettings,
    pub peers: PeerSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeSettings {
    /// Public host:port other peers reach us at.
    pub hostport: String,
    /// Local bind address for the RPC server.
    pub rpc_bind: String,
    /// Directory holding the catalog database and the zonefile blob store.
    pub data_dir: PathBuf,
    /// Optional directory used as a long-term storage driver for zonefiles
    /// that cannot be fetched from any peer.
    pub storage_driver_dir: Option<PathBuf>,
    /// Optional JSON snapshot of the name ledger, for running standalone.
    pub ledger_snapshot: Option<PathBuf>,
    /// First block height to index when starting from an empty catalog.
    pub first_block: u64,
}

/// Replication protocol constants. The defaults are the wire-compatible
/// values; every field can be overridden by an `ATLAS_`-prefixed
/// environment variable (e.g. `ATLAS_PEER_LIFETIME`).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProtocolSettings {
    /// Seconds a request outcome stays in a peer's health history.
    pub peer_lifetime: u64,
    /// Seconds a synced peer inventory stays fresh.
    pub ping_interval: u64,
    /// Seconds before a peer's discovery time must be revalidated.
    pub max_age: u64,
    /// Seconds between revalidation sweeps of old peers.
    pub clean_interval: u64,
    /// Number of eviction slots in the peer directory.
    pub slot_max: u64,
    /// Minimum response ratio before a peer is eligible for eviction.
    pub min_peer_health: f64,
    /// Maximum neighbors reported to (and accepted from) any peer.
    pub max_neighbors: usize,
    /// Cap on the outbound push queue.
    pub max_queued_zonefiles: usize,
    /// Bits per inventory download window.
    pub inventory_window: u64,
}

/// Per-call RPC timeouts, in seconds.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimeoutSettings {
    pub ping: u64,
    pub inv: u64,
    pub neighbors: u64,
    pub zonefiles: u64,
    pub push: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PeerSettings {
    /// Seed peers, forcibly added and whitelisted at startup.
    pub seeds: Vec<String>,
    /// Peers we never gossip with.
    pub blacklist: Vec<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            hostport: "127.0.0.1:20443".to_string(),
            rpc_bind: "0.0.0.0:20443".to_string(),
            data_dir: PathBuf::from("./atlas-data"),
            storage_driver_dir: None,
            ledger_snapshot: None,
            first_block: 0,
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            peer_lifetime: 3_600,
            ping_interval: 60,
            max_age: 2_678_400,
            clean_interval: 3_600,
            slot_max: 65_536,
            min_peer_health: 0.5,
            max_neighbors: 80,
            max_queued_zonefiles: 1_000,
            inventory_window: 524_288,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            ping: 3,
            inv: 10,
            neighbors: 10,
            zonefiles: 30,
            push: 10,
        }
    }
}

impl AtlasConfig {
    /// Load configuration: defaults, then the optional TOML file, then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&AtlasConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let mut cfg: AtlasConfig = builder.build()?.try_deserialize()?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Apply `ATLAS_*` environment overrides to the protocol constants and
    /// timeouts.
    pub fn apply_env_overrides(&mut self) {
        env_override("ATLAS_PEER_LIFETIME", &mut self.protocol.peer_lifetime);
        env_override("ATLAS_PING_INTERVAL", &mut self.protocol.ping_interval);
        env_override("ATLAS_MAX_AGE", &mut self.protocol.max_age);
        env_override("ATLAS_CLEAN_INTERVAL", &mut self.protocol.clean_interval);
        env_override("ATLAS_SLOT_MAX", &mut self.protocol.slot_max);
        env_override("ATLAS_MIN_PEER_HEALTH", &mut self.protocol.min_peer_health);
        env_override("ATLAS_MAX_NEIGHBORS", &mut self.protocol.max_neighbors);
        env_override(
            "ATLAS_MAX_QUEUED_ZONEFILES",
            &mut self.protocol.max_queued_zonefiles,
        );
        env_override("ATLAS_INVENTORY_WINDOW", &mut self.protocol.inventory_window);
        env_override("ATLAS_PING_TIMEOUT", &mut self.timeouts.ping);
        env_override("ATLAS_INV_TIMEOUT", &mut self.timeouts.inv);
        env_override("ATLAS_NEIGHBORS_TIMEOUT", &mut self.timeouts.neighbors);
        env_override("ATLAS_ZONEFILES_TIMEOUT", &mut self.timeouts.zonefiles);
        env_override("ATLAS_PUSH_TIMEOUT", &mut self.timeouts.push);
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.node.hostport.contains(':') {
            return Err(ConfigValidationError::InvalidHostport(
                self.node.hostport.clone(),
            ));
        }
        if self.protocol.slot_max == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "slot_max must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.protocol.min_peer_health) {
            return Err(ConfigValidationError::InvalidValue(
                "min_peer_health must be within [0, 1]".to_string(),
            ));
        }
        if self.protocol.max_neighbors == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "max_neighbors must be positive".to_string(),
            ));
        }
        if self.protocol.inventory_window == 0 || self.protocol.inventory_window % 8 != 0 {
            return Err(ConfigValidationError::InvalidValue(
                "inventory_window must be a positive multiple of 8 bits".to_string(),
            ));
        }
        Ok(())
    }

    /// Cap on the pending-peer queue: ten neighbor sets' worth of hosts,
    /// never more than the peer directory can hold.
    pub fn max_new_peers(&self) -> usize {
        (self.protocol.max_neighbors * 10).min(self.protocol.slot_max as usize)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.ping)
    }

    pub fn inv_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.inv)
    }

    pub fn neighbors_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.neighbors)
    }

    pub fn zonefiles_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.zonefiles)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.push)
    }
}

fn env_override<T: std::str::FromStr>(name: &str, field: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *field = value,
            Err(_) => warn!(var = name, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}
