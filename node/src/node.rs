//! Node assembly: shared state, bootstrap, and worker lifecycle.

use crate::catalog::{AtlasDb, CatalogError};
use crate::config::{AtlasConfig, ConfigValidationError};
use crate::ledger::NameLedger;
use crate::network::server::bind_rpc_server;
use crate::network::{
    host_of, now_secs, peer_slot, AtlasRpcClient, InventoryHealthChecker, PeerCrawler, PeerTable,
    ZonefileFetcher, ZonefilePusher,
};
use crate::storage::{zonefile_dir, DirectoryDriver, StorageDriver, StorageError, ZonefileStore};
use atlas_core::ZonefileHash;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the workers and the RPC surface share. Each piece carries
/// its own lock; nothing here is held across network I/O.
pub struct NodeState {
    pub config: AtlasConfig,
    pub local_hostport: String,
    /// The catalog mutex: guards the database and the local inventory
    /// bitmap together.
    pub catalog: Mutex<AtlasDb>,
    pub peers: PeerTable,
    /// Hostports reported by remote peers, awaiting validation.
    pub peer_queue: Mutex<VecDeque<String>>,
    /// Zonefiles awaiting outbound propagation.
    pub push_queue: Mutex<VecDeque<(ZonefileHash, Vec<u8>)>>,
    pub rpc: AtlasRpcClient,
    pub store: ZonefileStore,
    pub drivers: Vec<Box<dyn StorageDriver>>,
    pub ledger: Arc<dyn NameLedger>,
}

impl NodeState {
    /// Bootstrap node state: open the catalog, resync it with the ledger
    /// (clearing the possibly-partial boundary block), load the peer
    /// directory, and apply seed and blacklist entries.
    pub fn new(config: AtlasConfig, ledger: Arc<dyn NameLedger>) -> Result<Self, NodeError> {
        config.validate()?;

        let store = ZonefileStore::open(zonefile_dir(&config.node.data_dir))?;
        let mut catalog = AtlasDb::open(&config.node.data_dir.join("atlas.db"))?;

        let start_block = catalog.last_block().unwrap_or(config.node.first_block);
        info!(
            start_block,
            tip = ledger.tip_height(),
            "Synchronizing catalog with the name ledger"
        );
        catalog.sync_with_ledger(ledger.as_ref(), start_block, &store);

        let local_hostport = config.node.hostport.clone();
        let peers = PeerTable::new(&local_hostport, config.protocol.peer_lifetime);

        debug!("Loading peer table");
        for hostport in catalog.load_peers() {
            peers.register(&hostport, false, false);
        }

        let now = now_secs();
        for seed in &config.peers.seeds {
            if seed == &local_hostport {
                continue;
            }
            let Some(host) = host_of(seed) else {
                debug!(peer = seed.as_str(), "Skipping malformed seed peer");
                continue;
            };
            debug!(peer = seed.as_str(), "Adding seed peer");
            let slot = peer_slot(rand::random(), host, config.protocol.slot_max);
            catalog.insert_peer(seed, slot, now);
            peers.register(seed, false, true);
            peers.set_whitelisted(seed, true);
        }
        for banned in &config.peers.blacklist {
            if banned == &local_hostport {
                continue;
            }
            peers.register(banned, true, false);
            peers.set_blacklisted(banned, true);
        }

        let mut drivers: Vec<Box<dyn StorageDriver>> = Vec::new();
        if let Some(dir) = &config.node.storage_driver_dir {
            drivers.push(Box::new(DirectoryDriver::new(dir)));
        }

        let rpc = AtlasRpcClient::new(&config);

        Ok(Self {
            config,
            local_hostport,
            catalog: Mutex::new(catalog),
            peers,
            peer_queue: Mutex::new(VecDeque::new()),
            push_queue: Mutex::new(VecDeque::new()),
            rpc,
            store,
            drivers,
            ledger,
        })
    }
}

/// The running node: four background workers plus the RPC server.
pub struct Node {
    state: Arc<NodeState>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    rpc_server: Option<(actix_web::dev::ServerHandle, std::thread::JoinHandle<()>)>,
}

impl Node {
    pub fn new(config: AtlasConfig, ledger: Arc<dyn NameLedger>) -> Result<Self, NodeError> {
        let state = Arc::new(NodeState::new(config, ledger)?);
        Ok(Self {
            state,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            rpc_server: None,
        })
    }

    pub fn state(&self) -> Arc<NodeState> {
        Arc::clone(&self.state)
    }

    /// Start the RPC server and the four workers.
    pub fn start(&mut self) -> Result<(), NodeError> {
        let bind = self.state.config.node.rpc_bind.clone();
        let (server, addrs) = bind_rpc_server(Arc::clone(&self.state), &bind)?;
        let server_handle = server.handle();
        let server_thread = std::thread::Builder::new()
            .name("atlas-rpc".to_string())
            .spawn(move || {
                let system = actix_web::rt::System::new();
                if let Err(e) = system.block_on(server) {
                    error!(error = %e, "RPC server exited with an error");
                }
            })?;
        self.rpc_server = Some((server_handle, server_thread));
        info!(bind = ?addrs, "RPC server listening");

        let crawler = PeerCrawler::new(self.state(), Arc::clone(&self.stop));
        let health = InventoryHealthChecker::new(self.state(), Arc::clone(&self.stop));
        let fetcher = ZonefileFetcher::new(self.state(), Arc::clone(&self.stop));
        let pusher = ZonefilePusher::new(self.state(), Arc::clone(&self.stop));

        self.workers.push(tokio::spawn(crawler.run()));
        self.workers.push(tokio::spawn(health.run()));
        self.workers.push(tokio::spawn(fetcher.run()));
        self.workers.push(tokio::spawn(pusher.run()));

        info!(
            hostport = self.state.local_hostport.as_str(),
            "Atlas node started"
        );
        Ok(())
    }

    /// Signal every worker to stop, then wait for them and the RPC server
    /// to wind down. Workers finish their current RPC (bounded by its
    /// timeout) before exiting.
    pub async fn stop(&mut self) {
        info!("Stopping Atlas node");
        self.stop.store(true, Ordering::Relaxed);

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        if let Some((handle, thread)) = self.rpc_server.take() {
            handle.stop(true).await;
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        info!("Atlas node stopped");
    }
}
