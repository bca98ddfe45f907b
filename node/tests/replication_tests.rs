//! End-to-end replication tests: two node states talking over a real RPC
//! server on localhost.

use atlas_core::{hash_zonefile, inventory, ZonefileHash};
use node::config::AtlasConfig;
use node::ledger::MemoryLedger;
use node::network::server::bind_rpc_server;
use node::network::{
    add_peer_at_slot, fetcher, health, peer_enqueue, push_enqueue, PeerCrawler, ZonefileFetcher,
    ZonefilePusher,
};
use node::node::NodeState;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A node state with its own temp data directory.
struct TestNode {
    state: Arc<NodeState>,
    _dir: TempDir,
}

/// A test node with its RPC server bound on an ephemeral localhost port.
struct ServedNode {
    node: TestNode,
    hostport: String,
    server_handle: actix_web::dev::ServerHandle,
}

fn build_state(ledger: MemoryLedger) -> TestNode {
    let dir = TempDir::new().unwrap();
    let mut config = AtlasConfig::default();
    config.node.data_dir = dir.path().join("data");
    config.node.hostport = format!("127.0.0.1:{}", 20_000 + rand::random::<u16>() % 10_000);
    config.node.rpc_bind = "127.0.0.1:0".to_string();
    let state = Arc::new(NodeState::new(config, Arc::new(ledger)).unwrap());
    TestNode { state, _dir: dir }
}

fn serve(node: TestNode) -> ServedNode {
    let (server, addrs) = bind_rpc_server(node.state.clone(), "127.0.0.1:0").unwrap();
    let hostport = addrs[0].to_string();
    let server_handle = server.handle();
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        let _ = system.block_on(server);
    });
    ServedNode {
        node,
        hostport,
        server_handle,
    }
}

impl ServedNode {
    fn state(&self) -> &NodeState {
        &self.node.state
    }

    async fn shutdown(self) {
        self.server_handle.stop(true).await;
    }
}

/// Three zonefiles anchored at one block; the first two bodies are stored.
fn seeded_ledger() -> (MemoryLedger, Vec<(ZonefileHash, Vec<u8>)>) {
    let bodies: Vec<Vec<u8>> = vec![
        b"$ORIGIN alpha.id\n".to_vec(),
        b"$ORIGIN bravo.id\n".to_vec(),
        b"$ORIGIN charlie.id\n".to_vec(),
    ];
    let hashed: Vec<(ZonefileHash, Vec<u8>)> = bodies
        .into_iter()
        .map(|b| (hash_zonefile(&b), b))
        .collect();

    let mut ledger = MemoryLedger::new("test-consensus");
    ledger.put_block(100, hashed.iter().map(|(h, _)| *h).collect());
    (ledger, hashed)
}

fn serve_seeded() -> (ServedNode, Vec<(ZonefileHash, Vec<u8>)>) {
    let (ledger, zonefiles) = seeded_ledger();
    let node = build_state(ledger);
    for (hash, body) in zonefiles.iter().take(2) {
        node.state.store.put(hash, body).unwrap();
        node.state.catalog.lock().set_present(hash, true);
    }
    (serve(node), zonefiles)
}

#[tokio::test]
async fn ping_getinfo_and_health_accounting() {
    let (remote, _) = serve_seeded();
    let local = build_state(MemoryLedger::new("local"));

    local.state.peers.register(&remote.hostport, false, false);

    assert!(local.state.rpc.ping(&local.state.peers, &remote.hostport).await);
    // every RPC adds exactly one history entry
    assert_eq!(local.state.peers.request_count(&remote.hostport), 1);

    let info = local
        .state
        .rpc
        .getinfo(&local.state.peers, &remote.hostport)
        .await
        .unwrap();
    assert_eq!(info.consensus, "test-consensus");
    assert_eq!(info.last_block_processed, 100);
    assert!(!info.server_version.is_empty());
    assert_eq!(local.state.peers.request_count(&remote.hostport), 2);
    assert_eq!(local.state.peers.health(&remote.hostport), 1.0);

    // a dead peer counts as a non-response
    local.state.peers.register("127.0.0.1:1", false, false);
    assert!(!local.state.rpc.ping(&local.state.peers, "127.0.0.1:1").await);
    assert_eq!(local.state.peers.health("127.0.0.1:1"), 0.0);
    assert_eq!(local.state.peers.request_count("127.0.0.1:1"), 1);

    remote.shutdown().await;
}

#[tokio::test]
async fn inventory_download_and_zonefile_fetch() {
    let (remote, zonefiles) = serve_seeded();

    // same ledger, but no bodies stored locally
    let (ledger, _) = seeded_ledger();
    let local = build_state(ledger);
    local.state.peers.register(&remote.hostport, false, false);

    // mirror the remote inventory: bits 0 and 1 set, bit 2 clear
    assert!(health::refresh_peer_inventory(&local.state, &remote.hostport, 0).await);
    let mirror = local
        .state
        .peers
        .remote_inventory(&remote.hostport)
        .unwrap();
    assert!(inventory::test_bits(&mirror, &[0, 1]));
    assert!(!inventory::test_bits(&mirror, &[2]));

    // the fetcher pulls both available bodies in one round
    let stop = Arc::new(AtomicBool::new(false));
    let fetched = ZonefileFetcher::new(local.state.clone(), stop).step().await;
    assert_eq!(fetched, 2);
    for (hash, body) in zonefiles.iter().take(2) {
        assert_eq!(local.state.store.get(hash).unwrap(), *body);
        let bits = local.state.catalog.lock().get_bits(hash);
        assert!(inventory::test_bits(local.state.catalog.lock().inventory(), &bits));
    }
    // the third zonefile had no claiming peer and stays missing
    assert!(!local.state.store.has(&zonefiles[2].0));

    remote.shutdown().await;
}

#[tokio::test]
async fn rarest_first_ordering() {
    let (ledger, zonefiles) = seeded_ledger();
    let local = build_state(ledger);

    // zonefile 0 known by three peers, 1 by two, 2 by one
    let bits: Vec<Vec<usize>> = zonefiles
        .iter()
        .map(|(h, _)| local.state.catalog.lock().get_bits(h))
        .collect();
    for (i, peer) in ["p1:1", "p2:1", "p3:1"].iter().enumerate() {
        local.state.peers.register(peer, false, false);
        let mut inv = Vec::new();
        for b in bits.iter().take(3 - i) {
            inv = inventory::set_bits(&inv, b);
        }
        local.state.peers.set_remote_inventory(peer, inv);
    }

    let plan = fetcher::missing_zonefile_availability(&local.state);
    assert_eq!(plan.len(), 3);
    // rarest first: the zonefile claimed by one peer leads
    assert_eq!(plan[0].hash, zonefiles[2].0);
    assert_eq!(plan[0].peers.len(), 1);
    assert_eq!(plan[1].hash, zonefiles[1].0);
    assert_eq!(plan[1].peers.len(), 2);
    assert_eq!(plan[2].hash, zonefiles[0].0);
    assert_eq!(plan[2].peers.len(), 3);
}

#[tokio::test]
async fn slot_eviction_declines_while_occupant_lives() {
    let (remote, _) = serve_seeded();
    let local = build_state(MemoryLedger::new("local"));

    // the live server occupies slot 7
    local
        .state
        .catalog
        .lock()
        .insert_peer(&remote.hostport, 7, now());
    local.state.peers.register(&remote.hostport, false, false);

    // a new peer hashing into slot 7 must be declined
    let added = add_peer_at_slot(&local.state, "10.255.255.1:20443", 7, now(), true).await;
    assert!(!added);
    assert!(!local.state.peers.contains("10.255.255.1:20443"));
    assert_eq!(
        local.state.catalog.lock().peers_in_slot(7),
        vec![remote.hostport.clone()]
    );

    // a slot whose only occupant is dead gets taken over
    local
        .state
        .catalog
        .lock()
        .insert_peer("127.0.0.1:1", 9, now());
    let added = add_peer_at_slot(&local.state, "10.255.255.2:20443", 9, now(), true).await;
    assert!(added);
    assert!(local.state.peers.contains("10.255.255.2:20443"));

    remote.shutdown().await;
}

#[tokio::test]
async fn pushed_zonefiles_are_stored_and_propagated() {
    // remote anchors all three zonefiles but holds no bodies
    let (ledger, zonefiles) = seeded_ledger();
    let remote = serve(build_state(ledger));
    let (hash, body) = zonefiles[0].clone();

    // local holds the body and knows the remote lacks it
    let (ledger, _) = seeded_ledger();
    let local = build_state(ledger);
    local.state.store.put(&hash, &body).unwrap();
    local.state.catalog.lock().set_present(&hash, true);
    local.state.peers.register(&remote.hostport, false, false);
    local
        .state
        .peers
        .set_remote_inventory(&remote.hostport, vec![0x00]);

    // a zonefile every peer already has is not queued
    let known_bits = local.state.catalog.lock().get_bits(&hash);
    local.state.peers.set_remote_bits(&remote.hostport, &known_bits, true);
    assert!(!push_enqueue(&local.state, hash, body.clone()));
    assert!(local.state.push_queue.lock().is_empty());

    // flip the mirror back: now the remote needs it
    local.state.peers.set_remote_bits(&remote.hostport, &known_bits, false);
    assert!(push_enqueue(&local.state, hash, body.clone()));
    assert_eq!(local.state.push_queue.lock().len(), 1);

    let stop = Arc::new(AtomicBool::new(false));
    let contacted = ZonefilePusher::new(local.state.clone(), stop).step().await;
    assert_eq!(contacted, 1);
    assert!(local.state.push_queue.lock().is_empty());

    // the remote stored the body and marked it present
    assert_eq!(remote.state().store.get(&hash).unwrap(), body);
    let remote_bits = remote.state().catalog.lock().get_bits(&hash);
    assert!(inventory::test_bits(
        remote.state().catalog.lock().inventory(),
        &remote_bits
    ));

    // a body whose hash is not anchored is refused
    let unknown = b"unanchored".to_vec();
    let saved = local
        .state
        .rpc
        .put_zonefiles(&local.state.peers, &remote.hostport, &[unknown])
        .await
        .unwrap();
    assert_eq!(saved, vec![0]);

    remote.shutdown().await;
}

#[tokio::test]
async fn crawler_validates_queued_peers() {
    let (remote, _) = serve_seeded();
    let local = build_state(MemoryLedger::new("local"));

    assert!(peer_enqueue(&local.state, &remote.hostport));
    // re-enqueueing before validation is fine; dead peers get dropped later
    assert!(peer_enqueue(&local.state, "127.0.0.1:1"));

    let stop = Arc::new(AtomicBool::new(false));
    let mut crawler = PeerCrawler::new(local.state.clone(), stop);
    crawler.step().await;

    // the live peer passed getinfo + version gate and joined the peer set
    assert!(local.state.peers.contains(&remote.hostport));
    assert_eq!(local.state.catalog.lock().load_peers(), vec![remote.hostport.clone()]);
    assert!(local.state.peers.request_count(&remote.hostport) >= 1);
    // the dead peer did not
    assert!(!local.state.peers.contains("127.0.0.1:1"));

    remote.shutdown().await;
}

#[tokio::test]
async fn served_inventory_is_clamped_to_local_length() {
    let (remote, _) = serve_seeded();
    let local = build_state(MemoryLedger::new("local"));
    local.state.peers.register(&remote.hostport, false, false);

    // 3 anchored zonefiles, first two present: one byte, bits 0 and 1
    let inv = local
        .state
        .rpc
        .get_inventory_range(&local.state.peers, &remote.hostport, 0, 524_288)
        .await
        .unwrap();
    assert_eq!(inv, vec![0xc0]);

    // a request past the end comes back empty
    let tail = local
        .state
        .rpc
        .get_inventory_range(&local.state.peers, &remote.hostport, 524_288, 524_288)
        .await
        .unwrap();
    assert!(tail.is_empty());

    remote.shutdown().await;
}
