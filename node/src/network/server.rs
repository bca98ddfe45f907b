//! The RPC surface we serve to other peers.
//!
//! A single JSON-RPC endpoint dispatches the replication methods: `ping`,
//! `getinfo`, `get_atlas_peers`, `get_zonefile_inventory`, `get_zonefiles`
//! and `put_zonefiles`. Errors travel back as `{"error": "..."}`. Callers
//! that announce a source hostport are queued for discovery.

use super::rpc::{
    GetInventoryParams, GetNeighborsResponse, GetZonefilesParams, GetZonefilesResponse,
    JsonRpcRequest, JsonRpcResponse, NodeInfo, PutZonefilesParams, PutZonefilesResponse,
};
use super::{peer_enqueue, push_enqueue};
use crate::node::NodeState;
use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer};
use atlas_core::hash_zonefile;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Version we report in `getinfo`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Most zonefiles served per `get_zonefiles` request.
const MAX_ZONEFILES_PER_REQUEST: usize = 100;

/// Bind the RPC server, returning the server future and the addresses it
/// bound. The [`Server`] must be driven on an actix runtime; see
/// `Node::start`.
pub fn bind_rpc_server(
    state: Arc<NodeState>,
    bind: &str,
) -> std::io::Result<(Server, Vec<std::net::SocketAddr>)> {
    let data = web::Data::new(state);
    let http = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/v1/rpc", web::post().to(handle_rpc))
    })
    .disable_signals()
    .workers(2)
    .bind(bind)?;
    let addrs = http.addrs();
    Ok((http.run(), addrs))
}

async fn handle_rpc(
    request: web::Json<JsonRpcRequest>,
    state: web::Data<Arc<NodeState>>,
) -> HttpResponse {
    let req = request.into_inner();
    let id = req.id;

    // a caller that tells us where it lives is a discovery candidate
    if let Some(src) = &req.src {
        if peer_enqueue(&state, src) {
            debug!(peer = src.as_str(), "Queued calling peer for discovery");
        }
    }

    let result = match req.method.as_str() {
        "ping" => Ok(json!({ "status": true })),
        "getinfo" => handle_getinfo(&state),
        "get_atlas_peers" => handle_get_peers(&state, req.src.as_deref()),
        "get_zonefile_inventory" => handle_get_inventory(&state, req.params),
        "get_zonefiles" => handle_get_zonefiles(&state, req.params),
        "put_zonefiles" => handle_put_zonefiles(&state, req.params),
        other => Err(format!("No such method: {}", other)),
    };

    let response = match result {
        Ok(value) => JsonRpcResponse::result(id, value),
        Err(message) => JsonRpcResponse::error(id, message),
    };
    HttpResponse::Ok().json(response)
}

fn handle_getinfo(state: &NodeState) -> Result<Value, String> {
    let info = NodeInfo {
        consensus: state.ledger.consensus_hash(),
        server_version: SERVER_VERSION.to_string(),
        last_block_processed: state.ledger.tip_height(),
    };
    serde_json::to_value(info).map_err(|e| e.to_string())
}

fn handle_get_peers(state: &NodeState, src: Option<&str>) -> Result<Value, String> {
    let mut peers = state
        .peers
        .live_neighbors(src, state.config.protocol.min_peer_health);
    peers.truncate(state.config.protocol.max_neighbors);
    serde_json::to_value(GetNeighborsResponse {
        status: true,
        peers,
    })
    .map_err(|e| e.to_string())
}

fn handle_get_inventory(state: &NodeState, params: Value) -> Result<Value, String> {
    let params: GetInventoryParams =
        serde_json::from_value(params).map_err(|_| "Invalid inventory request".to_string())?;

    let byte_offset = (params.offset / 8) as usize;
    let byte_len = ((params.length + 7) / 8) as usize;
    let slice = {
        let catalog = state.catalog.lock();
        catalog.inventory_range(byte_offset, byte_len).to_vec()
    };

    Ok(json!({ "status": true, "inv": B64.encode(slice) }))
}

fn handle_get_zonefiles(state: &NodeState, params: Value) -> Result<Value, String> {
    let params: GetZonefilesParams =
        serde_json::from_value(params).map_err(|_| "Invalid zonefile request".to_string())?;
    if params.zonefiles.len() > MAX_ZONEFILES_PER_REQUEST {
        return Err("Too many zonefiles requested".to_string());
    }

    let mut zonefiles = HashMap::new();
    for hash in params.zonefiles {
        if let Some(body) = state.store.get(&hash) {
            zonefiles.insert(hash.to_string(), B64.encode(body));
        }
    }

    serde_json::to_value(GetZonefilesResponse {
        status: true,
        zonefiles,
    })
    .map_err(|e| e.to_string())
}

fn handle_put_zonefiles(state: &NodeState, params: Value) -> Result<Value, String> {
    let params: PutZonefilesParams =
        serde_json::from_value(params).map_err(|_| "Invalid zonefile push".to_string())?;
    if params.zonefiles.len() > MAX_ZONEFILES_PER_REQUEST {
        return Err("Too many zonefiles pushed".to_string());
    }

    let mut saved = Vec::with_capacity(params.zonefiles.len());
    for body_b64 in &params.zonefiles {
        let Ok(body) = B64.decode(body_b64.as_bytes()) else {
            warn!("Pushed zonefile is not valid base64");
            saved.push(0);
            continue;
        };
        let hash = hash_zonefile(&body);

        let bits = state.catalog.lock().get_bits(&hash);
        if bits.is_empty() {
            // not anchored in the ledger as far as we know
            debug!(hash = %hash, "Refusing pushed zonefile with unknown hash");
            saved.push(0);
            continue;
        }

        if let Err(e) = state.store.put(&hash, &body) {
            warn!(hash = %hash, error = %e, "Failed to store pushed zonefile");
            saved.push(0);
            continue;
        }
        state.catalog.lock().set_present(&hash, true);

        // forward it to peers that lack it
        push_enqueue(state, hash, body);
        saved.push(1);
    }

    serde_json::to_value(PutZonefilesResponse {
        status: true,
        saved,
    })
    .map_err(|e| e.to_string())
}
