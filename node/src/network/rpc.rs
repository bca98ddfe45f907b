//! Typed RPC client for the peer protocol.
//!
//! Calls are JSON-RPC over HTTP with a per-call timeout. Every response is
//! parsed into a fixed-schema structure and validated; anything that does
//! not conform is treated the same as a transport failure. Each call
//! records exactly one outcome in the peer's health history.
//!
//! Zonefile bodies are opaque bytes and travel base64-encoded; inventory
//! bitmaps travel base64-encoded in their big-endian wire layout.

use super::peer_table::PeerTable;
use super::now_secs;
use crate::config::AtlasConfig;
use atlas_core::ZonefileHash;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

// ---- wire envelope -----------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: u64,
    /// Hostport the caller can be reached back at; receivers queue it for
    /// peer discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub id: u64,
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(message.into()),
            id,
        }
    }
}

// ---- method payloads ---------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub consensus: String,
    pub server_version: String,
    pub last_block_processed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetNeighborsResponse {
    pub status: bool,
    pub peers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetInventoryParams {
    /// Bit offset of the requested slice.
    pub offset: u64,
    /// Slice length in bits; the responder returns at most `length / 8`
    /// bytes, rounded up.
    pub length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetInventoryResponse {
    pub status: bool,
    /// Base64 of the big-endian inventory slice.
    pub inv: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetZonefilesParams {
    pub zonefiles: Vec<ZonefileHash>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetZonefilesResponse {
    pub status: bool,
    /// Hash (hex) to body (base64).
    pub zonefiles: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutZonefilesParams {
    /// Bodies, base64-encoded.
    pub zonefiles: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutZonefilesResponse {
    pub status: bool,
    pub saved: Vec<u8>,
}

// ---- client ------------------------------------------------------------

/// Typed, timeout-bounded RPC client for remote peers.
pub struct AtlasRpcClient {
    http: reqwest::Client,
    local_hostport: String,
    max_neighbors: usize,
    ping_timeout: Duration,
    inv_timeout: Duration,
    neighbors_timeout: Duration,
    zonefiles_timeout: Duration,
    push_timeout: Duration,
}

impl AtlasRpcClient {
    pub fn new(config: &AtlasConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            local_hostport: config.node.hostport.clone(),
            max_neighbors: config.protocol.max_neighbors,
            ping_timeout: config.ping_timeout(),
            inv_timeout: config.inv_timeout(),
            neighbors_timeout: config.neighbors_timeout(),
            zonefiles_timeout: config.zonefiles_timeout(),
            push_timeout: config.push_timeout(),
        }
    }

    async fn call<R: DeserializeOwned>(
        &self,
        hostport: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<R, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: 1,
            src: Some(self.local_hostport.clone()),
        };

        let response = self
            .http
            .post(format!("http://{}/v1/rpc", hostport))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?;

        if let Some(error) = envelope.error {
            return Err(RpcError::Remote(error));
        }
        let result = envelope
            .result
            .ok_or_else(|| RpcError::Malformed("missing result".to_string()))?;
        serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    fn log_failure(&self, method: &str, hostport: &str, error: &RpcError) {
        match error {
            RpcError::Transport(msg) => {
                debug!(method, peer = hostport, error = %msg, "RPC transport failure");
            }
            RpcError::Malformed(msg) => {
                debug!(method, peer = hostport, error = %msg, "RPC response malformed");
                warn!(method, peer = hostport, "Peer returned a malformed response");
            }
            RpcError::Remote(msg) => {
                debug!(method, peer = hostport, error = %msg, "RPC remote error");
            }
        }
    }

    /// Is the peer alive?
    pub async fn ping(&self, peers: &PeerTable, hostport: &str) -> bool {
        debug!(peer = hostport, "ping");
        let res: Result<PingResponse, RpcError> = self
            .call(hostport, "ping", Value::Null, self.ping_timeout)
            .await;

        let alive = match res {
            Ok(r) => r.status,
            Err(e) => {
                self.log_failure("ping", hostport, &e);
                false
            }
        };
        peers.update_health(hostport, alive, now_secs());
        alive
    }

    /// Fetch a peer's node info, validating the schema.
    pub async fn getinfo(&self, peers: &PeerTable, hostport: &str) -> Option<NodeInfo> {
        debug!(peer = hostport, "getinfo");
        let res: Result<NodeInfo, RpcError> = self
            .call(hostport, "getinfo", Value::Null, self.ping_timeout)
            .await;

        let info = match res {
            Ok(info) if !info.server_version.is_empty() => Some(info),
            Ok(_) => {
                warn!(peer = hostport, "getinfo reply is missing a server version");
                None
            }
            Err(e) => {
                self.log_failure("getinfo", hostport, &e);
                None
            }
        };
        peers.update_health(hostport, info.is_some(), now_secs());
        info
    }

    /// Ask a peer for its neighbor set (at most `max_neighbors` entries).
    pub async fn get_neighbors(&self, peers: &PeerTable, hostport: &str) -> Option<Vec<String>> {
        debug!(peer = hostport, "get_atlas_peers");
        let res: Result<GetNeighborsResponse, RpcError> = self
            .call(
                hostport,
                "get_atlas_peers",
                Value::Null,
                self.neighbors_timeout,
            )
            .await;

        let neighbors = match res {
            Ok(r) if r.status && r.peers.len() <= self.max_neighbors => Some(r.peers),
            Ok(r) => {
                warn!(
                    peer = hostport,
                    count = r.peers.len(),
                    "Neighbor reply failed validation"
                );
                None
            }
            Err(e) => {
                self.log_failure("get_atlas_peers", hostport, &e);
                None
            }
        };
        peers.update_health(hostport, neighbors.is_some(), now_secs());
        neighbors
    }

    /// Download one inventory slice. `offset` and `length` are in bits;
    /// the reply may be shorter than requested at the end of the peer's
    /// inventory.
    pub async fn get_inventory_range(
        &self,
        peers: &PeerTable,
        hostport: &str,
        offset: u64,
        length: u64,
    ) -> Option<Vec<u8>> {
        debug!(peer = hostport, offset, length, "get_zonefile_inventory");
        let params = serde_json::to_value(GetInventoryParams { offset, length }).ok()?;
        let res: Result<GetInventoryResponse, RpcError> = self
            .call(hostport, "get_zonefile_inventory", params, self.inv_timeout)
            .await;

        let inv = match res {
            Ok(r) if r.status => match B64.decode(r.inv.as_bytes()) {
                Ok(bytes) if bytes.len() as u64 <= (length + 7) / 8 => Some(bytes),
                Ok(bytes) => {
                    warn!(
                        peer = hostport,
                        got = bytes.len(),
                        "Inventory slice is longer than requested"
                    );
                    None
                }
                Err(_) => {
                    warn!(peer = hostport, "Inventory slice is not valid base64");
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                self.log_failure("get_zonefile_inventory", hostport, &e);
                None
            }
        };
        peers.update_health(hostport, inv.is_some(), now_secs());
        inv
    }

    /// Fetch zonefile bodies by hash. Every returned body is verified
    /// against its hash; one bad body invalidates the whole reply.
    pub async fn get_zonefiles(
        &self,
        peers: &PeerTable,
        hostport: &str,
        hashes: &[ZonefileHash],
    ) -> Option<HashMap<ZonefileHash, Vec<u8>>> {
        debug!(peer = hostport, count = hashes.len(), "get_zonefiles");
        let params = serde_json::to_value(GetZonefilesParams {
            zonefiles: hashes.to_vec(),
        })
        .ok()?;
        let res: Result<GetZonefilesResponse, RpcError> = self
            .call(hostport, "get_zonefiles", params, self.zonefiles_timeout)
            .await;

        let zonefiles = match res {
            Ok(r) if r.status => decode_zonefile_map(hostport, r.zonefiles),
            Ok(_) => None,
            Err(e) => {
                self.log_failure("get_zonefiles", hostport, &e);
                None
            }
        };
        peers.update_health(hostport, zonefiles.is_some(), now_secs());
        zonefiles
    }

    /// Offer zonefile bodies to a peer. Returns the per-body saved vector.
    pub async fn put_zonefiles(
        &self,
        peers: &PeerTable,
        hostport: &str,
        bodies: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        debug!(peer = hostport, count = bodies.len(), "put_zonefiles");
        let params = serde_json::to_value(PutZonefilesParams {
            zonefiles: bodies.iter().map(|b| B64.encode(b)).collect(),
        })
        .ok()?;
        let res: Result<PutZonefilesResponse, RpcError> = self
            .call(hostport, "put_zonefiles", params, self.push_timeout)
            .await;

        let saved = match res {
            Ok(r)
                if r.status
                    && r.saved.len() == bodies.len()
                    && r.saved.iter().all(|s| *s <= 1) =>
            {
                Some(r.saved)
            }
            Ok(_) => {
                warn!(peer = hostport, "put_zonefiles reply failed validation");
                None
            }
            Err(e) => {
                self.log_failure("put_zonefiles", hostport, &e);
                None
            }
        };
        peers.update_health(hostport, saved.is_some(), now_secs());
        saved
    }
}

fn decode_zonefile_map(
    hostport: &str,
    raw: HashMap<String, String>,
) -> Option<HashMap<ZonefileHash, Vec<u8>>> {
    let mut out = HashMap::with_capacity(raw.len());
    for (hash_str, body_b64) in raw {
        let hash: ZonefileHash = match hash_str.parse() {
            Ok(h) => h,
            Err(_) => {
                warn!(peer = hostport, hash = %hash_str, "Invalid zonefile hash in reply");
                return None;
            }
        };
        let body = match B64.decode(body_b64.as_bytes()) {
            Ok(b) => b,
            Err(_) => {
                warn!(peer = hostport, hash = %hash, "Zonefile body is not valid base64");
                return None;
            }
        };
        if !hash.matches(&body) {
            warn!(peer = hostport, hash = %hash, "Zonefile body does not match its hash");
            return None;
        }
        out.insert(hash, body);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::hash_zonefile;

    #[test]
    fn zonefile_map_rejects_mismatched_bodies() {
        let body = b"a zonefile".to_vec();
        let hash = hash_zonefile(&body);

        let mut good = HashMap::new();
        good.insert(hash.to_string(), B64.encode(&body));
        let decoded = decode_zonefile_map("peer:1", good).unwrap();
        assert_eq!(decoded.get(&hash).unwrap(), &body);

        let mut tampered = HashMap::new();
        tampered.insert(hash.to_string(), B64.encode(b"tampered"));
        assert!(decode_zonefile_map("peer:1", tampered).is_none());

        let mut garbage = HashMap::new();
        garbage.insert("nothex".to_string(), B64.encode(&body));
        assert!(decode_zonefile_map("peer:1", garbage).is_none());
    }

    #[test]
    fn envelope_serializes_without_empty_fields() {
        let resp = JsonRpcResponse::result(7, serde_json::json!({"status": true}));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(!text.contains("error"));

        let err = JsonRpcResponse::error(7, "no such method");
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("no such method"));
        assert!(!text.contains("result"));
    }
}
