//! Peer Storage (RocksDB)
//!
//! Persistent per-peer rows, written at the end of every crawl round.
//! One row per peer ID: writing the same peer again updates its row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

use crate::geo::GeoInfo;
use crate::types::{PeerId, PeerRecord};

/// Key prefix for node rows
const PREFIX_NODE: &[u8] = b"node:";

/// Client type recorded for peers that only ever answered "too many peers"
const CLIENT_TYPE_TOO_MANY_PEERS: &str = "tmp";

/// Reachability as of the latest check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
    TooManyPeers,
}

/// Row contents supplied by the crawler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub node_id: PeerId,
    pub public_key: String,
    pub ip: IpAddr,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub conn_type: String,

    pub client_type: String,
    pub software_version: String,
    pub capabilities: Vec<String>,
    pub network_id: Option<u64>,
    pub head_hash: Option<String>,
    pub block_height: Option<u64>,

    pub seq: u64,
    pub score: u32,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,

    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
}

impl NodeUpsert {
    /// Build a row from a registry entry and its resolved location
    pub fn from_peer(peer: &PeerRecord, geo: Option<GeoInfo>) -> Self {
        let info = peer.client_info.clone().unwrap_or_default();

        let mut client_type = info.client_type;
        if client_type.is_empty() && peer.too_many_peers {
            client_type = CLIENT_TYPE_TOO_MANY_PEERS.to_string();
        }

        let answered_last_check = peer.last_check.is_some() && peer.last_check == peer.last_response;
        let status = match (answered_last_check, peer.too_many_peers) {
            (true, true) => ConnectionStatus::TooManyPeers,
            (true, false) => ConnectionStatus::Online,
            (false, _) => ConnectionStatus::Offline,
        };

        let geo = geo.unwrap_or_default();

        Self {
            node_id: peer.id(),
            public_key: peer.record.public_key_hex(),
            ip: peer.ip(),
            tcp_port: peer.record.tcp_port,
            udp_port: peer.record.udp_port,
            conn_type: peer.record.conn_type().to_string(),
            client_type,
            software_version: info.software_version,
            capabilities: info.capabilities,
            network_id: info.network_id,
            head_hash: info.head_hash,
            block_height: info.block_height,
            seq: peer.seq,
            score: peer.score,
            first_seen: peer.first_response,
            last_seen: peer.last_response,
            status,
            country: geo.country,
            city: geo.city,
            asn: geo.asn,
        }
    }
}

/// Stored row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNode {
    pub node: NodeUpsert,

    /// Consecutive rounds without an answer
    pub failure_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Idempotent per-peer persistence
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn upsert(&self, node: NodeUpsert) -> Result<(), StoreError>;
}

/// Peer store backed by RocksDB
pub struct RocksPeerStore {
    db: DB,

    /// Serializes read-modify-write cycles on rows
    write_lock: Mutex<()>,
}

impl RocksPeerStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(100);
        opts.set_keep_log_file_num(3);

        let db = DB::open(&opts, path)?;
        let store = Self {
            db,
            write_lock: Mutex::new(()),
        };

        info!("📦 Peer store opened at {:?} ({} nodes)", path, store.count()?);
        Ok(store)
    }

    /// Insert or update the row for `node.node_id`
    pub fn upsert_node(&self, node: NodeUpsert) -> Result<StoredNode, StoreError> {
        let key = node_key(&node.node_id);
        let now = Utc::now();

        let _guard = self.write_lock.lock();

        let row = match self.db.get(&key)? {
            Some(bytes) => {
                let previous: StoredNode = bincode::deserialize(&bytes)?;
                merge_row(previous, node, now)
            }
            None => StoredNode {
                failure_count: if node.status == ConnectionStatus::Offline { 1 } else { 0 },
                node,
                created_at: now,
                updated_at: now,
            },
        };

        self.db.put(&key, bincode::serialize(&row)?)?;
        Ok(row)
    }

    /// Get a row by peer ID
    pub fn get(&self, id: &PeerId) -> Result<Option<StoredNode>, StoreError> {
        match self.db.get(node_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Rows in ascending peer ID order
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<StoredNode>, StoreError> {
        let iter = self
            .db
            .iterator(IteratorMode::From(PREFIX_NODE, rocksdb::Direction::Forward));

        let mut rows = Vec::new();
        for item in iter.skip(offset) {
            let (key, value) = item?;
            if !key.starts_with(PREFIX_NODE) || rows.len() >= limit {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Number of stored rows
    pub fn count(&self) -> Result<usize, StoreError> {
        let iter = self
            .db
            .iterator(IteratorMode::From(PREFIX_NODE, rocksdb::Direction::Forward));

        let mut count = 0;
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(PREFIX_NODE) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Flush all changes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl PeerStore for RocksPeerStore {
    async fn upsert(&self, node: NodeUpsert) -> Result<(), StoreError> {
        let row = self.upsert_node(node)?;
        debug!("Stored node {} ({:?})", row.node.node_id.short(), row.node.status);
        Ok(())
    }
}

/// Combine an existing row with fresh data
fn merge_row(previous: StoredNode, mut node: NodeUpsert, now: DateTime<Utc>) -> StoredNode {
    // keep the earliest first contact
    node.first_seen = match (previous.node.first_seen, node.first_seen) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    if node.last_seen.is_none() {
        node.last_seen = previous.node.last_seen;
    }

    let failure_count = match node.status {
        ConnectionStatus::Offline => previous.failure_count.saturating_add(1),
        _ => 0,
    };

    StoredNode {
        node,
        failure_count,
        created_at: previous.created_at,
        updated_at: now,
    }
}

/// Create storage key for a node
fn node_key(id: &PeerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(PREFIX_NODE.len() + 32);
    key.extend_from_slice(PREFIX_NODE);
    key.extend_from_slice(id.as_bytes());
    key
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("row encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
