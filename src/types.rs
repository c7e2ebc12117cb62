//! Core types for the crawler
//!
//! A peer is identified by the blake3 hash of its Ed25519 public key.
//! Each peer publishes a signed [`NodeRecord`] carrying its address and a
//! sequence number; the crawler tracks one [`PeerRecord`] per peer on top
//! of that, holding the liveness score and contact timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Helper module for serializing [u8; 64] arrays
mod sig_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(data: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        hex::encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 64 {
            return Err(serde::de::Error::custom("signature must be 64 bytes"));
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

/// Helper module for serializing [u8; 32] arrays
mod key_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(data: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        hex::encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::decode_32(&s).map_err(serde::de::Error::custom)
    }
}

fn decode_32(s: &str) -> Result<[u8; 32], hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

// =============================================================================
// PRIMITIVE TYPES
// =============================================================================

/// 32-byte hash (Blake3)
pub type Hash = [u8; 32];

/// 32-byte Ed25519 public key
pub type PublicKey = [u8; 32];

/// 64-byte Ed25519 signature
pub type Signature = [u8; 64];

/// Peer identifier (blake3 of the peer's public key)
///
/// Ordered bytewise, which gives the registry its ascending-id iteration
/// order. Serialized as a lowercase hex string so it can key a JSON object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes in hex, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(PeerId)
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// NODE RECORD (signed by the peer)
// =============================================================================

/// The peer's own signed record
///
/// Everything except `signature` is covered by the signature, so a
/// record can be relayed by third parties without being altered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Sequence number, bumped by the peer whenever it republishes
    pub seq: u64,

    /// Ed25519 public key
    #[serde(with = "key_serde")]
    pub public_key: PublicKey,

    /// Advertised IP address
    pub ip: IpAddr,

    /// Discovery port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,

    /// Connection port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,

    /// Signature over [`NodeRecord::signing_data`]
    #[serde(with = "sig_serde")]
    pub signature: Signature,
}

impl NodeRecord {
    /// Peer ID derived from the public key
    pub fn id(&self) -> PeerId {
        crate::crypto::peer_id_from_key(&self.public_key)
    }

    /// Get the data to be signed (all fields except signature)
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&self.seq.to_le_bytes());
        data.extend_from_slice(&self.public_key);
        match self.ip {
            IpAddr::V4(v4) => {
                data.push(4);
                data.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                data.push(6);
                data.extend_from_slice(&v6.octets());
            }
        }
        data.extend_from_slice(&self.udp_port.unwrap_or(0).to_le_bytes());
        data.extend_from_slice(&self.tcp_port.unwrap_or(0).to_le_bytes());
        data
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// Address to probe for liveness, if the peer advertises a TCP port
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_port.map(|port| SocketAddr::new(self.ip, port))
    }

    /// Transport the peer can be reached on ("TCP" wins over "UDP")
    pub fn conn_type(&self) -> &'static str {
        if self.tcp_port.is_some() {
            "TCP"
        } else if self.udp_port.is_some() {
            "UDP"
        } else {
            ""
        }
    }
}

// =============================================================================
// CLIENT INFO
// =============================================================================

/// Metadata reported by the remote client during a successful check
///
/// Filled in by the discovery collaborator; the crawler only stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub client_type: String,

    #[serde(default)]
    pub software_version: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
}

// =============================================================================
// PEER RECORD (tracked by the crawler)
// =============================================================================

/// One entry of the node registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Sequence number of `record` at the time it was stored
    pub seq: u64,

    /// Latest known signed record of the peer
    pub record: NodeRecord,

    /// Liveness score: +1 per successful check, halved per failed one
    #[serde(default, skip_serializing_if = "is_zero")]
    pub score: u32,

    /// First successful contact
    #[serde(default)]
    pub first_response: Option<DateTime<Utc>>,

    /// Most recent successful contact
    #[serde(default)]
    pub last_response: Option<DateTime<Utc>>,

    /// Most recent contact attempt
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,

    /// Peer refused the connection because it was full
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub too_many_peers: bool,
}

fn is_zero(score: &u32) -> bool {
    *score == 0
}

impl PeerRecord {
    /// Fresh, never checked entry for a record
    pub fn new(record: NodeRecord) -> Self {
        Self {
            seq: record.seq,
            record,
            score: 0,
            first_response: None,
            last_response: None,
            last_check: None,
            client_info: None,
            too_many_peers: false,
        }
    }

    pub fn id(&self) -> PeerId {
        self.record.id()
    }

    pub fn ip(&self) -> IpAddr {
        self.record.ip
    }

    /// Whether the peer ever answered a check
    pub fn has_responded(&self) -> bool {
        self.first_response.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_keypair, sign_node_record};

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId([0xab; 32]);
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short(), "abababababababab");
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_orders_bytewise() {
        let mut low = [0u8; 32];
        low[31] = 0xff;
        let mut high = [0u8; 32];
        high[0] = 0x01;
        assert!(PeerId(low) < PeerId(high));
    }

    #[test]
    fn test_peer_record_json_field_names() {
        let keypair = generate_keypair();
        let record = sign_node_record(&keypair, 3, "10.1.2.3".parse().unwrap(), Some(30333), Some(30333));
        let mut peer = PeerRecord::new(record);
        peer.too_many_peers = true;

        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["record"]["ip"], "10.1.2.3");
        assert_eq!(json["tooManyPeers"], true);
        // zero score is omitted
        assert!(json.get("score").is_none());

        let back: PeerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn test_conn_type() {
        let keypair = generate_keypair();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(sign_node_record(&keypair, 1, ip, Some(1), Some(2)).conn_type(), "TCP");
        assert_eq!(sign_node_record(&keypair, 1, ip, Some(1), None).conn_type(), "UDP");
        assert_eq!(sign_node_record(&keypair, 1, ip, None, None).conn_type(), "");
        assert!(sign_node_record(&keypair, 1, ip, Some(1), None).tcp_addr().is_none());
    }
}
