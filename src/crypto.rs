//! Cryptographic utilities for the crawler
//!
//! Node records are signed by their owner with Ed25519, compatible with
//! kratos-core keys. Peer IDs and configuration hashes use Blake3.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::net::IpAddr;

use crate::types::{Hash, NodeRecord, PeerId, PublicKey};

/// Domain separation prefix for node record signatures
const DOMAIN_NODE_RECORD: &[u8] = b"KRATOS_NODE_RECORD_V1:";

/// Domain separation prefix for peer ID derivation
const DOMAIN_PEER_ID: &[u8] = b"KRATOS_PEER_ID_V1:";

// =============================================================================
// KEYS & IDENTIFIERS
// =============================================================================

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Get public key bytes from keypair
pub fn keypair_to_public_key(keypair: &SigningKey) -> PublicKey {
    keypair.verifying_key().to_bytes()
}

/// Derive the peer ID from a public key
pub fn peer_id_from_key(public_key: &PublicKey) -> PeerId {
    PeerId(hash(&domain_separate(DOMAIN_PEER_ID, public_key)))
}

// =============================================================================
// NODE RECORD SIGNING & VERIFICATION
// =============================================================================

/// Build and sign a node record
pub fn sign_node_record(
    keypair: &SigningKey,
    seq: u64,
    ip: IpAddr,
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
) -> NodeRecord {
    let mut record = NodeRecord {
        seq,
        public_key: keypair_to_public_key(keypair),
        ip,
        udp_port,
        tcp_port,
        signature: [0u8; 64],
    };
    let domain_data = domain_separate(DOMAIN_NODE_RECORD, &record.signing_data());
    record.signature = keypair.sign(&domain_data).to_bytes();
    record
}

/// Verify that a node record was signed by the key it carries
pub fn verify_node_record(record: &NodeRecord) -> Result<(), SignatureError> {
    let verifying_key = VerifyingKey::from_bytes(&record.public_key)
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let domain_data = domain_separate(DOMAIN_NODE_RECORD, &record.signing_data());
    let signature = Signature::from_bytes(&record.signature);

    verifying_key
        .verify(&domain_data, &signature)
        .map_err(|_| SignatureError::InvalidSignature)
}

// =============================================================================
// HELPERS
// =============================================================================

/// Apply domain separation to prevent cross-protocol replay attacks
fn domain_separate(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(domain.len() + data.len());
    result.extend_from_slice(domain);
    result.extend_from_slice(data);
    result
}

/// Compute Blake3 hash
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash to hex string
pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_record_signing() {
        let keypair = generate_keypair();
        let mut record = sign_node_record(&keypair, 7, "192.168.1.10".parse().unwrap(), Some(30333), Some(30333));

        assert!(verify_node_record(&record).is_ok());

        // Tampered address must not verify
        record.ip = "192.168.1.11".parse().unwrap();
        assert_eq!(verify_node_record(&record), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn test_seq_is_signed() {
        let keypair = generate_keypair();
        let mut record = sign_node_record(&keypair, 1, "10.0.0.1".parse().unwrap(), None, Some(1));
        record.seq = 2;
        assert!(verify_node_record(&record).is_err());
    }

    #[test]
    fn test_peer_id_derivation() {
        let a = generate_keypair();
        let b = generate_keypair();
        let pk_a = keypair_to_public_key(&a);

        assert_eq!(peer_id_from_key(&pk_a), peer_id_from_key(&pk_a));
        assert_ne!(peer_id_from_key(&pk_a), peer_id_from_key(&keypair_to_public_key(&b)));
        // The ID is not the raw key
        assert_ne!(peer_id_from_key(&pk_a).0, pk_a);
    }

    #[test]
    fn test_hash_hex() {
        let h = hash(b"test data");
        assert_eq!(hash_to_hex(&h).len(), 64);
        assert_ne!(h, hash(b"test data 2"));
    }
}
