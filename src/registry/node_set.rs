//! Node set
//!
//! A `BTreeMap` keyed by peer ID, so iteration is always in ascending ID
//! order and serialized snapshots stay diff-friendly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::debug;

use super::scoring::{self, CheckOutcome};
use super::RegistryStats;
use crate::types::{NodeRecord, PeerId, PeerRecord};

/// Registry of known peers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRegistry {
    nodes: BTreeMap<PeerId, PeerRecord>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an externally supplied map. Call [`NodeRegistry::verify`]
    /// before trusting the result.
    pub fn from_map(nodes: BTreeMap<PeerId, PeerRecord>) -> Self {
        Self { nodes }
    }

    /// Ensure the given node records are present in the set
    ///
    /// Existing entries keep their score and timestamps; only the signed
    /// record and its sequence number are replaced. A record older than
    /// the stored one is ignored. Returns how many peers were new.
    pub fn add<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = NodeRecord>,
    {
        let mut inserted = 0;

        for record in records {
            match self.nodes.entry(record.id()) {
                Entry::Vacant(slot) => {
                    slot.insert(PeerRecord::new(record));
                    inserted += 1;
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if record.seq < existing.seq {
                        debug!(
                            "Ignoring stale record for {} (seq {} < {})",
                            existing.id().short(),
                            record.seq,
                            existing.seq
                        );
                        continue;
                    }
                    existing.seq = record.seq;
                    existing.record = record;
                }
            }
        }

        inserted
    }

    /// All records, ordered by ascending peer ID
    pub fn all_records(&self) -> impl Iterator<Item = &PeerRecord> + '_ {
        self.nodes.values()
    }

    /// All signed node records, ordered by ascending peer ID
    pub fn node_records(&self) -> Vec<NodeRecord> {
        self.nodes.values().map(|p| p.record.clone()).collect()
    }

    /// The `n` highest scoring peers as a new set
    ///
    /// Ties are broken by ascending peer ID. When `n` covers the whole
    /// registry the result is an identical copy.
    pub fn top_n(&self, n: usize) -> NodeRegistry {
        if n >= self.nodes.len() {
            return self.clone();
        }

        let mut by_score: Vec<&PeerRecord> = self.nodes.values().collect();
        // stable sort keeps ascending-id order among equal scores
        by_score.sort_by(|a, b| b.score.cmp(&a.score));

        let nodes = by_score
            .into_iter()
            .take(n)
            .map(|p| (p.id(), p.clone()))
            .collect();

        NodeRegistry { nodes }
    }

    /// Integrity checks on the node set
    pub fn verify(&self) -> Result<(), IntegrityError> {
        for (key, peer) in &self.nodes {
            let record_id = peer.record.id();
            if record_id != *key {
                return Err(IntegrityError::IdMismatch {
                    key: *key,
                    record_id,
                });
            }
            if peer.record.seq != peer.seq {
                return Err(IntegrityError::SeqMismatch {
                    id: *key,
                    seq: peer.seq,
                    record_seq: peer.record.seq,
                });
            }
        }
        Ok(())
    }

    /// Apply the outcome of a liveness check to one peer
    ///
    /// Returns false if the peer is not in the registry.
    pub fn apply_check(&mut self, id: &PeerId, outcome: CheckOutcome, now: DateTime<Utc>) -> bool {
        match self.nodes.get_mut(id) {
            Some(peer) => {
                scoring::apply_check(peer, outcome, now);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let total_peers = self.nodes.len();
        let responsive_peers = self.nodes.values().filter(|p| p.has_responded()).count();
        let too_many_peers = self.nodes.values().filter(|p| p.too_many_peers).count();

        let average_score = if total_peers == 0 {
            0.0
        } else {
            self.nodes.values().map(|p| p.score as f64).sum::<f64>() / total_peers as f64
        };

        RegistryStats {
            total_peers,
            responsive_peers,
            too_many_peers,
            average_score,
        }
    }
}

/// A registry whose contents contradict themselves
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("invalid node {key}: ID does not match ID {record_id} in record")]
    IdMismatch { key: PeerId, record_id: PeerId },

    #[error("invalid node {id}: 'seq' {seq} does not match seq {record_seq} from record")]
    SeqMismatch { id: PeerId, seq: u64, record_seq: u64 },
}
