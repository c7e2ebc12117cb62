//! Node Registry Module
//!
//! In-memory, deduplicated set of peer records keyed by peer ID.
//! The crawl scheduler owns the registry and is its only writer; readers
//! get immutable snapshots published after each round.

mod node_set;
pub mod scoring;
pub mod snapshot;

pub use node_set::{IntegrityError, NodeRegistry};
pub use scoring::CheckOutcome;

/// Summary of the registry contents
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RegistryStats {
    /// Total peers in registry
    pub total_peers: usize,

    /// Peers that answered at least one check
    pub responsive_peers: usize,

    /// Peers that last reported being full
    pub too_many_peers: usize,

    /// Average peer score
    pub average_score: f64,
}
