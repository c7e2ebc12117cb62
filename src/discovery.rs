//! Discovery collaborator
//!
//! The crawler does not speak the discovery protocol itself. It drives an
//! implementation of [`Discovery`] once per round: one `discover` pass to
//! collect node records, then one `check` per known peer.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::registry::CheckOutcome;
use crate::types::NodeRecord;

/// Node records seen during one discovery pass
///
/// `error` may be set alongside a non-empty `nodes` list when the pass
/// was cut short; the partial results are still usable.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub nodes: Vec<NodeRecord>,
    pub error: Option<DiscoveryError>,
}

impl DiscoveryReport {
    pub fn complete(nodes: Vec<NodeRecord>) -> Self {
        Self { nodes, error: None }
    }

    pub fn partial(nodes: Vec<NodeRecord>, error: DiscoveryError) -> Self {
        Self {
            nodes,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

/// Peer discovery and liveness checking
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Find node records, starting from the currently known ones
    async fn discover(&self, known: &[NodeRecord], timeout: Duration, workers: usize) -> DiscoveryReport;

    /// Contact a single peer
    async fn check(&self, node: &NodeRecord, timeout: Duration) -> CheckOutcome;
}

/// Minimal discovery: fixed seed records, TCP connect as liveness check
pub struct TcpProbe {
    seeds: Vec<NodeRecord>,
}

impl TcpProbe {
    pub fn new(seeds: Vec<NodeRecord>) -> Self {
        Self { seeds }
    }
}

#[async_trait]
impl Discovery for TcpProbe {
    async fn discover(&self, _known: &[NodeRecord], _timeout: Duration, _workers: usize) -> DiscoveryReport {
        if self.seeds.is_empty() {
            return DiscoveryReport::partial(
                Vec::new(),
                DiscoveryError::Network("no seed records to start from".to_string()),
            );
        }
        DiscoveryReport::complete(self.seeds.clone())
    }

    async fn check(&self, node: &NodeRecord, timeout: Duration) -> CheckOutcome {
        let Some(addr) = node.tcp_addr() else {
            return CheckOutcome::Unreachable;
        };

        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => CheckOutcome::alive(None),
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", addr, e);
                CheckOutcome::Unreachable
            }
            Err(_) => {
                debug!("Probe of {} timed out", addr);
                CheckOutcome::Unreachable
            }
        }
    }
}
