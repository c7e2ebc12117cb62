//! Node set snapshot file
//!
//! JSON object mapping hex peer IDs to peer records. Used to bootstrap the
//! registry on startup and to persist it after each round.

use std::io::Write;
use std::path::Path;
use tracing::debug;

use super::{IntegrityError, NodeRegistry};
use crate::types::NodeRecord;

/// Path that selects standard output instead of a file
pub const STDOUT_PATH: &str = "-";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot failed integrity check: {0}")]
    Integrity(#[from] IntegrityError),
}

/// Load and verify a snapshot
pub fn load_snapshot(path: &Path) -> Result<NodeRegistry, SnapshotError> {
    let content = std::fs::read(path)?;
    let registry: NodeRegistry = serde_json::from_slice(&content)?;
    registry.verify()?;
    debug!("Loaded {} nodes from {:?}", registry.len(), path);
    Ok(registry)
}

/// Load a JSON array of signed node records (bootnodes)
///
/// Signatures are checked later, when the records go through a crawl round.
pub fn load_node_records(path: &Path) -> Result<Vec<NodeRecord>, SnapshotError> {
    let content = std::fs::read(path)?;
    let records: Vec<NodeRecord> = serde_json::from_slice(&content)?;
    debug!("Loaded {} node records from {:?}", records.len(), path);
    Ok(records)
}

/// Write a snapshot to `path`, or to stdout when `path` is `-`
pub fn write_snapshot(registry: &NodeRegistry, path: &Path) -> Result<(), SnapshotError> {
    let content = serde_json::to_vec_pretty(registry)?;

    if path.as_os_str() == STDOUT_PATH {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&content)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Write file atomically (write to temp, then rename)
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, &content)?;
    std::fs::rename(&temp_path, path)?;

    debug!("Saved {} nodes to {:?}", registry.len(), path);
    Ok(())
}
