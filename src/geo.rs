//! IP geolocation collaborator
//!
//! Lookups are read-only and may run from any task. Missing data is not
//! an error: a lookup simply returns `None`.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

/// Location data for one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(default)]
    pub country: Option<String>,

    #[serde(default)]
    pub city: Option<String>,

    /// Autonomous system number
    #[serde(default)]
    pub asn: Option<u32>,
}

/// Address to location lookup
pub trait GeoLocator: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Locator used when no table is configured
pub struct NoGeo;

impl GeoLocator for NoGeo {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoInfo> {
        None
    }
}

/// One row of a geolocation table file
#[derive(Debug, Deserialize)]
struct GeoTableEntry {
    cidr: String,
    #[serde(flatten)]
    info: GeoInfo,
}

/// CIDR range to location table, loaded from a JSON array
pub struct GeoTable {
    /// Sorted most specific range first
    ranges: Vec<(IpNet, GeoInfo)>,
}

impl GeoTable {
    /// Load a table; rows with a malformed range are skipped
    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let content = std::fs::read(path)?;
        let entries: Vec<GeoTableEntry> = serde_json::from_slice(&content)?;

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.cidr.trim().parse::<IpNet>() {
                Ok(net) => ranges.push((net.trunc(), entry.info)),
                Err(e) => warn!("Invalid CIDR in geo table, skipping: {} ({})", entry.cidr, e),
            }
        }

        let table = Self::from_ranges(ranges);
        info!("🌍 Geo table loaded from {:?}: {} ranges", path, table.len());
        Ok(table)
    }

    pub fn from_ranges(mut ranges: Vec<(IpNet, GeoInfo)>) -> Self {
        ranges.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl GeoLocator for GeoTable {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        let ip = ip.to_canonical();
        self.ranges
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, info)| info.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("cannot read geo table: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse geo table: {0}")]
    Json(#[from] serde_json::Error),
}
