//! Crawler Configuration
//!
//! Operator-tunable settings live in a JSON file that is re-read at the
//! start of every crawl round. The Blake3 hash of its raw bytes decides
//! whether anything changed; only then is a new [`EffectiveConfig`] built.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::crypto;
use crate::types::Hash;

/// Blake3 hash of the raw configuration file
pub type ConfigHash = Hash;

/// Accepted values for `log_level`
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Upper bound for `crawl_interval_secs` (one week)
pub const MAX_CRAWL_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// Upper bound for `discovery_timeout_secs` (one hour)
pub const MAX_DISCOVERY_TIMEOUT_SECS: u64 = 3600;

/// Upper bound for `max_parallel_crawls`
pub const MAX_PARALLEL_CRAWLS: usize = 10_000;

/// Key holding the IP/CIDR list in an IP blacklist source file
pub const IP_BLACKLIST_KEY: &str = "ip_blacklists";

/// Key holding the pubkey list in a pubkey blacklist source file
pub const PUBKEY_BLACKLIST_KEY: &str = "pubkey_blacklists";

/// Configuration file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    // === Blacklists ===

    /// Blacklisted IP addresses, may contain CIDR ranges
    pub ip_blacklist: Vec<String>,

    /// Blacklisted public keys or peer IDs (hex)
    pub pubkey_blacklist: Vec<String>,

    /// Optional JSON file with more IPs under `ip_blacklists`
    pub ip_blacklist_path: Option<PathBuf>,

    /// Optional JSON file with more pubkeys under `pubkey_blacklists`
    pub pubkey_blacklist_path: Option<PathBuf>,

    /// Treat unparsable peer addresses as blacklisted
    pub strict_ip_check: bool,

    // === Timing ===

    /// Interval between crawl rounds (seconds)
    pub crawl_interval_secs: u64,

    /// Timeout for one discovery pass or liveness check (seconds)
    pub discovery_timeout_secs: u64,

    // === Limits ===

    /// Maximum concurrent liveness checks
    pub max_parallel_crawls: usize,

    /// Minimum score for a peer to be written to storage
    pub min_store_score: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),

            ip_blacklist: vec![],
            pubkey_blacklist: vec![],
            ip_blacklist_path: None,
            pubkey_blacklist_path: None,
            strict_ip_check: false,

            crawl_interval_secs: 1800,   // 30 minutes
            discovery_timeout_secs: 10,

            max_parallel_crawls: 100,
            min_store_score: 1,
        }
    }
}

impl AppConfig {
    /// Parse and validate configuration bytes
    pub fn from_slice(content: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level '{}' must be one of {:?}",
                self.log_level, LOG_LEVELS
            )));
        }

        if !(1..=MAX_CRAWL_INTERVAL_SECS).contains(&self.crawl_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "crawl_interval_secs must be between 1 and {}",
                MAX_CRAWL_INTERVAL_SECS
            )));
        }

        if !(1..=MAX_DISCOVERY_TIMEOUT_SECS).contains(&self.discovery_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "discovery_timeout_secs must be between 1 and {}",
                MAX_DISCOVERY_TIMEOUT_SECS
            )));
        }

        if !(1..=MAX_PARALLEL_CRAWLS).contains(&self.max_parallel_crawls) {
            return Err(ConfigError::Invalid(format!(
                "max_parallel_crawls must be between 1 and {}",
                MAX_PARALLEL_CRAWLS
            )));
        }

        Ok(())
    }
}

/// Read the configuration file and hash its raw bytes
pub fn load_config(path: &Path) -> Result<(AppConfig, ConfigHash), ConfigError> {
    let content = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let hash = crypto::hash(&content);
    let config = AppConfig::from_slice(&content)?;
    Ok((config, hash))
}

/// Read a list of strings stored under `key` in a JSON object file
///
/// A missing file, missing key or non-array value yields an empty list.
/// Non-string array elements are skipped.
pub fn load_json_list(path: &Path, key: &str) -> Vec<String> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read list file {:?}: {}", path, e);
            return vec![];
        }
    };

    let value: serde_json::Value = match serde_json::from_slice(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!("List file {:?} is not valid JSON: {}", path, e);
            return vec![];
        }
    };

    let Some(items) = value.get(key).and_then(|v| v.as_array()) else {
        warn!("List file {:?} has no array under '{}'", path, key);
        return vec![];
    };

    let list: Vec<String> = items
        .iter()
        .filter_map(|item| match item.as_str() {
            Some(s) => Some(s.to_string()),
            None => {
                debug!("Skipping non-string entry {} in {:?}", item, path);
                None
            }
        })
        .collect();

    debug!("Loaded {} entries from {:?} ('{}')", list.len(), path, key);
    list
}

/// Settings in force for crawl rounds, tied to one configuration hash
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub hash: ConfigHash,
    pub log_level: String,
    pub crawl_interval: Duration,
    pub discovery_timeout: Duration,
    pub max_parallel_crawls: usize,
    pub min_store_score: u32,

    /// Inline entries followed by those from the source file
    pub ip_blacklist: Vec<String>,
    pub pubkey_blacklist: Vec<String>,
    pub strict_ip_check: bool,
}

impl EffectiveConfig {
    /// Resolve a parsed configuration, reading blacklist source files
    pub fn build(config: &AppConfig, hash: ConfigHash) -> Self {
        let mut ip_blacklist = config.ip_blacklist.clone();
        if let Some(path) = &config.ip_blacklist_path {
            ip_blacklist.extend(load_json_list(path, IP_BLACKLIST_KEY));
        }

        let mut pubkey_blacklist = config.pubkey_blacklist.clone();
        if let Some(path) = &config.pubkey_blacklist_path {
            pubkey_blacklist.extend(load_json_list(path, PUBKEY_BLACKLIST_KEY));
        }

        Self {
            hash,
            log_level: config.log_level.clone(),
            crawl_interval: Duration::from_secs(config.crawl_interval_secs),
            discovery_timeout: Duration::from_secs(config.discovery_timeout_secs),
            max_parallel_crawls: config.max_parallel_crawls,
            min_store_score: config.min_store_score,
            ip_blacklist,
            pubkey_blacklist,
            strict_ip_check: config.strict_ip_check,
        }
    }

    pub fn hash_hex(&self) -> String {
        crypto::hash_to_hex(&self.hash)
    }
}

/// Process settings from the command line or environment
///
/// Unlike [`AppConfig`] these are read once at startup.
#[derive(Parser, Debug, Clone)]
#[command(name = "kratos-crawler")]
#[command(author = "KratOs Contributors")]
#[command(version)]
#[command(about = "Peer crawler for the KratOs network", long_about = None)]
pub struct EnvConfig {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "CRAWLER_CONFIG", default_value = "crawler.json")]
    pub config: PathBuf,

    /// Data directory for the peer store
    #[arg(short, long, env = "CRAWLER_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Node set snapshot loaded at startup and written on shutdown
    #[arg(long, env = "CRAWLER_NODES_FILE")]
    pub nodes_file: Option<PathBuf>,

    /// Write the node set here after every round ("-" for stdout)
    #[arg(short, long, env = "CRAWLER_OUTPUT")]
    pub output: Option<PathBuf>,

    /// CIDR to location table (JSON)
    #[arg(long, env = "CRAWLER_GEOIP_TABLE")]
    pub geoip_table: Option<PathBuf>,

    /// HTTP API port, 0 disables the API
    #[arg(long, env = "CRAWLER_API_PORT", default_value = "8080")]
    pub api_port: u16,

    /// JSON array of signed node records to start crawling from
    #[arg(long, env = "CRAWLER_BOOTNODES")]
    pub bootnodes: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
