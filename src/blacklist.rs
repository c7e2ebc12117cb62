//! IP and public key blacklist
//!
//! The active rule set is an immutable [`BlacklistSet`] behind an
//! `RwLock<Arc<_>>`. A reload parses the new lists into a fresh set
//! without holding the lock, then swaps the pointer, so concurrent
//! readers see either the old rules or the new ones, never a mix.

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Counts of loaded rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlacklistStats {
    pub single_ips: usize,
    pub cidr_blocks: usize,
    pub pubkeys: usize,
}

/// One immutable generation of blacklist rules
#[derive(Debug, Default)]
pub struct BlacklistSet {
    ips: HashSet<IpAddr>,
    nets: Vec<IpNet>,
    pubkeys: HashSet<String>,

    /// Treat unparsable addresses as blacklisted
    strict_ip_check: bool,
}

impl BlacklistSet {
    /// Parse rule lists, skipping (and logging) malformed entries
    pub fn parse<S: AsRef<str>>(ip_list: &[S], pubkey_list: &[S], strict_ip_check: bool) -> Self {
        let mut set = BlacklistSet {
            strict_ip_check,
            ..Default::default()
        };

        for entry in ip_list {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }

            // cidr notation
            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => set.nets.push(net.trunc()),
                    Err(e) => warn!("Invalid CIDR in blacklist, skipping: {} ({})", entry, e),
                }
            } else {
                match entry.parse::<IpAddr>() {
                    Ok(ip) => {
                        set.ips.insert(ip.to_canonical());
                    }
                    Err(_) => warn!("Invalid IP address in blacklist, skipping: {}", entry),
                }
            }
        }

        for entry in pubkey_list {
            let entry = entry.as_ref().trim();
            if !entry.is_empty() {
                set.pubkeys.insert(entry.to_ascii_lowercase());
            }
        }

        set
    }

    /// Exact address or CIDR containment match
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.ips.contains(&ip) || self.nets.iter().any(|net| net.contains(&ip))
    }

    /// Match an address given as text
    ///
    /// Unparsable input is not blacklisted unless `strict_ip_check` is set.
    pub fn contains_ip_str(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(ip) => self.contains_ip(ip),
            Err(_) => {
                warn!("Invalid IP address format for blacklist check: {}", ip);
                self.strict_ip_check
            }
        }
    }

    /// Hex keys match regardless of case
    pub fn contains_pubkey(&self, pubkey: &str) -> bool {
        let pubkey = pubkey.trim();
        !pubkey.is_empty() && self.pubkeys.contains(&pubkey.to_ascii_lowercase())
    }

    pub fn stats(&self) -> BlacklistStats {
        BlacklistStats {
            single_ips: self.ips.len(),
            cidr_blocks: self.nets.len(),
            pubkeys: self.pubkeys.len(),
        }
    }
}

/// Blacklist shared between the scheduler (writer) and any number of readers
pub struct BlacklistFilter {
    active: RwLock<Arc<BlacklistSet>>,
}

impl BlacklistFilter {
    /// Create a filter with fail-open address checks
    pub fn new<S: AsRef<str>>(ip_list: &[S], pubkey_list: &[S]) -> Self {
        Self::with_strictness(ip_list, pubkey_list, false)
    }

    pub fn with_strictness<S: AsRef<str>>(ip_list: &[S], pubkey_list: &[S], strict_ip_check: bool) -> Self {
        let set = BlacklistSet::parse(ip_list, pubkey_list, strict_ip_check);
        let stats = set.stats();
        info!(
            "🚫 Blacklist loaded: {} single IPs, {} CIDR blocks, {} pubkeys",
            stats.single_ips, stats.cidr_blocks, stats.pubkeys
        );

        Self {
            active: RwLock::new(Arc::new(set)),
        }
    }

    /// Replace all rules, keeping the current strictness
    pub fn reload<S: AsRef<str>>(&self, ip_list: &[S], pubkey_list: &[S]) {
        let strict = self.active.read().strict_ip_check;
        self.reload_with_strictness(ip_list, pubkey_list, strict);
    }

    /// Replace all rules and the strictness policy
    pub fn reload_with_strictness<S: AsRef<str>>(&self, ip_list: &[S], pubkey_list: &[S], strict_ip_check: bool) {
        // Parse outside the lock, readers keep using the old set meanwhile
        let set = Arc::new(BlacklistSet::parse(ip_list, pubkey_list, strict_ip_check));
        let stats = set.stats();

        *self.active.write() = set;

        info!(
            "🚫 Blacklist reloaded: {} single IPs, {} CIDR blocks, {} pubkeys",
            stats.single_ips, stats.cidr_blocks, stats.pubkeys
        );
    }

    /// Current rule set, stable for as long as the caller holds it
    pub fn snapshot(&self) -> Arc<BlacklistSet> {
        self.active.read().clone()
    }

    pub fn is_ip_blacklisted(&self, ip: &str) -> bool {
        self.active.read().contains_ip_str(ip)
    }

    pub fn is_ip_addr_blacklisted(&self, ip: IpAddr) -> bool {
        self.active.read().contains_ip(ip)
    }

    pub fn is_pubkey_blacklisted(&self, pubkey: &str) -> bool {
        self.active.read().contains_pubkey(pubkey)
    }

    pub fn stats(&self) -> BlacklistStats {
        self.active.read().stats()
    }
}
