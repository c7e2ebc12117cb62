//! Metrics Collection
//!
//! Counters updated by the crawl scheduler, exported by the HTTP API.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for the crawler
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    // === Rounds ===
    pub rounds_total: AtomicU64,
    pub rounds_failed: AtomicU64,
    pub config_reloads: AtomicU64,

    /// Duration of the most recent round
    pub last_round_ms: AtomicU64,

    // === Discovery ===
    pub peers_discovered: AtomicU64,
    pub peers_admitted: AtomicU64,
    pub peers_blacklisted: AtomicU64,
    pub peers_invalid: AtomicU64,

    // === Liveness ===
    pub checks_ok: AtomicU64,
    pub checks_failed: AtomicU64,

    // === Storage ===
    pub records_stored: AtomicU64,
    pub store_failures: AtomicU64,

    /// Current registry size
    pub registry_size: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn inc_rounds(&self) {
        self.rounds_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rounds_failed(&self) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_config_reloads(&self) {
        self.config_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_round_ms(&self, ms: u64) {
        self.last_round_ms.store(ms, Ordering::Relaxed);
    }

    /// Record the outcome of candidate filtering
    pub fn add_discovery(&self, discovered: u64, admitted: u64, blacklisted: u64, invalid: u64) {
        self.peers_discovered.fetch_add(discovered, Ordering::Relaxed);
        self.peers_admitted.fetch_add(admitted, Ordering::Relaxed);
        self.peers_blacklisted.fetch_add(blacklisted, Ordering::Relaxed);
        self.peers_invalid.fetch_add(invalid, Ordering::Relaxed);
    }

    pub fn add_checks(&self, ok: u64, failed: u64) {
        self.checks_ok.fetch_add(ok, Ordering::Relaxed);
        self.checks_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn add_stored(&self, stored: u64, failed: u64) {
        self.records_stored.fetch_add(stored, Ordering::Relaxed);
        self.store_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn set_registry_size(&self, size: u64) {
        self.registry_size.store(size, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let series: [(&str, &str, &str, u64); 14] = [
            ("uptime_seconds", "Crawler uptime in seconds", "gauge", self.uptime_secs()),
            ("rounds_total", "Crawl rounds run", "counter", load(&self.rounds_total)),
            ("rounds_failed", "Crawl rounds that reported an error", "counter", load(&self.rounds_failed)),
            ("config_reloads", "Configuration changes applied", "counter", load(&self.config_reloads)),
            ("last_round_ms", "Duration of the last crawl round", "gauge", load(&self.last_round_ms)),
            ("peers_discovered", "Node records returned by discovery", "counter", load(&self.peers_discovered)),
            ("peers_admitted", "New peers added to the registry", "counter", load(&self.peers_admitted)),
            ("peers_blacklisted", "Candidates rejected by the blacklist", "counter", load(&self.peers_blacklisted)),
            ("peers_invalid", "Candidates with an invalid signature", "counter", load(&self.peers_invalid)),
            ("checks_ok", "Successful liveness checks", "counter", load(&self.checks_ok)),
            ("checks_failed", "Failed liveness checks", "counter", load(&self.checks_failed)),
            ("records_stored", "Rows written to the peer store", "counter", load(&self.records_stored)),
            ("store_failures", "Failed peer store writes", "counter", load(&self.store_failures)),
            ("registry_size", "Peers in the registry", "gauge", load(&self.registry_size)),
        ];

        for (name, help, kind, value) in series {
            let _ = write!(
                output,
                "# HELP kratos_crawler_{name} {help}\n\
                 # TYPE kratos_crawler_{name} {kind}\n\
                 kratos_crawler_{name} {value}\n\n"
            );
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "rounds": {
                "total": load(&self.rounds_total),
                "failed": load(&self.rounds_failed),
                "config_reloads": load(&self.config_reloads),
                "last_round_ms": load(&self.last_round_ms),
            },
            "peers": {
                "discovered": load(&self.peers_discovered),
                "admitted": load(&self.peers_admitted),
                "blacklisted": load(&self.peers_blacklisted),
                "invalid": load(&self.peers_invalid),
                "registry_size": load(&self.registry_size),
            },
            "checks": {
                "ok": load(&self.checks_ok),
                "failed": load(&self.checks_failed),
            },
            "storage": {
                "stored": load(&self.records_stored),
                "failures": load(&self.store_failures),
            },
        })
    }
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
