//! One crawl round
//!
//! 1. Reload the configuration file; apply it if its hash changed
//! 2. Discover candidates and filter them through the blacklist
//! 3. Add the survivors to the registry
//! 4. Check every non-blacklisted peer, bounded by `max_parallel_crawls`
//! 5. Merge check results into the registry on the scheduler task
//! 6. Store qualifying peers with their location
//! 7. Publish the registry snapshot

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{CrawlScheduler, SchedulerState};
use crate::blacklist::BlacklistSet;
use crate::config::{load_config, EffectiveConfig, MAX_PARALLEL_CRAWLS};
use crate::crypto;
use crate::discovery::DiscoveryError;
use crate::registry::snapshot::{write_snapshot, SnapshotError};
use crate::registry::CheckOutcome;
use crate::storage::NodeUpsert;
use crate::types::{NodeRecord, PeerId, PeerRecord};

/// Counters collected during one round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// The configuration changed at the start of this round
    pub config_reloaded: bool,

    pub discovered: usize,

    /// Peers seen for the first time
    pub admitted: usize,

    pub blacklisted: usize,

    /// Candidates whose signature did not verify
    pub invalid: usize,

    pub checks_ok: usize,
    pub checks_failed: usize,

    pub stored: usize,
    pub store_failed: usize,

    pub duration: Duration,
}

impl std::fmt::Display for RoundReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} discovered ({} new, {} blacklisted, {} invalid), checks {} ok / {} failed, {} stored ({} failed) in {:?}",
            self.discovered,
            self.admitted,
            self.blacklisted,
            self.invalid,
            self.checks_ok,
            self.checks_failed,
            self.stored,
            self.store_failed,
            self.duration
        )
    }
}

/// Round-scoped failure; the scheduler keeps going
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("{failed} of {attempted} storage writes failed")]
    Storage { failed: usize, attempted: usize },

    #[error("cannot write node snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl CrawlScheduler {
    /// Run one crawl round
    ///
    /// Every step runs even when an earlier one reported an error; the
    /// first error is returned after the registry has been published.
    pub async fn run_round(&mut self) -> Result<RoundReport, RoundError> {
        let started = Instant::now();
        self.set_state(SchedulerState::Running);

        let mut report = RoundReport {
            config_reloaded: self.reload_config(),
            ..Default::default()
        };

        // Rules stay fixed for the whole round
        let blacklist = self.filter.snapshot();
        let config = self.config.clone();

        let mut first_error: Option<RoundError> = None;

        // === Discovery ===
        let known = self.registry.node_records();
        let discovery = self
            .collaborators
            .discovery
            .discover(&known, config.discovery_timeout, config.max_parallel_crawls)
            .await;

        if let Some(e) = discovery.error {
            warn!("Discovery reported an error ({} records kept): {}", discovery.nodes.len(), e);
            first_error.get_or_insert(RoundError::Discovery(e));
        }

        report.discovered = discovery.nodes.len();
        let candidates = self.admit(&blacklist, discovery.nodes, &mut report);
        report.admitted = self.registry.add(candidates);

        // === Liveness ===
        let targets: Vec<NodeRecord> = self
            .registry
            .all_records()
            .filter(|peer| !is_blacklisted(&blacklist, peer))
            .map(|peer| peer.record.clone())
            .collect();

        let outcomes = self.check_peers(targets, &config).await;

        let now = Utc::now();
        for (id, outcome) in outcomes {
            if outcome.is_success() {
                report.checks_ok += 1;
            } else {
                report.checks_failed += 1;
            }
            self.registry.apply_check(&id, outcome, now);
        }

        // === Storage ===
        let rows: Vec<NodeUpsert> = self
            .registry
            .all_records()
            .filter(|peer| peer.score >= config.min_store_score && !is_blacklisted(&blacklist, peer))
            .map(|peer| NodeUpsert::from_peer(peer, self.collaborators.geo.lookup(peer.ip())))
            .collect();

        let attempted = rows.len();
        for row in rows {
            let id = row.node_id;
            match self.collaborators.store.upsert(row).await {
                Ok(()) => report.stored += 1,
                Err(e) => {
                    report.store_failed += 1;
                    warn!("Failed to store node {}: {}", id.short(), e);
                }
            }
        }

        if report.store_failed > 0 {
            first_error.get_or_insert(RoundError::Storage {
                failed: report.store_failed,
                attempted,
            });
        }

        // === Publish ===
        self.registry_tx.send_replace(Arc::new(self.registry.clone()));

        if let Some(path) = &self.output {
            if let Err(e) = write_snapshot(&self.registry, path) {
                first_error.get_or_insert(RoundError::Snapshot(e));
            }
        }

        report.duration = started.elapsed();
        self.record_metrics(&report, first_error.is_some());
        self.set_state(SchedulerState::Idle);

        match first_error {
            Some(e) => {
                info!("📊 Round summary: {}", report);
                Err(e)
            }
            None => Ok(report),
        }
    }

    /// Re-read the configuration file, returning whether it was applied
    ///
    /// A file that cannot be read or parsed leaves the current
    /// configuration in force.
    pub(super) fn reload_config(&mut self) -> bool {
        let (app_config, hash) = match load_config(&self.config_path) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("⚠️  Config reload failed, keeping previous configuration: {}", e);
                return false;
            }
        };

        if hash == self.config.hash {
            return false;
        }

        let next = EffectiveConfig::build(&app_config, hash);

        self.filter
            .reload_with_strictness(&next.ip_blacklist, &next.pubkey_blacklist, next.strict_ip_check);

        if let Some(handle) = &self.log_handle {
            if let Err(e) = handle.set_level(&next.log_level) {
                warn!("Cannot apply log level '{}': {}", next.log_level, e);
            }
        }

        info!(
            "🔄 Configuration changed ({}): interval {:?}, timeout {:?}, {} workers",
            &next.hash_hex()[..16],
            next.crawl_interval,
            next.discovery_timeout,
            next.max_parallel_crawls
        );

        self.config = next;
        self.config_tx.send_replace(hash);
        self.metrics.inc_config_reloads();
        true
    }

    /// Drop blacklisted and badly signed candidates
    fn admit(&self, blacklist: &BlacklistSet, nodes: Vec<NodeRecord>, report: &mut RoundReport) -> Vec<NodeRecord> {
        let mut admitted = Vec::with_capacity(nodes.len());

        for node in nodes {
            if is_record_blacklisted(blacklist, &node) {
                debug!("Skipping blacklisted node {} ({})", node.id().short(), node.ip);
                report.blacklisted += 1;
                continue;
            }

            if let Err(e) = crypto::verify_node_record(&node) {
                debug!("Skipping node {} with bad record: {}", node.id().short(), e);
                report.invalid += 1;
                continue;
            }

            admitted.push(node);
        }

        admitted
    }

    /// Check peers concurrently and collect the outcomes
    async fn check_peers(&self, targets: Vec<NodeRecord>, config: &EffectiveConfig) -> Vec<(PeerId, CheckOutcome)> {
        let permits = Arc::new(Semaphore::new(
            config.max_parallel_crawls.clamp(1, MAX_PARALLEL_CRAWLS),
        ));
        let timeout = config.discovery_timeout;
        let mut tasks = JoinSet::new();

        for node in targets {
            let permits = permits.clone();
            let discovery = self.collaborators.discovery.clone();

            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => tokio::time::timeout(timeout, discovery.check(&node, timeout))
                        .await
                        .unwrap_or(CheckOutcome::Unreachable),
                    Err(_) => CheckOutcome::Unreachable,
                };
                (node.id(), outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Liveness check task failed: {}", e),
            }
        }

        outcomes
    }

    fn record_metrics(&self, report: &RoundReport, failed: bool) {
        let m = &self.metrics;
        m.inc_rounds();
        if failed {
            m.inc_rounds_failed();
        }
        m.set_last_round_ms(report.duration.as_millis() as u64);
        m.add_discovery(
            report.discovered as u64,
            report.admitted as u64,
            report.blacklisted as u64,
            report.invalid as u64,
        );
        m.add_checks(report.checks_ok as u64, report.checks_failed as u64);
        m.add_stored(report.stored as u64, report.store_failed as u64);
        m.set_registry_size(self.registry.len() as u64);
    }
}

/// Blacklisted by address, public key or peer ID
fn is_record_blacklisted(blacklist: &BlacklistSet, node: &NodeRecord) -> bool {
    blacklist.contains_ip(node.ip)
        || blacklist.contains_pubkey(&node.public_key_hex())
        || blacklist.contains_pubkey(&node.id().to_string())
}

fn is_blacklisted(blacklist: &BlacklistSet, peer: &PeerRecord) -> bool {
    is_record_blacklisted(blacklist, &peer.record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::mock::{self, MockDiscovery, MockStore};
    use crate::registry::snapshot::load_snapshot;
    use crate::types::ClientInfo;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_round_admits_checks_and_stores() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(3);
        let discovery = MockDiscovery::new(nodes.clone());
        discovery.set_outcome(nodes[1].id(), CheckOutcome::Unreachable);
        discovery.set_outcome(nodes[2].id(), CheckOutcome::TooManyPeers);
        let store = MockStore::new();

        let mut scheduler = mock::scheduler(dir.path(), r#"{}"#, discovery.clone(), store.clone());
        let report = scheduler.run_round().await.unwrap();

        assert!(!report.config_reloaded);
        assert_eq!(report.discovered, 3);
        assert_eq!(report.admitted, 3);
        assert_eq!(report.checks_ok, 2);
        assert_eq!(report.checks_failed, 1);
        // unreachable peer has score 0, below min_store_score
        assert_eq!(report.stored, 2);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let registry = scheduler.registry();
        assert_eq!(registry.get(&nodes[0].id()).unwrap().score, 1);
        assert_eq!(registry.get(&nodes[1].id()).unwrap().score, 0);
        assert!(registry.get(&nodes[2].id()).unwrap().too_many_peers);

        assert!(store.get(&nodes[0].id()).is_some());
        assert_eq!(store.get(&nodes[2].id()).unwrap().client_type, "tmp");
        assert!(store.get(&nodes[1].id()).is_none());
    }

    #[tokio::test]
    async fn test_scores_across_rounds() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(1);
        let id = nodes[0].id();
        let discovery = MockDiscovery::new(nodes);
        let info = ClientInfo {
            client_type: "kratos".to_string(),
            ..Default::default()
        };
        discovery.set_outcome(id, CheckOutcome::alive(Some(info.clone())));

        let mut scheduler = mock::scheduler(dir.path(), r#"{}"#, discovery.clone(), MockStore::new());
        for _ in 0..5 {
            scheduler.run_round().await.unwrap();
        }
        assert_eq!(scheduler.registry().get(&id).unwrap().score, 5);

        discovery.set_outcome(id, CheckOutcome::Unreachable);
        scheduler.run_round().await.unwrap();

        let peer = scheduler.registry().get(&id).unwrap();
        assert_eq!(peer.score, 2);
        assert_eq!(peer.client_info, Some(info));
        assert!(peer.last_check > peer.last_response);
    }

    #[tokio::test]
    async fn test_blacklisted_candidates_are_rejected() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(4);
        let config = format!(
            r#"{{"ip_blacklist": ["{}", "10.9.0.0/16"], "pubkey_blacklist": ["{}", "{}"]}}"#,
            nodes[0].ip,
            nodes[1].public_key_hex(),
            nodes[2].id()
        );

        let discovery = MockDiscovery::new(nodes.clone());
        let mut scheduler = mock::scheduler(dir.path(), &config, discovery.clone(), MockStore::new());
        let report = scheduler.run_round().await.unwrap();

        assert_eq!(report.blacklisted, 3);
        assert_eq!(report.admitted, 1);
        assert_eq!(scheduler.registry().len(), 1);
        assert!(scheduler.registry().contains(&nodes[3].id()));
        assert_eq!(discovery.checked(), vec![nodes[3].id()]);
    }

    #[tokio::test]
    async fn test_uppercase_key_entries_are_rejected() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(3);
        let config = format!(
            r#"{{"pubkey_blacklist": ["{}", "{}"]}}"#,
            nodes[0].public_key_hex().to_uppercase(),
            nodes[1].id().to_string().to_uppercase()
        );

        let discovery = MockDiscovery::new(nodes.clone());
        let mut scheduler = mock::scheduler(dir.path(), &config, discovery.clone(), MockStore::new());
        let report = scheduler.run_round().await.unwrap();

        assert_eq!(report.blacklisted, 2);
        assert_eq!(scheduler.registry().len(), 1);
        assert!(scheduler.registry().contains(&nodes[2].id()));
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let dir = tempdir().unwrap();
        let mut nodes = mock::nodes(2);
        nodes[0].tcp_port = Some(1);

        let mut scheduler = mock::scheduler(dir.path(), r#"{}"#, MockDiscovery::new(nodes.clone()), MockStore::new());
        let report = scheduler.run_round().await.unwrap();

        assert_eq!(report.invalid, 1);
        assert!(!scheduler.registry().contains(&nodes[0].id()));
        assert!(scheduler.registry().contains(&nodes[1].id()));
    }

    #[tokio::test]
    async fn test_config_change_applies_from_next_round() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(2);
        let target = nodes[0].clone();

        let discovery = MockDiscovery::new(nodes.clone());
        let mut scheduler = mock::scheduler(dir.path(), r#"{}"#, discovery.clone(), MockStore::new());

        // Operator edits the file while round 1 is discovering
        let config_path = dir.path().join(mock::CONFIG_FILE);
        let edited = format!(r#"{{"ip_blacklist": ["{}/32"], "log_level": "debug"}}"#, target.ip);
        discovery.on_discover(move || std::fs::write(&config_path, edited).unwrap());

        let round1 = scheduler.run_round().await.unwrap();
        assert!(!round1.config_reloaded);
        assert_eq!(round1.blacklisted, 0);
        assert_eq!(round1.admitted, 2);
        assert_eq!(discovery.checked().len(), 2);
        assert!(!scheduler.filter().is_ip_addr_blacklisted(target.ip));

        discovery.clear_checked();
        let old_hash = scheduler.config().hash;

        let round2 = scheduler.run_round().await.unwrap();
        assert!(round2.config_reloaded);
        assert_eq!(round2.blacklisted, 1);
        assert_ne!(scheduler.config().hash, old_hash);
        assert_eq!(scheduler.config().log_level, "debug");
        assert!(scheduler.filter().is_ip_addr_blacklisted(target.ip));
        assert_eq!(*scheduler.subscribe_config().borrow(), scheduler.config().hash);

        // already known peer is kept but no longer checked
        assert!(scheduler.registry().contains(&target.id()));
        assert_eq!(discovery.checked(), vec![nodes[1].id()]);
    }

    #[tokio::test]
    async fn test_malformed_reload_keeps_previous_config() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(1);
        let config = format!(r#"{{"ip_blacklist": ["{}"], "discovery_timeout_secs": 3}}"#, nodes[0].ip);
        let mut scheduler = mock::scheduler(dir.path(), &config, MockDiscovery::new(nodes.clone()), MockStore::new());
        let before = scheduler.config().clone();

        let config_path = dir.path().join(mock::CONFIG_FILE);
        for broken in [
            "{ not json",
            r#"{"crawl_interval_secs": 0}"#,
            r#"{"crawl_interval_secs": 18446744073709551615}"#,
            r#"{"max_parallel_crawls": 18446744073709551615}"#,
            r#"{"discovery_timeout_secs": 86400}"#,
        ] {
            std::fs::write(&config_path, broken).unwrap();

            let report = scheduler.run_round().await.unwrap();
            assert!(!report.config_reloaded);
            assert_eq!(report.blacklisted, 1);
            assert_eq!(scheduler.config(), &before);
        }

        std::fs::remove_file(&config_path).unwrap();
        assert!(!scheduler.reload_config());
        assert_eq!(scheduler.config(), &before);
    }

    #[tokio::test]
    async fn test_unchanged_bytes_do_not_reload() {
        let dir = tempdir().unwrap();
        let mut scheduler = mock::scheduler(dir.path(), r#"{"log_level": "info"}"#, MockDiscovery::new(vec![]), MockStore::new());

        let config_path = dir.path().join(mock::CONFIG_FILE);
        std::fs::write(&config_path, r#"{"log_level": "info"}"#).unwrap();
        assert!(!scheduler.reload_config());

        std::fs::write(&config_path, r#"{"log_level": "info" }"#).unwrap();
        assert!(scheduler.reload_config());
        assert!(!scheduler.reload_config());
    }

    #[tokio::test]
    async fn test_storage_failures_are_contained() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(3);
        let store = MockStore::new();
        store.fail_for(nodes[1].id());

        let mut scheduler = mock::scheduler(dir.path(), r#"{}"#, MockDiscovery::new(nodes.clone()), store.clone());
        let err = scheduler.run_round().await.unwrap_err();

        assert!(matches!(err, RoundError::Storage { failed: 1, attempted: 3 }));
        assert_eq!(store.len(), 2);
        // the round still completed
        assert_eq!(scheduler.registry().len(), 3);
        assert_eq!(scheduler.subscribe_registry().borrow().len(), 3);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.metrics.rounds_failed.load(Ordering::Relaxed), 1);

        // next round is unaffected
        store.clear_failures();
        assert!(scheduler.run_round().await.is_ok());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_partial_discovery_is_kept() {
        let dir = tempdir().unwrap();
        let nodes = mock::nodes(2);
        let discovery = MockDiscovery::new(nodes);
        discovery.fail_with(DiscoveryError::Timeout);

        let mut scheduler = mock::scheduler(dir.path(), r#"{}"#, discovery, MockStore::new());
        let err = scheduler.run_round().await.unwrap_err();

        assert!(matches!(err, RoundError::Discovery(DiscoveryError::Timeout)));
        assert_eq!(scheduler.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_written_after_round() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out").join("nodes.json");
        let nodes = mock::nodes(2);

        let mut scheduler = mock::scheduler(dir.path(), r#"{}"#, MockDiscovery::new(nodes), MockStore::new())
            .with_output(output.clone());
        scheduler.run_round().await.unwrap();

        let loaded = load_snapshot(&output).unwrap();
        assert_eq!(&loaded, scheduler.registry());
    }

    #[tokio::test]
    async fn test_parallel_checks_are_bounded() {
        let dir = tempdir().unwrap();
        let discovery = MockDiscovery::new(mock::nodes(12));
        discovery.set_check_delay(Duration::from_millis(20));

        let mut scheduler = mock::scheduler(
            dir.path(),
            r#"{"max_parallel_crawls": 3}"#,
            discovery.clone(),
            MockStore::new(),
        );
        let report = scheduler.run_round().await.unwrap();

        assert_eq!(report.checks_ok, 12);
        assert!(discovery.max_in_flight() <= 3);
    }
}
