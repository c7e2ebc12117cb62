//! In-memory collaborators for scheduler tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Collaborators, CrawlScheduler};
use crate::api::Metrics;
use crate::config::{load_config, EffectiveConfig};
use crate::crypto::{generate_keypair, sign_node_record};
use crate::discovery::{Discovery, DiscoveryError, DiscoveryReport};
use crate::geo::NoGeo;
use crate::registry::{CheckOutcome, NodeRegistry};
use crate::storage::{NodeUpsert, PeerStore, StoreError};
use crate::types::{NodeRecord, PeerId};

pub const CONFIG_FILE: &str = "crawler.json";

/// Signed records on 10.0.0.1, 10.0.0.2, ...
pub fn nodes(count: u8) -> Vec<NodeRecord> {
    (1..=count)
        .map(|i| {
            let ip = format!("10.0.0.{}", i).parse().unwrap();
            sign_node_record(&generate_keypair(), 1, ip, Some(30333), Some(30333))
        })
        .collect()
}

/// Scheduler over an empty registry, configured from `config_json`
pub fn scheduler(dir: &Path, config_json: &str, discovery: Arc<MockDiscovery>, store: Arc<MockStore>) -> CrawlScheduler {
    let config_path = dir.join(CONFIG_FILE);
    std::fs::write(&config_path, config_json).unwrap();
    let (app_config, hash) = load_config(&config_path).unwrap();

    CrawlScheduler::new(
        config_path,
        EffectiveConfig::build(&app_config, hash),
        NodeRegistry::new(),
        Collaborators {
            discovery,
            geo: Arc::new(NoGeo),
            store,
        },
        Arc::new(Metrics::new()),
    )
}

type Hook = Box<dyn FnOnce() + Send>;

/// Discovery returning fixed records; every peer is alive unless told otherwise
#[derive(Default)]
pub struct MockDiscovery {
    nodes: Vec<NodeRecord>,
    error: Mutex<Option<DiscoveryError>>,
    outcomes: Mutex<HashMap<PeerId, CheckOutcome>>,
    on_discover: Mutex<Option<Hook>>,
    check_delay: Mutex<Option<Duration>>,

    discover_calls: AtomicUsize,
    checked: Mutex<Vec<PeerId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockDiscovery {
    pub fn new(nodes: Vec<NodeRecord>) -> Arc<Self> {
        Arc::new(Self {
            nodes,
            ..Default::default()
        })
    }

    pub fn set_outcome(&self, id: PeerId, outcome: CheckOutcome) {
        self.outcomes.lock().insert(id, outcome);
    }

    /// Report `error` alongside the records from now on
    pub fn fail_with(&self, error: DiscoveryError) {
        *self.error.lock() = Some(error);
    }

    /// Run `hook` during the next discovery pass
    pub fn on_discover(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_discover.lock() = Some(Box::new(hook));
    }

    pub fn set_check_delay(&self, delay: Duration) {
        *self.check_delay.lock() = Some(delay);
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    /// Checked peer IDs in ascending order
    pub fn checked(&self) -> Vec<PeerId> {
        let mut checked = self.checked.lock().clone();
        checked.sort();
        checked
    }

    pub fn clear_checked(&self) {
        self.checked.lock().clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn discover(&self, _known: &[NodeRecord], _timeout: Duration, _workers: usize) -> DiscoveryReport {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);

        let hook = self.on_discover.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        let error = self.error.lock().clone();
        match error {
            Some(e) => DiscoveryReport::partial(self.nodes.clone(), e),
            None => DiscoveryReport::complete(self.nodes.clone()),
        }
    }

    async fn check(&self, node: &NodeRecord, _timeout: Duration) -> CheckOutcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.check_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = node.id();
        self.checked.lock().push(id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self.outcomes.lock().get(&id).cloned();
        outcome.unwrap_or(CheckOutcome::alive(None))
    }
}

/// Store keeping rows in a map, optionally failing for chosen peers
#[derive(Default)]
pub struct MockStore {
    rows: Mutex<HashMap<PeerId, NodeUpsert>>,
    failing: Mutex<HashSet<PeerId>>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, id: PeerId) {
        self.failing.lock().insert(id);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn get(&self, id: &PeerId) -> Option<NodeUpsert> {
        self.rows.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }
}

#[async_trait]
impl PeerStore for MockStore {
    async fn upsert(&self, node: NodeUpsert) -> Result<(), StoreError> {
        if self.failing.lock().contains(&node.node_id) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.rows.lock().insert(node.node_id, node);
        Ok(())
    }
}
