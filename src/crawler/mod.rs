//! Crawl Scheduler
//!
//! One control task drives periodic crawl rounds:
//!
//! ```text
//!   Idle ──tick──► Running(round) ──done──► Idle ──tick──► ...
//!     │                                       │
//!     └───────────── shutdown ────────────────┴──► Stopped
//! ```
//!
//! The scheduler owns the [`NodeRegistry`] and the active
//! [`EffectiveConfig`], and is the only caller of
//! [`BlacklistFilter::reload_with_strictness`]. Cancellation is checked
//! between rounds only; an in-flight round always runs to completion.

mod round;

pub use round::{RoundError, RoundReport};

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::api::Metrics;
use crate::blacklist::BlacklistFilter;
use crate::config::{ConfigHash, EffectiveConfig, MAX_CRAWL_INTERVAL_SECS};
use crate::discovery::Discovery;
use crate::geo::GeoLocator;
use crate::logging::LogLevelHandle;
use crate::registry::NodeRegistry;
use crate::storage::PeerStore;

/// Lifecycle of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Waiting for the next tick
    Idle,
    /// A crawl round is in progress
    Running,
    /// Cancelled; terminal
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Externally owned services used by crawl rounds
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn Discovery>,
    pub geo: Arc<dyn GeoLocator>,
    pub store: Arc<dyn PeerStore>,
}

/// Periodic crawl driver
pub struct CrawlScheduler {
    /// Configuration file re-read at the start of every round
    config_path: PathBuf,

    /// Settings in force, replaced only when the file hash changes
    config: EffectiveConfig,

    filter: Arc<BlacklistFilter>,
    collaborators: Collaborators,
    registry: NodeRegistry,

    log_handle: Option<LogLevelHandle>,

    /// Snapshot file written after each round
    output: Option<PathBuf>,

    metrics: Arc<Metrics>,

    state_tx: watch::Sender<SchedulerState>,
    registry_tx: watch::Sender<Arc<NodeRegistry>>,
    config_tx: watch::Sender<ConfigHash>,
}

impl CrawlScheduler {
    /// Create a scheduler; the blacklist is built from `config`
    pub fn new(
        config_path: PathBuf,
        config: EffectiveConfig,
        registry: NodeRegistry,
        collaborators: Collaborators,
        metrics: Arc<Metrics>,
    ) -> Self {
        let filter = Arc::new(BlacklistFilter::with_strictness(
            &config.ip_blacklist,
            &config.pubkey_blacklist,
            config.strict_ip_check,
        ));

        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        let (registry_tx, _) = watch::channel(Arc::new(registry.clone()));
        let (config_tx, _) = watch::channel(config.hash);
        metrics.set_registry_size(registry.len() as u64);

        Self {
            config_path,
            config,
            filter,
            collaborators,
            registry,
            log_handle: None,
            output: None,
            metrics,
            state_tx,
            registry_tx,
            config_tx,
        }
    }

    /// Re-apply `log_level` through this handle on configuration changes
    pub fn with_log_handle(mut self, handle: LogLevelHandle) -> Self {
        self.log_handle = Some(handle);
        self
    }

    /// Write the node set to `path` after every round (`-` for stdout)
    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn filter(&self) -> Arc<BlacklistFilter> {
        self.filter.clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    /// Registry snapshot published at the end of every round
    pub fn subscribe_registry(&self) -> watch::Receiver<Arc<NodeRegistry>> {
        self.registry_tx.subscribe()
    }

    /// Hash of the configuration in force
    pub fn subscribe_config(&self) -> watch::Receiver<ConfigHash> {
        self.config_tx.subscribe()
    }

    /// Run rounds until `shutdown` turns true (or its sender is dropped)
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "🕷️  Crawl scheduler started: interval {:?}, timeout {:?}, {} workers",
            self.config.crawl_interval, self.config.discovery_timeout, self.config.max_parallel_crawls
        );

        if !*shutdown.borrow() {
            self.run_round_logged().await;
        }

        let mut period = self.config.crawl_interval;
        let mut ticker = round_timer(period);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_round_logged().await;

                    // A new interval takes effect from the next tick on
                    if self.config.crawl_interval != period {
                        period = self.config.crawl_interval;
                        ticker = round_timer(period);
                        info!("⏱️  Crawl interval changed to {:?}", period);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.state_tx.send_replace(SchedulerState::Stopped);
        info!("🛑 Crawl scheduler stopped");
    }

    /// Move the scheduler onto its own task
    pub fn spawn(mut self, shutdown: watch::Receiver<bool>) -> SchedulerHandle {
        let state = self.state_tx.subscribe();
        let task = tokio::spawn(async move {
            self.run(shutdown).await;
            self.registry
        });

        SchedulerHandle { state, task }
    }

    async fn run_round_logged(&mut self) {
        match self.run_round().await {
            Ok(report) => info!("✅ Crawl round finished: {}", report),
            Err(e) => error!("❌ Crawl round failed: {}", e),
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state_tx.send_replace(state);
    }
}

/// Interval whose first tick is one full period away
fn round_timer(period: Duration) -> Interval {
    let period = period.min(Duration::from_secs(MAX_CRAWL_INTERVAL_SECS));
    let now = Instant::now();
    let start = now.checked_add(period).unwrap_or(now);
    let mut interval = time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Handle to a scheduler running on its own task
pub struct SchedulerHandle {
    state: watch::Receiver<SchedulerState>,
    task: JoinHandle<NodeRegistry>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Resolves once the scheduler has fully stopped
    pub async fn stopped(&mut self) {
        // Err means the task is gone, which is stopped as well
        let _ = self.state.wait_for(|s| *s == SchedulerState::Stopped).await;
    }

    /// Wait for the task and take back the registry
    pub async fn join(self) -> Result<NodeRegistry, JoinError> {
        self.task.await
    }
}

#[cfg(test)]
pub(crate) mod mock;
