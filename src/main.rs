//! KratOs Crawler Service

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kratos_crawler::api::{self, ApiState, Metrics};
use kratos_crawler::config::{load_config, EffectiveConfig, EnvConfig};
use kratos_crawler::crawler::{Collaborators, CrawlScheduler};
use kratos_crawler::discovery::TcpProbe;
use kratos_crawler::geo::{GeoLocator, GeoTable, NoGeo};
use kratos_crawler::logging;
use kratos_crawler::registry::snapshot::{load_node_records, load_snapshot, write_snapshot};
use kratos_crawler::registry::NodeRegistry;
use kratos_crawler::storage::RocksPeerStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = EnvConfig::parse();

    // No previous configuration to fall back to at startup
    let (app_config, hash) =
        load_config(&env.config).with_context(|| format!("cannot load configuration {:?}", env.config))?;

    let log_handle = logging::init(&app_config.log_level)?;

    info!("🕷️  KratOs Crawler v{}", env!("CARGO_PKG_VERSION"));

    let config = EffectiveConfig::build(&app_config, hash);

    info!("⚙️  Configuration ({}):", &config.hash_hex()[..16]);
    info!("   Crawl interval: {:?}", config.crawl_interval);
    info!("   Discovery timeout: {:?}", config.discovery_timeout);
    info!("   Max parallel crawls: {}", config.max_parallel_crawls);
    info!("   Min store score: {}", config.min_store_score);

    // Node set
    let registry = match &env.nodes_file {
        Some(path) if path.exists() => {
            let registry = load_snapshot(path).with_context(|| format!("cannot load node set {:?}", path))?;
            info!("📂 Loaded {} nodes from {:?}", registry.len(), path);
            registry
        }
        Some(path) => {
            warn!("Node set {:?} not found, starting empty", path);
            NodeRegistry::new()
        }
        None => NodeRegistry::new(),
    };

    let mut seeds = registry.node_records();
    if let Some(path) = &env.bootnodes {
        let bootnodes = load_node_records(path).with_context(|| format!("cannot load bootnodes {:?}", path))?;
        info!("🌱 {} bootnodes from {:?}", bootnodes.len(), path);
        seeds.extend(bootnodes);
    }

    let geo: Arc<dyn GeoLocator> = match &env.geoip_table {
        Some(path) => Arc::new(GeoTable::load(path).with_context(|| format!("cannot load geo table {:?}", path))?),
        None => Arc::new(NoGeo),
    };

    tokio::fs::create_dir_all(&env.data_dir).await?;
    let store = Arc::new(RocksPeerStore::open(&env.data_dir.join("peer_store"))?);

    let metrics = Arc::new(Metrics::new());

    let mut scheduler = CrawlScheduler::new(
        env.config.clone(),
        config,
        registry,
        Collaborators {
            discovery: Arc::new(TcpProbe::new(seeds)),
            geo,
            store: store.clone(),
        },
        metrics.clone(),
    )
    .with_log_handle(log_handle);

    if let Some(path) = &env.output {
        scheduler = scheduler.with_output(path.clone());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_handle = if env.api_port != 0 {
        let state = Arc::new(ApiState {
            scheduler: scheduler.subscribe_state(),
            registry: scheduler.subscribe_registry(),
            config_hash: scheduler.subscribe_config(),
            blacklist: scheduler.filter(),
            metrics,
        });
        Some(tokio::spawn(api::run_api_server(env.api_port, state, shutdown_rx.clone())))
    } else {
        None
    };

    let mut crawler = scheduler.spawn(shutdown_rx);

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received, waiting for the current round");

    shutdown_tx.send_replace(true);
    crawler.stopped().await;
    let registry = crawler.join().await?;

    if let Some(handle) = api_handle {
        match handle.await {
            Ok(Err(e)) => error!("HTTP API exited with error: {}", e),
            Err(e) => error!("HTTP API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    // Graceful shutdown: persist node set and flush the store
    if let Some(path) = env.output.as_ref().or(env.nodes_file.as_ref()) {
        write_snapshot(&registry, path)?;
        info!("📂 Node set ({} nodes) written to {:?}", registry.len(), path);
    }

    store.flush()?;
    info!("📦 Peer store flushed to disk");

    info!("👋 KratOs Crawler shutting down");
    Ok(())
}
