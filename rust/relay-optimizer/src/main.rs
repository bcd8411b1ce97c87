//! Relay Optimizer Service
//!
//! Runs one optimization loop per configured node against a shared relay
//! inventory, keeps each node's topology document fresh and serves the
//! selection over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RELAY OPTIMIZER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Optimizer (per node)   ←── fetch, probe, rank every cycle  │
//! │  Inventory (RocksDB)    ←── shared relay records + lock     │
//! │  Topology Writer        ←── pinned + best + random relays   │
//! │  HTTP API (8090)        ←── selection queries and metrics   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use relay_optimizer::api::{self, ApiState, Metrics};
use relay_optimizer::config::{NodeConfig, OptimizerConfig, StoreBackend};
use relay_optimizer::inventory::{InventoryStore, MemoryStore, RedisStore, RocksStore};
use relay_optimizer::nettest::NetTester;
use relay_optimizer::optimizer::{Optimizer, RelaySelector};
use relay_optimizer::probe::SystemProber;
use relay_optimizer::topology::{self, HttpDownloader, TopologyWriter};
use relay_optimizer::types::PeerRecord;

/// How long a stopping optimizer may take to finish its current cycle
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Relay Optimizer - latency-ranked relay discovery for producer fleets
#[derive(Parser, Debug)]
#[command(name = "relay-optimizer")]
#[command(author = "Relay Optimizer Contributors")]
#[command(version)]
#[command(about = "Discovers, probes and ranks relays for block producer nodes", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "relay-optimizer.toml")]
    config: PathBuf,

    /// Inventory database directory (overrides store.path)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Only serve this node (defaults to every configured node)
    #[arg(long, global = true)]
    node: Option<String>,

    /// HTTP API port
    #[arg(long, global = true)]
    api_port: Option<u16>,

    /// Seconds between optimization cycles
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the optimizer loops, topology writers and HTTP API (default)
    Run,

    /// Run a single optimization cycle and exit
    Cycle,

    /// Print a topology document built from the current inventory
    Relays {
        /// Number of relays to select
        #[arg(long)]
        size: Option<usize>,
    },

    /// Probe the given peers once and print their measured latency
    Probe {
        /// Peers as ADDR or ADDR:PORT
        #[arg(required = true)]
        peers: Vec<String>,

        /// Port used when a peer has none
        #[arg(long, default_value = "3001")]
        port: u16,
    },

    /// Write a default configuration file and exit
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into())
        )
        .init();

    info!("🛰️  Relay Optimizer v{}", env!("CARGO_PKG_VERSION"));

    if let Some(Command::InitConfig) = args.command {
        return init_config(&args.config);
    }

    // Load configuration
    let config = if args.config.exists() {
        OptimizerConfig::load(&args.config)
            .with_context(|| format!("loading {:?}", args.config))?
    } else {
        warn!("Config file not found, using defaults");
        OptimizerConfig::default()
    };

    // Override config with CLI args
    let config = config
        .with_store_path(args.data_dir.clone())
        .with_api_port(args.api_port)
        .with_cycle_interval_secs(args.interval);

    config.validate()?;

    let nodes = selected_nodes(&config, args.node.as_deref())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, nodes).await,
        Command::Cycle => cycle(config, nodes).await,
        Command::Relays { size } => relays(config, &nodes[0], size).await,
        Command::Probe { peers, port } => probe(config, &peers, port).await,
        Command::InitConfig => Ok(()),
    }
}

fn init_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{:?} already exists", path);
    }

    OptimizerConfig::default().save(path)?;
    info!("📝 Default configuration written to {:?}", path);
    Ok(())
}

fn selected_nodes(config: &OptimizerConfig, name: Option<&str>) -> anyhow::Result<Vec<NodeConfig>> {
    match name {
        Some(name) => config
            .node(Some(name))
            .cloned()
            .map(|node| vec![node])
            .ok_or_else(|| anyhow::anyhow!("no node named {} in configuration", name)),
        None if config.nodes.is_empty() => anyhow::bail!("no nodes configured"),
        None => Ok(config.nodes.clone()),
    }
}

/// Open the configured inventory backend
///
/// The RocksDB handle is returned separately so it can be flushed on shutdown.
async fn open_store(config: &OptimizerConfig) -> anyhow::Result<(Arc<dyn InventoryStore>, Option<Arc<RocksStore>>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory inventory; nothing survives a restart");
            let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new());
            Ok((store, None))
        }
        StoreBackend::Rocksdb => {
            let rocks = Arc::new(RocksStore::open(&config.store.path)?);
            info!("📦 Inventory opened at {:?}", config.store.path);
            let store: Arc<dyn InventoryStore> = rocks.clone();
            Ok((store, Some(rocks)))
        }
        StoreBackend::Redis => {
            let store: Arc<dyn InventoryStore> = Arc::new(
                RedisStore::connect(&config.store.url)
                    .await
                    .with_context(|| format!("connecting to inventory at {}", config.store.url))?,
            );
            Ok((store, None))
        }
    }
}

fn build_optimizers(
    config: &OptimizerConfig,
    nodes: Vec<NodeConfig>,
    store: Arc<dyn InventoryStore>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<Vec<Arc<Optimizer>>> {
    let prober = Arc::new(SystemProber::new(&config.nettest));
    let downloader = Arc::new(HttpDownloader::new(config.topology.http_timeout())?);

    Ok(nodes
        .into_iter()
        .map(|node| {
            Arc::new(Optimizer::new(
                config,
                node,
                store.clone(),
                prober.clone(),
                downloader.clone(),
                metrics.clone(),
            ))
        })
        .collect())
}

async fn run(config: OptimizerConfig, nodes: Vec<NodeConfig>) -> anyhow::Result<()> {
    info!("⚙️  Configuration:");
    info!("   Nodes: {}", nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", "));
    info!("   Cycle interval: {}s", config.optimizer.cycle_interval_secs);
    info!("   Inventory backend: {:?}", config.store.backend);
    info!("   Lock: {} (ttl {}s)", config.lock.name, config.lock.ttl_secs);
    if config.api.enabled {
        info!("   API port: {}", config.api.port);
    }

    let (store, rocks) = open_store(&config).await?;
    let metrics = Arc::new(Metrics::new());
    let optimizers = build_optimizers(&config, nodes, store.clone(), metrics.clone())?;

    let (shutdown, _) = watch::channel(false);
    let mut loops = tokio::task::JoinSet::new();
    let mut services = tokio::task::JoinSet::new();

    for optimizer in &optimizers {
        loops.spawn(supervise(
            optimizer.clone(),
            config.optimizer.restart_pause(),
            shutdown.subscribe(),
        ));

        let writer = Arc::new(TopologyWriter::new(
            optimizer.node().clone(),
            Arc::new(optimizer.selector()),
        ));
        services.spawn(topology::run_periodic_writer(writer, config.topology.writer_interval()));
    }

    if config.api.enabled {
        let state = Arc::new(ApiState {
            selector: Arc::new(RelaySelector::new(
                store.clone(),
                config.lock.name.clone(),
                0,
                Duration::ZERO,
            )),
            optimizers: optimizers.clone(),
            default_size: optimizers.first().map(|o| o.node().peers).unwrap_or(20),
            metrics: metrics.clone(),
        });
        let port = config.api.port;
        services.spawn(async move {
            if let Err(e) = api::run_api_server(state, port).await {
                error!("HTTP API exited: {}", e);
            }
        });
    }

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        Some(result) = services.join_next() => {
            error!("Service exited: {:?}", result);
        }
    }

    services.abort_all();
    shutdown.send_replace(true);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while loops.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Optimizers still busy after {}s, abandoning their cycles",
            SHUTDOWN_GRACE.as_secs()
        );
        loops.abort_all();
    }

    if let Some(rocks) = rocks {
        rocks.flush()?;
        info!("📦 Inventory flushed to disk");
    }

    info!("👋 Relay Optimizer shutting down");
    Ok(())
}

/// Keep one optimizer loop alive until shutdown, restarting it after failures
async fn supervise(optimizer: Arc<Optimizer>, pause: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        let mut handle = optimizer.clone().run();

        tokio::select! {
            result = handle.finished() => match result {
                Ok(()) => return,
                Err(e) => warn!(
                    "Optimizer for {} failed ({}), restarting in {}s",
                    optimizer.node().name,
                    e,
                    pause.as_secs()
                ),
            },
            _ = shutdown.changed() => {
                handle.stop();
                if let Err(e) = handle.wait().await {
                    warn!("Optimizer for {} ended with: {}", optimizer.node().name, e);
                }
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn cycle(config: OptimizerConfig, nodes: Vec<NodeConfig>) -> anyhow::Result<()> {
    let (store, rocks) = open_store(&config).await?;
    let metrics = Arc::new(Metrics::new());

    for optimizer in build_optimizers(&config, nodes, store, metrics)? {
        let report = optimizer.cycle().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if let Some(rocks) = rocks {
        rocks.flush()?;
    }
    Ok(())
}

async fn relays(config: OptimizerConfig, node: &NodeConfig, size: Option<usize>) -> anyhow::Result<()> {
    let (store, _) = open_store(&config).await?;
    let selector = RelaySelector::new(store, config.lock.name.clone(), 0, Duration::ZERO);

    let relays = selector.relays(size.unwrap_or(node.peers)).await?;
    let document = topology::compose_document(node, &relays);
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

/// Parse `ADDR` or `ADDR:PORT`; bracketed IPv6 literals keep their colons
fn parse_target(target: &str, default_port: u16) -> anyhow::Result<PeerRecord> {
    if let Ok(addr) = target.parse::<std::net::SocketAddr>() {
        return Ok(PeerRecord::new(addr.ip().to_string(), addr.port()));
    }
    if target.parse::<std::net::IpAddr>().is_ok() {
        return Ok(PeerRecord::new(target, default_port));
    }

    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in {}", target))?;
            Ok(PeerRecord::new(host, port))
        }
        None => Ok(PeerRecord::new(target, default_port)),
    }
}

async fn probe(config: OptimizerConfig, targets: &[String], default_port: u16) -> anyhow::Result<()> {
    let peers = targets
        .iter()
        .map(|t| parse_target(t, default_port))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let tester = NetTester::new(Arc::new(SystemProber::new(&config.nettest)), config.nettest.clone());

    let report = tester
        .three_technique_pass(&peers, config.optimizer.route_accept_threshold())
        .await;

    let render = |peers: &[PeerRecord]| {
        peers
            .iter()
            .map(|p| serde_json::json!({ "peer": p.to_string(), "latency_ms": p.latency.as_millis() as u64 }))
            .collect::<Vec<_>>()
    };

    let output = serde_json::json!({
        "accepted": render(&report.accepted),
        "unreachable": render(&report.failed),
        "partial_loss": render(&report.partial_loss),
        "unreported": render(&report.unreported),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
