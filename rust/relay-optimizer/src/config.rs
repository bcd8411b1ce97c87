//! Relay Optimizer Configuration
//!
//! Every timeout, threshold and retry count used by the probing and
//! optimization layers lives here, so tests and operators can vary them.
//! Default values match the production fleet settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Network;

/// Main configuration for the relay optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Control loop settings
    pub optimizer: LoopConfig,

    /// Distributed lock settings
    pub lock: LockConfig,

    /// Latency test runner settings
    pub nettest: NetTestConfig,

    /// Topology source and writer settings
    pub topology: TopologyConfig,

    /// Inventory backend
    pub store: StoreConfig,

    /// Read-only query API
    pub api: ApiConfig,

    /// Nodes served by this process
    pub nodes: Vec<NodeConfig>,
}

/// Control loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Period between optimization cycles (seconds)
    pub cycle_interval_secs: u64,

    /// Well-known hosts used for the outbound connectivity check, tried in rotation
    pub network_check_hosts: Vec<String>,

    /// Maximum round trip accepted by the connectivity check (milliseconds)
    pub network_check_max_rtt_ms: u64,

    /// Pause between failed connectivity checks (seconds)
    pub network_check_pause_secs: u64,

    /// Route-latency survivors under this latency are accepted (milliseconds)
    pub route_accept_threshold_ms: u64,

    /// Attempts made by inventory queries while the inventory is empty
    pub inventory_retries: u32,

    /// Pause between empty-inventory retries (seconds)
    pub inventory_retry_pause_secs: u64,

    /// Pause before the binary restarts a failed loop (seconds)
    pub restart_pause_secs: u64,
}

/// Distributed lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Name shared by every optimizer instance of the fleet
    pub name: String,

    /// Lock expiry, so a crashed holder does not block the fleet (seconds)
    pub ttl_secs: u64,

    /// Acquisition attempts before the cycle is aborted
    pub retries: u32,

    /// Delay between acquisition attempts (milliseconds)
    pub retry_delay_ms: u64,
}

/// Latency test runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetTestConfig {
    /// Wall-clock budget of a ping batch (seconds)
    pub ping_batch_timeout_secs: u64,

    /// Wall-clock budget of a TCP + route batch (seconds)
    pub route_batch_timeout_secs: u64,

    /// Echo requests per ping run
    pub ping_count: u32,

    /// Echo payload size (bytes)
    pub ping_payload_size: u32,

    /// Deadline of a single ping run (seconds)
    pub ping_deadline_secs: u64,

    /// Connect timeout before a route probe (seconds)
    pub connect_timeout_secs: u64,

    /// Per-peer timeout of the sequential TCP dial retest (milliseconds)
    pub tcp_dial_timeout_ms: u64,

    /// Added to every TCP-connect measurement (milliseconds)
    pub tcp_latency_margin_ms: u64,

    /// Upper bound of the random delay before tracing (seconds)
    pub route_jitter_max_secs: u64,

    /// Trace attempts when the route is too short
    pub route_tries: u32,

    /// Minimum number of hops for a usable trace
    pub route_min_hops: usize,

    /// Pause between trace attempts (milliseconds)
    pub route_retry_pause_ms: u64,

    /// Samples noisier than this are discarded (milliseconds)
    pub route_stddev_limit_ms: u64,

    /// Conservative latency reported for unmeasured routes (milliseconds)
    pub route_default_latency_ms: u64,

    /// Maximum probe tasks in flight per batch (0 = one task per peer)
    pub max_in_flight: usize,

    /// Hostname resolution attempts of the valency pass
    pub valency_retries: u32,

    /// Pause between failed resolutions (milliseconds)
    pub valency_retry_pause_ms: u64,

    /// Path of the ping tool
    pub ping_command: String,

    /// Path of the trace tool
    pub trace_command: String,

    /// Maximum hops traced
    pub trace_max_hops: u32,

    /// Probes sent per hop
    pub trace_queries: u32,

    /// Seconds to wait for each hop reply
    pub trace_wait_secs: u64,
}

/// Topology source and writer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Public topology document for mainnet
    pub mainnet_url: String,

    /// Public topology document for testnet
    pub testnet_url: String,

    /// Directory receiving downloaded documents before parsing
    pub scratch_dir: PathBuf,

    /// Download attempts before giving up
    pub download_attempts: u32,

    /// Pause between download attempts (seconds)
    pub download_retry_pause_secs: u64,

    /// HTTP request timeout (seconds)
    pub http_timeout_secs: u64,

    /// Interval between topology file rewrites (seconds)
    pub writer_interval_secs: u64,
}

/// Inventory backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Rocksdb,
    Redis,
}

/// Inventory backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Database directory (rocksdb backend only)
    pub path: PathBuf,

    /// Server shared by the whole fleet (redis backend only)
    pub url: String,
}

/// Read-only query API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

/// A locally pinned peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedPeer {
    pub host: String,
    pub port: u16,
}

/// A node served by this process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,

    pub network: Network,

    /// Public host of the node itself
    pub host: String,

    pub port: u16,

    /// Desired number of peers in the topology document
    pub peers: usize,

    /// Where the topology document is written
    pub topology_path: PathBuf,

    /// Peers the operator pinned for this node
    #[serde(default)]
    pub pinned: Vec<PinnedPeer>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 6 * 60 * 60, // 6 hours
            network_check_hosts: vec![
                "1.1.1.1".to_string(),
                "8.8.8.8".to_string(),
                "9.9.9.9".to_string(),
            ],
            network_check_max_rtt_ms: 300,
            network_check_pause_secs: 5,
            route_accept_threshold_ms: 2000,
            inventory_retries: 100,
            inventory_retry_pause_secs: 20,
            restart_pause_secs: 60,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: "relay-optimizer-mutex".to_string(),
            ttl_secs: 900, // longer than a full cycle
            retries: 32,
            retry_delay_ms: 500,
        }
    }
}

impl Default for NetTestConfig {
    fn default() -> Self {
        Self {
            ping_batch_timeout_secs: 60,
            route_batch_timeout_secs: 40,
            ping_count: 5,
            ping_payload_size: 128,
            ping_deadline_secs: 20,
            connect_timeout_secs: 5,
            tcp_dial_timeout_ms: 1000,
            tcp_latency_margin_ms: 100,
            route_jitter_max_secs: 15,
            route_tries: 3,
            route_min_hops: 4,
            route_retry_pause_ms: 1000,
            route_stddev_limit_ms: 50,
            route_default_latency_ms: 2000,
            max_in_flight: 0,
            valency_retries: 10,
            valency_retry_pause_ms: 200,
            ping_command: "ping".to_string(),
            trace_command: "traceroute".to_string(),
            trace_max_hops: 30,
            trace_queries: 3,
            trace_wait_secs: 2,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            mainnet_url: "https://explorer.mainnet.cardano.org/relays/topology.json".to_string(),
            testnet_url: "https://explorer.cardano-testnet.iohkdev.io/relays/topology.json".to_string(),
            scratch_dir: std::env::temp_dir().join("relay-optimizer"),
            download_attempts: 20,
            download_retry_pause_secs: 2,
            http_timeout_secs: 30,
            writer_interval_secs: 60 * 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Rocksdb,
            path: PathBuf::from("./data/inventory"),
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8090,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: LoopConfig::default(),
            lock: LockConfig::default(),
            nettest: NetTestConfig::default(),
            topology: TopologyConfig::default(),
            store: StoreConfig::default(),
            api: ApiConfig::default(),
            nodes: vec![NodeConfig::default()],
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "relay0".to_string(),
            network: Network::Testnet,
            host: "127.0.0.1".to_string(),
            port: 3001,
            peers: 20,
            topology_path: PathBuf::from("./data/relay0/topology.json"),
            pinned: vec![],
        }
    }
}

impl LoopConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn network_check_max_rtt(&self) -> Duration {
        Duration::from_millis(self.network_check_max_rtt_ms)
    }

    pub fn network_check_pause(&self) -> Duration {
        Duration::from_secs(self.network_check_pause_secs)
    }

    pub fn route_accept_threshold(&self) -> Duration {
        Duration::from_millis(self.route_accept_threshold_ms)
    }

    pub fn inventory_retry_pause(&self) -> Duration {
        Duration::from_secs(self.inventory_retry_pause_secs)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_secs(self.restart_pause_secs)
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// How often a holder re-extends the lock while working
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis((self.ttl_secs * 1000 / 3).max(1))
    }
}

impl NetTestConfig {
    pub fn ping_batch_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_batch_timeout_secs)
    }

    pub fn route_batch_timeout(&self) -> Duration {
        Duration::from_secs(self.route_batch_timeout_secs)
    }

    pub fn ping_deadline(&self) -> Duration {
        Duration::from_secs(self.ping_deadline_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tcp_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_dial_timeout_ms)
    }

    pub fn tcp_latency_margin(&self) -> Duration {
        Duration::from_millis(self.tcp_latency_margin_ms)
    }

    pub fn route_jitter_max(&self) -> Duration {
        Duration::from_secs(self.route_jitter_max_secs)
    }

    pub fn route_retry_pause(&self) -> Duration {
        Duration::from_millis(self.route_retry_pause_ms)
    }

    pub fn route_stddev_limit(&self) -> Duration {
        Duration::from_millis(self.route_stddev_limit_ms)
    }

    pub fn route_default_latency(&self) -> Duration {
        Duration::from_millis(self.route_default_latency_ms)
    }

    pub fn valency_retry_pause(&self) -> Duration {
        Duration::from_millis(self.valency_retry_pause_ms)
    }

    pub fn trace_wait(&self) -> Duration {
        Duration::from_secs(self.trace_wait_secs)
    }
}

impl TopologyConfig {
    /// Public topology document URL for a network
    pub fn url_for(&self, network: Network) -> &str {
        match network {
            Network::Mainnet => &self.mainnet_url,
            Network::Testnet => &self.testnet_url,
        }
    }

    pub fn download_retry_pause(&self) -> Duration {
        Duration::from_secs(self.download_retry_pause_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn writer_interval(&self) -> Duration {
        Duration::from_secs(self.writer_interval_secs)
    }
}

impl OptimizerConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    // Builder-style methods for CLI overrides

    pub fn with_api_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.api.port = port;
        }
        self
    }

    pub fn with_store_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.store.path = path;
        }
        self
    }

    pub fn with_cycle_interval_secs(mut self, secs: Option<u64>) -> Self {
        if let Some(secs) = secs {
            self.optimizer.cycle_interval_secs = secs;
        }
        self
    }

    /// Find a node by name, or the first configured node when no name is given
    pub fn node(&self, name: Option<&str>) -> Option<&NodeConfig> {
        match name {
            Some(name) => self.nodes.iter().find(|n| n.name == name),
            None => self.nodes.first(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.optimizer.cycle_interval_secs == 0 {
            anyhow::bail!("optimizer.cycle_interval_secs must be greater than zero");
        }

        if self.optimizer.network_check_hosts.is_empty() {
            anyhow::bail!("optimizer.network_check_hosts must name at least one host");
        }

        if self.lock.name.is_empty() {
            anyhow::bail!("lock.name must not be empty");
        }

        if self.lock.ttl_secs == 0 {
            anyhow::bail!("lock.ttl_secs must be greater than zero");
        }

        if self.lock.retries == 0 {
            anyhow::bail!("lock.retries must be at least 1");
        }

        if self.nettest.ping_count == 0 {
            anyhow::bail!("nettest.ping_count must be at least 1");
        }

        if self.nettest.route_tries == 0 {
            anyhow::bail!("nettest.route_tries must be at least 1");
        }

        if self.topology.download_attempts == 0 {
            anyhow::bail!("topology.download_attempts must be at least 1");
        }

        // Reconciliation drops every key the node's own network no longer
        // lists, so one inventory can only serve one network
        if let Some(first) = self.nodes.first() {
            if let Some(other) = self.nodes.iter().find(|n| n.network != first.network) {
                anyhow::bail!(
                    "nodes {} ({}) and {} ({}) would share one inventory; run one process per network",
                    first.name,
                    first.network,
                    other.name,
                    other.network
                );
            }
        }

        let mut names = std::collections::HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                anyhow::bail!("duplicate node name: {}", node.name);
            }
            if node.peers == 0 {
                anyhow::bail!("node {}: peers must be greater than zero", node.name);
            }
        }

        Ok(())
    }
}
