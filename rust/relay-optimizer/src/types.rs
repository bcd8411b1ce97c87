//! Core types shared by the probing, inventory and optimizer layers
//!
//! A [`PeerRecord`] is the unit every layer passes around. The same record is
//! persisted in the inventory (bincode, latency included) and rendered into the
//! node-facing topology document (JSON, latency omitted).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Value written in the `type` field of every topology entry
pub const REGULAR_PEER_TYPE: &str = "regular";

// =============================================================================
// NETWORK
// =============================================================================

/// Public network a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

// =============================================================================
// PEER RECORD
// =============================================================================

/// Where a peer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// Discovered through the public topology source
    Regular,

    /// Pinned locally by the operator
    Extra,
}

/// A network-reachable candidate peer
///
/// `(address, port)` is the identity, compare [`PeerRecord::inventory_key`]
/// to match peers. `==` compares every field, `latency` included, and
/// `latency` is overwritten on every optimization cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Hostname or literal IP
    pub address: String,

    /// TCP port of the node
    pub port: u16,

    /// Number of concrete addresses the name expands to
    pub valency: u32,

    /// Regular (discovered) or extra (pinned)
    pub kind: PeerKind,

    /// Last measured latency
    #[serde(default)]
    pub latency: Duration,
}

impl PeerRecord {
    /// Create a discovered peer with the discovery default valency of 1
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            valency: 1,
            kind: PeerKind::Regular,
            latency: Duration::ZERO,
        }
    }

    /// Create a locally pinned peer
    pub fn extra(address: impl Into<String>, port: u16) -> Self {
        Self {
            kind: PeerKind::Extra,
            ..Self::new(address, port)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inventory key: `"{address}-{port}"`
    pub fn inventory_key(&self) -> String {
        inventory_key(&self.address, self.port)
    }

    /// Literal IP address, if the address is not a hostname
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    pub fn is_literal_ip(&self) -> bool {
        self.ip().is_some()
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Build the inventory key for an address/port pair
pub fn inventory_key(address: &str, port: u16) -> String {
    format!("{}-{}", address, port)
}

/// Sort peers by ascending latency. Stable, so ties keep their input order.
pub fn sort_by_latency(peers: &mut [PeerRecord]) {
    peers.sort_by_key(|p| p.latency);
}

/// Whether latencies are non-decreasing across the list
pub fn is_sorted_by_latency(peers: &[PeerRecord]) -> bool {
    peers.windows(2).all(|w| w[0].latency <= w[1].latency)
}

// =============================================================================
// TOPOLOGY DOCUMENT (node wire format)
// =============================================================================

/// Topology document consumed by the node process
///
/// ```json
/// { "Producers": [ { "type": "regular", "addr": "1.2.3.4", "port": 3001, "valency": 1, "debug": "" } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDocument {
    #[serde(rename = "Producers", default)]
    pub producers: Vec<TopologyEntry>,
}

/// One entry of the topology document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    #[serde(rename = "type", default = "regular_type")]
    pub entry_type: String,

    pub addr: String,

    pub port: u16,

    #[serde(default = "default_valency")]
    pub valency: u32,

    #[serde(default)]
    pub debug: String,
}

fn regular_type() -> String {
    REGULAR_PEER_TYPE.to_string()
}

fn default_valency() -> u32 {
    1
}

impl From<&PeerRecord> for TopologyEntry {
    fn from(peer: &PeerRecord) -> Self {
        Self {
            entry_type: regular_type(),
            addr: peer.address.clone(),
            port: peer.port,
            valency: peer.valency,
            debug: String::new(),
        }
    }
}

impl From<&TopologyEntry> for PeerRecord {
    fn from(entry: &TopologyEntry) -> Self {
        Self {
            valency: entry.valency,
            ..PeerRecord::new(entry.addr.clone(), entry.port)
        }
    }
}

impl TopologyDocument {
    pub fn from_peers<'a>(peers: impl IntoIterator<Item = &'a PeerRecord>) -> Self {
        Self {
            producers: peers.into_iter().map(TopologyEntry::from).collect(),
        }
    }

    pub fn to_peers(&self) -> Vec<PeerRecord> {
        self.producers.iter().map(PeerRecord::from).collect()
    }
}
