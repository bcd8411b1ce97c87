//! Probe Primitives
//!
//! Three independent latency-measurement techniques:
//!
//! - TCP-connect timing
//! - ICMP echo timing with packet-loss classification
//! - Route-latency estimation from hop tracing, with outlier rejection
//!
//! Every network effect goes through the [`Prober`] trait. [`SystemProber`]
//! talks to the real network (tokio sockets, the platform `ping` and
//! `traceroute` tools); tests plug in scripted probers.

mod ping;
mod route;
mod trace;

pub use ping::{parse_ping_output, PingCommand};
pub use route::{estimate_route_latency, route_latency, RouteSettings};
pub use trace::{parse_trace_output, TraceCommand};

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::config::NetTestConfig;

// =============================================================================
// TYPES
// =============================================================================

/// Statistics of one ICMP echo run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    /// Average round trip of the replies received
    pub avg_rtt: Duration,

    /// Lost requests, in percent (0..=100)
    pub packet_loss: f64,
}

/// Classification of an ICMP echo run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PingOutcome {
    /// Every request answered
    Reachable(Duration),

    /// Some requests lost
    PartialLoss(f64),

    /// Every request lost
    AllLost,
}

impl PingStats {
    pub fn classify(&self) -> PingOutcome {
        if self.packet_loss >= 100.0 {
            PingOutcome::AllLost
        } else if self.packet_loss > 0.0 {
            PingOutcome::PartialLoss(self.packet_loss)
        } else {
            PingOutcome::Reachable(self.avg_rtt)
        }
    }
}

/// One responder at a given hop distance
#[derive(Debug, Clone, PartialEq)]
pub struct HopNode {
    pub addr: IpAddr,
    pub rtts: Vec<Duration>,
}

/// One hop of a traced route
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub distance: u32,

    /// Responders at this distance; empty when every probe timed out
    pub nodes: Vec<HopNode>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("{tool} produced unusable output: {reason}")]
    Parse { tool: &'static str, reason: String },
}

// =============================================================================
// PROBER
// =============================================================================

/// Network effects used by the latency test runner
#[async_trait]
pub trait Prober: Send + Sync {
    /// Run an ICMP echo burst against an address
    async fn ping(&self, address: &str) -> Result<PingStats, ProbeError>;

    /// Trace the route towards an IP
    async fn trace(&self, ip: IpAddr) -> Result<Vec<Hop>, ProbeError>;

    /// Open and immediately close a TCP connection, returning the connect time
    async fn tcp_connect(&self, address: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError>;

    /// Resolve a hostname to its addresses
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProbeError>;
}

/// Prober backed by the host network stack and tools
pub struct SystemProber {
    ping: PingCommand,
    trace: TraceCommand,
}

impl SystemProber {
    pub fn new(config: &NetTestConfig) -> Self {
        Self {
            ping: PingCommand::from_config(config),
            trace: TraceCommand::from_config(config),
        }
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn ping(&self, address: &str) -> Result<PingStats, ProbeError> {
        self.ping.run(address).await
    }

    async fn trace(&self, ip: IpAddr) -> Result<Vec<Hop>, ProbeError> {
        self.trace.run(ip).await
    }

    async fn tcp_connect(&self, address: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let stream = tokio::time::timeout(timeout, TcpStream::connect((address, port)))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))??;
        let elapsed = started.elapsed();
        drop(stream);
        Ok(elapsed)
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProbeError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| ProbeError::Resolve(host.to_string()))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }

        if ips.is_empty() {
            return Err(ProbeError::Resolve(host.to_string()));
        }
        Ok(ips)
    }
}
