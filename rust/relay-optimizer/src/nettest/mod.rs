//! Latency Test Runner
//!
//! Fans the probe primitives out over a candidate list under a hard
//! wall-clock budget and classifies the outcome. Every list returned from
//! here is sorted by ascending latency.

pub mod batch;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::NetTestConfig;
use crate::probe::{route_latency, PingOutcome, Prober, RouteSettings};
use crate::types::{sort_by_latency, PeerRecord};

/// Outcome of an ICMP batch
#[derive(Debug, Default, Clone)]
pub struct PingReport {
    /// Some echo requests lost
    pub partial_loss: Vec<PeerRecord>,

    /// Every echo request lost, or the echo probe itself failed
    pub all_lost: Vec<PeerRecord>,

    /// Zero loss, latency set to the average round trip
    pub reachable: Vec<PeerRecord>,

    /// Still in flight when the batch window closed
    pub unreported: Vec<PeerRecord>,
}

/// Outcome of the full ping, route and TCP pass
#[derive(Debug, Default, Clone)]
pub struct PassReport {
    /// Reachable by ping, by a fast enough route, or by the TCP retest
    pub accepted: Vec<PeerRecord>,

    /// Failed every technique
    pub failed: Vec<PeerRecord>,

    pub partial_loss: Vec<PeerRecord>,

    /// Lost to the ping batch window, not classified
    pub unreported: Vec<PeerRecord>,
}

enum PingVerdict {
    Reachable(PeerRecord),
    PartialLoss(PeerRecord),
    AllLost(PeerRecord),
}

/// Runs latency batches through a [`Prober`]
pub struct NetTester {
    prober: Arc<dyn Prober>,
    config: NetTestConfig,
    route: RouteSettings,
}

impl NetTester {
    pub fn new(prober: Arc<dyn Prober>, config: NetTestConfig) -> Self {
        let route = RouteSettings::from_config(&config);
        Self { prober, config, route }
    }

    pub fn prober(&self) -> Arc<dyn Prober> {
        self.prober.clone()
    }

    /// ICMP-probe every peer concurrently
    ///
    /// Returns once every peer has reported or the ping batch window
    /// elapses. Peers still in flight at that point land in `unreported`
    /// and in none of the three classified lists.
    pub async fn test_latency_with_ping(&self, peers: &[PeerRecord]) -> PingReport {
        let prober = self.prober.clone();
        let collected = batch::fan_out(
            peers.to_vec(),
            self.config.ping_batch_timeout(),
            self.config.max_in_flight,
            move |peer| {
                let prober = prober.clone();
                async move {
                    match prober.ping(&peer.address).await {
                        Ok(stats) => match stats.classify() {
                            PingOutcome::Reachable(rtt) => {
                                debug!("{} answered ping in {:?}", peer, rtt);
                                PingVerdict::Reachable(peer.with_latency(rtt))
                            }
                            PingOutcome::PartialLoss(loss) => {
                                warn!("{} lost {:.0}% of echo requests", peer, loss);
                                PingVerdict::PartialLoss(peer)
                            }
                            PingOutcome::AllLost => {
                                warn!("{} lost all echo requests", peer);
                                PingVerdict::AllLost(peer)
                            }
                        },
                        Err(e) => {
                            warn!("ping {} failed: {}", peer, e);
                            PingVerdict::AllLost(peer)
                        }
                    }
                }
            },
        )
        .await;

        let mut report = PingReport::default();
        let mut seen = HashSet::new();
        for verdict in collected.results {
            let peer = match verdict {
                PingVerdict::Reachable(p) => {
                    report.reachable.push(p.clone());
                    p
                }
                PingVerdict::PartialLoss(p) => {
                    report.partial_loss.push(p.clone());
                    p
                }
                PingVerdict::AllLost(p) => {
                    report.all_lost.push(p.clone());
                    p
                }
            };
            seen.insert(peer.inventory_key());
        }

        report.unreported = peers
            .iter()
            .filter(|p| !seen.contains(&p.inventory_key()))
            .cloned()
            .collect();

        if collected.timed_out {
            warn!(
                "ping batch window elapsed, {} of {} peers did not report",
                report.unreported.len(),
                peers.len()
            );
        }

        sort_by_latency(&mut report.reachable);
        sort_by_latency(&mut report.partial_loss);
        sort_by_latency(&mut report.all_lost);
        report
    }

    /// TCP-connect then route-latency probe every peer concurrently
    ///
    /// Latency is the connect time plus the route estimate. Peers that fail
    /// either step, or are still in flight when the route batch window
    /// elapses, are absent from the result.
    pub async fn test_latency(&self, peers: &[PeerRecord]) -> Vec<PeerRecord> {
        let prober = self.prober.clone();
        let route = self.route.clone();
        let connect_timeout = self.config.connect_timeout();

        let collected = batch::fan_out(
            peers.to_vec(),
            self.config.route_batch_timeout(),
            self.config.max_in_flight,
            move |peer| {
                let prober = prober.clone();
                let route = route.clone();
                async move {
                    debug!("testing relay {}", peer);
                    let connect = match prober.tcp_connect(&peer.address, peer.port, connect_timeout).await {
                        Ok(elapsed) => elapsed,
                        Err(e) => {
                            debug!("connect to {} failed: {}", peer, e);
                            return None;
                        }
                    };

                    match route_latency(prober.as_ref(), &peer.address, &route).await {
                        Ok(estimate) => {
                            let latency = connect + estimate;
                            debug!("relay {} latency {:?}", peer, latency);
                            Some(peer.with_latency(latency))
                        }
                        Err(e) => {
                            warn!("route latency for {} failed: {}", peer, e);
                            None
                        }
                    }
                }
            },
        )
        .await;

        if collected.timed_out {
            warn!("route batch window elapsed");
        }

        let mut reachable: Vec<PeerRecord> = collected.results.into_iter().flatten().collect();
        info!("{} of {} peers passed the route test", reachable.len(), peers.len());
        sort_by_latency(&mut reachable);
        reachable
    }

    /// Sequential TCP reachability pass
    ///
    /// Good peers get the connect time plus a fixed margin as latency.
    pub async fn test_tcp_dial(&self, peers: &[PeerRecord]) -> (Vec<PeerRecord>, Vec<PeerRecord>) {
        let timeout = self.config.tcp_dial_timeout();
        let margin = self.config.tcp_latency_margin();

        let mut good = Vec::new();
        let mut bad = Vec::new();

        for peer in peers {
            match self.prober.tcp_connect(&peer.address, peer.port, timeout).await {
                Ok(elapsed) => good.push(peer.clone().with_latency(elapsed + margin)),
                Err(e) => {
                    debug!("tcp dial {} failed: {}", peer, e);
                    bad.push(peer.clone());
                }
            }
        }

        sort_by_latency(&mut good);
        sort_by_latency(&mut bad);
        (good, bad)
    }

    /// Ping everything, route-test the ping failures, then TCP-dial the
    /// route failures and routes at or above `route_threshold`
    pub async fn three_technique_pass(&self, candidates: &[PeerRecord], route_threshold: Duration) -> PassReport {
        let ping = self.test_latency_with_ping(candidates).await;
        let mut accepted = ping.reachable;

        let routed = self.test_latency(&ping.all_lost).await;
        let routed_keys: HashSet<String> = routed.iter().map(PeerRecord::inventory_key).collect();

        let mut retest = Vec::new();
        for peer in routed {
            if peer.latency < route_threshold {
                accepted.push(peer);
            } else {
                retest.push(peer);
            }
        }
        retest.extend(
            ping.all_lost
                .into_iter()
                .filter(|p| !routed_keys.contains(&p.inventory_key())),
        );

        let (dialed, failed) = self.test_tcp_dial(&retest).await;
        accepted.extend(dialed);
        sort_by_latency(&mut accepted);

        if !ping.unreported.is_empty() {
            warn!("{} peers did not report before the ping window closed", ping.unreported.len());
        }

        PassReport {
            accepted,
            failed,
            partial_loss: ping.partial_loss,
            unreported: ping.unreported,
        }
    }

    /// Correct valency from DNS for hostname peers
    ///
    /// Hostnames are resolved, retrying on failure; the valency becomes the
    /// number of resolved addresses. Peers left at valency 0 are dropped.
    pub async fn set_valency(&self, peers: &[PeerRecord]) -> Vec<PeerRecord> {
        let mut result = Vec::with_capacity(peers.len());

        for peer in peers {
            let mut peer = peer.clone();

            if !peer.is_literal_ip() && peer.valency < 2 {
                peer.valency = 0;
                for attempt in 1..=self.config.valency_retries.max(1) {
                    match self.prober.resolve(&peer.address).await {
                        Ok(ips) => {
                            peer.valency = ips.len() as u32;
                            break;
                        }
                        Err(e) => {
                            debug!("resolve {} failed (attempt {}): {}", peer.address, attempt, e);
                            tokio::time::sleep(self.config.valency_retry_pause()).await;
                        }
                    }
                }
            }

            if peer.valency == 0 {
                warn!("dropping {}: no addresses resolved", peer);
                continue;
            }
            result.push(peer);
        }

        sort_by_latency(&mut result);
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::{Hop, HopNode, PingStats, ProbeError};
    use crate::types::is_sorted_by_latency;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Prober answering from fixed per-address tables
    #[derive(Default)]
    pub(crate) struct ScriptedProber {
        pub pings: HashMap<String, PingStats>,
        pub hangs: HashSet<String>,
        pub connects: HashMap<String, Duration>,
        pub route_ms: HashMap<String, u64>,
        pub dns: HashMap<String, Vec<IpAddr>>,
        pub resolve_calls: AtomicU32,
    }

    impl ScriptedProber {
        pub fn ping_ok(mut self, addr: &str, ms: u64) -> Self {
            self.pings.insert(
                addr.to_string(),
                PingStats { avg_rtt: Duration::from_millis(ms), packet_loss: 0.0 },
            );
            self
        }

        pub fn ping_loss(mut self, addr: &str, loss: f64) -> Self {
            self.pings.insert(addr.to_string(), PingStats { avg_rtt: Duration::ZERO, packet_loss: loss });
            self
        }

        pub fn hang(mut self, addr: &str) -> Self {
            self.hangs.insert(addr.to_string());
            self
        }

        pub fn connect(mut self, addr: &str, ms: u64) -> Self {
            self.connects.insert(addr.to_string(), Duration::from_millis(ms));
            self
        }

        pub fn route(mut self, addr: &str, ms: u64) -> Self {
            self.route_ms.insert(addr.to_string(), ms);
            self
        }

        pub fn dns(mut self, host: &str, ips: &[&str]) -> Self {
            self.dns
                .insert(host.to_string(), ips.iter().map(|ip| ip.parse().unwrap()).collect());
            self
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn ping(&self, address: &str) -> Result<PingStats, ProbeError> {
            if self.hangs.contains(address) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.pings
                .get(address)
                .copied()
                .ok_or_else(|| ProbeError::Resolve(address.to_string()))
        }

        async fn trace(&self, ip: IpAddr) -> Result<Vec<Hop>, ProbeError> {
            let ms = self.route_ms.get(&ip.to_string()).copied().unwrap_or(0);
            Ok((1..=5)
                .map(|distance| Hop {
                    distance,
                    nodes: vec![HopNode { addr: ip, rtts: vec![Duration::from_millis(ms)] }],
                })
                .collect())
        }

        async fn tcp_connect(&self, address: &str, _port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
            self.connects.get(address).copied().ok_or(ProbeError::Timeout(timeout))
        }

        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProbeError> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            self.dns.get(host).cloned().ok_or_else(|| ProbeError::Resolve(host.to_string()))
        }
    }

    pub(crate) fn fast_config() -> NetTestConfig {
        NetTestConfig {
            route_jitter_max_secs: 0,
            route_retry_pause_ms: 1,
            valency_retry_pause_ms: 1,
            ..NetTestConfig::default()
        }
    }

    fn peer(addr: &str) -> PeerRecord {
        PeerRecord::new(addr, 3001)
    }

    #[tokio::test]
    async fn test_ping_classification_buckets() {
        let prober = ScriptedProber::default()
            .ping_ok("10.0.0.1", 30)
            .ping_ok("10.0.0.2", 10)
            .ping_loss("10.0.0.3", 40.0)
            .ping_loss("10.0.0.4", 100.0);
        let tester = NetTester::new(Arc::new(prober), fast_config());

        let peers: Vec<_> = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]
            .iter()
            .map(|a| peer(a))
            .collect();
        let report = tester.test_latency_with_ping(&peers).await;

        assert_eq!(report.reachable.len(), 2);
        assert_eq!(report.reachable[0].address, "10.0.0.2");
        assert!(is_sorted_by_latency(&report.reachable));
        assert_eq!(report.partial_loss[0].address, "10.0.0.3");
        // Probe failure for .5 counts as all lost
        assert_eq!(report.all_lost.len(), 2);
        assert!(report.unreported.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_batch_returns_within_window() {
        let prober = ScriptedProber::default()
            .ping_ok("10.0.0.1", 20)
            .hang("10.0.0.2")
            .hang("10.0.0.3");
        let tester = NetTester::new(Arc::new(prober), fast_config());

        let peers = vec![peer("10.0.0.1"), peer("10.0.0.2"), peer("10.0.0.3")];
        let started = tokio::time::Instant::now();
        let report = tester.test_latency_with_ping(&peers).await;

        assert!(started.elapsed() <= Duration::from_secs(61));
        assert_eq!(report.reachable.len(), 1);
        assert_eq!(report.unreported.len(), 2);
        let classified = report.reachable.len() + report.partial_loss.len() + report.all_lost.len();
        assert!(classified <= peers.len());
    }

    #[tokio::test]
    async fn test_latency_adds_connect_and_route() {
        let prober = ScriptedProber::default()
            .connect("10.0.0.1", 5)
            .route("10.0.0.1", 80)
            .connect("10.0.0.2", 5)
            .route("10.0.0.2", 40);
        let tester = NetTester::new(Arc::new(prober), fast_config());

        let peers = vec![peer("10.0.0.1"), peer("10.0.0.2"), peer("10.0.0.3")];
        let reachable = tester.test_latency(&peers).await;

        assert_eq!(reachable.len(), 2);
        assert_eq!(reachable[0].address, "10.0.0.2");
        assert_eq!(reachable[0].latency, Duration::from_millis(45));
        assert_eq!(reachable[1].latency, Duration::from_millis(85));
    }

    #[tokio::test]
    async fn test_tcp_dial_splits_good_and_bad() {
        let prober = ScriptedProber::default().connect("10.0.0.1", 7);
        let tester = NetTester::new(Arc::new(prober), fast_config());

        let (good, bad) = tester.test_tcp_dial(&[peer("10.0.0.1"), peer("10.0.0.2")]).await;

        assert_eq!(good.len(), 1);
        assert_eq!(good[0].latency, Duration::from_millis(107));
        assert_eq!(bad[0].address, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_set_valency_from_dns() {
        let prober = Arc::new(
            ScriptedProber::default().dns("relays.example.org", &["10.1.0.1", "10.1.0.2", "10.1.0.3"]),
        );
        let tester = NetTester::new(prober.clone(), fast_config());

        let peers = vec![
            peer("relays.example.org"),
            peer("gone.example.org"),
            peer("10.0.0.9"),
        ];
        let result = tester.set_valency(&peers).await;

        assert_eq!(result.len(), 2);
        let named = result.iter().find(|p| p.address == "relays.example.org").unwrap();
        assert_eq!(named.valency, 3);
        let literal = result.iter().find(|p| p.address == "10.0.0.9").unwrap();
        assert_eq!(literal.valency, 1);

        // 1 successful lookup plus 10 failed attempts
        assert_eq!(prober.resolve_calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_pass_retests_route_failures_and_slow_routes() {
        let prober = ScriptedProber::default()
            .ping_ok("10.0.0.1", 20)
            .ping_loss("10.0.0.2", 40.0)
            // all lost, fast route
            .ping_loss("10.0.0.3", 100.0)
            .connect("10.0.0.3", 5)
            .route("10.0.0.3", 50)
            // all lost, slow route, TCP still answers
            .ping_loss("10.0.0.4", 100.0)
            .connect("10.0.0.4", 5)
            .route("10.0.0.4", 2500)
            // all lost, no route, no TCP
            .ping_loss("10.0.0.5", 100.0);
        let tester = NetTester::new(Arc::new(prober), fast_config());

        let peers: Vec<_> = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]
            .iter()
            .map(|a| peer(a))
            .collect();
        let report = tester.three_technique_pass(&peers, Duration::from_secs(2)).await;

        let accepted: Vec<_> = report.accepted.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(accepted, vec!["10.0.0.1", "10.0.0.3", "10.0.0.4"]);
        assert_eq!(report.accepted[2].latency, Duration::from_millis(105));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].address, "10.0.0.5");
        assert_eq!(report.partial_loss[0].address, "10.0.0.2");
        assert!(report.unreported.is_empty());
    }
}
