//! One optimization cycle under the fleet lock

use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, error, info};

use super::{Optimizer, OptimizerError, OptimizerState};
use crate::inventory::{encode_peer, HeldLock};
use crate::types::{Network, PeerRecord};

/// Summary of a completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub network: Network,

    /// Candidates in the fresh topology
    pub candidates: usize,

    /// Inventory keys dropped because upstream no longer lists them
    pub reconciled: usize,

    /// Peers written to the inventory
    pub accepted: usize,

    /// Peers deleted after failing every technique or DNS
    pub evicted: usize,

    /// Peers deleted for partial packet loss
    pub partial_loss: usize,

    /// Peers whose ping never reported, left untouched
    pub timed_out: usize,

    pub duration_ms: u64,

    /// Unix seconds
    pub finished_at: i64,
}

impl CycleReport {
    pub fn log(&self) {
        info!(
            "✅ Cycle on {} done in {}ms: {} candidates, {} accepted, {} evicted, {} partial loss, {} timed out, {} reconciled",
            self.network,
            self.duration_ms,
            self.candidates,
            self.accepted,
            self.evicted,
            self.partial_loss,
            self.timed_out,
            self.reconciled
        );
    }
}

impl Optimizer {
    /// Lock, run the cycle body, and always unlock
    pub(super) async fn locked_cycle(&self) -> Result<CycleReport, OptimizerError> {
        let held = self.mutex.lock().await?;
        info!("🔒 {} holds {}", self.node.name, self.mutex.name());

        let result = match self.mutex.hold_while(&held, self.cycle_body(&held)).await {
            Ok(result) => result,
            Err(lost) => Err(lost.into()),
        };
        let released = self.mutex.unlock(held).await;

        match (result, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock)) => {
                error!("unlock after failed cycle: {}", unlock);
                Err(e)
            }
        }
    }

    async fn cycle_body(&self, held: &HeldLock) -> Result<CycleReport, OptimizerError> {
        let started = Instant::now();
        let network = self.node.network;

        self.set_state(OptimizerState::Reconciling);
        let candidates = self.source.fetch_candidates(network, &self.node.pinned).await?;
        if candidates.is_empty() {
            return Err(OptimizerError::EmptyTopology(network));
        }
        let reconciled = self.reconcile(&candidates).await?;

        self.set_state(OptimizerState::Probing);
        let outcome = self
            .tester
            .three_technique_pass(&candidates, self.loop_config.route_accept_threshold())
            .await;

        let mut evicted = 0;
        for peer in &outcome.failed {
            self.evict(peer, "failed every latency test").await?;
            evicted += 1;
        }

        let valid = self.tester.set_valency(&outcome.accepted).await;
        let valid_keys: HashSet<String> = valid.iter().map(PeerRecord::inventory_key).collect();
        for peer in &outcome.accepted {
            if !valid_keys.contains(&peer.inventory_key()) {
                self.evict(peer, "no addresses resolved").await?;
                evicted += 1;
            }
        }

        self.set_state(OptimizerState::Persisting);
        self.mutex.extend(held).await?;
        for peer in &valid {
            self.store.set(&peer.inventory_key(), encode_peer(peer)?).await?;
            info!("IP: {} --> {}ms", peer.address, peer.latency.as_millis());
        }

        for peer in &outcome.partial_loss {
            self.evict(peer, "partial packet loss").await?;
        }

        if valid.is_empty() {
            return Err(OptimizerError::NoReachablePeers(network));
        }

        Ok(CycleReport {
            network,
            candidates: candidates.len(),
            reconciled,
            accepted: valid.len(),
            evicted,
            partial_loss: outcome.partial_loss.len(),
            timed_out: outcome.unreported.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            finished_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Delete every inventory key the fresh topology no longer lists
    pub(super) async fn reconcile(&self, fresh: &[PeerRecord]) -> Result<usize, OptimizerError> {
        let fresh_keys: HashSet<String> = fresh.iter().map(PeerRecord::inventory_key).collect();
        let mut removed = 0;

        for key in self.store.keys("*").await? {
            if key == self.mutex.name() || fresh_keys.contains(&key) {
                continue;
            }
            debug!("reconcile: {} is gone upstream", key);
            self.store.delete(&key).await?;
            removed += 1;
        }

        if removed > 0 {
            info!("🧹 Reconciled inventory, removed {} stale entries", removed);
        }
        Ok(removed)
    }

    async fn evict(&self, peer: &PeerRecord, reason: &str) -> Result<(), OptimizerError> {
        debug!("evicting {}: {}", peer, reason);
        self.store.delete(&peer.inventory_key()).await?;
        self.metrics.inc_evicted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Metrics;
    use crate::config::{OptimizerConfig, PinnedPeer, TopologyConfig};
    use crate::inventory::{decode_peer, InventoryStore, MemoryStore, StoreError};
    use crate::nettest::tests::{fast_config, ScriptedProber};
    use crate::topology::{Download, TopologyError};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedDownloader(String);

    #[async_trait]
    impl Download for FixedDownloader {
        async fn download(&self, destination: &Path, _url: &str) -> Result<(), TopologyError> {
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(destination, &self.0).await?;
            Ok(())
        }
    }

    /// Serves a topology, then hands the fleet lock to another holder
    struct TakeoverDownloader {
        body: String,
        store: Arc<dyn InventoryStore>,
    }

    #[async_trait]
    impl Download for TakeoverDownloader {
        async fn download(&self, destination: &Path, url: &str) -> Result<(), TopologyError> {
            self.store.delete("mutex").await.unwrap();
            self.store.try_lock("mutex", "other", Duration::from_secs(60)).await.unwrap();
            FixedDownloader(self.body.clone()).download(destination, url).await
        }
    }

    fn topology(addrs: &[&str]) -> String {
        let entries: Vec<String> = addrs
            .iter()
            .map(|a| format!(r#"{{"type":"regular","addr":"{}","port":3001,"valency":1}}"#, a))
            .collect();
        format!(r#"{{"Producers":[{}]}}"#, entries.join(","))
    }

    fn prober() -> ScriptedProber {
        ScriptedProber::default()
            .ping_ok("1.1.1.1", 10)
            // reachable by ping
            .ping_ok("10.0.0.1", 20)
            .ping_ok("relay.example.org", 35)
            .dns("relay.example.org", &["10.2.0.1", "10.2.0.2"])
            // partial loss
            .ping_loss("10.0.0.2", 40.0)
            // all lost, route ok
            .ping_loss("10.0.0.3", 100.0)
            .connect("10.0.0.3", 5)
            .route("10.0.0.3", 50)
            // all lost, unreachable
            .ping_loss("10.0.0.4", 100.0)
    }

    pub(crate) fn optimizer(
        dir: &Path,
        prober: ScriptedProber,
        body: String,
        store: Arc<dyn InventoryStore>,
    ) -> Optimizer {
        optimizer_with(dir, prober, Arc::new(FixedDownloader(body)), store)
    }

    fn optimizer_with(
        dir: &Path,
        prober: ScriptedProber,
        downloader: Arc<dyn Download>,
        store: Arc<dyn InventoryStore>,
    ) -> Optimizer {
        let mut config = OptimizerConfig {
            nettest: fast_config(),
            topology: TopologyConfig {
                scratch_dir: dir.to_path_buf(),
                ..TopologyConfig::default()
            },
            ..OptimizerConfig::default()
        };
        config.optimizer.network_check_hosts = vec!["1.1.1.1".to_string()];
        config.lock.name = "mutex".to_string();

        let node = config.nodes[0].clone();
        Optimizer::new(
            &config,
            node,
            store,
            Arc::new(prober),
            downloader,
            Arc::new(Metrics::new()),
        )
    }

    async fn seed(store: &MemoryStore, addr: &str) {
        let peer = PeerRecord::new(addr, 3001);
        store.set(&peer.inventory_key(), encode_peer(&peer).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        seed(&store, "10.0.0.2").await;
        seed(&store, "10.0.0.4").await;
        seed(&store, "10.9.9.9").await;

        let body = topology(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "relay.example.org"]);
        let optimizer = optimizer(dir.path(), prober(), body, store.clone());

        let report = optimizer.cycle().await.unwrap();

        assert_eq!(report.candidates, 5);
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.accepted, 3);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.partial_loss, 1);
        assert_eq!(optimizer.state(), OptimizerState::Idle);

        let keys = store.keys("*").await.unwrap();
        assert_eq!(
            keys,
            vec!["10.0.0.1-3001", "10.0.0.3-3001", "relay.example.org-3001"]
        );

        let named = decode_peer(&store.get("relay.example.org-3001").await.unwrap().unwrap()).unwrap();
        assert_eq!(named.valency, 2);
        assert_eq!(named.latency, Duration::from_millis(35));

        let routed = decode_peer(&store.get("10.0.0.3-3001").await.unwrap().unwrap()).unwrap();
        assert_eq!(routed.latency, Duration::from_millis(55));

        // Selection only sees what survived the cycle
        let served = optimizer.selector().load_once().await.unwrap();
        let mut served: Vec<String> = served.iter().map(PeerRecord::inventory_key).collect();
        served.sort();
        assert_eq!(served, keys);
        assert!(!served.contains(&"10.9.9.9-3001".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_lock_aborts_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        seed(&store, "10.0.0.2").await;
        seed(&store, "10.9.9.9").await;
        store.try_lock("mutex", "other", Duration::from_secs(3600)).await.unwrap();
        let before = store.keys("*").await.unwrap();

        let body = topology(&["10.0.0.1", "10.0.0.2", "10.0.0.4"]);
        let optimizer = optimizer(dir.path(), prober(), body, store.clone());

        let err = optimizer.cycle().await.unwrap_err();
        assert!(matches!(err, OptimizerError::Store(StoreError::LockNotAcquired { .. })));
        assert_eq!(store.keys("*").await.unwrap(), before);
        assert!(optimizer.last_report().await.is_none());
    }

    #[tokio::test]
    async fn test_lock_taken_over_mid_cycle_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn InventoryStore> = memory.clone();
        let downloader = Arc::new(TakeoverDownloader {
            body: topology(&["10.0.0.1"]),
            store: store.clone(),
        });
        let optimizer = optimizer_with(dir.path(), prober(), downloader, store);

        let err = optimizer.cycle().await.unwrap_err();
        assert!(matches!(err, OptimizerError::Store(StoreError::LockLost(_))));
        assert!(memory.get("10.0.0.1-3001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        seed(&store, "10.0.0.1").await;
        seed(&store, "10.0.0.7").await;
        store.try_lock("mutex", "other", Duration::from_secs(60)).await.unwrap();

        let optimizer = optimizer(dir.path(), prober(), topology(&[]), store.clone());
        let fresh = vec![PeerRecord::new("10.0.0.1", 3001)];

        assert_eq!(optimizer.reconcile(&fresh).await.unwrap(), 1);
        let first = store.keys("*").await.unwrap();
        assert_eq!(optimizer.reconcile(&fresh).await.unwrap(), 0);
        assert_eq!(store.keys("*").await.unwrap(), first);
        assert!(first.contains(&"mutex".to_string()));
    }

    #[tokio::test]
    async fn test_no_reachable_peers_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let optimizer = optimizer(dir.path(), prober(), topology(&["10.0.0.2", "10.0.0.4"]), store.clone());

        let err = optimizer.cycle().await.unwrap_err();
        assert!(matches!(err, OptimizerError::NoReachablePeers(Network::Testnet)));
        assert!(store.get("mutex").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pinned_peers_are_not_probed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut optimizer = optimizer(dir.path(), prober(), topology(&["10.0.0.1", "10.0.0.3"]), store.clone());
        optimizer.node.pinned = vec![PinnedPeer { host: "10.0.0.3".to_string(), port: 3001 }];

        let report = optimizer.cycle().await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(store.keys("*").await.unwrap(), vec!["10.0.0.1-3001"]);
    }

    #[tokio::test]
    async fn test_run_stop_wait() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let optimizer = Arc::new(optimizer(dir.path(), prober(), topology(&["10.0.0.1"]), store));

        let handle = optimizer.clone().run();

        // First cycle runs immediately
        while optimizer.last_report().await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.stop();
        handle.wait().await.unwrap();
        assert_eq!(optimizer.state(), OptimizerState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_cycle_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let optimizer = Arc::new(optimizer(dir.path(), prober(), topology(&[]), store));

        let err = optimizer.clone().run().wait().await.unwrap_err();
        assert!(matches!(err, OptimizerError::EmptyTopology(_)));
        assert_eq!(optimizer.state(), OptimizerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_offline() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        // No answer from the check host
        let offline = ScriptedProber::default().ping_loss("1.1.1.1", 100.0);
        let optimizer = Arc::new(optimizer(dir.path(), offline, topology(&["10.0.0.1"]), store.clone()));

        let mut states = optimizer.subscribe();
        let handle = optimizer.clone().run();
        states.wait_for(|s| *s == OptimizerState::CheckingNetwork).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.stop();
        handle.wait().await.unwrap();

        assert!(optimizer.last_report().await.is_none());
        assert!(store.get("mutex").await.unwrap().is_none());
    }
}
