//! Optimizer
//!
//! Long-lived control loop of one node: on a timer (and once at start-up)
//! it verifies outbound connectivity, takes the fleet lock, reconciles the
//! shared inventory against a fresh topology, runs the latency techniques
//! and persists the survivors.
//!
//! ```text
//! Idle -> CheckingNetwork -> Reconciling -> Probing -> Persisting -> Idle
//!                      (stop) -> Stopped
//! ```

mod cycle;
pub mod selection;

pub use cycle::CycleReport;
pub use selection::{best_and_random, RelaySelector, Selection};

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::api::Metrics;
use crate::config::{LoopConfig, NodeConfig, OptimizerConfig};
use crate::inventory::{DistributedMutex, InventoryStore, StoreError};
use crate::nettest::NetTester;
use crate::probe::{PingOutcome, Prober};
use crate::topology::{Download, TopologyError, TopologySource};
use crate::types::Network;

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("No reachable peers found on {0}")]
    NoReachablePeers(Network),

    #[error("Inventory is empty")]
    EmptyInventory,

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("{0} topology has no candidates")]
    EmptyTopology(Network),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Inventory error: {0}")]
    Store(#[from] StoreError),

    #[error("Optimizer task failed: {0}")]
    Task(String),
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerState {
    Idle,
    CheckingNetwork,
    Reconciling,
    Probing,
    Persisting,
    Stopped,
}

/// Optimization engine for one node
pub struct Optimizer {
    loop_config: LoopConfig,
    node: NodeConfig,
    store: Arc<dyn InventoryStore>,
    mutex: DistributedMutex,
    tester: NetTester,
    source: TopologySource,
    state: watch::Sender<OptimizerState>,
    last_report: RwLock<Option<CycleReport>>,
    metrics: Arc<Metrics>,
}

/// Owner's side of a running loop
pub struct OptimizerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), OptimizerError>>,
}

impl OptimizerHandle {
    /// Ask the loop to end at its next iteration boundary
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for the loop to end and return its terminal error, if any
    pub async fn wait(mut self) -> Result<(), OptimizerError> {
        self.finished().await
    }

    /// Like [`wait`](Self::wait) but keeps the handle, so it can sit in a
    /// `select!` next to a shutdown signal. Must not be polled again once it
    /// has returned.
    pub async fn finished(&mut self) -> Result<(), OptimizerError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(OptimizerError::Task(e.to_string())),
        }
    }
}

impl Optimizer {
    pub fn new(
        config: &OptimizerConfig,
        node: NodeConfig,
        store: Arc<dyn InventoryStore>,
        prober: Arc<dyn Prober>,
        downloader: Arc<dyn Download>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(OptimizerState::Idle);

        Self {
            loop_config: config.optimizer.clone(),
            node,
            mutex: DistributedMutex::new(store.clone(), &config.lock),
            store,
            tester: NetTester::new(prober, config.nettest.clone()),
            source: TopologySource::new(config.topology.clone(), downloader),
            state,
            last_report: RwLock::new(None),
            metrics,
        }
    }

    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    pub fn state(&self) -> OptimizerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<OptimizerState> {
        self.state.subscribe()
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    /// Selector over the same inventory, waiting for it to fill as configured
    pub fn selector(&self) -> RelaySelector {
        RelaySelector::new(
            self.store.clone(),
            self.mutex.name().to_string(),
            self.loop_config.inventory_retries,
            self.loop_config.inventory_retry_pause(),
        )
    }

    fn set_state(&self, state: OptimizerState) {
        self.state.send_replace(state);
    }

    /// Start the loop as a background task
    pub fn run(self: Arc<Self>) -> OptimizerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run_loop(stop_rx).await });
        OptimizerHandle { stop, task }
    }

    async fn run_loop(&self, mut stop: watch::Receiver<bool>) -> Result<(), OptimizerError> {
        info!(
            "🚀 Optimizer for {} ({}) running every {}s",
            self.node.name,
            self.node.network,
            self.loop_config.cycle_interval_secs
        );

        let mut interval = tokio::time::interval(self.loop_config.cycle_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    match self.cycle_until_stopped(&mut stop).await {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            error!("❌ Optimization cycle failed: {}", e);
                            self.metrics.inc_cycles_failed();
                            self.set_state(OptimizerState::Stopped);
                            return Err(e);
                        }
                    }
                }
            }
        }

        info!("Optimizer for {} stopped", self.node.name);
        self.set_state(OptimizerState::Stopped);
        Ok(())
    }

    /// Run one cycle without a stop signal
    pub async fn cycle(&self) -> Result<CycleReport, OptimizerError> {
        let (_keep, mut stop) = watch::channel(false);
        self.cycle_until_stopped(&mut stop)
            .await?
            .ok_or_else(|| OptimizerError::Task("cycle stopped before it ran".to_string()))
    }

    /// Returns `Ok(None)` if stopped while waiting for the network
    async fn cycle_until_stopped(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<CycleReport>, OptimizerError> {
        self.set_state(OptimizerState::CheckingNetwork);
        if !self.wait_for_network(stop).await {
            return Ok(None);
        }

        let report = self.locked_cycle().await;
        self.set_state(OptimizerState::Idle);
        let report = report?;

        report.log();
        self.metrics.record_cycle(&report);
        *self.last_report.write().await = Some(report.clone());
        Ok(Some(report))
    }

    /// Block until outbound connectivity looks healthy
    ///
    /// Rotates through the check hosts, requiring zero loss and a round trip
    /// under the limit. Returns false if stopped first.
    async fn wait_for_network(&self, stop: &mut watch::Receiver<bool>) -> bool {
        let hosts = &self.loop_config.network_check_hosts;
        if hosts.is_empty() {
            return true;
        }

        let max_rtt = self.loop_config.network_check_max_rtt();
        let prober = self.tester.prober();
        let mut attempt = 0usize;

        loop {
            if *stop.borrow() {
                return false;
            }

            let host = &hosts[attempt % hosts.len()];
            attempt += 1;

            match prober.ping(host).await.map(|stats| stats.classify()) {
                Ok(PingOutcome::Reachable(rtt)) if rtt < max_rtt => {
                    info!("network latency to {}: {}ms", host, rtt.as_millis());
                    return true;
                }
                Ok(PingOutcome::Reachable(rtt)) => {
                    warn!("network latency to {} is {}ms", host, rtt.as_millis());
                }
                Ok(PingOutcome::PartialLoss(loss)) => {
                    warn!("network check losing packets to {}: {:.0}%", host, loss);
                }
                Ok(PingOutcome::AllLost) => warn!("network check: {} unreachable", host),
                Err(e) => warn!("network check against {} failed: {}", host, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.loop_config.network_check_pause()) => {}
                _ = stop.changed() => return false,
            }
        }
    }
}

