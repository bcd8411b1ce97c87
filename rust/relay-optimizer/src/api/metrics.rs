//! Metrics Collection
//!
//! Collects and exposes metrics for monitoring the optimizer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::optimizer::CycleReport;

/// Metrics collector for the optimizer
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Completed optimization cycles
    pub cycles_completed: AtomicU64,

    /// Failed optimization cycles
    pub cycles_failed: AtomicU64,

    /// Candidates in the last fresh topology
    pub candidates: AtomicU64,

    /// Peers accepted by the last cycle
    pub accepted: AtomicU64,

    /// Inventory entries deleted after failed tests
    pub evictions: AtomicU64,

    /// Partial-loss peers in the last cycle
    pub partial_loss: AtomicU64,

    /// Peers lost to the ping window in the last cycle
    pub timed_out: AtomicU64,

    /// Unix time of the last completed cycle
    pub last_cycle_timestamp: AtomicU64,

    /// Current inventory size
    pub inventory_size: AtomicU64,

    /// Selection queries served
    pub api_queries: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Record a completed cycle
    pub fn record_cycle(&self, report: &CycleReport) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.candidates.store(report.candidates as u64, Ordering::Relaxed);
        self.accepted.store(report.accepted as u64, Ordering::Relaxed);
        self.partial_loss.store(report.partial_loss as u64, Ordering::Relaxed);
        self.timed_out.store(report.timed_out as u64, Ordering::Relaxed);
        self.last_cycle_timestamp
            .store(report.finished_at.max(0) as u64, Ordering::Relaxed);
    }

    pub fn inc_cycles_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_api_queries(&self) {
        self.api_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Update inventory size
    pub fn set_inventory_size(&self, count: u64) {
        self.inventory_size.store(count, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        // Uptime
        output.push_str(&format!(
            "# HELP relay_optimizer_uptime_seconds Optimizer uptime in seconds\n\
             # TYPE relay_optimizer_uptime_seconds gauge\n\
             relay_optimizer_uptime_seconds {}\n\n",
            self.uptime_secs()
        ));

        // Cycles
        output.push_str(&format!(
            "# HELP relay_optimizer_cycles_total Completed optimization cycles\n\
             # TYPE relay_optimizer_cycles_total counter\n\
             relay_optimizer_cycles_total {}\n\n",
            self.cycles_completed.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP relay_optimizer_cycles_failed_total Failed optimization cycles\n\
             # TYPE relay_optimizer_cycles_failed_total counter\n\
             relay_optimizer_cycles_failed_total {}\n\n",
            self.cycles_failed.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP relay_optimizer_last_cycle_timestamp Unix time of the last completed cycle\n\
             # TYPE relay_optimizer_last_cycle_timestamp gauge\n\
             relay_optimizer_last_cycle_timestamp {}\n\n",
            self.last_cycle_timestamp.load(Ordering::Relaxed)
        ));

        // Last cycle classification
        output.push_str(&format!(
            "# HELP relay_optimizer_candidates Candidates in the last topology\n\
             # TYPE relay_optimizer_candidates gauge\n\
             relay_optimizer_candidates {}\n\n",
            self.candidates.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP relay_optimizer_accepted Peers accepted by the last cycle\n\
             # TYPE relay_optimizer_accepted gauge\n\
             relay_optimizer_accepted {}\n\n",
            self.accepted.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP relay_optimizer_partial_loss Partial packet loss peers in the last cycle\n\
             # TYPE relay_optimizer_partial_loss gauge\n\
             relay_optimizer_partial_loss {}\n\n",
            self.partial_loss.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP relay_optimizer_timed_out Peers that missed the ping window in the last cycle\n\
             # TYPE relay_optimizer_timed_out gauge\n\
             relay_optimizer_timed_out {}\n\n",
            self.timed_out.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP relay_optimizer_evictions_total Inventory entries deleted after failed tests\n\
             # TYPE relay_optimizer_evictions_total counter\n\
             relay_optimizer_evictions_total {}\n\n",
            self.evictions.load(Ordering::Relaxed)
        ));

        // Inventory
        output.push_str(&format!(
            "# HELP relay_optimizer_inventory_size Peers in the shared inventory\n\
             # TYPE relay_optimizer_inventory_size gauge\n\
             relay_optimizer_inventory_size {}\n\n",
            self.inventory_size.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP relay_optimizer_api_queries_total Selection queries served\n\
             # TYPE relay_optimizer_api_queries_total counter\n\
             relay_optimizer_api_queries_total {}\n\n",
            self.api_queries.load(Ordering::Relaxed)
        ));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "cycles": {
                "completed": self.cycles_completed.load(Ordering::Relaxed),
                "failed": self.cycles_failed.load(Ordering::Relaxed),
                "last_timestamp": self.last_cycle_timestamp.load(Ordering::Relaxed),
            },
            "last_cycle": {
                "candidates": self.candidates.load(Ordering::Relaxed),
                "accepted": self.accepted.load(Ordering::Relaxed),
                "partial_loss": self.partial_loss.load(Ordering::Relaxed),
                "timed_out": self.timed_out.load(Ordering::Relaxed),
            },
            "evictions": self.evictions.load(Ordering::Relaxed),
            "inventory_size": self.inventory_size.load(Ordering::Relaxed),
            "api_queries": self.api_queries.load(Ordering::Relaxed),
        })
    }
}
