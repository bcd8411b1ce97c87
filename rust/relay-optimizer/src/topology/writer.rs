//! Topology Document Writer
//!
//! Renders the peers a node should connect to (its pinned peers followed by
//! a best+random selection from the inventory) into the JSON document the
//! node process reads, and keeps that file fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::optimizer::RelaySelector;
use crate::types::{PeerRecord, TopologyDocument};

/// Pinned peers first, then the selected relays
pub fn compose_document(node: &NodeConfig, relays: &[PeerRecord]) -> TopologyDocument {
    let pinned: Vec<PeerRecord> = node
        .pinned
        .iter()
        .map(|p| PeerRecord::extra(p.host.clone(), p.port))
        .collect();

    TopologyDocument::from_peers(pinned.iter().chain(relays.iter()))
}

/// Writes one node's topology document
pub struct TopologyWriter {
    /// Node the document is for
    node: NodeConfig,

    /// Inventory selection
    selector: Arc<RelaySelector>,
}

impl TopologyWriter {
    pub fn new(node: NodeConfig, selector: Arc<RelaySelector>) -> Self {
        Self { node, selector }
    }

    /// Build the document from the current inventory
    pub async fn generate(&self) -> anyhow::Result<TopologyDocument> {
        let relays = self.selector.relays(self.node.peers).await?;
        let document = compose_document(&self.node, &relays);

        info!(
            "📝 Generated topology for {}: {} pinned, {} relays",
            self.node.name,
            self.node.pinned.len(),
            relays.len()
        );

        Ok(document)
    }

    /// Generate and save to the node's topology path
    pub async fn generate_and_save(&self) -> anyhow::Result<TopologyDocument> {
        let document = self.generate().await?;
        write_document(&self.node.topology_path, &document).await?;
        debug!("Saved topology to {:?}", self.node.topology_path);
        Ok(document)
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.node.topology_path
    }
}

/// Write a document atomically (write to temp, then rename)
pub async fn write_document(path: &Path, document: &TopologyDocument) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(document)?;

    tokio::fs::write(&temp_path, &content).await?;
    tokio::fs::rename(&temp_path, path).await?;

    Ok(())
}

/// Run periodic topology generation
pub async fn run_periodic_writer(writer: Arc<TopologyWriter>, interval: std::time::Duration) {
    info!(
        "📝 Starting periodic topology writer for {:?} (every {}s)",
        writer.output_path(),
        interval.as_secs()
    );

    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        if let Err(e) = writer.generate_and_save().await {
            warn!("Failed to write topology: {}", e);
        }
    }
}
