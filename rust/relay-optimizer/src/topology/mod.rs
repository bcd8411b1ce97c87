//! Topology Source
//!
//! Downloads the public peer list for a network and turns it into discovery
//! candidates, skipping peers the operator already pinned locally.

pub mod downloader;
pub mod writer;

pub use downloader::{download_with_retry, Download, HttpDownloader};
pub use writer::{compose_document, run_periodic_writer, TopologyWriter};

use rand::Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{PinnedPeer, TopologyConfig};
use crate::types::{Network, PeerRecord, TopologyDocument};

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("Download of {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Download of {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted { url: String, attempts: u32, last: String },

    #[error("Topology document {path:?} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Public topology document source
pub struct TopologySource {
    config: TopologyConfig,
    downloader: Arc<dyn Download>,
}

impl TopologySource {
    pub fn new(config: TopologyConfig, downloader: Arc<dyn Download>) -> Self {
        Self { config, downloader }
    }

    /// Download and filter discovery candidates for `network`
    ///
    /// Peers whose address matches a pinned peer are skipped, duplicate
    /// `(address, port)` pairs collapse to the first occurrence, and every
    /// candidate starts at valency 1.
    pub async fn fetch_candidates(
        &self,
        network: Network,
        excluding: &[PinnedPeer],
    ) -> Result<Vec<PeerRecord>, TopologyError> {
        let url = self.config.url_for(network);
        let scratch = self.scratch_path(network);

        download_with_retry(
            self.downloader.as_ref(),
            &scratch,
            url,
            self.config.download_attempts,
            self.config.download_retry_pause(),
        )
        .await?;

        let parsed = read_document(&scratch).await;
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            debug!("could not remove {:?}: {}", scratch, e);
        }
        let document = parsed?;

        let pinned: HashSet<&str> = excluding.iter().map(|p| p.host.as_str()).collect();
        let mut seen = HashSet::new();
        let mut candidates = Vec::with_capacity(document.producers.len());
        let mut skipped = 0usize;

        for entry in &document.producers {
            if pinned.contains(entry.addr.as_str()) {
                skipped += 1;
                continue;
            }

            let mut peer = PeerRecord::from(entry);
            peer.valency = 1;
            if seen.insert(peer.inventory_key()) {
                candidates.push(peer);
            }
        }

        if skipped > 0 {
            debug!("skipped {} pinned peers from the {} topology", skipped, network);
        }
        if candidates.is_empty() {
            warn!("{} topology at {} has no usable peers", network, url);
        }
        info!("🌐 Fetched {} {} candidates", candidates.len(), network);

        Ok(candidates)
    }

    fn scratch_path(&self, network: Network) -> PathBuf {
        let tag: [u8; 4] = rand::thread_rng().gen();
        self.config
            .scratch_dir
            .join(format!("topology-{}-{}.json", network, hex::encode(tag)))
    }
}

async fn read_document(path: &std::path::Path) -> Result<TopologyDocument, TopologyError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|source| TopologyError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
