//! Relay selection from the shared inventory
//!
//! Read path only. Selection never takes the fleet lock; a query that runs
//! while a cycle is persisting may see a partially written inventory.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::OptimizerError;
use crate::inventory::{decode_peer, InventoryStore};
use crate::types::{sort_by_latency, PeerRecord};

/// Best and random buckets of one selection
#[derive(Debug, Clone, Default, Serialize)]
pub struct Selection {
    /// Lowest-latency peers, ascending
    pub best: Vec<PeerRecord>,

    /// Uniform sample of the remainder, ascending
    pub random: Vec<PeerRecord>,
}

impl Selection {
    /// Best bucket followed by the random bucket
    pub fn into_relays(self) -> Vec<PeerRecord> {
        let mut relays = self.best;
        relays.extend(self.random);
        relays
    }
}

/// Split a latency-sorted list into `best` lowest peers plus `random` others
///
/// When the request exceeds the list, it is split roughly in half instead:
/// `ceil(n/2)` best and `floor(n/2)` random.
pub fn best_and_random<R: Rng + ?Sized>(
    relays: &[PeerRecord],
    best: usize,
    random: usize,
    rng: &mut R,
) -> Result<Selection, OptimizerError> {
    if best + random == 0 {
        return Err(OptimizerError::InvalidSelection(
            "best and random sizes are both zero".to_string(),
        ));
    }
    if relays.is_empty() {
        return Err(OptimizerError::EmptyInventory);
    }

    let mut sorted = relays.to_vec();
    sort_by_latency(&mut sorted);

    let n = sorted.len();
    let (best, random) = if best + random > n {
        let half = n.div_ceil(2);
        (half, n - half)
    } else {
        (best, random)
    };

    let mut remainder = sorted.split_off(best);
    remainder.shuffle(rng);
    remainder.truncate(random);
    sort_by_latency(&mut remainder);

    Ok(Selection {
        best: sorted,
        random: remainder,
    })
}

/// Inventory-backed selection queries
pub struct RelaySelector {
    store: Arc<dyn InventoryStore>,

    /// Key of the fleet lock, never a peer
    lock_name: String,

    /// Extra loads while the inventory is empty
    retries: u32,

    retry_pause: Duration,
}

impl RelaySelector {
    pub fn new(store: Arc<dyn InventoryStore>, lock_name: String, retries: u32, retry_pause: Duration) -> Self {
        Self {
            store,
            lock_name,
            retries,
            retry_pause,
        }
    }

    /// Every peer currently in the inventory, ascending by latency
    pub async fn load_once(&self) -> Result<Vec<PeerRecord>, OptimizerError> {
        let mut relays = Vec::new();

        for key in self.store.keys("*").await? {
            if key == self.lock_name {
                continue;
            }
            let Some(raw) = self.store.get(&key).await? else {
                // Deleted since listing
                continue;
            };
            match decode_peer(&raw) {
                Ok(peer) => relays.push(peer),
                Err(e) => warn!("skipping undecodable inventory entry {}: {}", key, e),
            }
        }

        sort_by_latency(&mut relays);
        Ok(relays)
    }

    /// Load the inventory, waiting for a first cycle to fill it
    pub async fn inventory_relays(&self) -> Result<Vec<PeerRecord>, OptimizerError> {
        let mut relays = self.load_once().await?;

        let mut attempt = 0;
        while relays.is_empty() && attempt < self.retries {
            attempt += 1;
            debug!("inventory empty, retrying in {:?} ({}/{})", self.retry_pause, attempt, self.retries);
            tokio::time::sleep(self.retry_pause).await;
            relays = self.load_once().await?;
        }

        Ok(relays)
    }

    pub async fn best_and_random(&self, best: usize, random: usize) -> Result<Selection, OptimizerError> {
        let relays = self.inventory_relays().await?;
        best_and_random(&relays, best, random, &mut rand::thread_rng())
    }

    /// Half best, half random
    pub async fn relays(&self, size: usize) -> Result<Vec<PeerRecord>, OptimizerError> {
        let best = size.div_ceil(2);
        let selection = self.best_and_random(best, size - best).await?;
        Ok(selection.into_relays())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{encode_peer, MemoryStore};
    use crate::types::is_sorted_by_latency;
    use std::collections::HashSet;

    fn twenty_peers() -> Vec<PeerRecord> {
        (1..=20u64)
            .map(|i| PeerRecord::new(format!("10.0.0.{}", i), 3001).with_latency(Duration::from_millis(10 * i)))
            .collect()
    }

    async fn seeded_store(peers: &[PeerRecord]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for peer in peers {
            store.set(&peer.inventory_key(), encode_peer(peer).unwrap()).await.unwrap();
        }
        store
    }

    #[test]
    fn test_best_are_lowest_latency() {
        let peers = twenty_peers();
        let selection = best_and_random(&peers, 5, 5, &mut rand::thread_rng()).unwrap();

        assert_eq!(selection.best.len(), 5);
        assert_eq!(selection.random.len(), 5);
        let best_max = selection.best.iter().map(|p| p.latency).max().unwrap();
        let random_min = selection.random.iter().map(|p| p.latency).min().unwrap();
        assert!(best_max < random_min);
        assert!(is_sorted_by_latency(&selection.random));
    }

    #[test]
    fn test_oversized_request_splits_in_half() {
        let peers: Vec<_> = twenty_peers().into_iter().take(7).collect();
        let selection = best_and_random(&peers, 10, 10, &mut rand::thread_rng()).unwrap();

        assert_eq!(selection.best.len(), 4);
        assert_eq!(selection.random.len(), 3);
    }

    #[test]
    fn test_invalid_and_empty() {
        let peers = twenty_peers();
        assert!(matches!(
            best_and_random(&peers, 0, 0, &mut rand::thread_rng()),
            Err(OptimizerError::InvalidSelection(_))
        ));
        assert!(matches!(
            best_and_random(&[], 3, 3, &mut rand::thread_rng()),
            Err(OptimizerError::EmptyInventory)
        ));
    }

    #[tokio::test]
    async fn test_get_relays_top_five_plus_five_others() {
        let peers = twenty_peers();
        let store = seeded_store(&peers).await;
        let selector = RelaySelector::new(store, "mutex".to_string(), 0, Duration::ZERO);

        let relays = selector.relays(10).await.unwrap();
        assert_eq!(relays.len(), 10);

        let top5: Vec<_> = peers[..5].iter().map(|p| p.address.clone()).collect();
        let got5: Vec<_> = relays[..5].iter().map(|p| p.address.clone()).collect();
        assert_eq!(got5, top5);

        let rest: HashSet<_> = peers[5..].iter().map(|p| p.address.clone()).collect();
        let unique: HashSet<_> = relays[5..].iter().map(|p| p.address.clone()).collect();
        assert_eq!(unique.len(), 5);
        assert!(unique.is_subset(&rest));
    }

    #[tokio::test]
    async fn test_lock_key_is_skipped() {
        let store = seeded_store(&twenty_peers()[..2]).await;
        store.try_lock("mutex", "token", Duration::from_secs(60)).await.unwrap();
        let selector = RelaySelector::new(store, "mutex".to_string(), 0, Duration::ZERO);

        let relays = selector.load_once().await.unwrap();
        assert_eq!(relays.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_first_cycle() {
        let store = Arc::new(MemoryStore::new());
        let selector = RelaySelector::new(store.clone(), "mutex".to_string(), 100, Duration::from_secs(20));

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(50)).await;
            let peer = PeerRecord::new("10.0.0.1", 3001);
            writer.set(&peer.inventory_key(), encode_peer(&peer).unwrap()).await.unwrap();
        });

        let relays = selector.inventory_relays().await.unwrap();
        assert_eq!(relays.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_inventory_after_retries() {
        let store = Arc::new(MemoryStore::new());
        let selector = RelaySelector::new(store, "mutex".to_string(), 0, Duration::ZERO);

        assert!(matches!(selector.relays(4).await, Err(OptimizerError::EmptyInventory)));
    }
}
