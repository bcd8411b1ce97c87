//! Bounded-time fan-out of per-peer probes
//!
//! One task per peer reports into an unbounded queue. The collector stops at
//! whichever comes first: every task finished, or the batch window elapsed.
//! Stragglers are never aborted; they check the shared `done` flag before
//! sending and drop their result once the window is over. The receiver is
//! only closed after the flag is raised, and a send on a closed queue is a
//! silent no-op, so late reporters never fail.

use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::types::PeerRecord;

/// Sending half handed to each probe task
pub struct Reporter<T> {
    tx: mpsc::UnboundedSender<T>,
    done: Arc<AtomicBool>,
}

impl<T> Clone for Reporter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            done: self.done.clone(),
        }
    }
}

impl<T> Reporter<T> {
    /// Whether the batch window is already over
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Report a result. Returns false if it was suppressed.
    pub fn report(&self, item: T) -> bool {
        if self.is_done() {
            return false;
        }
        self.tx.send(item).is_ok()
    }
}

/// Results gathered within one batch window
#[derive(Debug)]
pub struct Collected<T> {
    pub results: Vec<T>,

    /// True when the window elapsed before every task reported
    pub timed_out: bool,
}

/// Create a reporter and its collector half
pub fn channel<T>() -> (Reporter<T>, Collector<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let done = Arc::new(AtomicBool::new(false));
    (
        Reporter { tx, done: done.clone() },
        Collector { rx, done },
    )
}

/// Receiving half, owned by the batch caller
pub struct Collector<T> {
    rx: mpsc::UnboundedReceiver<T>,
    done: Arc<AtomicBool>,
}

impl<T> Collector<T> {
    /// Collect up to `expected` results within `window`
    pub async fn collect(mut self, expected: usize, window: Duration) -> Collected<T> {
        let deadline = Instant::now() + window;
        let mut results = Vec::with_capacity(expected);
        let mut timed_out = false;

        while results.len() < expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(item)) => results.push(item),
                // Every reporter dropped
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        // Raise the flag before closing so reporters stop first
        self.done.store(true, Ordering::Release);
        self.rx.close();

        Collected { results, timed_out }
    }
}

/// Probe every peer concurrently, in random order, within `window`
///
/// `max_in_flight` of 0 means one task per peer with no bound.
pub async fn fan_out<T, F, Fut>(
    mut peers: Vec<PeerRecord>,
    window: Duration,
    max_in_flight: usize,
    probe: F,
) -> Collected<T>
where
    T: Send + 'static,
    F: Fn(PeerRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    // Avoid biasing early or late entries
    peers.shuffle(&mut rand::thread_rng());

    let expected = peers.len();
    let (reporter, collector) = channel();
    let limiter = (max_in_flight > 0).then(|| Arc::new(Semaphore::new(max_in_flight)));
    let probe = Arc::new(probe);

    for peer in peers {
        let reporter = reporter.clone();
        let limiter = limiter.clone();
        let probe = probe.clone();

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            if reporter.is_done() {
                debug!("batch over before {} was probed", peer);
                return;
            }

            let result = probe(peer).await;
            reporter.report(result);
        });
    }
    drop(reporter);

    collector.collect(expected, window).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<PeerRecord> {
        (0..n).map(|i| PeerRecord::new(format!("10.0.0.{}", i), 3001)).collect()
    }

    #[tokio::test]
    async fn test_collects_every_result() {
        let collected = fan_out(peers(10), Duration::from_secs(5), 0, |peer| async move { peer.address }).await;

        assert_eq!(collected.results.len(), 10);
        assert!(!collected.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bounds_slow_probes() {
        let started = Instant::now();
        let collected = fan_out(peers(6), Duration::from_secs(60), 0, |peer| async move {
            if peer.address.ends_with(".0") || peer.address.ends_with(".1") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            peer.address
        })
        .await;

        assert_eq!(collected.results.len(), 4);
        assert!(collected.timed_out);
        assert!(started.elapsed() <= Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reporters_are_suppressed() {
        let (reporter, collector) = channel::<u32>();
        let late = reporter.clone();

        assert!(reporter.report(1));
        let collected = collector.collect(2, Duration::from_secs(1)).await;

        assert_eq!(collected.results, vec![1]);
        assert!(late.is_done());
        assert!(!late.report(2));
    }

    #[tokio::test]
    async fn test_bounded_in_flight() {
        use std::sync::atomic::AtomicUsize;

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (r, p) = (running.clone(), peak.clone());
        let collected = fan_out(peers(12), Duration::from_secs(5), 3, move |_peer| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(collected.results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
