//! Route-latency estimation
//!
//! Traces the route to a peer and estimates its latency from the round-trip
//! samples of the final responder. Noisy routes (sample standard deviation
//! above a limit) fall back to a fixed default instead of a misleading mean.

use rand::Rng;
use statrs::statistics::Statistics;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Prober, ProbeError};
use crate::config::NetTestConfig;

/// Tuning of the route-latency estimate
#[derive(Debug, Clone)]
pub struct RouteSettings {
    /// Upper bound of the random pre-trace delay
    pub jitter_max: Duration,

    /// Trace attempts before giving up with the default
    pub tries: u32,

    /// Fewer hops than this is treated as an incomplete trace
    pub min_hops: usize,

    pub retry_pause: Duration,

    pub stddev_limit: Duration,

    /// Reported when the route is too noisy or never completes
    pub default_latency: Duration,
}

impl RouteSettings {
    pub fn from_config(config: &NetTestConfig) -> Self {
        Self {
            jitter_max: config.route_jitter_max(),
            tries: config.route_tries,
            min_hops: config.route_min_hops,
            retry_pause: config.route_retry_pause(),
            stddev_limit: config.route_stddev_limit(),
            default_latency: config.route_default_latency(),
        }
    }
}

/// Estimate the latency of the route towards `address`
///
/// Resolution and trace failures are errors. An incomplete route after all
/// attempts is not: it yields `default_latency`.
pub async fn route_latency(
    prober: &dyn Prober,
    address: &str,
    settings: &RouteSettings,
) -> Result<Duration, ProbeError> {
    // Spread concurrent traces out
    let jitter = random_jitter(settings.jitter_max);
    if !jitter.is_zero() {
        tokio::time::sleep(jitter).await;
    }

    let ip = resolve_first(prober, address).await?;

    let tries = settings.tries.max(1);
    for attempt in 1..=tries {
        let hops = prober.trace(ip).await?;

        if hops.len() < settings.min_hops {
            debug!(
                "route to {} has {} hops (attempt {}/{})",
                address,
                hops.len(),
                attempt,
                tries
            );
            if attempt < tries {
                tokio::time::sleep(settings.retry_pause).await;
            }
            continue;
        }

        // Samples of the last responder on the final hop
        let samples = match hops.last().and_then(|hop| hop.nodes.last()) {
            Some(node) if !node.rtts.is_empty() => node.rtts.clone(),
            _ => continue,
        };

        return Ok(estimate_route_latency(
            &samples,
            settings.stddev_limit,
            settings.default_latency,
        ));
    }

    debug!("no usable route to {}, using default latency", address);
    Ok(settings.default_latency)
}

/// Mean of the samples, or `default` when they spread more than `stddev_limit`
pub fn estimate_route_latency(samples: &[Duration], stddev_limit: Duration, default: Duration) -> Duration {
    if samples.is_empty() {
        return default;
    }

    let ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    let mean = ms.iter().mean();

    if ms.len() >= 2 {
        let std_dev = ms.iter().std_dev();
        let limit_ms = stddev_limit.as_secs_f64() * 1000.0;
        if std_dev > limit_ms {
            warn!("route samples too noisy (stddev {:.1} ms), using default", std_dev);
            return default;
        }
    }

    millis_to_duration(mean)
}

/// Milliseconds to a duration, rounded to the microsecond
pub(crate) fn millis_to_duration(ms: f64) -> Duration {
    Duration::from_micros((ms * 1000.0).round().max(0.0) as u64)
}

async fn resolve_first(prober: &dyn Prober, address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    prober
        .resolve(address)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ProbeError::Resolve(address.to_string()))
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
