//! The probe engine: cached single probes and bounded-concurrency batches.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};

use crate::{
    cache::ProbeCache,
    ping::{self, PingSpec},
    probe::{Probe, Source},
    mtu,
};

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Echoes per latency sample (`PING_COUNT`).
    pub ping_count: u32,
    /// Per-reply timeout (`PING_TIMEOUT`).
    pub ping_timeout: Duration,
    /// Overall batch deadline (`PARALLEL_TIMEOUT`).
    pub parallel_timeout: Duration,
    /// Concurrent probe bound (`MAX_CONCURRENCY`). Ping spawn cost dominates
    /// at high fan-out on small hosts, so this stays small.
    pub max_concurrency: usize,
    /// Run MTU discovery on alive probes (`PROBE_MTU`).
    pub discover_mtu: bool,
    /// Extend the MTU search above 1500 (`PROBE_JUMBO`).
    pub jumbo: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            ping_count: 2,
            ping_timeout: Duration::from_secs(1),
            parallel_timeout: Duration::from_secs(5),
            max_concurrency: 4,
            discover_mtu: false,
            jumbo: false,
        }
    }
}

/// Measures gateways, consulting the shared TTL cache first.
#[derive(Debug, Clone)]
pub struct ProbeEngine {
    cache: Arc<ProbeCache>,
    opts: ProbeOptions,
}

impl ProbeEngine {
    pub fn new(cache: Arc<ProbeCache>, opts: ProbeOptions) -> Self {
        Self { cache, opts }
    }

    pub fn cache(&self) -> &ProbeCache {
        &self.cache
    }

    /// Probes one `(link, gateway)` pair, returning a cached result when one
    /// is still fresh.
    pub async fn probe(&self, link: &str, gateway: Ipv4Addr) -> Probe {
        if let Some(hit) = self.cache.get(link, gateway) {
            tracing::debug!(%link, %gateway, "probe cache hit");
            return hit;
        }

        let probe = self.measure(link, gateway).await;
        self.cache.put(&probe);
        probe
    }

    /// Probes many pairs concurrently, bounded by `max_concurrency`, under
    /// the batch deadline. Pairs that don't finish in time come back dead
    /// with `source = Fresh`. The result map is keyed by link name; there is
    /// no ordering guarantee.
    pub async fn probe_batch(&self, targets: &[(String, Ipv4Addr)]) -> FxHashMap<String, Probe> {
        let deadline = Instant::now() + self.opts.parallel_timeout;
        let semaphore = Arc::new(Semaphore::new(self.opts.max_concurrency.max(1)));
        let mut tasks: JoinSet<(String, Probe)> = JoinSet::new();

        let mut seen = FxHashSet::default();
        for (link, gateway) in targets {
            if !seen.insert(link.clone()) {
                continue;
            }

            let engine = self.clone();
            let semaphore = semaphore.clone();
            let link = link.clone();
            let gateway = *gateway;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let probe = engine.probe(&link, gateway).await;
                (link, probe)
            });
        }

        let mut results = FxHashMap::default();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((link, probe)))) => {
                    results.insert(link, probe);
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(?e, "probe task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(pending = tasks.len(), "batch deadline expired, cancelling");
                    tasks.abort_all();
                    break;
                }
            }
        }

        // Whatever didn't make it is recorded as dead-and-fresh so the
        // planner sees every requested pair.
        for (link, gateway) in targets {
            if !results.contains_key(link) {
                results.insert(link.clone(), Probe::dead(link.clone(), *gateway));
            }
        }

        results
    }

    /// One fresh measurement: liveness gate, latency/loss sample, jitter,
    /// then optional MTU discovery.
    async fn measure(&self, link: &str, gateway: Ipv4Addr) -> Probe {
        // Early exit: one echo with a one-second deadline. No reply means we
        // skip the full sample entirely.
        let gate = ping::ping(
            link,
            gateway,
            1,
            Duration::from_secs(1),
            PingSpec::default(),
            Duration::from_secs(2),
        )
        .await;

        match gate {
            Ok(outcome) if outcome.received > 0 => {}
            Ok(_) => {
                tracing::debug!(%link, %gateway, "liveness gate: no reply");
                return Probe::dead(link, gateway);
            }
            Err(e) => {
                tracing::warn!(%link, %gateway, ?e, "liveness gate failed to run");
                return Probe::dead(link, gateway);
            }
        }

        let count = self.opts.ping_count.max(1);
        let sample_deadline = Duration::from_secs_f64(
            f64::from(count) * 0.2 + self.opts.ping_timeout.as_secs_f64() + 1.0,
        );
        let sample = match ping::ping(
            link,
            gateway,
            count,
            self.opts.ping_timeout,
            PingSpec::default(),
            sample_deadline,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(%link, %gateway, ?e, "latency sample failed to run");
                return Probe::dead(link, gateway);
            }
        };

        if sample.received == 0 {
            return Probe::dead(link, gateway);
        }

        let latency_ms = ping::mean(&sample.rtts_ms);
        let jitter_ms =
            (sample.rtts_ms.len() >= 2).then(|| ping::population_stddev(&sample.rtts_ms));
        let loss_pct = f64::from(count.saturating_sub(sample.received)) / f64::from(count) * 100.0;

        let mtu = if self.opts.discover_mtu {
            mtu::discover(link, gateway, self.opts.jumbo).await
        } else {
            None
        };

        let probe = Probe::alive(link, gateway, latency_ms, jitter_ms, loss_pct, mtu);
        tracing::debug!(
            %link,
            %gateway,
            latency_ms = format_args!("{latency_ms:.3}"),
            ?jitter_ms,
            loss_pct,
            "probe complete"
        );
        probe
    }
}
