//! Path MTU discovery via don't-fragment pings.
//!
//! Binary search for the largest MTU whose payload (`mtu − 28` bytes of ICMP
//! data) passes three consecutive `ping -M do` probes. The search floor is
//! the IPv4 minimum of 576; the ceiling is 1500 unless jumbo probing is
//! enabled.

use std::{future::Future, net::Ipv4Addr, time::Duration};

use crate::ping::{self, PingSpec};

pub const MTU_FLOOR: u32 = 576;
pub const MTU_CEIL: u32 = 1500;
pub const MTU_JUMBO_CEIL: u32 = 9000;

/// IPv4 + ICMP header overhead subtracted from the MTU to get the payload.
const HEADER_OVERHEAD: u32 = 28;

const PROBES_PER_SIZE: u32 = 3;

/// Discovers the path MTU towards `gateway` over `link`.
///
/// Returns `None` when even the floor doesn't pass, which means the path is
/// unusable for MTU purposes (the latency probe decides aliveness, not us).
pub async fn discover(link: &str, gateway: Ipv4Addr, jumbo: bool) -> Option<u32> {
    let ceiling = if jumbo { MTU_JUMBO_CEIL } else { MTU_CEIL };
    let link = link.to_string();

    let mtu = largest_passing(MTU_FLOOR, ceiling, |mtu| {
        let link = link.clone();
        async move { fits(&link, gateway, mtu).await }
    })
    .await;

    tracing::debug!(link = %link, %gateway, ?mtu, "mtu discovery finished");
    mtu
}

async fn fits(link: &str, gateway: Ipv4Addr, mtu: u32) -> bool {
    let spec = PingSpec { payload: Some(mtu - HEADER_OVERHEAD), no_fragment: true };
    let deadline = Duration::from_secs(u64::from(PROBES_PER_SIZE) + 2);

    match ping::ping(link, gateway, PROBES_PER_SIZE, Duration::from_secs(1), spec, deadline).await {
        Ok(outcome) => outcome.received == PROBES_PER_SIZE,
        Err(e) => {
            tracing::debug!(%link, %gateway, mtu, ?e, "mtu probe failed to run");
            false
        }
    }
}

/// Binary search for the largest value in `[lo, hi]` passing `probe`.
///
/// Assumes the passing set is a prefix (true for MTU: if 1400 fits, 1300
/// fits). Returns `None` when even `lo` fails.
pub async fn largest_passing<F, Fut>(mut lo: u32, mut hi: u32, probe: F) -> Option<u32>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    if !probe(lo).await {
        return None;
    }

    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if probe(mid).await {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    Some(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn finds_exact_threshold() {
        for threshold in [576, 1400, 1492, 1500] {
            let found = largest_passing(576, 1500, |mtu| async move { mtu <= threshold }).await;
            assert_eq!(found, Some(threshold));
        }
    }

    #[tokio::test]
    async fn returns_none_when_floor_fails() {
        let found = largest_passing(576, 1500, |_| async { false }).await;
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn full_range_passes_at_ceiling() {
        let found = largest_passing(576, 9000, |_| async { true }).await;
        assert_eq!(found, Some(9000));
    }

    #[tokio::test]
    async fn probe_count_is_logarithmic() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();
        largest_passing(576, 1500, move |mtu| {
            let calls = calls_inner.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                mtu <= 1200
            }
        })
        .await;
        // 1 floor check + ~log2(925) bisections.
        assert!(calls.load(Ordering::Relaxed) <= 12);
    }
}
