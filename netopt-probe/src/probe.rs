//! Probe result types.

use std::net::Ipv4Addr;

use serde::Serialize;

use netopt_common::clock;

/// Whether a probe came from a live measurement or the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Fresh,
    Cached,
}

/// Measurement outcome for one `(link, gateway)` pair.
///
/// A probe with zero successful replies is `Dead` regardless of anything
/// else; `Alive` always carries a latency and a loss percentage below 100.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProbeStatus {
    Alive {
        latency_ms: f64,
        /// Population stddev of the sample RTTs; absent for samples of one.
        jitter_ms: Option<f64>,
        loss_pct: f64,
        mtu: Option<u32>,
    },
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Probe {
    pub link: String,
    pub gateway: Ipv4Addr,
    pub status: ProbeStatus,
    /// Microseconds on the process monotonic clock when measured.
    pub measured_at_us: u64,
    pub source: Source,
}

impl Probe {
    pub fn alive(
        link: impl Into<String>,
        gateway: Ipv4Addr,
        latency_ms: f64,
        jitter_ms: Option<f64>,
        loss_pct: f64,
        mtu: Option<u32>,
    ) -> Self {
        Self {
            link: link.into(),
            gateway,
            status: ProbeStatus::Alive { latency_ms, jitter_ms, loss_pct, mtu },
            measured_at_us: clock::monotonic_micros(),
            source: Source::Fresh,
        }
    }

    pub fn dead(link: impl Into<String>, gateway: Ipv4Addr) -> Self {
        Self {
            link: link.into(),
            gateway,
            status: ProbeStatus::Dead,
            measured_at_us: clock::monotonic_micros(),
            source: Source::Fresh,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.status, ProbeStatus::Alive { .. })
    }

    pub fn latency_ms(&self) -> Option<f64> {
        match self.status {
            ProbeStatus::Alive { latency_ms, .. } => Some(latency_ms),
            ProbeStatus::Dead => None,
        }
    }

    /// Loss percentage; a dead probe is total loss.
    pub fn loss_pct(&self) -> f64 {
        match self.status {
            ProbeStatus::Alive { loss_pct, .. } => loss_pct,
            ProbeStatus::Dead => 100.0,
        }
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        match self.status {
            ProbeStatus::Alive { jitter_ms, .. } => jitter_ms,
            ProbeStatus::Dead => None,
        }
    }
}
