//! TTL cache for probe results.
//!
//! Two layers share one view: an in-process map for batch probing, and a
//! plaintext file per `(link, gateway)` pair so consecutive CLI invocations
//! within the TTL window reuse measurements. A file holds a single line —
//! the latency in milliseconds, or the literal `DEAD` for a confirmed-down
//! gateway — and its mtime is the freshness timestamp. Dead entries are
//! cached exactly like live ones to suppress re-probing of down gateways.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use rustc_hash::FxHashMap;

use netopt_common::clock;

use crate::probe::{Probe, ProbeStatus, Source};

/// File content for a dead gateway.
const DEAD_SENTINEL: &str = "DEAD";

type CacheKey = (String, Ipv4Addr);

#[derive(Debug)]
pub struct ProbeCache {
    ttl: Duration,
    root: Option<PathBuf>,
    inner: Mutex<FxHashMap<CacheKey, Probe>>,
}

impl ProbeCache {
    /// Memory-only cache.
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, root: None, inner: Mutex::new(FxHashMap::default()) }
    }

    /// Cache backed by one file per entry under `root`.
    pub fn with_root(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self { ttl, root: Some(root.into()), inner: Mutex::new(FxHashMap::default()) }
    }

    /// Looks up a fresh entry, preferring the in-process map over disk.
    /// Hits come back with `source = Cached`.
    pub fn get(&self, link: &str, gateway: Ipv4Addr) -> Option<Probe> {
        let key = (link.to_string(), gateway);
        let now_us = clock::monotonic_micros();
        let ttl_us = self.ttl.as_micros() as u64;

        {
            let inner = self.inner.lock().expect("probe cache poisoned");
            if let Some(probe) = inner.get(&key) {
                if now_us.saturating_sub(probe.measured_at_us) < ttl_us {
                    let mut hit = probe.clone();
                    hit.source = Source::Cached;
                    return Some(hit);
                }
            }
        }

        self.read_file(link, gateway, now_us, ttl_us)
    }

    /// Inserts a probe, overwriting any previous entry for the same key.
    /// Concurrent probes of the same pair are both valid measurements, so
    /// last-writer-wins is correct here.
    pub fn put(&self, probe: &Probe) {
        let key = (probe.link.clone(), probe.gateway);
        self.inner.lock().expect("probe cache poisoned").insert(key, probe.clone());
        self.write_file(probe);
    }

    /// Snapshot of `(link, gateway, age, alive)` for every disk entry,
    /// fresh or stale — `status` reporting wants both.
    pub fn disk_entries(&self) -> Vec<(String, Duration, bool)> {
        let Some(root) = &self.root else { return Vec::new() };
        let Ok(dir) = std::fs::read_dir(root) else { return Vec::new() };

        let mut entries = Vec::new();
        for entry in dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let age = modified.elapsed().unwrap_or_default();
            let alive = std::fs::read_to_string(entry.path())
                .map(|c| c.trim() != DEAD_SENTINEL)
                .unwrap_or(false);
            entries.push((name, age, alive));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn read_file(&self, link: &str, gateway: Ipv4Addr, now_us: u64, ttl_us: u64) -> Option<Probe> {
        let path = self.entry_path(link, gateway)?;
        let meta = std::fs::metadata(&path).ok()?;
        let age = meta.modified().ok()?.elapsed().ok()?;
        if age.as_micros() as u64 >= ttl_us {
            return None;
        }

        let contents = std::fs::read_to_string(&path).ok()?;
        let line = contents.trim();

        let status = if line == DEAD_SENTINEL {
            ProbeStatus::Dead
        } else {
            let latency_ms: f64 = line.parse().ok()?;
            ProbeStatus::Alive { latency_ms, jitter_ms: None, loss_pct: 0.0, mtu: None }
        };

        Some(Probe {
            link: link.to_string(),
            gateway,
            status,
            measured_at_us: now_us.saturating_sub(age.as_micros() as u64),
            source: Source::Cached,
        })
    }

    fn write_file(&self, probe: &Probe) {
        let Some(path) = self.entry_path(&probe.link, probe.gateway) else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let line = match probe.status {
            ProbeStatus::Alive { latency_ms, .. } => format!("{latency_ms:.3}\n"),
            ProbeStatus::Dead => format!("{DEAD_SENTINEL}\n"),
        };

        // Cache persistence is best-effort; a read-only cache dir only costs
        // cross-invocation reuse.
        if let Err(e) = std::fs::write(&path, line) {
            tracing::warn!(path = %path.display(), ?e, "failed to persist cache entry");
        }
    }

    fn entry_path(&self, link: &str, gateway: Ipv4Addr) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(entry_file_name(link, gateway)))
    }
}

/// `{link}_{gateway-slug}` with dots dashed, e.g. `eth0_192-168-1-1`.
pub fn entry_file_name(link: &str, gateway: Ipv4Addr) -> String {
    format!("{}_{}", link, gateway.to_string().replace('.', "-"))
}

/// Removes stale entry files under `root`.
pub fn sweep(root: &Path, ttl: Duration) {
    let Ok(dir) = std::fs::read_dir(root) else { return };
    for entry in dir.flatten() {
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|m| m.elapsed().unwrap_or_default() >= ttl)
            .unwrap_or(true);
        if stale {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
