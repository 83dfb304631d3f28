//! TCP stack tuning through `/proc/sys`.
//!
//! Parameters are addressed by their dotted sysctl key and written through
//! the proc filesystem directly. Prior values are captured per-key so that
//! any tuning can be rolled back exactly.

use std::{io, path::PathBuf};

use serde::{Deserialize, Serialize};

/// The keys a TCP profile touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    CongestionControl,
    Fastopen,
    RmemMax,
    WmemMax,
    DefaultQdisc,
    SlowStartAfterIdle,
    MtuProbing,
}

impl Param {
    /// Dotted sysctl key.
    pub fn key(&self) -> &'static str {
        match self {
            Self::CongestionControl => "net.ipv4.tcp_congestion_control",
            Self::Fastopen => "net.ipv4.tcp_fastopen",
            Self::RmemMax => "net.core.rmem_max",
            Self::WmemMax => "net.core.wmem_max",
            Self::DefaultQdisc => "net.core.default_qdisc",
            Self::SlowStartAfterIdle => "net.ipv4.tcp_slow_start_after_idle",
            Self::MtuProbing => "net.ipv4.tcp_mtu_probing",
        }
    }
}

/// Maps a dotted sysctl key to its `/proc/sys` path.
///
/// Rejects keys that would escape `/proc/sys` (path traversal, absolute
/// components) — checkpoint restore feeds keys parsed from archive text
/// through here.
pub fn key_to_path(key: &str) -> Option<PathBuf> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_'))
        && !key.contains("..")
        && !key.starts_with('.')
        && !key.ends_with('.');

    valid.then(|| PathBuf::from("/proc/sys").join(key.replace('.', "/")))
}

/// Reads a parameter's current value, trimmed.
pub fn read(param: Param) -> io::Result<String> {
    read_key(param.key())
}

/// Writes a parameter.
pub fn write(param: Param, value: &str) -> io::Result<()> {
    write_key(param.key(), value)
}

/// Reads an arbitrary dotted key.
pub fn read_key(key: &str) -> io::Result<String> {
    let path = key_to_path(key)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("bad sysctl key {key}")))?;
    std::fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Writes an arbitrary dotted key.
pub fn write_key(key: &str, value: &str) -> io::Result<()> {
    let path = key_to_path(key)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("bad sysctl key {key}")))?;
    std::fs::write(path, value)
}

/// A TCP tuning profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub congestion_control: String,
    pub fastopen: u32,
    pub rmem_max: u64,
    pub wmem_max: u64,
}

impl Profile {
    /// The settings this profile applies, in application order.
    pub fn settings(&self) -> Vec<(Param, String)> {
        vec![
            (Param::CongestionControl, self.congestion_control.clone()),
            (Param::Fastopen, self.fastopen.to_string()),
            (Param::RmemMax, self.rmem_max.to_string()),
            (Param::WmemMax, self.wmem_max.to_string()),
            (Param::SlowStartAfterIdle, "0".to_string()),
            (Param::MtuProbing, "1".to_string()),
        ]
    }
}

/// The conservative fallback the watchdog rollback applies: kernel defaults
/// a stuck remote box is guaranteed to behave under.
pub fn conservative_settings() -> Vec<(Param, String)> {
    vec![
        (Param::CongestionControl, "cubic".to_string()),
        (Param::DefaultQdisc, "pfifo_fast".to_string()),
    ]
}

/// Per-key backup of the values a tuning pass replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub prior: Vec<(String, String)>,
}

/// Applies `profile`, returning a backup of every value it replaced.
///
/// On a write failure the already-changed keys are restored before the error
/// surfaces, so tuning is all-or-nothing.
pub fn tune(profile: &Profile) -> io::Result<Backup> {
    let mut backup = Backup::default();

    for (param, value) in profile.settings() {
        let prior = match read(param) {
            Ok(prior) => prior,
            Err(e) => {
                // Key absent on this kernel; skip rather than fail the profile.
                tracing::warn!(key = param.key(), ?e, "sysctl key unreadable, skipping");
                continue;
            }
        };

        if let Err(e) = write(param, &value) {
            tracing::error!(key = param.key(), %value, ?e, "sysctl write failed, unwinding");
            restore(&backup);
            return Err(e);
        }

        tracing::debug!(key = param.key(), %prior, %value, "sysctl tuned");
        backup.prior.push((param.key().to_string(), prior));
    }

    Ok(backup)
}

/// Re-applies a backup key-by-key. Failures are logged, not propagated —
/// restore is a best-effort path that must visit every key.
pub fn restore(backup: &Backup) {
    for (key, value) in &backup.prior {
        if let Err(e) = write_key(key, value) {
            tracing::warn!(%key, %value, ?e, "sysctl restore failed for key");
        }
    }
}
