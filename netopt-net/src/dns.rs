//! Resolver file management.
//!
//! The resolver file is only rewritten when it is really ours to manage:
//! a symlinked `/etc/resolv.conf` belongs to systemd-resolved or
//! NetworkManager, and a running dnsmasq owns local resolution. In both
//! cases we skip with a reason instead of fighting the other manager.

use std::{io, net::Ipv4Addr, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};

use netopt_common::cmd;

pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Prior contents of the resolver file, for rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsBackup {
    pub path: PathBuf,
    pub contents: String,
}

/// What [`configure`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsOutcome {
    Written(DnsBackup),
    Skipped { reason: String },
}

/// Writes `servers` to the resolver file at `path`, unless it is managed by
/// something else. Returns the prior contents when a write happened.
pub async fn configure(servers: &[Ipv4Addr], path: &Path) -> io::Result<DnsOutcome> {
    if servers.is_empty() {
        return Ok(DnsOutcome::Skipped { reason: "no DNS servers configured".to_string() });
    }

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Ok(DnsOutcome::Skipped {
                reason: format!("{} is a symlink (managed by the system resolver)", path.display()),
            });
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if dnsmasq_active().await {
        return Ok(DnsOutcome::Skipped { reason: "dnsmasq is managing local DNS".to_string() });
    }

    let contents = std::fs::read_to_string(path).unwrap_or_default();
    let backup = DnsBackup { path: path.to_path_buf(), contents };

    let mut fresh = String::from("# written by netopt\n");
    for server in servers {
        fresh.push_str(&format!("nameserver {server}\n"));
    }
    std::fs::write(path, fresh)?;

    tracing::info!(path = %path.display(), count = servers.len(), "resolver file written");
    Ok(DnsOutcome::Written(backup))
}

/// Puts the prior resolver contents back.
pub fn restore(backup: &DnsBackup) -> io::Result<()> {
    std::fs::write(&backup.path, &backup.contents)
}

async fn dnsmasq_active() -> bool {
    match cmd::run("pidof", &["dnsmasq"], Duration::from_secs(1)).await {
        Ok(out) => out.success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_restores_resolver_file() {
        let _ = tracing_subscriber::fmt::try_init();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 10.0.0.53\n").unwrap();

        let servers: Vec<Ipv4Addr> = vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()];
        let outcome = configure(&servers, &path).await.unwrap();

        let DnsOutcome::Written(backup) = outcome else { panic!("expected a write") };
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("nameserver 1.1.1.1"));
        assert!(written.contains("nameserver 8.8.8.8"));

        restore(&backup).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 10.0.0.53\n");
    }

    #[tokio::test]
    async fn skips_symlinked_resolver_file() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("stub-resolv.conf");
        std::fs::write(&target, "nameserver 127.0.0.53\n").unwrap();
        let path = tmp.path().join("resolv.conf");
        std::os::unix::fs::symlink(&target, &path).unwrap();

        let servers: Vec<Ipv4Addr> = vec!["1.1.1.1".parse().unwrap()];
        let outcome = configure(&servers, &path).await.unwrap();
        assert!(matches!(outcome, DnsOutcome::Skipped { ref reason } if reason.contains("symlink")));
        // Target untouched.
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "nameserver 127.0.0.53\n");
    }

    #[tokio::test]
    async fn empty_server_list_is_a_skip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("resolv.conf");
        let outcome = configure(&[], &path).await.unwrap();
        assert!(matches!(outcome, DnsOutcome::Skipped { .. }));
        assert!(!path.exists());
    }
}
