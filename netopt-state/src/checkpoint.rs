//! Content-addressed snapshots of mutable system state.
//!
//! A checkpoint is a gzip-compressed tar of plain-text dumps (routes, links,
//! sysctls, qdiscs, module parameters, firewall rules, `/proc/net`
//! statistics) plus a top-level `metadata.json`. Capture is best-effort per
//! tool: a missing `ethtool` costs one dump, never the checkpoint.
//!
//! Restore is deliberately *safe* rather than *exact*: `net.*` sysctls are
//! re-applied key-by-key, qdiscs are torn down to kernel defaults (replaying
//! captured qdisc syntax across kernel versions is a minefield), and
//! interface feature state is surfaced for manual review only.

use std::{
    fs::File,
    io::{self, Read as _},
    path::{Path, PathBuf},
    time::Duration,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use netopt_common::cmd;
use netopt_net::sysctl;

const CAPTURE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("checkpoint {0} not found")]
    NotFound(String),
    #[error("checkpoint is corrupt: {0}")]
    Corrupt(String),
    #[error("extraction directory {0} is outside the OS temp root")]
    UnsafeTempDir(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command error: {0}")]
    Command(#[from] cmd::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identity and provenance of one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at_utc: String,
    pub hostname: String,
    pub kernel: String,
    pub uid: u32,
}

/// A checkpoint archive on disk, as reported by [`CheckpointStore::list`].
#[derive(Debug, Clone)]
pub struct Entry {
    pub metadata: Metadata,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    retention: usize,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Self {
        Self { root: root.into(), retention }
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.tar.gz"))
    }

    /// Captures a new checkpoint and returns its metadata.
    pub async fn create(&self, name: &str, description: &str) -> Result<Metadata> {
        std::fs::create_dir_all(&self.root)?;

        let name = sanitize_name(name);
        let created = chrono::Utc::now();
        let id = format!("{name}_{}", created.format("%Y%m%dT%H%M%SZ"));

        let staging = tempfile::Builder::new().prefix("netopt-ckpt-").tempdir()?;
        let dir = staging.path();

        self.capture_dumps(dir).await?;

        let metadata = Metadata {
            id: id.clone(),
            name,
            description: description.to_string(),
            created_at_utc: created.to_rfc3339(),
            hostname: read_proc("/proc/sys/kernel/hostname"),
            kernel: read_proc("/proc/sys/kernel/osrelease"),
            uid: nix::unistd::Uid::current().as_raw(),
        };
        std::fs::write(dir.join("metadata.json"), serde_json::to_vec_pretty(&metadata)?)?;

        let archive = self.archive_path(&id);
        let file = File::create(&archive)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all("", dir)?;
        builder.into_inner()?.finish()?;

        tracing::info!(%id, path = %archive.display(), "checkpoint created");
        Ok(metadata)
    }

    async fn capture_dumps(&self, dir: &Path) -> Result<()> {
        capture(dir, "addresses.txt", "ip", &["addr", "show"]).await;
        capture(dir, "routes.txt", "ip", &["route", "show", "table", "all"]).await;
        capture(dir, "links.txt", "ip", &["-o", "link", "show"]).await;
        capture(dir, "modules.txt", "lsmod", &[]).await;

        // Per-link dumps need the link names.
        let links = std::fs::read_to_string(dir.join("links.txt"))
            .map(|text| parse_link_names(&text))
            .unwrap_or_default();

        let mut tc_dump = String::new();
        if let Some(out) = run_capture("tc", &["qdisc", "show"]).await {
            tc_dump.push_str(&out);
        }
        for link in &links {
            for kind in ["class", "filter"] {
                if let Some(out) = run_capture("tc", &[kind, "show", "dev", link]).await {
                    tc_dump.push_str(&format!("# {kind} dev {link}\n{out}"));
                }
            }
        }
        write_dump(dir, "tc.txt", &tc_dump);

        for link in &links {
            let mut ethtool_dump = String::new();
            for flag in ["-k", "-g", "-c"] {
                if let Some(out) = run_capture("ethtool", &[flag, link]).await {
                    ethtool_dump.push_str(&out);
                    ethtool_dump.push('\n');
                }
            }
            if !ethtool_dump.is_empty() {
                write_dump(dir, &format!("ethtool_{link}.txt"), &ethtool_dump);
            }
        }

        if let Some(all) = run_capture("sysctl", &["-a"]).await {
            for (file, prefix) in
                [("sysctl_net.txt", "net."), ("sysctl_kernel.txt", "kernel."), ("sysctl_vm.txt", "vm.")]
            {
                let partition: String =
                    all.lines().filter(|l| l.starts_with(prefix)).map(|l| format!("{l}\n")).collect();
                write_dump(dir, file, &partition);
            }
        }

        write_dump(dir, "module_params.txt", &dump_module_params("/sys/module"));

        if let Some(units) =
            run_capture("systemctl", &["list-units", "--all", "--no-pager", "--plain"]).await
        {
            let mut dump = units;
            for unit in [
                "NetworkManager.service",
                "systemd-networkd.service",
                "systemd-resolved.service",
                "wpa_supplicant.service",
                "dnsmasq.service",
                "firewalld.service",
            ] {
                if let Some(state) = run_capture("systemctl", &["is-active", unit]).await {
                    dump.push_str(&format!("{unit}: {}\n", state.trim()));
                }
            }
            write_dump(dir, "systemd_units.txt", &dump);
        }

        copy_proc_net(dir);

        for (program, args) in [
            ("iptables-save", vec![]),
            ("nft", vec!["list", "ruleset"]),
            ("firewall-cmd", vec!["--list-all-zones"]),
        ] {
            if cmd::which(program).is_none() {
                continue;
            }
            if let Some(out) = run_capture(program, &args).await {
                write_dump(dir, "firewall.txt", &out);
                break;
            }
        }

        Ok(())
    }

    /// All checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<Entry>> {
        let Ok(dir) = std::fs::read_dir(&self.root) else { return Ok(Vec::new()) };

        let mut entries = Vec::new();
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "gz").unwrap_or(false) {
                match read_metadata(&path) {
                    Ok(metadata) => {
                        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                        entries.push(Entry { metadata, size_bytes });
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), ?e, "unreadable checkpoint, skipping");
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.metadata.created_at_utc.cmp(&b.metadata.created_at_utc));
        Ok(entries)
    }

    /// Restores checkpoint `id`. Aborts before any mutation when the archive
    /// fails its integrity check.
    pub async fn restore(&self, id: &str) -> Result<Metadata> {
        let archive = self.archive_path(id);
        if !archive.exists() {
            return Err(Error::NotFound(id.to_string()));
        }

        // Owner-exclusive scratch dir, removed on every exit path by Drop.
        let scratch = tempfile::Builder::new().prefix("netopt-restore-").tempdir()?;
        let temp_root = std::env::temp_dir();
        if !scratch.path().starts_with(&temp_root) {
            return Err(Error::UnsafeTempDir(scratch.path().to_path_buf()));
        }

        let file = File::open(&archive)?;
        let mut unpacker = tar::Archive::new(GzDecoder::new(file));
        unpacker.unpack(scratch.path())?;

        // Integrity gate: metadata must parse before we touch the system.
        let metadata_raw = std::fs::read_to_string(scratch.path().join("metadata.json"))
            .map_err(|_| Error::Corrupt("metadata.json missing".to_string()))?;
        let metadata: Metadata = serde_json::from_str(&metadata_raw)
            .map_err(|e| Error::Corrupt(format!("metadata.json unparseable: {e}")))?;

        // net.* sysctls, key by key.
        if let Ok(dump) = std::fs::read_to_string(scratch.path().join("sysctl_net.txt")) {
            let mut applied = 0usize;
            for (key, value) in parse_net_sysctls(&dump) {
                match sysctl::write_key(&key, &value) {
                    Ok(()) => applied += 1,
                    Err(e) => tracing::warn!(%key, ?e, "sysctl restore failed for key"),
                }
            }
            tracing::info!(applied, "net sysctls restored");
        }

        // Qdiscs: teardown to defaults, not verbatim replay.
        if let Ok(dump) = std::fs::read_to_string(scratch.path().join("links.txt")) {
            for link in parse_link_names(&dump) {
                match cmd::run("tc", &["qdisc", "del", "dev", &link, "root"], CAPTURE_DEADLINE).await
                {
                    Ok(out) if !out.success() => {
                        tracing::debug!(%link, "no root qdisc to remove");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(%link, ?e, "tc unavailable, skipping qdisc teardown"),
                }
            }
        }

        // Interface features: advisory only.
        for entry in std::fs::read_dir(scratch.path())?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("ethtool_") {
                tracing::info!(dump = %name, "interface feature state captured, review manually");
            }
        }

        tracing::info!(%id, "checkpoint restored");
        Ok(metadata)
    }

    /// Deletes checkpoint `id`; deleting a missing id is an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let archive = self.archive_path(id);
        if !archive.exists() {
            return Err(Error::NotFound(id.to_string()));
        }
        std::fs::remove_file(archive)?;
        tracing::info!(%id, "checkpoint deleted");
        Ok(())
    }

    /// Enforces FIFO retention, returning the ids removed.
    pub fn prune(&self) -> Result<Vec<String>> {
        let entries = self.list()?;
        if entries.len() <= self.retention {
            return Ok(Vec::new());
        }

        let excess = entries.len() - self.retention;
        let mut removed = Vec::with_capacity(excess);
        for entry in entries.into_iter().take(excess) {
            self.delete(&entry.metadata.id)?;
            removed.push(entry.metadata.id);
        }
        Ok(removed)
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "checkpoint".to_string()
    } else {
        cleaned
    }
}

fn read_proc(path: &str) -> String {
    std::fs::read_to_string(path).map(|s| s.trim().to_string()).unwrap_or_else(|_| "unknown".into())
}

async fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    match cmd::run(program, args, CAPTURE_DEADLINE).await {
        Ok(out) if out.success() => Some(out.stdout),
        Ok(out) => {
            tracing::debug!(%program, exit = ?out.exit, "capture tool failed, skipping dump");
            None
        }
        Err(e) => {
            tracing::debug!(%program, ?e, "capture tool unavailable, skipping dump");
            None
        }
    }
}

async fn capture(dir: &Path, file: &str, program: &str, args: &[&str]) {
    if let Some(out) = run_capture(program, args).await {
        write_dump(dir, file, &out);
    }
}

fn write_dump(dir: &Path, file: &str, contents: &str) {
    if contents.is_empty() {
        return;
    }
    if let Err(e) = std::fs::write(dir.join(file), contents) {
        tracing::warn!(%file, ?e, "failed to write capture dump");
    }
}

fn copy_proc_net(dir: &Path) {
    let dest = dir.join("proc_net");
    if std::fs::create_dir_all(&dest).is_err() {
        return;
    }
    let Ok(entries) = std::fs::read_dir("/proc/net") else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Ok(contents) = std::fs::read_to_string(&path) {
            let _ = std::fs::write(dest.join(entry.file_name()), contents);
        }
    }
}

fn dump_module_params(root: &str) -> String {
    let mut dump = String::new();
    let Ok(modules) = std::fs::read_dir(root) else { return dump };
    for module in modules.flatten() {
        let params_dir = module.path().join("parameters");
        let Ok(params) = std::fs::read_dir(&params_dir) else { continue };
        let module_name = module.file_name().to_string_lossy().to_string();
        for param in params.flatten() {
            if let Ok(value) = std::fs::read_to_string(param.path()) {
                let param_name = param.file_name().to_string_lossy().to_string();
                dump.push_str(&format!("{module_name}.{param_name}={}\n", value.trim()));
            }
        }
    }
    dump
}

/// Extracts interface names from an `ip -o link show` dump.
pub(crate) fn parse_link_names(dump: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in dump.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(index), Some(name)) = (parts.next(), parts.next()) else { continue };
        if index.trim().parse::<u32>().is_err() {
            continue;
        }
        let name = name.trim();
        let name = name.split('@').next().unwrap_or(name);
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    names
}

/// Extracts `net.*` key/value pairs from a `sysctl -a` style dump.
pub(crate) fn parse_net_sysctls(dump: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in dump.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        if key.starts_with("net.") {
            pairs.push((key.to_string(), value.trim().to_string()));
        }
    }
    pairs
}

fn read_metadata(archive: &Path) -> Result<Metadata> {
    let file = File::open(archive)?;
    let mut unpacker = tar::Archive::new(GzDecoder::new(file));

    for entry in unpacker.entries()? {
        let mut entry = entry?;
        let is_metadata = entry
            .path()
            .map(|p| p.file_name().map(|n| n == "metadata.json").unwrap_or(false))
            .unwrap_or(false);
        if is_metadata {
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            return Ok(serde_json::from_str(&raw)?);
        }
    }

    Err(Error::Corrupt("metadata.json missing".to_string()))
}
