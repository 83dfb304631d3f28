//! The safety envelope around an apply.
//!
//! Order of operations: lock → pre-flight → checkpoint → route backup →
//! probe → plan → apply → TCP/DNS side effects → post-apply validation →
//! watchdog arm (remote sessions) or commit. Every failure after the route
//! changes rolls the whole set of side effects back; a failed rollback is
//! FATAL and points the operator at the pre-apply checkpoint.

use std::{path::Path, sync::Arc, time::Duration};

use serde_json::json;

use netopt_common::{cmd, signals, EventSink};
use netopt_net::{dns, link, route, sysctl, ExcludePattern, Inventory, Link};
use netopt_probe::{aspath, ProbeCache, ProbeEngine};
use netopt_state::{CheckpointStore, LockFile, Transaction, Watchdog};

use crate::{
    config::Config,
    error::AppError,
    plan::{self, Candidate, Plan},
};

const REQUIRED_TOOLS: &[&str] = &["ip", "ping", "sysctl", "tc"];

const LOCK_FILE: &str = "netopt.lock";
const ROUTE_BACKUP_FILE: &str = "route-backup";
const STATE_FILE: &str = "state";

#[derive(Debug, Clone, Default)]
pub struct ApplyFlags {
    pub no_watchdog: bool,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub plan: Plan,
    pub noop: bool,
    pub checkpoint_id: Option<String>,
    /// Seconds until the watchdog fires, when one was armed.
    pub watchdog_secs: Option<u64>,
    pub dns_note: String,
}

/// Pre-flight checks: tools present, at least one usable link, current
/// default gateway answering. Nothing is mutated before these pass.
pub async fn preflight(config: &Config, links: &[Link]) -> Result<(), AppError> {
    for tool in REQUIRED_TOOLS {
        if cmd::which(tool).is_none() {
            return Err(AppError::MissingTool(tool.to_string()));
        }
    }

    if links.is_empty() {
        return Err(AppError::Preflight("no interfaces".to_string()));
    }

    match route::current_default().await {
        Ok(current) => match link::parse_via(&current.join("\n")) {
            Some(gateway) => {
                if !ping_once(&gateway.to_string(), 2).await {
                    return Err(AppError::Preflight(format!(
                        "current default gateway {gateway} is unreachable"
                    )));
                }
            }
            None => {
                tracing::warn!("no current default gateway, skipping reachability check");
            }
        },
        Err(e) => return Err(AppError::Preflight(format!("cannot read routing table: {e}"))),
    }

    // Config parseability was established at startup; mtr is optional and
    // its absence only disables AS-path annotation.
    if config.enable_bgp && cmd::which("mtr").is_none() {
        tracing::warn!("ENABLE_BGP set but mtr is missing; AS-path annotation disabled");
    }

    Ok(())
}

/// Whether this invocation comes from a remote session.
///
/// SSH environment variables are authoritative; `who am i` catches nested
/// shells that scrubbed them. Multiplexers (`TMUX`, `STY`) are noted but do
/// not imply remote by themselves.
pub async fn is_remote_session() -> bool {
    for var in ["SSH_CONNECTION", "SSH_CLIENT", "SSH_TTY"] {
        if std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false) {
            return true;
        }
    }

    for var in ["TMUX", "STY"] {
        if std::env::var(var).is_ok() {
            tracing::debug!(%var, "terminal multiplexer detected");
        }
    }

    if let Ok(out) = cmd::run("who", &["am", "i"], Duration::from_secs(2)).await {
        return who_shows_remote(&out.stdout);
    }

    false
}

/// A `who am i` origin column naming a host (not an X display) means remote.
pub fn who_shows_remote(stdout: &str) -> bool {
    for line in stdout.lines() {
        let Some(open) = line.find('(') else { continue };
        let Some(close) = line.rfind(')') else { continue };
        if close <= open {
            continue;
        }
        let origin = &line[open + 1..close];
        if !origin.is_empty() && !origin.starts_with(':') && !origin.starts_with("tmux") {
            return true;
        }
    }
    false
}

/// Post-apply validation, in order. Steps 1–3 failing force a rollback;
/// step 4 (DNS) only warns.
pub async fn post_validate(plan: &Plan, config: &Config, dns_skipped: bool) -> Result<(), String> {
    let current = route::current_default().await.map_err(|e| format!("route readback: {e}"))?;
    if !plan.to_route().matches_lines(&current) {
        return Err(format!(
            "installed route does not match the plan (kernel: {:?})",
            current
        ));
    }

    let first_gateway = plan.entries[0].gateway.to_string();
    if !ping_once(&first_gateway, 2).await {
        return Err(format!("plan gateway {first_gateway} is unreachable after apply"));
    }

    let canary = config.canary_ip.to_string();
    if !ping_once(&canary, 3).await {
        return Err(format!("external canary {canary} is unreachable after apply"));
    }

    if !dns_skipped {
        let lookup = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::net::lookup_host((config.canary_host.as_str(), 53)),
        )
        .await;
        match lookup {
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_none() {
                    tracing::warn!(host = %config.canary_host, "DNS canary did not resolve");
                }
            }
            _ => tracing::warn!(host = %config.canary_host, "DNS canary did not resolve"),
        }
    }

    Ok(())
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

async fn ping_once(target: &str, timeout_secs: u64) -> bool {
    let timeout = timeout_secs.to_string();
    let args = ["-n", "-c", "1", "-W", timeout.as_str(), target];
    match cmd::run("ping", &args, Duration::from_secs(timeout_secs + 2)).await {
        Ok(out) => out.success(),
        Err(_) => false,
    }
}

/// The whole apply pipeline; see the module docs for the stage order.
pub async fn run_apply(
    config: &Config,
    flags: &ApplyFlags,
    sink: &EventSink,
) -> Result<ApplyReport, AppError> {
    let lock = LockFile::acquire(config.state_root.join(LOCK_FILE))?;

    let inventory = Inventory::new(ExcludePattern::parse(&config.exclude_interfaces));
    let links = inventory.list()?;

    preflight(config, &links).await?;
    sink.info("preflight", json!({ "links": links.len() }));

    let checkpoint_id = if config.enable_checkpoints {
        let store = CheckpointStore::new(
            config.state_root.join("checkpoints"),
            config.checkpoint_retention,
        );
        let metadata = store.create("pre-apply", "automatic pre-apply checkpoint").await?;
        if let Err(e) = store.prune() {
            tracing::warn!(?e, "checkpoint prune failed");
        }
        sink.info("checkpoint", json!({ "id": metadata.id }));
        Some(metadata.id)
    } else {
        None
    };

    let backup = route::backup().await?;
    persist_route_backup(config, &backup);
    let mut tx = Transaction::begin(lock, backup.clone(), checkpoint_id.clone());

    // Pair every link with its gateway; links without one sit out.
    let mut eligible: Vec<(Link, std::net::Ipv4Addr)> = Vec::new();
    for l in &links {
        match link::gateway(&l.name).await? {
            Some(gateway) => eligible.push((l.clone(), gateway)),
            None => {
                sink.debug("probe", json!({ "link": l.name, "skipped": "no gateway" }));
            }
        }
    }

    let cache = Arc::new(ProbeCache::with_root(
        &config.cache_root,
        Duration::from_secs(config.cache_ttl),
    ));
    let engine = ProbeEngine::new(cache, config.probe_options());
    let targets: Vec<(String, std::net::Ipv4Addr)> =
        eligible.iter().map(|(l, gw)| (l.name.clone(), *gw)).collect();
    let probes = engine.probe_batch(&targets).await;
    for probe in probes.values() {
        sink.info(
            "probe",
            json!({
                "link": probe.link,
                "gateway": probe.gateway,
                "alive": probe.is_alive(),
                "latency_ms": probe.latency_ms().map(round3),
                "jitter_ms": probe.jitter_ms().map(round3),
                "loss_pct": probe.loss_pct(),
                "source": probe.source,
            }),
        );
    }

    let mut candidates = Vec::new();
    for (l, gateway) in eligible {
        let Some(probe) = probes.get(&l.name) else { continue };
        let as_path = if config.enable_bgp && probe.is_alive() {
            aspath::annotate(&l.name, config.canary_ip).await
        } else {
            None
        };
        candidates.push(Candidate { link: l, gateway, probe: probe.clone(), as_path });
    }

    let the_plan = plan::build(candidates, config);
    sink.info("plan", json!({ "entries": the_plan.len(), "summary": the_plan.summary() }));

    if the_plan.is_empty() {
        tx.roll_back()?;
        return Err(AppError::Preflight("no usable paths (all probes dead or excluded)".into()));
    }

    let outcome = match route::apply(&the_plan.to_route()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // route::apply already restored the backup (or escalated).
            let app: AppError = e.into();
            if matches!(app, AppError::Fatal { .. }) {
                tx.mark_fatal();
            } else {
                let _ = tx.roll_back();
            }
            sink.error("apply", json!({ "error": app.to_string() }));
            return Err(with_checkpoint(app, &checkpoint_id));
        }
    };
    tx.mark_applied()?;
    sink.info(
        "apply",
        json!({ "route": the_plan.to_route().to_string(), "noop": outcome.noop }),
    );

    let sysctl_backup = match sysctl::tune(&config.tcp_profile()) {
        Ok(backup) => backup,
        Err(e) => {
            // Sysctl unwinds itself; put the route back and give up.
            let _guard = signals::defer_interrupts();
            let app = match route::restore(&outcome.backup).await {
                Ok(()) => {
                    let _ = tx.roll_back();
                    AppError::Other(format!("sysctl tuning failed: {e}"))
                }
                Err(restore_err) => {
                    tx.mark_fatal();
                    AppError::Fatal {
                        message: format!("sysctl failed ({e}) and route restore failed ({restore_err})"),
                        checkpoint: checkpoint_id.clone(),
                    }
                }
            };
            sink.error("apply", json!({ "error": app.to_string() }));
            return Err(app);
        }
    };
    sink.info("sysctl", json!({ "changed": sysctl_backup.prior.len() }));

    let dns_outcome = match dns::configure(&config.dns_servers, Path::new(dns::RESOLV_CONF)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(?e, "DNS configuration failed, continuing without it");
            dns::DnsOutcome::Skipped { reason: format!("write failed: {e}") }
        }
    };
    let (dns_skipped, dns_note) = match &dns_outcome {
        dns::DnsOutcome::Written(_) => (false, "resolver file updated".to_string()),
        dns::DnsOutcome::Skipped { reason } => (true, format!("DNS skipped: {reason}")),
    };
    sink.info("dns", json!({ "note": dns_note }));

    if let Err(reason) = post_validate(&the_plan, config, dns_skipped).await {
        // Rollback runs to completion even if the operator interrupts.
        let _guard = signals::defer_interrupts();
        sysctl::restore(&sysctl_backup);
        if let dns::DnsOutcome::Written(b) = &dns_outcome {
            let _ = dns::restore(b);
        }
        let app = match route::restore(&outcome.backup).await {
            Ok(()) => {
                let _ = tx.roll_back();
                AppError::PostValidate(reason)
            }
            Err(e) => {
                tx.mark_fatal();
                AppError::Fatal {
                    message: format!("post-validate failed ({reason}); route restore failed ({e})"),
                    checkpoint: checkpoint_id.clone(),
                }
            }
        };
        sink.error("validate", json!({ "error": app.to_string() }));
        return Err(app);
    }
    sink.info("validate", json!({ "ok": true }));

    let remote = is_remote_session().await;
    let watchdog_secs = if remote && config.enable_watchdog && !flags.no_watchdog {
        let watchdog = Watchdog::new(&config.state_root);
        let names: Vec<String> = links.iter().map(|l| l.name.clone()).collect();
        watchdog.arm(config.watchdog_timeout, &outcome.backup, &names)?;
        sink.warn(
            "watchdog",
            json!({ "armed_secs": config.watchdog_timeout, "action": "confirm or roll back" }),
        );
        Some(config.watchdog_timeout)
    } else {
        // Local (or explicitly unwatched) sessions commit immediately.
        tx.commit()?;
        sink.info("apply", json!({ "committed": true }));
        None
    };

    write_state_summary(config, &the_plan, outcome.noop);

    Ok(ApplyReport { plan: the_plan, noop: outcome.noop, checkpoint_id, watchdog_secs, dns_note })
}

/// Confirms a watchdog-guarded apply from a later invocation.
pub fn confirm_watchdog(config: &Config, sink: &EventSink) -> Result<(), AppError> {
    let watchdog = Watchdog::new(&config.state_root);
    if watchdog.fired() {
        let _ = watchdog.acknowledge_fired();
        sink.fatal("watchdog", json!({ "fired": true }));
        return Err(AppError::WatchdogFired);
    }
    watchdog.confirm()?;
    sink.info("watchdog", json!({ "confirmed": true }));
    Ok(())
}

fn with_checkpoint(error: AppError, checkpoint_id: &Option<String>) -> AppError {
    match error {
        AppError::Fatal { message, checkpoint: None } => {
            AppError::Fatal { message, checkpoint: checkpoint_id.clone() }
        }
        other => other,
    }
}

/// Writes the plain-text route backup consumed by the `restore` verb and
/// the watchdog script generator.
fn persist_route_backup(config: &Config, backup: &route::RouteBackup) {
    let path = config.state_root.join(ROUTE_BACKUP_FILE);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut contents = backup.entries.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    if let Err(e) = std::fs::write(&path, contents) {
        tracing::warn!(path = %path.display(), ?e, "failed to persist route backup");
    }
}

/// Reads the persisted route backup, for the `restore` verb.
pub fn load_route_backup(config: &Config) -> Result<route::RouteBackup, AppError> {
    let path = config.state_root.join(ROUTE_BACKUP_FILE);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| AppError::Other(format!("no route backup at {}: {e}", path.display())))?;
    Ok(route::RouteBackup {
        entries: contents.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect(),
    })
}

fn write_state_summary(config: &Config, plan: &Plan, noop: bool) {
    let summary = json!({
        "applied_at_utc": chrono::Utc::now().to_rfc3339(),
        "noop": noop,
        "entries": plan.entries,
    });
    let path = config.state_root.join(STATE_FILE);
    if let Err(e) = std::fs::write(&path, serde_json::to_vec_pretty(&summary).unwrap_or_default())
    {
        tracing::warn!(path = %path.display(), ?e, "failed to write apply summary");
    }
}
