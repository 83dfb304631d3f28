//! The `status` verb: a read-only snapshot of everything netopt manages.

use std::{fmt::Write as _, time::Duration};

use netopt_net::route;
use netopt_probe::ProbeCache;
use netopt_state::{LockFile, Watchdog};

use crate::{config::Config, error::AppError};

pub async fn report(config: &Config) -> Result<String, AppError> {
    let mut out = String::new();

    writeln!(out, "default routes:").ok();
    match route::current_default().await {
        Ok(lines) if lines.is_empty() => {
            writeln!(out, "  (none)").ok();
        }
        Ok(lines) => {
            for line in lines {
                writeln!(out, "  {line}").ok();
            }
        }
        Err(e) => {
            writeln!(out, "  unreadable: {e}").ok();
        }
    }

    let lock_path = config.state_root.join("netopt.lock");
    match LockFile::holder(&lock_path) {
        Some(pid) => writeln!(out, "lock: held by pid {pid}").ok(),
        None => writeln!(out, "lock: free").ok(),
    };

    let watchdog = Watchdog::new(&config.state_root);
    match watchdog.status() {
        Some(status) if status.fired => {
            writeln!(out, "watchdog: FIRED (rollback has run)").ok();
        }
        Some(status) => {
            writeln!(out, "watchdog: armed, {}s remaining", status.remaining_secs.max(0)).ok();
        }
        None => {
            writeln!(out, "watchdog: not armed").ok();
        }
    }

    let cache = ProbeCache::with_root(&config.cache_root, Duration::from_secs(config.cache_ttl));
    let entries = cache.disk_entries();
    if entries.is_empty() {
        writeln!(out, "probe cache: empty").ok();
    } else {
        writeln!(out, "probe cache:").ok();
        for (name, age, alive) in entries {
            let freshness =
                if age.as_secs() < config.cache_ttl { "fresh" } else { "stale" };
            let state = if alive { "alive" } else { "dead" };
            writeln!(out, "  {name}: {state}, {}s old ({freshness})", age.as_secs()).ok();
        }
    }

    let state_path = config.state_root.join("state");
    match std::fs::read_to_string(&state_path) {
        Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(summary) => {
                let when = summary["applied_at_utc"].as_str().unwrap_or("unknown");
                writeln!(out, "last apply: {when}").ok();
                if let Some(entries) = summary["entries"].as_array() {
                    for entry in entries {
                        if let Some(rationale) = entry["rationale"].as_str() {
                            writeln!(out, "  {rationale}").ok();
                        }
                    }
                }
            }
            Err(_) => {
                writeln!(out, "last apply: summary unreadable").ok();
            }
        },
        Err(_) => {
            writeln!(out, "last apply: none recorded").ok();
        }
    }

    Ok(out)
}
