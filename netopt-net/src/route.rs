//! Transactional default-route replacement.
//!
//! The applicator captures a backup of the current default route(s), clears
//! them idempotently, and installs a single multipath route with one weighted
//! nexthop per plan entry. Any failure after clearing restores the backup
//! before surfacing. Restore re-validates every backup entry against a token
//! whitelist and passes argv tokens directly — a corrupted backup file must
//! not be able to smuggle commands.

use std::{fmt, net::Ipv4Addr, time::Duration};

use serde::{Deserialize, Serialize};

use netopt_common::cmd;

const IP_DEADLINE: Duration = Duration::from_secs(5);

/// Deleting `default` repeatedly converges in one or two iterations; more
/// than this means something else is re-adding routes under us.
const MAX_CLEAR_ITERATIONS: usize = 10;

/// Valued keywords permitted in a restored default-route entry. `nexthop`
/// is handled separately: it is a bare per-hop delimiter, not a pair.
const ALLOWED_KEYWORDS: &[&str] = &["via", "dev", "scope", "proto", "metric", "src", "weight"];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("command error: {0}")]
    Command(#[from] cmd::Error),
    #[error("cannot clear existing default routes after {MAX_CLEAR_ITERATIONS} attempts")]
    CannotClear,
    #[error("route installation failed: {stderr}")]
    ApplyFailed { stderr: String },
    #[error("restore failed after apply error: {stderr}")]
    RestoreFailed { stderr: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One weighted nexthop of the multipath default route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHop {
    pub gateway: Ipv4Addr,
    pub dev: String,
    pub weight: u32,
}

/// The multipath default route a plan compiles to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathRoute {
    pub next_hops: Vec<NextHop>,
}

impl MultipathRoute {
    pub fn new(next_hops: Vec<NextHop>) -> Self {
        Self { next_hops }
    }

    /// Argv for `ip`, one `nexthop via G dev L weight W` group per hop.
    pub fn to_args(&self) -> Vec<String> {
        let mut args =
            vec!["-4".to_string(), "route".to_string(), "add".to_string(), "default".to_string()];
        for hop in &self.next_hops {
            args.push("nexthop".to_string());
            args.push("via".to_string());
            args.push(hop.gateway.to_string());
            args.push("dev".to_string());
            args.push(hop.dev.clone());
            args.push("weight".to_string());
            args.push(hop.weight.to_string());
        }
        args
    }

    /// Whether the kernel's current default-route dump is equivalent to this
    /// route. The kernel flattens a single-nexthop multipath route to a plain
    /// `default via G dev L` entry, dropping the weight, so a one-entry route
    /// matches on gateway and device alone.
    pub fn matches_lines(&self, current: &[String]) -> bool {
        if current.len() != 1 {
            return false;
        }

        let mut kernel_hops = parse_next_hops(&current[0]);
        let mut ours: Vec<_> = self
            .next_hops
            .iter()
            .map(|h| (h.gateway, h.dev.clone(), if self.next_hops.len() == 1 { None } else { Some(h.weight) }))
            .collect();

        kernel_hops.sort();
        ours.sort();
        kernel_hops == ours
    }
}

impl fmt::Display for MultipathRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "default")?;
        for hop in &self.next_hops {
            write!(f, " nexthop via {} dev {} weight {}", hop.gateway, hop.dev, hop.weight)?;
        }
        Ok(())
    }
}

/// Parses `(gateway, dev, weight)` triples out of one merged route line.
fn parse_next_hops(line: &str) -> Vec<(Ipv4Addr, String, Option<u32>)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut hops = Vec::new();

    let nexthop_positions: Vec<usize> =
        tokens.iter().enumerate().filter(|(_, t)| **t == "nexthop").map(|(i, _)| i).collect();

    let spans: Vec<(usize, usize)> = if nexthop_positions.is_empty() {
        vec![(0, tokens.len())]
    } else {
        nexthop_positions
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = nexthop_positions.get(i + 1).copied().unwrap_or(tokens.len());
                (start, end)
            })
            .collect()
    };

    for (start, end) in spans {
        let span = &tokens[start..end];
        let mut gateway = None;
        let mut dev = None;
        let mut weight = None;
        let mut iter = span.iter();
        while let Some(token) = iter.next() {
            match *token {
                "via" => gateway = iter.next().and_then(|v| v.parse().ok()),
                "dev" => dev = iter.next().map(|v| v.to_string()),
                "weight" => weight = iter.next().and_then(|v| v.parse().ok()),
                _ => {}
            }
        }
        if let (Some(gateway), Some(dev)) = (gateway, dev) {
            hops.push((gateway, dev, weight));
        }
    }

    hops
}

/// Snapshot of the pre-apply default route(s), one merged line per route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBackup {
    pub entries: Vec<String>,
}

impl RouteBackup {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of [`apply`].
#[derive(Debug)]
pub struct ApplyOutcome {
    pub backup: RouteBackup,
    /// The requested route was already installed; nothing was mutated.
    pub noop: bool,
}

/// Reads the current IPv4 default route(s), merging the indented nexthop
/// continuation lines `ip` prints for multipath routes.
pub async fn current_default() -> Result<Vec<String>> {
    let out = cmd::run("ip", &["-4", "route", "show", "default"], IP_DEADLINE).await?;
    if !out.success() {
        return Err(Error::ApplyFailed { stderr: out.stderr.trim().to_string() });
    }
    Ok(merge_continuations(&out.stdout))
}

pub(crate) fn merge_continuations(dump: &str) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for line in dump.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if let Some(last) = merged.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        merged.push(line.trim().to_string());
    }
    merged
}

/// Captures the current default route(s) as a restorable backup.
pub async fn backup() -> Result<RouteBackup> {
    Ok(RouteBackup { entries: current_default().await? })
}

/// Removes all IPv4 default routes, idempotently.
pub async fn clear_default() -> Result<()> {
    for _ in 0..MAX_CLEAR_ITERATIONS {
        if current_default().await?.is_empty() {
            return Ok(());
        }
        let out = cmd::run("ip", &["-4", "route", "del", "default"], IP_DEADLINE).await?;
        if !out.success() {
            tracing::debug!(stderr = %out.stderr.trim(), "route del default returned non-zero");
        }
    }

    if current_default().await?.is_empty() {
        return Ok(());
    }
    Err(Error::CannotClear)
}

/// Installs the plan's multipath route. Backup, clear and restore-on-failure
/// are all handled here; on success the pre-apply backup is returned so the
/// transaction can keep it.
pub async fn apply(route: &MultipathRoute) -> Result<ApplyOutcome> {
    let current = current_default().await?;
    let backup = RouteBackup { entries: current.clone() };

    if route.matches_lines(&current) {
        tracing::info!(route = %route, "requested route already installed, no-op");
        return Ok(ApplyOutcome { backup, noop: true });
    }

    if let Err(e) = clear_default().await {
        roll_back_to(&backup).await?;
        return Err(e);
    }

    let args = route.to_args();
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let out = cmd::run("ip", &arg_refs, IP_DEADLINE).await?;
    if !out.success() {
        let stderr = out.stderr.trim().to_string();
        tracing::error!(%stderr, route = %route, "route installation failed, restoring backup");
        roll_back_to(&backup).await?;
        return Err(Error::ApplyFailed { stderr });
    }

    tracing::info!(route = %route, "multipath default route installed");
    Ok(ApplyOutcome { backup, noop: false })
}

async fn roll_back_to(backup: &RouteBackup) -> Result<()> {
    restore(backup).await.map_err(|e| Error::RestoreFailed { stderr: e.to_string() })
}

/// Reinstates a backed-up default route set.
///
/// Every entry is validated against the token whitelist before execution;
/// invalid entries are logged and skipped rather than run.
pub async fn restore(backup: &RouteBackup) -> Result<()> {
    clear_default().await?;

    for entry in &backup.entries {
        if !validate_entry(entry) {
            tracing::warn!(%entry, "backup entry failed validation, skipping");
            continue;
        }

        let tokens: Vec<&str> = entry.split_whitespace().collect();
        let mut args = vec!["-4", "route", "add"];
        args.extend(tokens);

        let out = cmd::run("ip", &args, IP_DEADLINE).await?;
        if !out.success() {
            return Err(Error::RestoreFailed { stderr: out.stderr.trim().to_string() });
        }
    }

    Ok(())
}

/// Whether a backup entry is a well-formed default-route specification:
/// `default` followed by whitelisted keyword/value pairs, with `nexthop`
/// allowed as a bare delimiter starting each hop of a multipath entry.
/// This is the same shape [`merge_continuations`] produces for an ECMP
/// backup, so a re-apply's own backup always restores.
pub fn validate_entry(entry: &str) -> bool {
    let mut tokens = entry.split_whitespace();
    if tokens.next() != Some("default") {
        return false;
    }

    while let Some(keyword) = tokens.next() {
        if keyword == "nexthop" {
            // Hop delimiter; the next hop's keyword/value pairs follow.
            continue;
        }
        if !ALLOWED_KEYWORDS.contains(&keyword) {
            return false;
        }
        match tokens.next() {
            Some(value) if value_is_sane(value) => {}
            _ => return false,
        }
    }
    true
}

fn value_is_sane(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '_' | '/' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(gateway: &str, dev: &str, weight: u32) -> NextHop {
        NextHop { gateway: gateway.parse().unwrap(), dev: dev.to_string(), weight }
    }

    #[test]
    fn route_args_are_argv_tokens() {
        let route =
            MultipathRoute::new(vec![hop("192.168.1.1", "eth0", 40), hop("192.168.1.1", "wlan0", 18)]);
        let args = route.to_args();
        assert_eq!(
            args,
            [
                "-4", "route", "add", "default", "nexthop", "via", "192.168.1.1", "dev", "eth0",
                "weight", "40", "nexthop", "via", "192.168.1.1", "dev", "wlan0", "weight", "18",
            ]
        );
    }

    #[test]
    fn display_matches_ip_syntax() {
        let route = MultipathRoute::new(vec![hop("10.0.0.1", "eth0", 7)]);
        assert_eq!(route.to_string(), "default nexthop via 10.0.0.1 dev eth0 weight 7");
    }

    #[test]
    fn merge_continuations_joins_multipath_dumps() {
        let dump = "default proto static\n\tnexthop via 192.168.1.1 dev eth0 weight 40\n\tnexthop via 192.168.1.1 dev wlan0 weight 18\n";
        let merged = merge_continuations(dump);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].starts_with("default proto static nexthop via 192.168.1.1"));
        assert!(merged[0].contains("dev wlan0 weight 18"));
    }

    #[test]
    fn merge_continuations_keeps_separate_routes_apart() {
        let dump = "default via 192.168.1.1 dev eth0 metric 100\ndefault via 10.0.0.1 dev wlan0 metric 200\n";
        assert_eq!(merge_continuations(dump).len(), 2);
    }

    #[test]
    fn matches_lines_on_identical_multipath() {
        let route =
            MultipathRoute::new(vec![hop("192.168.1.1", "eth0", 40), hop("192.168.1.1", "wlan0", 18)]);
        let current = vec![
            "default proto static nexthop via 192.168.1.1 dev eth0 weight 40 nexthop via 192.168.1.1 dev wlan0 weight 18".to_string(),
        ];
        assert!(route.matches_lines(&current));
    }

    #[test]
    fn matches_lines_detects_weight_drift() {
        let route =
            MultipathRoute::new(vec![hop("192.168.1.1", "eth0", 40), hop("192.168.1.1", "wlan0", 18)]);
        let current = vec![
            "default nexthop via 192.168.1.1 dev eth0 weight 40 nexthop via 192.168.1.1 dev wlan0 weight 5".to_string(),
        ];
        assert!(!route.matches_lines(&current));
    }

    #[test]
    fn single_hop_matches_flattened_kernel_route() {
        let route = MultipathRoute::new(vec![hop("10.0.0.1", "eth0", 19)]);
        let current = vec!["default via 10.0.0.1 dev eth0 proto dhcp metric 100".to_string()];
        assert!(route.matches_lines(&current));

        let other = vec!["default via 10.0.0.2 dev eth0".to_string()];
        assert!(!route.matches_lines(&other));
    }

    #[test]
    fn empty_current_never_matches() {
        let route = MultipathRoute::new(vec![hop("10.0.0.1", "eth0", 1)]);
        assert!(!route.matches_lines(&[]));
    }

    #[test]
    fn validate_entry_accepts_whitelisted_specs() {
        assert!(validate_entry("default via 192.168.1.1 dev eth0"));
        assert!(validate_entry("default via 192.168.1.1 dev eth0 proto dhcp metric 100"));
        assert!(validate_entry("default dev ppp0 scope link src 10.64.0.1"));
    }

    #[test]
    fn validate_entry_accepts_multipath_specs() {
        assert!(validate_entry(
            "default nexthop via 192.168.1.1 dev eth0 weight 40 \
             nexthop via 192.168.1.1 dev wlan0 weight 18"
        ));
        assert!(validate_entry("default proto static nexthop via 192.168.1.1 dev eth0 weight 40"));
        // valueless weight is still malformed
        assert!(!validate_entry("default nexthop via 192.168.1.1 dev eth0 weight"));
    }

    #[test]
    fn validate_entry_rejects_non_whitelisted_tokens() {
        // not a default route
        assert!(!validate_entry("10.0.0.0/8 via 192.168.1.1 dev eth0"));
        // flag-style keyword outside the whitelist
        assert!(!validate_entry("default via 192.168.1.1 dev eth0 onlink"));
        // keyword without a value
        assert!(!validate_entry("default via 192.168.1.1 dev"));
        // embedded shell metacharacters in a value
        assert!(!validate_entry("default via 192.168.1.1 dev 'eth0;rm'"));
        assert!(!validate_entry("default via $(reboot) dev eth0"));
        // option-looking value
        assert!(!validate_entry("default via 192.168.1.1 dev -f"));
        // injection inside a multipath hop
        assert!(!validate_entry(
            "default nexthop via 192.168.1.1 dev eth0 weight 40 nexthop via `reboot` dev wlan0"
        ));
    }

    #[test]
    fn ecmp_backup_entry_survives_validation_for_restore() {
        // A second apply backs up the multipath route the first apply
        // installed; the merged dump must come back through the whitelist.
        let dump = "default proto static\n\
                    \tnexthop via 192.168.1.1 dev eth0 weight 40\n\
                    \tnexthop via 192.168.1.1 dev wlan0 weight 18\n";
        let backup = RouteBackup { entries: merge_continuations(dump) };

        assert_eq!(backup.entries.len(), 1);
        assert!(
            validate_entry(&backup.entries[0]),
            "ECMP backup must be restorable: {}",
            backup.entries[0]
        );

        // And the entry still parses into the hops restore will reinstall.
        let hops = parse_next_hops(&backup.entries[0]);
        assert_eq!(
            hops,
            [
                ("192.168.1.1".parse().unwrap(), "eth0".to_string(), Some(40)),
                ("192.168.1.1".parse().unwrap(), "wlan0".to_string(), Some(18)),
            ]
        );
    }

    #[test]
    fn backup_round_trips_through_serde() {
        let backup = RouteBackup {
            entries: vec!["default via 192.168.1.1 dev eth0 proto dhcp metric 100".to_string()],
        };
        let json = serde_json::to_string(&backup).unwrap();
        let decoded: RouteBackup = serde_json::from_str(&json).unwrap();
        assert_eq!(backup, decoded);
    }
}
