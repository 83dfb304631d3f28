//! AS-path annotation via `mtr`.
//!
//! Optional, read-only telemetry: a single-cycle `mtr` report with AS lookup
//! gives the ordered list of autonomous systems on the path out of a link.
//! Any failure (tool missing, timeout, empty trace) yields no annotation —
//! never a probe failure.

use std::{net::Ipv4Addr, time::Duration};

use serde::Serialize;

use netopt_common::cmd;

const MTR_DEADLINE: Duration = Duration::from_secs(20);

/// Operators with settlement-free global reachability; presence of any of
/// these on a path marks it as riding Tier-1 transit.
pub const TIER1_ASNS: &[u32] =
    &[174, 701, 1299, 2914, 3257, 3356, 3491, 5511, 6453, 6461, 6762, 7018];

/// Ordered AS-path annotation for a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsPath {
    /// AS numbers in trace order, consecutive duplicates collapsed.
    pub hops: Vec<u32>,
    pub tier1_present: bool,
}

impl AsPath {
    pub fn from_hops(hops: Vec<u32>) -> Option<Self> {
        if hops.is_empty() {
            return None;
        }
        let tier1_present = hops.iter().any(|asn| TIER1_ASNS.contains(asn));
        Some(Self { hops, tier1_present })
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }
}

/// Traces the AS path from `link` towards `target`.
pub async fn annotate(link: &str, target: Ipv4Addr) -> Option<AsPath> {
    let target_s = target.to_string();
    let args = ["-z", "-n", "-c", "1", "--report", "-I", link, target_s.as_str()];

    let out = match cmd::run("mtr", &args, MTR_DEADLINE).await {
        Ok(out) if out.success() => out,
        Ok(out) => {
            tracing::debug!(%link, %target, exit = ?out.exit, "mtr unavailable or failed");
            return None;
        }
        Err(e) => {
            tracing::debug!(%link, %target, ?e, "mtr did not run");
            return None;
        }
    };

    AsPath::from_hops(parse_report(&out.stdout))
}

/// Extracts AS numbers from an `mtr -z` report, in trace order, collapsing
/// consecutive duplicates. `AS???` (unresolved) hops are skipped.
pub fn parse_report(stdout: &str) -> Vec<u32> {
    let mut hops = Vec::new();

    for line in stdout.lines() {
        for token in line.split_whitespace() {
            let Some(digits) = token.strip_prefix("AS") else { continue };
            let Ok(asn) = digits.parse::<u32>() else { continue };
            if hops.last() != Some(&asn) {
                hops.push(asn);
            }
        }
    }

    hops
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
Start: 2024-01-01T00:00:00+0000
HOST: router                      Loss%   Snt   Last   Avg  Best  Wrst StDev
  1. AS???    192.168.1.1          0.0%     1    1.1   1.1   1.1   1.1   0.0
  2. AS6805   62.52.200.1          0.0%     1    8.3   8.3   8.3   8.3   0.0
  3. AS6805   62.53.10.9           0.0%     1    9.0   9.0   9.0   9.0   0.0
  4. AS1299   62.115.140.2         0.0%     1   12.4  12.4  12.4  12.4   0.0
  5. AS13335  1.1.1.1              0.0%     1   13.0  13.0  13.0  13.0   0.0
";

    #[test]
    fn parses_in_trace_order_with_consecutive_dedup() {
        assert_eq!(parse_report(REPORT), vec![6805, 1299, 13335]);
    }

    #[test]
    fn unresolved_hops_are_skipped() {
        let report = "  1. AS???  10.0.0.1  0.0%  1  1.0\n  2. AS???  10.0.0.2  0.0%  1  2.0\n";
        assert!(parse_report(report).is_empty());
    }

    #[test]
    fn non_consecutive_repeats_are_kept() {
        let report = "1. AS100 a\n2. AS200 b\n3. AS100 c\n";
        assert_eq!(parse_report(report), vec![100, 200, 100]);
    }

    #[test]
    fn tier1_detection() {
        let path = AsPath::from_hops(vec![6805, 1299, 13335]).unwrap();
        assert!(path.tier1_present, "AS1299 is Tier-1");
        assert_eq!(path.hop_count(), 3);

        let path = AsPath::from_hops(vec![6805, 13335]).unwrap();
        assert!(!path.tier1_present);
    }

    #[test]
    fn empty_trace_yields_no_annotation() {
        assert_eq!(AsPath::from_hops(Vec::new()), None);
    }
}
