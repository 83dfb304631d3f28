//! ICMP echo invocation and output parsing.
//!
//! We shell out to `ping` (bound to a specific link with `-I`) and parse the
//! per-reply `time=` values plus the transmit/receive statistics line. The
//! per-reply values feed the jitter computation, so `-q` is never used.

use std::{net::Ipv4Addr, time::Duration};

use netopt_common::cmd;

/// Interval between echoes within one sample, in seconds.
pub const SAMPLE_INTERVAL_S: &str = "0.2";

/// Parsed result of one `ping` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingOutcome {
    /// Round-trip times of the successful replies, in reply order.
    pub rtts_ms: Vec<f64>,
    pub transmitted: u32,
    pub received: u32,
}

impl PingOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.transmitted > 0 && self.transmitted == self.received
    }
}

/// Extra knobs for a ping run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingSpec {
    /// Payload size in bytes (`-s`); used by MTU discovery.
    pub payload: Option<u32>,
    /// Set the don't-fragment bit (`-M do`).
    pub no_fragment: bool,
}

/// Runs `count` echoes to `target` bound to `link`, with a per-reply timeout
/// and an overall subprocess deadline.
pub async fn ping(
    link: &str,
    target: Ipv4Addr,
    count: u32,
    reply_timeout: Duration,
    spec: PingSpec,
    deadline: Duration,
) -> cmd::Result<PingOutcome> {
    let count_s = count.to_string();
    let timeout_s = reply_timeout.as_secs().max(1).to_string();
    let target_s = target.to_string();
    let payload_s = spec.payload.map(|p| p.to_string());

    let mut args: Vec<&str> = vec!["-n", "-c", &count_s, "-W", &timeout_s, "-I", link];
    if count > 1 {
        args.push("-i");
        args.push(SAMPLE_INTERVAL_S);
    }
    if spec.no_fragment {
        args.push("-M");
        args.push("do");
    }
    if let Some(payload) = payload_s.as_deref() {
        args.push("-s");
        args.push(payload);
    }
    args.push(&target_s);

    let out = cmd::run("ping", &args, deadline).await?;
    let mut outcome = parse_output(&out.stdout);

    // A killed or crashed ping may not print the statistics line, and some
    // ping flavors word it differently; reconcile counts from the replies.
    if outcome.transmitted == 0 {
        outcome.transmitted = count;
    }
    if outcome.received == 0 && !outcome.rtts_ms.is_empty() {
        outcome.received = outcome.rtts_ms.len() as u32;
    }

    Ok(outcome)
}

/// Parses `ping` stdout: per-reply `time=<ms>` values and the
/// `N packets transmitted, M received` statistics line.
pub fn parse_output(stdout: &str) -> PingOutcome {
    let mut outcome = PingOutcome::default();

    for line in stdout.lines() {
        if let Some(rtt) = parse_reply_time(line) {
            outcome.rtts_ms.push(rtt);
            continue;
        }

        if line.contains("packets transmitted") {
            let mut tokens = line.split_whitespace().peekable();
            while let Some(token) = tokens.next() {
                match tokens.peek() {
                    Some(&"packets") => outcome.transmitted = token.parse().unwrap_or(0),
                    Some(&"received,") | Some(&"received") => {
                        outcome.received = token.parse().unwrap_or(0)
                    }
                    _ => {}
                }
            }
        }
    }

    outcome
}

fn parse_reply_time(line: &str) -> Option<f64> {
    let start = line.find("time=")? + "time=".len();
    let rest = &line[start..];
    let end = rest.find(" ms").unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

/// Arithmetic mean.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (the sample *is* the population here).
pub fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
PING 192.168.1.1 (192.168.1.1) 56(84) bytes of data.
64 bytes from 192.168.1.1: icmp_seq=1 ttl=64 time=1.23 ms
64 bytes from 192.168.1.1: icmp_seq=2 ttl=64 time=2.77 ms

--- 192.168.1.1 ping statistics ---
2 packets transmitted, 2 received, 0% packet loss, time 201ms
rtt min/avg/max/mdev = 1.230/2.000/2.770/0.770 ms
";

    #[test]
    fn parses_reply_times_and_counts() {
        let outcome = parse_output(SAMPLE);
        assert_eq!(outcome.rtts_ms, vec![1.23, 2.77]);
        assert_eq!(outcome.transmitted, 2);
        assert_eq!(outcome.received, 2);
        assert!(outcome.all_succeeded());
    }

    #[test]
    fn parses_partial_loss() {
        let stdout = "\
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=15.0 ms

--- 10.0.0.1 ping statistics ---
4 packets transmitted, 1 received, 75% packet loss, time 602ms
";
        let outcome = parse_output(stdout);
        assert_eq!(outcome.rtts_ms, vec![15.0]);
        assert_eq!(outcome.transmitted, 4);
        assert_eq!(outcome.received, 1);
        assert!(!outcome.all_succeeded());
    }

    #[test]
    fn total_loss_has_no_reply_times() {
        let stdout = "\
PING 10.9.9.9 (10.9.9.9) 56(84) bytes of data.

--- 10.9.9.9 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";
        let outcome = parse_output(stdout);
        assert!(outcome.rtts_ms.is_empty());
        assert_eq!(outcome.transmitted, 1);
        assert_eq!(outcome.received, 0);
    }

    #[test]
    fn tolerates_sub_millisecond_times() {
        let outcome = parse_output("64 bytes from 1.1.1.1: icmp_seq=1 ttl=60 time=0.845 ms\n");
        assert_eq!(outcome.rtts_ms, vec![0.845]);
    }

    #[test]
    fn mean_and_stddev_are_population_statistics() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&values) - 5.0).abs() < 1e-9);
        // Canonical population stddev example: exactly 2.
        assert!((population_stddev(&values) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn single_sample_has_zero_stddev() {
        assert_eq!(population_stddev(&[3.3]), 0.0);
        assert_eq!(population_stddev(&[]), 0.0);
    }
}
