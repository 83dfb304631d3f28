//! Weight planning: deterministic scoring from probes to a multipath route.
//!
//! The score pipeline is one function regardless of whether AS-path data is
//! present: a latency-derived base, a class multiplier, and an optional
//! 0.7/0.3 blend with the compressed BGP bonus. Given identical probes and
//! configuration the output is byte-identical, which the tests rely on.

use std::net::Ipv4Addr;

use serde::Serialize;

use netopt_net::{Link, LinkClass, MultipathRoute, NextHop};
use netopt_probe::{AsPath, Probe};

use crate::config::Config;

/// Upper clamp of the blended weight.
const BLEND_MAX_WEIGHT: u32 = 40;

/// One link eligible for planning.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub link: Link,
    pub gateway: Ipv4Addr,
    pub probe: Probe,
    pub as_path: Option<AsPath>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub link: String,
    pub class: LinkClass,
    pub gateway: Ipv4Addr,
    pub weight: u32,
    pub rationale: String,
    #[serde(skip)]
    pub probe: Probe,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn to_route(&self) -> MultipathRoute {
        MultipathRoute::new(
            self.entries
                .iter()
                .map(|e| NextHop { gateway: e.gateway, dev: e.link.clone(), weight: e.weight })
                .collect(),
        )
    }

    /// Human summary, one rationale line per entry.
    pub fn summary(&self) -> String {
        self.entries.iter().map(|e| e.rationale.clone()).collect::<Vec<_>>().join("\n")
    }
}

/// Latency multiplier per link class.
pub fn class_multiplier(class: LinkClass) -> f64 {
    match class {
        LinkClass::Ethernet => 2.0,
        LinkClass::Wifi => 1.0,
        LinkClass::Mobile => 0.5,
        LinkClass::Unknown => 1.0,
    }
}

/// Builds the plan from alive candidates.
///
/// Dead probes never produce entries. Probes at or above the loss-exclusion
/// threshold are dropped regardless of latency (a threshold of zero excludes
/// any loss at all, but never a clean probe). Output is sorted by weight
/// descending, then class priority, then link name.
pub fn build(candidates: Vec<Candidate>, config: &Config) -> Plan {
    let mut entries = Vec::new();

    for candidate in candidates {
        let Some(latency_ms) = candidate.probe.latency_ms() else {
            tracing::debug!(link = %candidate.link.name, "dead probe, excluded from plan");
            continue;
        };

        let loss_pct = candidate.probe.loss_pct();
        if loss_pct > 0.0 && loss_pct >= config.loss_exclude_pct {
            tracing::info!(
                link = %candidate.link.name,
                loss_pct,
                threshold = config.loss_exclude_pct,
                "loss above exclusion threshold, dropped"
            );
            continue;
        }

        let class = candidate.link.class;
        let as_path = config.enable_bgp.then_some(candidate.as_path.as_ref()).flatten();
        let weight = score(latency_ms, class, as_path, config);
        let rationale = rationale(&candidate.link.name, class, latency_ms, as_path, weight);

        entries.push(PlanEntry {
            link: candidate.link.name.clone(),
            class,
            gateway: candidate.gateway,
            weight,
            rationale,
            probe: candidate.probe,
        });
    }

    entries.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| config.class_priority(a.class).cmp(&config.class_priority(b.class)))
            .then_with(|| a.link.cmp(&b.link))
    });

    Plan { entries }
}

/// The scoring formula.
///
/// `base = clamp((MAX_LATENCY − latency) / LATENCY_DIVISOR, MIN, MAX)` in
/// floating point, multiplied by the class factor and re-clamped to
/// `[MIN, 2×MAX]`, then truncated. With an AS-path annotation the bonus
/// (`max(0, 100 − hops×5) + 20·tier1`, compressed by 5 to match the
/// latency-derived magnitude) is blended 0.7/0.3 before rounding.
fn score(latency_ms: f64, class: LinkClass, as_path: Option<&AsPath>, config: &Config) -> u32 {
    let min = f64::from(config.min_weight);
    let max = f64::from(config.max_weight);

    let base = ((config.max_latency - latency_ms) / config.latency_divisor).clamp(min, max);
    let weighted = (base * class_multiplier(class)).clamp(min, max * 2.0);

    let weight = match as_path {
        None => weighted.trunc(),
        Some(path) => {
            let bonus = bgp_bonus(path);
            (0.7 * weighted + 0.3 * (bonus / 5.0)).round().clamp(1.0, f64::from(BLEND_MAX_WEIGHT))
        }
    };

    (weight as u32).max(1)
}

/// 0–120 scalar: shorter paths and Tier-1 transit score higher.
fn bgp_bonus(path: &AsPath) -> f64 {
    let hop_penalty = 100_i64 - path.hop_count() as i64 * 5;
    let tier1 = if path.tier1_present { 20 } else { 0 };
    (hop_penalty.max(0) + tier1) as f64
}

fn rationale(
    link: &str,
    class: LinkClass,
    latency_ms: f64,
    as_path: Option<&AsPath>,
    weight: u32,
) -> String {
    let mult = class_multiplier(class);
    match as_path {
        None => format!("{link}: {class} {latency_ms:.1}ms ×{mult:.1} → w={weight}"),
        Some(path) => format!(
            "{link}: {class} {latency_ms:.1}ms ×{mult:.1} bgp+{:.0} → w={weight}",
            bgp_bonus(path)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netopt_probe::ProbeStatus;

    fn link(name: &str, class: LinkClass) -> Link {
        Link {
            name: name.to_string(),
            class,
            admin_up: true,
            carrier: true,
            mac: None,
            mtu: Some(1500),
            speed_mbps: None,
        }
    }

    fn alive(name: &str, class: LinkClass, latency_ms: f64, loss_pct: f64) -> Candidate {
        let gateway: Ipv4Addr = "192.168.1.1".parse().unwrap();
        Candidate {
            link: link(name, class),
            gateway,
            probe: Probe::alive(name, gateway, latency_ms, Some(0.1), loss_pct, None),
            as_path: None,
        }
    }

    fn dead(name: &str, class: LinkClass) -> Candidate {
        let gateway: Ipv4Addr = "192.168.1.1".parse().unwrap();
        Candidate {
            link: link(name, class),
            gateway,
            probe: Probe::dead(name, gateway),
            as_path: None,
        }
    }

    #[test]
    fn dual_homed_weights() {
        // eth0 at 2ms: clamp(19.8) ×2 = 39.6 → 39. wlan0 at 15ms: 18.5 → 18.
        let config = Config::default();
        let plan = build(
            vec![
                alive("eth0", LinkClass::Ethernet, 2.0, 0.0),
                alive("wlan0", LinkClass::Wifi, 15.0, 0.0),
            ],
            &config,
        );

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.entries[0].link, "eth0");
        assert_eq!(plan.entries[0].weight, 39);
        assert_eq!(plan.entries[1].link, "wlan0");
        assert_eq!(plan.entries[1].weight, 18);

        let route = plan.to_route();
        assert_eq!(
            route.to_string(),
            "default nexthop via 192.168.1.1 dev eth0 weight 39 nexthop via 192.168.1.1 dev wlan0 weight 18"
        );
    }

    #[test]
    fn mobile_is_deprioritized() {
        // eth0 at 10ms: 19 ×2 = 38. ppp0 at 50ms: 15 ×0.5 = 7.5 → 7.
        let config = Config::default();
        let plan = build(
            vec![
                alive("ppp0", LinkClass::Mobile, 50.0, 0.0),
                alive("eth0", LinkClass::Ethernet, 10.0, 0.0),
            ],
            &config,
        );

        assert_eq!(plan.entries[0].link, "eth0");
        assert_eq!(plan.entries[0].weight, 38);
        assert_eq!(plan.entries[1].link, "ppp0");
        assert_eq!(plan.entries[1].weight, 7);
    }

    #[test]
    fn dead_secondary_leaves_a_single_entry() {
        let config = Config::default();
        let plan = build(
            vec![alive("eth0", LinkClass::Ethernet, 5.0, 0.0), dead("wlan0", LinkClass::Wifi)],
            &config,
        );

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].link, "eth0");
        assert!(plan.entries[0].weight >= 1);
    }

    #[test]
    fn all_dead_is_an_empty_plan() {
        let config = Config::default();
        let plan =
            build(vec![dead("eth0", LinkClass::Ethernet), dead("wlan0", LinkClass::Wifi)], &config);
        assert!(plan.is_empty());
    }

    #[test]
    fn loss_at_threshold_is_excluded() {
        let config = Config::default();
        let plan = build(
            vec![
                alive("eth0", LinkClass::Ethernet, 2.0, 75.0),
                alive("wlan0", LinkClass::Wifi, 15.0, 50.0),
            ],
            &config,
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].link, "wlan0");
    }

    #[test]
    fn zero_threshold_excludes_any_loss_but_keeps_clean_probes() {
        let config = Config { loss_exclude_pct: 0.0, ..Config::default() };
        let plan = build(
            vec![
                alive("eth0", LinkClass::Ethernet, 2.0, 0.0),
                alive("wlan0", LinkClass::Wifi, 15.0, 0.5),
            ],
            &config,
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].link, "eth0");
    }

    #[test]
    fn very_high_latency_floors_at_min_weight() {
        let config = Config::default();
        let plan = build(vec![alive("ppp0", LinkClass::Mobile, 900.0, 0.0)], &config);
        assert_eq!(plan.entries[0].weight, 1);
    }

    #[test]
    fn bgp_blend_prefers_short_tier1_paths() {
        let mut config = Config::default();
        config.enable_bgp = true;

        let mut eth = alive("eth0", LinkClass::Ethernet, 2.0, 0.0);
        eth.as_path = AsPath::from_hops(vec![6805, 174, 13335]); // 3 hops, Tier-1
        let mut wlan = alive("wlan0", LinkClass::Wifi, 15.0, 0.0);
        wlan.as_path = AsPath::from_hops(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]); // 9 hops, no Tier-1

        let plan = build(vec![eth, wlan], &config);

        // eth0: round(0.7·39.6 + 0.3·(105/5)) = round(34.02) = 34
        // wlan0: round(0.7·18.5 + 0.3·(55/5)) = round(16.25) = 16
        assert_eq!(plan.entries[0].link, "eth0");
        assert_eq!(plan.entries[0].weight, 34);
        assert_eq!(plan.entries[1].link, "wlan0");
        assert_eq!(plan.entries[1].weight, 16);
        // The blend compresses but preserves the ordering.
        assert!(plan.entries[0].weight > plan.entries[1].weight);
    }

    #[test]
    fn annotations_are_ignored_when_bgp_is_disabled() {
        let config = Config::default();
        let mut eth = alive("eth0", LinkClass::Ethernet, 2.0, 0.0);
        eth.as_path = AsPath::from_hops(vec![174]);

        let plan = build(vec![eth], &config);
        assert_eq!(plan.entries[0].weight, 39);
        assert!(!plan.entries[0].rationale.contains("bgp"));
    }

    #[test]
    fn ties_break_by_class_priority_then_name() {
        let config = Config { max_latency: 100.0, ..Config::default() };
        // Identical latency → wifi and unknown share multiplier 1.0.
        let plan = build(
            vec![
                alive("zz0", LinkClass::Wifi, 50.0, 0.0),
                alive("aa0", LinkClass::Unknown, 50.0, 0.0),
                alive("bb0", LinkClass::Wifi, 50.0, 0.0),
            ],
            &config,
        );

        let order: Vec<_> = plan.entries.iter().map(|e| e.link.as_str()).collect();
        // wifi (priority 2) before unknown (priority 4); names ascending within.
        assert_eq!(order, ["bb0", "zz0", "aa0"]);
    }

    #[test]
    fn planning_is_deterministic() {
        let config = Config::default();
        let build_once = || {
            build(
                vec![
                    alive("eth0", LinkClass::Ethernet, 2.0, 0.0),
                    alive("wlan0", LinkClass::Wifi, 15.0, 0.0),
                    alive("ppp0", LinkClass::Mobile, 50.0, 0.0),
                ],
                &config,
            )
        };

        let a = build_once();
        let b = build_once();
        assert_eq!(a.summary(), b.summary());
        assert_eq!(
            a.entries.iter().map(|e| (e.link.clone(), e.weight)).collect::<Vec<_>>(),
            b.entries.iter().map(|e| (e.link.clone(), e.weight)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn rationale_reads_like_the_scoring() {
        let config = Config::default();
        let plan = build(vec![alive("eth0", LinkClass::Ethernet, 2.3, 0.0)], &config);
        assert_eq!(plan.entries[0].rationale, "eth0: ethernet 2.3ms ×2.0 → w=39");
    }
}
