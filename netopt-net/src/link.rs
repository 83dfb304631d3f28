//! Interface inventory and classification.
//!
//! Links are enumerated from sysfs and classified by a fixed policy (first
//! match wins): sysfs wireless markers, then name prefixes, then the sysfs
//! ARPHRD type. Virtual plumbing (loopback, container veths, bridges) is
//! excluded before classification ever runs.

use std::{fmt, io, net::Ipv4Addr, path::PathBuf, time::Duration};

use serde::Serialize;

use netopt_common::cmd;

/// How long we give `ip route show` to answer.
const IP_DEADLINE: Duration = Duration::from_secs(3);

/// ARPHRD_ETHER in sysfs `type`.
const ARPHRD_ETHER: u32 = 1;

/// IFF_UP bit in sysfs `flags`.
const IFF_UP: u32 = 0x1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to enumerate {root}: {source}")]
    Enumerate { root: PathBuf, source: io::Error },
    #[error("command error: {0}")]
    Command(#[from] cmd::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Link class, in descending default priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkClass {
    Ethernet,
    Wifi,
    Mobile,
    Unknown,
}

impl LinkClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ethernet => "ethernet",
            Self::Wifi => "wifi",
            Self::Mobile => "mobile",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LinkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical (or physical-looking) network interface.
///
/// Immutable for the duration of one apply; the planner and applicator only
/// ever read these fields.
#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub name: String,
    pub class: LinkClass,
    pub admin_up: bool,
    pub carrier: bool,
    pub mac: Option<String>,
    pub mtu: Option<u32>,
    pub speed_mbps: Option<u32>,
}

/// Anchored-alternation name matcher for `EXCLUDE_INTERFACES`.
///
/// Supports the subset the config format actually uses: clauses separated by
/// `|`, each optionally anchored with `^` and/or `$`, everything else
/// literal. `^lo$|^docker|^veth|^br-|^virbr` is the default.
#[derive(Debug, Clone)]
pub struct ExcludePattern {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone)]
struct Clause {
    literal: String,
    anchored_start: bool,
    anchored_end: bool,
}

impl ExcludePattern {
    pub fn parse(pattern: &str) -> Self {
        let clauses = pattern
            .split('|')
            .filter(|c| !c.is_empty())
            .map(|clause| {
                let anchored_start = clause.starts_with('^');
                let anchored_end = clause.ends_with('$');
                let start = usize::from(anchored_start);
                let end = clause.len() - usize::from(anchored_end);
                Clause { literal: clause[start..end].to_string(), anchored_start, anchored_end }
            })
            .collect();

        Self { clauses }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.clauses.iter().any(|c| match (c.anchored_start, c.anchored_end) {
            (true, true) => name == c.literal,
            (true, false) => name.starts_with(&c.literal),
            (false, true) => name.ends_with(&c.literal),
            (false, false) => name.contains(&c.literal),
        })
    }
}

/// Enumerates and classifies links from sysfs.
#[derive(Debug, Clone)]
pub struct Inventory {
    sysfs_root: PathBuf,
    exclude: ExcludePattern,
}

impl Inventory {
    pub fn new(exclude: ExcludePattern) -> Self {
        Self::with_root("/sys/class/net", exclude)
    }

    /// Uses an alternative sysfs root. Tests point this at a fixture tree.
    pub fn with_root(root: impl Into<PathBuf>, exclude: ExcludePattern) -> Self {
        Self { sysfs_root: root.into(), exclude }
    }

    /// Lists admin-up, non-excluded links, sorted by name.
    ///
    /// Per-link sysfs hiccups degrade the link to `unknown` (with a warning)
    /// rather than failing the enumeration; only an unreadable sysfs root is
    /// an error.
    pub fn list(&self) -> Result<Vec<Link>> {
        let entries = std::fs::read_dir(&self.sysfs_root)
            .map_err(|source| Error::Enumerate { root: self.sysfs_root.clone(), source })?;

        let mut links = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|source| Error::Enumerate { root: self.sysfs_root.clone(), source })?;
            let name = entry.file_name().to_string_lossy().to_string();

            if self.exclude.matches(&name) {
                tracing::debug!(link = %name, "excluded by pattern");
                continue;
            }

            let link = self.inspect(&name);
            if !link.admin_up {
                tracing::debug!(link = %name, "skipping admin-down link");
                continue;
            }

            links.push(link);
        }

        links.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(links)
    }

    fn inspect(&self, name: &str) -> Link {
        let dir = self.sysfs_root.join(name);

        let admin_up = match self.read_trimmed(name, "flags") {
            Some(flags) => parse_flags(&flags) & IFF_UP != 0,
            None => {
                tracing::warn!(link = %name, "missing sysfs flags, treating as down");
                false
            }
        };
        let carrier = self.read_trimmed(name, "carrier").is_some_and(|c| c == "1");

        // Classification policy, first match wins.
        let class = if dir.join("wireless").exists() || dir.join("phy80211").exists() {
            LinkClass::Wifi
        } else if name.starts_with("wl") || name.starts_with("wlan") {
            LinkClass::Wifi
        } else if ["ppp", "wwan", "wwp", "usb"].iter().any(|p| name.starts_with(p)) {
            LinkClass::Mobile
        } else {
            match self.read_trimmed(name, "type").and_then(|t| t.parse::<u32>().ok()) {
                Some(ARPHRD_ETHER) => LinkClass::Ethernet,
                Some(_) => LinkClass::Unknown,
                None => {
                    tracing::warn!(link = %name, "missing sysfs type, classifying as unknown");
                    LinkClass::Unknown
                }
            }
        };

        let mac = self.read_trimmed(name, "address").filter(|m| !m.is_empty());
        let mtu = self.read_trimmed(name, "mtu").and_then(|m| m.parse().ok());
        // Speed reads as -1 (or EINVAL) on links without carrier.
        let speed_mbps = self
            .read_trimmed(name, "speed")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|s| *s > 0)
            .map(|s| s as u32);

        Link { name: name.to_string(), class, admin_up, carrier, mac, mtu, speed_mbps }
    }

    fn read_trimmed(&self, name: &str, file: &str) -> Option<String> {
        std::fs::read_to_string(self.sysfs_root.join(name).join(file))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

fn parse_flags(raw: &str) -> u32 {
    let raw = raw.trim_start_matches("0x");
    u32::from_str_radix(raw, 16).unwrap_or(0)
}

/// Discovers the upstream gateway for `link` from the kernel routing table.
///
/// Returns the first `via <addr>` on a default-route entry scoped to the
/// link; `None` means the link has no default route and cannot participate
/// in planning.
pub async fn gateway(link: &str) -> Result<Option<Ipv4Addr>> {
    let out = cmd::run("ip", &["-4", "route", "show", "default", "dev", link], IP_DEADLINE).await?;
    if !out.success() {
        tracing::debug!(%link, stderr = %out.stderr.trim(), "no default route on link");
        return Ok(None);
    }

    Ok(parse_via(&out.stdout))
}

/// First `via <addr>` found in a route dump.
pub fn parse_via(routes: &str) -> Option<Ipv4Addr> {
    for line in routes.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "via" {
                if let Some(addr) = tokens.next().and_then(|a| a.parse().ok()) {
                    return Some(addr);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture_link(root: &std::path::Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, contents) in files {
            fs::write(dir.join(file), contents).unwrap();
        }
    }

    fn default_exclude() -> ExcludePattern {
        ExcludePattern::parse("^lo$|^docker|^veth|^br-|^virbr")
    }

    #[test]
    fn exclude_pattern_matches_documented_defaults() {
        let pattern = default_exclude();
        assert!(pattern.matches("lo"));
        assert!(pattern.matches("docker0"));
        assert!(pattern.matches("veth12ab"));
        assert!(pattern.matches("br-9af0"));
        assert!(pattern.matches("virbr0"));
        assert!(!pattern.matches("eth0"));
        assert!(!pattern.matches("lol")); // ^lo$ is exact
        assert!(!pattern.matches("wlan0"));
    }

    #[test]
    fn classification_policy_order() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        // wireless dir wins even over an eth-looking name
        fixture_link(root, "eth9", &[("flags", "0x1003"), ("type", "1")]);
        fs::create_dir_all(root.join("eth9").join("wireless")).unwrap();
        // name prefix wifi without wireless dir
        fixture_link(root, "wlan0", &[("flags", "0x1003"), ("type", "1")]);
        // mobile prefixes
        fixture_link(root, "ppp0", &[("flags", "0x1003"), ("type", "512")]);
        fixture_link(root, "wwan0", &[("flags", "0x1003"), ("type", "1")]);
        // plain ethernet via type
        fixture_link(root, "enp3s0", &[("flags", "0x1003"), ("type", "1")]);
        // unknown type
        fixture_link(root, "tun0", &[("flags", "0x1003"), ("type", "65534")]);

        let inventory = Inventory::with_root(root, default_exclude());
        let links = inventory.list().unwrap();
        let class_of = |name: &str| links.iter().find(|l| l.name == name).unwrap().class;

        assert_eq!(class_of("eth9"), LinkClass::Wifi);
        assert_eq!(class_of("wlan0"), LinkClass::Wifi);
        assert_eq!(class_of("ppp0"), LinkClass::Mobile);
        assert_eq!(class_of("wwan0"), LinkClass::Mobile);
        assert_eq!(class_of("enp3s0"), LinkClass::Ethernet);
        assert_eq!(class_of("tun0"), LinkClass::Unknown);
    }

    #[test]
    fn admin_down_links_are_omitted() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_link(tmp.path(), "eth0", &[("flags", "0x1003"), ("type", "1")]);
        fixture_link(tmp.path(), "eth1", &[("flags", "0x1002"), ("type", "1")]); // no IFF_UP

        let links = Inventory::with_root(tmp.path(), default_exclude()).list().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "eth0");
    }

    #[test]
    fn excluded_names_never_reach_classification() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_link(tmp.path(), "docker0", &[("flags", "0x1003"), ("type", "1")]);
        fixture_link(tmp.path(), "lo", &[("flags", "0x9"), ("type", "772")]);

        let links = Inventory::with_root(tmp.path(), default_exclude()).list().unwrap();
        assert!(links.is_empty());
    }

    #[test]
    fn missing_sysfs_type_degrades_to_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_link(tmp.path(), "weird0", &[("flags", "0x1003")]);

        let links = Inventory::with_root(tmp.path(), default_exclude()).list().unwrap();
        assert_eq!(links[0].class, LinkClass::Unknown);
    }

    #[test]
    fn list_is_sorted_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_link(tmp.path(), "wlan0", &[("flags", "0x1003"), ("type", "1")]);
        fixture_link(tmp.path(), "eth0", &[("flags", "0x1003"), ("type", "1")]);

        let links = Inventory::with_root(tmp.path(), default_exclude()).list().unwrap();
        let names: Vec<_> = links.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["eth0", "wlan0"]);
    }

    #[test]
    fn link_attributes_are_parsed() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_link(
            tmp.path(),
            "eth0",
            &[
                ("flags", "0x1003"),
                ("type", "1"),
                ("carrier", "1"),
                ("address", "aa:bb:cc:dd:ee:ff"),
                ("mtu", "1500"),
                ("speed", "1000"),
            ],
        );

        let links = Inventory::with_root(tmp.path(), default_exclude()).list().unwrap();
        let link = &links[0];
        assert!(link.carrier);
        assert_eq!(link.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(link.mtu, Some(1500));
        assert_eq!(link.speed_mbps, Some(1000));
    }

    #[test]
    fn negative_speed_is_treated_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_link(tmp.path(), "eth0", &[("flags", "0x1003"), ("type", "1"), ("speed", "-1")]);

        let links = Inventory::with_root(tmp.path(), default_exclude()).list().unwrap();
        assert_eq!(links[0].speed_mbps, None);
    }

    #[test]
    fn parse_via_takes_the_first_gateway() {
        let routes = "default via 192.168.1.1 dev eth0 proto dhcp metric 100\n\
                      default via 10.0.0.1 dev eth0 metric 200\n";
        assert_eq!(parse_via(routes), Some("192.168.1.1".parse().unwrap()));
        assert_eq!(parse_via("default dev ppp0 scope link\n"), None);
        assert_eq!(parse_via(""), None);
    }
}
