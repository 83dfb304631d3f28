//! Configuration loading.
//!
//! Shell-style `KEY=VALUE` files, merged in precedence order: compiled
//! defaults < system config < user config < `NETOPT_`-prefixed environment
//! variables < CLI flags. Unknown keys warn; unparseable values are a
//! configuration error (exit 4).

use std::{net::Ipv4Addr, path::PathBuf};

pub const SYSTEM_CONFIG: &str = "/etc/netopt/netopt.conf";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{origin}: bad value for {key}: {value:?}")]
    BadValue { origin: String, key: String, value: String },
    #[error("{origin}:{line}: not a KEY=VALUE line: {text:?}")]
    BadLine { origin: String, line: usize, text: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Class priorities: lower ordinal wins weight ties.
    pub priority_ethernet: u8,
    pub priority_wifi: u8,
    pub priority_mobile: u8,
    pub priority_unknown: u8,

    // Scoring.
    pub max_latency: f64,
    pub latency_divisor: f64,
    pub min_weight: u32,
    pub max_weight: u32,
    pub loss_exclude_pct: f64,

    // Probing.
    pub ping_count: u32,
    pub ping_timeout: u64,
    pub probe_mtu: bool,
    pub probe_jumbo: bool,
    pub cache_ttl: u64,
    pub parallel_timeout: u64,
    pub max_concurrency: usize,

    // Feature toggles.
    pub enable_bgp: bool,
    pub enable_checkpoints: bool,
    pub checkpoint_retention: usize,
    pub enable_watchdog: bool,
    pub watchdog_timeout: u64,
    pub max_watchdog_extend: u64,

    // TCP profile.
    pub tcp_congestion_control: String,
    pub tcp_fastopen: u32,
    pub rmem_max: u64,
    pub wmem_max: u64,

    // DNS.
    pub dns_servers: Vec<Ipv4Addr>,

    // Inventory.
    pub exclude_interfaces: String,

    // Paths and canaries.
    pub state_root: PathBuf,
    pub cache_root: PathBuf,
    pub canary_ip: Ipv4Addr,
    pub canary_host: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            priority_ethernet: 1,
            priority_wifi: 2,
            priority_mobile: 3,
            priority_unknown: 4,
            max_latency: 200.0,
            latency_divisor: 10.0,
            min_weight: 1,
            max_weight: 20,
            loss_exclude_pct: 75.0,
            ping_count: 2,
            ping_timeout: 1,
            probe_mtu: false,
            probe_jumbo: false,
            cache_ttl: 60,
            parallel_timeout: 5,
            max_concurrency: 4,
            enable_bgp: false,
            enable_checkpoints: true,
            checkpoint_retention: 10,
            enable_watchdog: true,
            watchdog_timeout: 300,
            max_watchdog_extend: 1800,
            tcp_congestion_control: "bbr".to_string(),
            tcp_fastopen: 3,
            rmem_max: 16_777_216,
            wmem_max: 16_777_216,
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            exclude_interfaces: "^lo$|^docker|^veth|^br-|^virbr".to_string(),
            state_root: PathBuf::from("/var/lib/netopt"),
            cache_root: PathBuf::from("/var/cache/netopt"),
            canary_ip: Ipv4Addr::new(1, 1, 1, 1),
            canary_host: "one.one.one.one".to_string(),
        }
    }
}

impl Config {
    /// Full precedence chain. `extra` (the `--config` flag) is merged after
    /// the user config, before the environment.
    pub fn load(extra: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::default();

        config.merge_file_if_present(&PathBuf::from(SYSTEM_CONFIG))?;
        if let Some(user) = user_config_path() {
            config.merge_file_if_present(&user)?;
        }
        if let Some(extra) = extra {
            config.merge_file_if_present(extra)?;
        }
        config.merge_env(std::env::vars())?;

        Ok(config)
    }

    fn merge_file_if_present(&mut self, path: &PathBuf) -> Result<()> {
        let Ok(contents) = std::fs::read_to_string(path) else { return Ok(()) };
        self.merge_str(&contents, &path.display().to_string())
    }

    /// Parses `KEY=VALUE` lines. Blank lines and `#` comments are ignored.
    pub fn merge_str(&mut self, contents: &str, origin: &str) -> Result<()> {
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::BadLine {
                    origin: origin.to_string(),
                    line: number + 1,
                    text: line.to_string(),
                });
            };

            self.set(key.trim(), unquote(value.trim()), origin)?;
        }
        Ok(())
    }

    /// Applies `NETOPT_`-prefixed variables from `vars`.
    pub fn merge_env(&mut self, vars: impl Iterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            if let Some(key) = key.strip_prefix("NETOPT_") {
                self.set(key, &value, "environment")?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        let bad = || Error::BadValue {
            origin: origin.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "PRIORITY_ETHERNET" => self.priority_ethernet = value.parse().map_err(|_| bad())?,
            "PRIORITY_WIFI" => self.priority_wifi = value.parse().map_err(|_| bad())?,
            "PRIORITY_MOBILE" => self.priority_mobile = value.parse().map_err(|_| bad())?,
            "PRIORITY_UNKNOWN" => self.priority_unknown = value.parse().map_err(|_| bad())?,
            "MAX_LATENCY" => self.max_latency = value.parse().map_err(|_| bad())?,
            "LATENCY_DIVISOR" => self.latency_divisor = value.parse().map_err(|_| bad())?,
            "MIN_WEIGHT" => self.min_weight = value.parse().map_err(|_| bad())?,
            "MAX_WEIGHT" => self.max_weight = value.parse().map_err(|_| bad())?,
            "LOSS_EXCLUDE_PCT" => self.loss_exclude_pct = value.parse().map_err(|_| bad())?,
            "PING_COUNT" => self.ping_count = value.parse().map_err(|_| bad())?,
            "PING_TIMEOUT" => self.ping_timeout = value.parse().map_err(|_| bad())?,
            "PROBE_MTU" => self.probe_mtu = parse_bool(value).ok_or_else(bad)?,
            "PROBE_JUMBO" => self.probe_jumbo = parse_bool(value).ok_or_else(bad)?,
            "CACHE_TTL" => self.cache_ttl = value.parse().map_err(|_| bad())?,
            "PARALLEL_TIMEOUT" => self.parallel_timeout = value.parse().map_err(|_| bad())?,
            "MAX_CONCURRENCY" => self.max_concurrency = value.parse().map_err(|_| bad())?,
            "ENABLE_BGP" => self.enable_bgp = parse_bool(value).ok_or_else(bad)?,
            "ENABLE_CHECKPOINTS" => self.enable_checkpoints = parse_bool(value).ok_or_else(bad)?,
            "CHECKPOINT_RETENTION" => {
                self.checkpoint_retention = value.parse().map_err(|_| bad())?
            }
            "ENABLE_WATCHDOG" => self.enable_watchdog = parse_bool(value).ok_or_else(bad)?,
            "WATCHDOG_TIMEOUT" => self.watchdog_timeout = value.parse().map_err(|_| bad())?,
            "MAX_WATCHDOG_EXTEND" => {
                self.max_watchdog_extend = value.parse().map_err(|_| bad())?
            }
            "TCP_CONGESTION_CONTROL" => self.tcp_congestion_control = value.to_string(),
            "TCP_FASTOPEN" => self.tcp_fastopen = value.parse().map_err(|_| bad())?,
            "RMEM_MAX" => self.rmem_max = value.parse().map_err(|_| bad())?,
            "WMEM_MAX" => self.wmem_max = value.parse().map_err(|_| bad())?,
            "DNS_SERVERS" => {
                self.dns_servers = value
                    .split([',', ' '])
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse().map_err(|_| bad()))
                    .collect::<Result<_>>()?
            }
            "EXCLUDE_INTERFACES" => self.exclude_interfaces = value.to_string(),
            "STATE_ROOT" => self.state_root = PathBuf::from(value),
            "CACHE_ROOT" => self.cache_root = PathBuf::from(value),
            "CANARY_IP" => self.canary_ip = value.parse().map_err(|_| bad())?,
            "CANARY_HOST" => self.canary_host = value.to_string(),
            other => {
                tracing::warn!(key = other, %origin, "unrecognized configuration key, ignoring");
            }
        }
        Ok(())
    }

    pub fn tcp_profile(&self) -> netopt_net::sysctl::Profile {
        netopt_net::sysctl::Profile {
            congestion_control: self.tcp_congestion_control.clone(),
            fastopen: self.tcp_fastopen,
            rmem_max: self.rmem_max,
            wmem_max: self.wmem_max,
        }
    }

    pub fn probe_options(&self) -> netopt_probe::ProbeOptions {
        netopt_probe::ProbeOptions {
            ping_count: self.ping_count,
            ping_timeout: std::time::Duration::from_secs(self.ping_timeout),
            parallel_timeout: std::time::Duration::from_secs(self.parallel_timeout),
            max_concurrency: self.max_concurrency,
            discover_mtu: self.probe_mtu,
            jumbo: self.probe_jumbo,
        }
    }

    pub fn class_priority(&self, class: netopt_net::LinkClass) -> u8 {
        use netopt_net::LinkClass::*;
        match class {
            Ethernet => self.priority_ethernet,
            Wifi => self.priority_wifi,
            Mobile => self.priority_mobile,
            Unknown => self.priority_unknown,
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config").join("netopt").join("netopt.conf"))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"'
            || bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_latency, 200.0);
        assert_eq!(config.latency_divisor, 10.0);
        assert_eq!(config.min_weight, 1);
        assert_eq!(config.max_weight, 20);
        assert_eq!(config.loss_exclude_pct, 75.0);
        assert_eq!(config.ping_count, 2);
        assert_eq!(config.cache_ttl, 60);
        assert_eq!(config.parallel_timeout, 5);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.checkpoint_retention, 10);
        assert_eq!(config.watchdog_timeout, 300);
        assert_eq!(config.max_watchdog_extend, 1800);
        assert!(!config.enable_bgp);
        assert!(!config.probe_jumbo);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut config = Config::default();
        config
            .merge_str(
                "# comment\n\nMAX_LATENCY=150\nENABLE_BGP=true\nDNS_SERVERS=9.9.9.9,1.0.0.1\nTCP_CONGESTION_CONTROL=\"cubic\"\n",
                "test.conf",
            )
            .unwrap();

        assert_eq!(config.max_latency, 150.0);
        assert!(config.enable_bgp);
        assert_eq!(
            config.dns_servers,
            vec!["9.9.9.9".parse::<Ipv4Addr>().unwrap(), "1.0.0.1".parse().unwrap()]
        );
        assert_eq!(config.tcp_congestion_control, "cubic");
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        config.merge_str("MAX_WEIGHT=10\n", "test.conf").unwrap();
        config
            .merge_env(vec![("NETOPT_MAX_WEIGHT".to_string(), "25".to_string())].into_iter())
            .unwrap();
        assert_eq!(config.max_weight, 25);
    }

    #[test]
    fn non_prefixed_env_is_ignored() {
        let mut config = Config::default();
        config
            .merge_env(vec![("MAX_WEIGHT".to_string(), "99".to_string())].into_iter())
            .unwrap();
        assert_eq!(config.max_weight, 20);
    }

    #[test]
    fn bad_value_is_a_config_error() {
        let mut config = Config::default();
        let err = config.merge_str("PING_COUNT=lots\n", "test.conf").unwrap_err();
        match err {
            Error::BadValue { origin, key, value } => {
                assert_eq!(origin, "test.conf");
                assert_eq!(key, "PING_COUNT");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bad_line_reports_the_line_number() {
        let mut config = Config::default();
        let err = config.merge_str("MAX_WEIGHT=10\nnot a kv line\n", "test.conf").unwrap_err();
        assert!(matches!(err, Error::BadLine { line: 2, .. }));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.merge_str("FUTURE_KNOB=42\n", "test.conf").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn booleans_accept_shell_style_spellings() {
        for (text, expect) in
            [("true", true), ("1", true), ("YES", true), ("false", false), ("0", false)]
        {
            let mut config = Config::default();
            config.merge_str(&format!("ENABLE_BGP={text}\n"), "t").unwrap();
            assert_eq!(config.enable_bgp, expect, "for {text}");
        }
    }
}
