//! beacon.toml configuration parser.
//!
//! Parsing happens in two steps. The file is first deserialized into raw
//! records that mirror the on-disk layout (unknown keys are rejected), then
//! each enabled peer is validated into a [`PeerSpec`]. Disabled peers are
//! counted and dropped without semantic validation.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{AddressFamily, Community, Origin, Prefix};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 200;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_MAX_CONCURRENT_PROBES: usize = 8;
pub const DEFAULT_CONNECT_RETRY_SECS: u64 = 5;
pub const DEFAULT_BGP_PORT: u16 = 179;
pub const DEFAULT_HOLD_TIME: u16 = 10;
pub const DEFAULT_LOCAL_PREF: u32 = 100;

// ── Raw on-disk records ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    daemon: RawDaemon,
    #[serde(default)]
    peers: Vec<RawPeer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDaemon {
    tick_interval_ms: Option<u64>,
    check_interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    max_concurrent_probes: Option<usize>,
    connect_retry_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPeer {
    #[serde(default)]
    enabled: bool,
    name: Option<String>,
    local_address: IpAddr,
    remote_address: IpAddr,
    remote_port: Option<u16>,
    local_as: u32,
    remote_as: Option<u32>,
    router_id: Option<Ipv4Addr>,
    address_family: AddressFamily,
    hold_time: Option<u16>,
    legacy_next_hop: Option<bool>,
    #[serde(default)]
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    name: String,
    check: String,
    destination: IpAddr,
    prefixes: Vec<String>,
    med: Option<u32>,
    local_pref: Option<u32>,
    #[serde(default)]
    communities: Vec<String>,
    origin: Option<Origin>,
}

// ── Validated records ──────────────────────────────────────────────

/// Timing and concurrency knobs for the control loop and sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    /// Scheduler tick.
    pub tick_interval: Duration,
    /// Minimum gap between two sweeps of the same peer.
    pub check_interval: Duration,
    /// Upper bound on a single health check.
    pub probe_timeout: Duration,
    /// Probes run concurrently per peer, at most this many at once.
    pub max_concurrent_probes: usize,
    /// Delay before a dropped session reconnects.
    pub connect_retry: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            max_concurrent_probes: DEFAULT_MAX_CONCURRENT_PROBES,
            connect_retry: Duration::from_secs(DEFAULT_CONNECT_RETRY_SECS),
        }
    }
}

/// One upstream peering.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    pub name: String,
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub local_as: u32,
    /// Expected ASN in the peer's OPEN, if pinned.
    pub remote_as: Option<u32>,
    pub router_id: Ipv4Addr,
    pub address_family: AddressFamily,
    pub hold_time: u16,
    /// Send NEXT_HOP 127.0.0.1 alongside MP_REACH_NLRI on IPv6 peers.
    pub legacy_next_hop: bool,
    pub targets: Vec<TargetSpec>,
}

/// One advertisable service attached to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub name: String,
    /// Shell command; exit status 0 means healthy.
    pub check: String,
    pub destination: IpAddr,
    pub prefixes: Vec<Prefix>,
    pub med: u32,
    pub local_pref: u32,
    pub communities: Vec<Community>,
    pub origin: Origin,
}

/// Fully validated daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub settings: DaemonSettings,
    peers: Vec<PeerSpec>,
    disabled_peers: usize,
}

impl Config {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let settings = validate_daemon(&raw.daemon)?;

        let mut peers = Vec::new();
        let mut disabled_peers = 0;
        for (index, peer) in raw.peers.into_iter().enumerate() {
            if !peer.enabled {
                disabled_peers += 1;
                continue;
            }
            peers.push(validate_peer(index, peer)?);
        }

        Ok(Config {
            settings,
            peers,
            disabled_peers,
        })
    }

    /// Enabled peers, in file order.
    pub fn enabled_peers(&self) -> &[PeerSpec] {
        &self.peers
    }

    /// Number of peer records skipped because `enabled` is false or absent.
    pub fn disabled_peers(&self) -> usize {
        self.disabled_peers
    }

    pub fn into_parts(self) -> (DaemonSettings, Vec<PeerSpec>) {
        (self.settings, self.peers)
    }
}

fn validate_daemon(raw: &RawDaemon) -> ConfigResult<DaemonSettings> {
    let positive = |value: Option<u64>, default: u64, field: &str| -> ConfigResult<u64> {
        match value.unwrap_or(default) {
            0 => Err(ConfigError::invalid("daemon", format!("{field} must be positive"))),
            v => Ok(v),
        }
    };

    let max_concurrent_probes = raw
        .max_concurrent_probes
        .unwrap_or(DEFAULT_MAX_CONCURRENT_PROBES);
    if max_concurrent_probes == 0 {
        return Err(ConfigError::invalid(
            "daemon",
            "max_concurrent_probes must be at least 1",
        ));
    }

    Ok(DaemonSettings {
        tick_interval: Duration::from_millis(positive(
            raw.tick_interval_ms,
            DEFAULT_TICK_INTERVAL_MS,
            "tick_interval_ms",
        )?),
        check_interval: Duration::from_secs(positive(
            raw.check_interval_secs,
            DEFAULT_CHECK_INTERVAL_SECS,
            "check_interval_secs",
        )?),
        probe_timeout: Duration::from_secs(positive(
            raw.probe_timeout_secs,
            DEFAULT_PROBE_TIMEOUT_SECS,
            "probe_timeout_secs",
        )?),
        max_concurrent_probes,
        connect_retry: Duration::from_secs(positive(
            raw.connect_retry_secs,
            DEFAULT_CONNECT_RETRY_SECS,
            "connect_retry_secs",
        )?),
    })
}

fn validate_peer(index: usize, raw: RawPeer) -> ConfigResult<PeerSpec> {
    let name = match raw.name {
        Some(name) if name.trim().is_empty() => {
            return Err(ConfigError::invalid(
                format!("peers[{index}]"),
                "name must not be empty",
            ));
        }
        Some(name) => name,
        None => raw.remote_address.to_string(),
    };
    let context = format!("peer {name}");

    if AddressFamily::of(&raw.local_address) != AddressFamily::of(&raw.remote_address) {
        return Err(ConfigError::invalid(
            &context,
            "local_address and remote_address must be the same IP version",
        ));
    }
    if raw.local_as == 0 {
        return Err(ConfigError::invalid(&context, "local_as must not be 0"));
    }
    if raw.remote_as == Some(0) {
        return Err(ConfigError::invalid(&context, "remote_as must not be 0"));
    }

    let router_id = match (raw.router_id, raw.local_address) {
        (Some(id), _) => id,
        (None, IpAddr::V4(v4)) => v4,
        (None, IpAddr::V6(_)) => {
            return Err(ConfigError::invalid(
                &context,
                "router_id is required when local_address is IPv6",
            ));
        }
    };
    if router_id.is_unspecified() {
        return Err(ConfigError::invalid(&context, "router_id must not be 0.0.0.0"));
    }

    let hold_time = raw.hold_time.unwrap_or(DEFAULT_HOLD_TIME);
    if hold_time == 1 || hold_time == 2 {
        return Err(ConfigError::invalid(
            &context,
            "hold_time must be 0 or at least 3 seconds",
        ));
    }

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(raw.targets.len());
    for target in raw.targets {
        if !seen.insert(target.name.clone()) {
            return Err(ConfigError::invalid(
                &context,
                format!("duplicate target name {}", target.name),
            ));
        }
        targets.push(validate_target(&name, raw.address_family, target)?);
    }

    Ok(PeerSpec {
        name,
        local_address: raw.local_address,
        remote_address: raw.remote_address,
        remote_port: raw.remote_port.unwrap_or(DEFAULT_BGP_PORT),
        local_as: raw.local_as,
        remote_as: raw.remote_as,
        router_id,
        address_family: raw.address_family,
        hold_time,
        legacy_next_hop: raw.legacy_next_hop.unwrap_or(false),
        targets,
    })
}

fn validate_target(
    peer: &str,
    family: AddressFamily,
    raw: RawTarget,
) -> ConfigResult<TargetSpec> {
    if raw.name.trim().is_empty() {
        return Err(ConfigError::invalid(
            format!("peer {peer}"),
            "target name must not be empty",
        ));
    }
    let context = format!("target {} on peer {peer}", raw.name);

    if raw.check.trim().is_empty() {
        return Err(ConfigError::invalid(&context, "check must not be empty"));
    }
    if AddressFamily::of(&raw.destination) != family {
        return Err(ConfigError::invalid(
            &context,
            format!("destination {} is not {family}", raw.destination),
        ));
    }
    if raw.prefixes.is_empty() {
        return Err(ConfigError::invalid(&context, "at least one prefix is required"));
    }

    let mut prefixes = Vec::with_capacity(raw.prefixes.len());
    for text in &raw.prefixes {
        let prefix: Prefix = text
            .parse()
            .map_err(|e| ConfigError::invalid(&context, format!("{e}")))?;
        if prefix.family() != family {
            return Err(ConfigError::invalid(
                &context,
                format!("prefix {prefix} is not {family}"),
            ));
        }
        prefixes.push(prefix);
    }

    let communities = raw
        .communities
        .iter()
        .map(|text| text.parse::<Community>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::invalid(&context, format!("{e}")))?;

    Ok(TargetSpec {
        name: raw.name,
        check: raw.check,
        destination: raw.destination,
        prefixes,
        med: raw.med.unwrap_or(0),
        local_pref: raw.local_pref.unwrap_or(DEFAULT_LOCAL_PREF),
        communities,
        origin: raw.origin.unwrap_or_default(),
    })
}
