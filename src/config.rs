//! Configuration loading, validation, and server line parsing.
//!
//! Pool tunables and named server lists are read from YAML once and turned
//! into a [`RuntimeConfig`]. Server lines use the compact
//! `host[:port[:weight]]` notation, several entries separated by commas,
//! semicolons or whitespace. IPv6 literals are written in brackets.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Result, Rotation, UpstreamError, UpstreamLimits, UpstreamPool};

/// Default number of errors inside the error window that kill an upstream.
pub const DEFAULT_MAX_ERRORS: u32 = 4;

/// Default length of the error window.
pub const DEFAULT_ERROR_TIME: Duration = Duration::from_secs(10);

/// Default time a dead upstream stays out of rotation.
pub const DEFAULT_REVIVE_TIME: Duration = Duration::from_secs(60);

/// Default weight of an entry that does not specify one.
pub const DEFAULT_UPSTREAM_WEIGHT: u32 = 1;

/// Raw configuration as deserialized from YAML.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Errors within the error window before an upstream is marked dead
    /// (default: 4).
    #[serde(default)]
    pub max_errors: Option<u32>,
    /// Error window in milliseconds (default: 10000).
    #[serde(default)]
    pub error_time_ms: Option<u64>,
    /// Dead period in milliseconds before automatic revival (default: 60000).
    #[serde(default)]
    pub revive_time_ms: Option<u64>,
    /// How long a failing address family is skipped, in milliseconds
    /// (default: the revive time).
    #[serde(default)]
    pub address_cooldown_ms: Option<u64>,
    /// Named upstream pools.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

/// One named pool in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Name used to look the pool up and in log output.
    pub name: String,
    /// Server line, e.g. `"a.example.com:80:2,b.example.com"`.
    pub servers: String,
    /// Port for entries that omit one.
    #[serde(default)]
    pub default_port: u16,
    /// Rotation callers of this pool should use.
    #[serde(default)]
    pub rotation: Rotation,
}

/// Validated configuration ready to build pools from.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Health policy applied to every pool.
    pub limits: UpstreamLimits,
    /// Pools in file order.
    pub pools: Vec<PoolConfig>,
}

/// A validated pool definition.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Pool name, unique within the file.
    pub name: String,
    /// Trimmed server line.
    pub servers: String,
    /// Port for entries that omit one.
    pub default_port: u16,
    /// Rotation callers of this pool should use.
    pub rotation: Rotation,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            UpstreamError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Applies defaults and validates every field.
    ///
    /// At least one pool must be configured, pool names must be unique and
    /// `max_errors` must be positive.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.upstreams.is_empty() {
            return Err(UpstreamError::Config(
                "at least one upstream pool must be configured".into(),
            ));
        }

        let max_errors = self.max_errors.unwrap_or(DEFAULT_MAX_ERRORS);
        if max_errors == 0 {
            return Err(UpstreamError::Config("max_errors must be positive".into()));
        }

        let error_time = self
            .error_time_ms
            .map_or(DEFAULT_ERROR_TIME, Duration::from_millis);
        let revive_time = self
            .revive_time_ms
            .map_or(DEFAULT_REVIVE_TIME, Duration::from_millis);
        let address_cooldown = self
            .address_cooldown_ms
            .map_or(revive_time, Duration::from_millis);

        let mut seen = HashSet::new();
        let pools = self
            .upstreams
            .into_iter()
            .map(|pool| {
                if !seen.insert(pool.name.clone()) {
                    return Err(UpstreamError::Config(format!(
                        "duplicate upstream pool name: {}",
                        pool.name
                    )));
                }

                let servers = pool.servers.trim().to_owned();
                if servers.is_empty() {
                    return Err(UpstreamError::Config(format!(
                        "upstream pool {} has no servers",
                        pool.name
                    )));
                }

                Ok(PoolConfig {
                    name: pool.name,
                    servers,
                    default_port: pool.default_port,
                    rotation: pool.rotation,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RuntimeConfig {
            limits: UpstreamLimits {
                max_errors,
                error_time,
                revive_time,
                address_cooldown,
            },
            pools,
        })
    }
}

impl RuntimeConfig {
    /// Returns the pool definition with the given name.
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }
}

impl PoolConfig {
    /// Builds a fresh [`UpstreamPool`] from this definition.
    pub fn build(&self, limits: UpstreamLimits) -> Result<UpstreamPool> {
        UpstreamPool::from_line(&self.servers, self.default_port, limits)
    }
}

/// One parsed `host[:port[:weight]]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// Port, or the default port when omitted.
    pub port: u16,
    /// Weight, at least 1.
    pub weight: u32,
}

impl ServerEntry {
    /// The host as an IP address, if it is a literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

fn entry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:\[([^\]]*)\]|([^:\[\]]*))(?::([^:]*))?(?::([^:]*))?$")
            .expect("server entry pattern is valid")
    })
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with(|c| c == '.' || c == '-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Validates a host name or IP literal as used in a server entry.
pub(crate) fn validate_host(entry: &str, host: &str) -> Result<()> {
    if host.parse::<IpAddr>().is_ok() || is_valid_hostname(host) {
        Ok(())
    } else {
        Err(UpstreamError::parse(entry, format!("invalid host \"{host}\"")))
    }
}

/// Parses a single `host[:port[:weight]]` entry.
pub fn parse_server_entry(entry: &str, default_port: u16) -> Result<ServerEntry> {
    let caps = entry_pattern()
        .captures(entry)
        .ok_or_else(|| UpstreamError::parse(entry, "malformed entry"))?;

    let host = match (caps.get(1), caps.get(2)) {
        (Some(v6), _) => {
            v6.as_str()
                .parse::<Ipv6Addr>()
                .map_err(|_| UpstreamError::parse(entry, "invalid IPv6 address"))?;
            v6.as_str()
        }
        (None, Some(host)) => host.as_str(),
        (None, None) => return Err(UpstreamError::parse(entry, "missing host")),
    };
    validate_host(entry, host)?;

    let port = caps
        .get(3)
        .map(|p| p.as_str().parse::<u16>())
        .transpose()
        .map_err(|_| UpstreamError::parse(entry, "invalid port"))?
        .unwrap_or(default_port);

    let weight = caps
        .get(4)
        .map(|w| w.as_str().parse::<u32>())
        .transpose()
        .map_err(|_| UpstreamError::parse(entry, "invalid weight"))?
        .unwrap_or(DEFAULT_UPSTREAM_WEIGHT);
    if weight == 0 {
        return Err(UpstreamError::parse(entry, "weight must be positive"));
    }

    Ok(ServerEntry {
        host: host.to_owned(),
        port,
        weight,
    })
}

/// Splits a server line into its non-empty entries.
pub fn split_server_line(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|entry| !entry.is_empty())
}
