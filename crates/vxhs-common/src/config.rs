//! Configuration types for the VxHS block driver
//!
//! A vDisk target arrives in one of two forms:
//!
//! ```text
//! URI:   vxhs://10.0.0.1:9999/{6ce4d6a1-...}%7Dvxhs://10.0.0.2:9999
//! JSON:  {"driver":"vxhs","vdisk_id":"{6ce4d6a1-...}",
//!         "server":[{"host":"10.0.0.1","port":"9999"},
//!                   {"host":"10.0.0.2","port":"9999"}]}
//! ```
//!
//! Both produce a [`VDiskConfig`]. Host 0 is the local storage agent, the
//! remaining hosts are reflection targets used for failover.

use crate::error::{ConfigError, ConfigResult};
use crate::{DEFAULT_AGENT_PORT, VDISK_PREFIX};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Separator between targets in the URI form (an encoded `}`)
const URI_TARGET_SEPARATOR: &str = "%7D";

/// URI scheme accepted by the loader
const URI_SCHEME: &str = "vxhs://";

/// Storage agent endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddr {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address string handed to the transport when opening a channel
    pub fn agent_uri(&self) -> String {
        format!("of://{}:{}", self.host, self.port)
    }

    fn parse_authority(uri: &str, authority: &str) -> ConfigResult<Self> {
        if authority.is_empty() {
            return Err(ConfigError::invalid_uri(uri, "missing host"));
        }

        // Bracketed IPv6 literal: [::1]:9999
        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ConfigError::invalid_uri(uri, "unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if tail.is_empty() => DEFAULT_AGENT_PORT,
                None => return Err(ConfigError::invalid_uri(uri, "garbage after host")),
            };
            return Ok(Self::new(host, port));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(port)?)),
            Some(_) => Err(ConfigError::invalid_uri(uri, "missing host")),
            None => Ok(Self::new(authority, DEFAULT_AGENT_PORT)),
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_port(port: &str) -> ConfigResult<u16> {
    match port.trim().parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort(port.to_string())),
    }
}

/// Parsed vDisk target
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VDiskConfig {
    /// Opaque identifier of the remote volume, usually `{UUID}`
    pub vdisk_id: String,
    /// Storage agents, primary first
    pub hosts: Vec<HostAddr>,
}

impl VDiskConfig {
    pub fn new(vdisk_id: impl Into<String>, hosts: Vec<HostAddr>) -> Self {
        Self {
            vdisk_id: vdisk_id.into(),
            hosts,
        }
    }

    /// Parse either target form. Strings starting with `json:` or `{"` are
    /// treated as JSON, anything else as a URI.
    pub fn parse(target: &str) -> ConfigResult<Self> {
        let trimmed = target.trim();
        if trimmed.starts_with("json:") || trimmed.starts_with("{\"") {
            Self::from_json(trimmed)
        } else {
            Self::from_uri(trimmed)
        }
    }

    /// Parse the URI form
    ///
    /// Targets are separated by `%7D`. The first target carries the vdisk
    /// id in its path; the separator swallowed the id's closing brace, so it
    /// is put back. Paths of later targets are ignored.
    pub fn from_uri(uri: &str) -> ConfigResult<Self> {
        debug!("parsing vxhs URI {uri}");

        let normalized = uri.replace("%7d", URI_TARGET_SEPARATOR);
        let mut vdisk_id = None;
        let mut hosts = Vec::new();

        for (index, target) in normalized
            .split(URI_TARGET_SEPARATOR)
            .filter(|t| !t.is_empty())
            .enumerate()
        {
            let rest = target
                .strip_prefix(URI_SCHEME)
                .ok_or_else(|| ConfigError::invalid_uri(uri, "expected vxhs:// scheme"))?;
            let (authority, path) = match rest.find('/') {
                Some(i) => rest.split_at(i),
                None => (rest, ""),
            };

            let host = HostAddr::parse_authority(uri, authority)?;
            debug!("vxhs URI host {}: {}", index + 1, host);

            if index == 0 {
                let id = path.trim_start_matches('/');
                if id.is_empty() {
                    return Err(ConfigError::invalid_uri(uri, "missing vdisk id"));
                }
                let mut id = id.to_string();
                if id.starts_with('{') && !id.ends_with('}') {
                    id.push('}');
                }
                vdisk_id = Some(id);
            }
            hosts.push(host);
        }

        let vdisk_id =
            vdisk_id.ok_or_else(|| ConfigError::invalid_uri(uri, "no storage agent target"))?;
        let config = Self { vdisk_id, hosts };
        config.validate()?;
        Ok(config)
    }

    /// Parse the structured form, with or without a leading `json:`
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let body = json.trim().strip_prefix("json:").unwrap_or(json).trim();
        let options: JsonTarget = serde_json::from_str(body)?;

        if let Some(driver) = options.driver.as_deref()
            && driver != "vxhs"
        {
            return Err(ConfigError::UnsupportedDriver(driver.to_string()));
        }

        let vdisk_id = options
            .vdisk_id
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingParameter("vdisk_id"))?;
        debug!("vxhs JSON vdisk_id {vdisk_id}");

        if options.server.is_empty() {
            return Err(ConfigError::MissingParameter("server"));
        }
        debug!("vxhs JSON lists {} servers", options.server.len());

        let mut hosts = Vec::with_capacity(options.server.len());
        for (index, server) in options.server.into_iter().enumerate() {
            let host = server
                .host
                .filter(|h| !h.is_empty())
                .ok_or(ConfigError::MissingServerField {
                    field: "host",
                    index,
                })?;
            let port = server
                .port
                .ok_or(ConfigError::MissingServerField {
                    field: "port",
                    index,
                })?
                .into_port()?;

            if server.to.is_some() {
                return Err(ConfigError::UnsupportedOption("Parameter 'to' not supported"));
            }
            if server.ipv4.is_some() || server.ipv6.is_some() {
                return Err(ConfigError::UnsupportedOption(
                    "Parameters 'ipv4/ipv6' not supported",
                ));
            }

            debug!("vxhs JSON host {}: {}:{}", index + 1, host, port);
            hosts.push(HostAddr::new(host, port));
        }

        let config = Self { vdisk_id, hosts };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the driver relies on at open
    pub fn validate(&self) -> ConfigResult<()> {
        if self.vdisk_id.is_empty() {
            return Err(ConfigError::MissingParameter("vdisk_id"));
        }
        if self.hosts.is_empty() {
            return Err(ConfigError::EmptyHostList);
        }
        Ok(())
    }

    /// Primary storage agent
    pub fn primary(&self) -> Option<&HostAddr> {
        self.hosts.first()
    }

    /// Device name handed to the storage agent
    pub fn device_path(&self) -> String {
        format!("{}/{}", VDISK_PREFIX, self.vdisk_id)
    }

    /// Whether a failover target exists
    pub fn has_redundancy(&self) -> bool {
        self.hosts.len() > 1
    }
}

/// Raw JSON target as supplied on the command line
#[derive(Debug, Deserialize)]
struct JsonTarget {
    driver: Option<String>,
    vdisk_id: Option<String>,
    #[serde(default)]
    server: Vec<JsonServer>,
}

#[derive(Debug, Deserialize)]
struct JsonServer {
    host: Option<String>,
    port: Option<JsonPort>,
    to: Option<serde_json::Value>,
    ipv4: Option<serde_json::Value>,
    ipv6: Option<serde_json::Value>,
}

/// Ports show up both as numbers and as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonPort {
    Number(u64),
    Text(String),
}

impl JsonPort {
    fn into_port(self) -> ConfigResult<u16> {
        match self {
            Self::Number(n) => match u16::try_from(n) {
                Ok(p) if p != 0 => Ok(p),
                _ => Err(ConfigError::InvalidPort(n.to_string())),
            },
            Self::Text(s) => parse_port(&s),
        }
    }
}

/// Tunables of the block driver core
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Largest single transport submission; bigger requests are split
    pub max_io_size: usize,
    /// Pause after every host rejected the readiness probe
    pub failover_retry_interval_ms: u64,
    /// Deadline for one failover episode (0 = retry forever)
    pub failover_timeout_ms: u64,
    /// How long a single readiness probe may stay unanswered
    pub probe_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_io_size: 1024 * 1024,            // 1 MiB
            failover_retry_interval_ms: 5_000,   // 5s
            failover_timeout_ms: 120_000,        // 120s
            probe_timeout_ms: 30_000,            // 30s
        }
    }
}

impl DriverConfig {
    pub fn failover_retry_interval(&self) -> Duration {
        Duration::from_millis(self.failover_retry_interval_ms)
    }

    pub fn failover_timeout(&self) -> Option<Duration> {
        (self.failover_timeout_ms > 0).then(|| Duration::from_millis(self.failover_timeout_ms))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_single_host() {
        let config = VDiskConfig::from_uri("vxhs://10.0.0.1:9999/{abc-123}").unwrap();
        assert_eq!(config.vdisk_id, "{abc-123}");
        assert_eq!(config.hosts, vec![HostAddr::new("10.0.0.1", 9999)]);
        assert!(!config.has_redundancy());
        assert_eq!(config.device_path(), "/dev/of/vdisk/{abc-123}");
    }

    #[test]
    fn test_uri_restores_brace_and_reads_failover_hosts() {
        let config = VDiskConfig::from_uri(
            "vxhs://10.0.0.1:9999/{abc-123%7Dvxhs://10.0.0.2:9998%7Dvxhs://10.0.0.3",
        )
        .unwrap();
        assert_eq!(config.vdisk_id, "{abc-123}");
        assert_eq!(
            config.hosts,
            vec![
                HostAddr::new("10.0.0.1", 9999),
                HostAddr::new("10.0.0.2", 9998),
                HostAddr::new("10.0.0.3", DEFAULT_AGENT_PORT),
            ]
        );
        assert_eq!(config.primary().unwrap().agent_uri(), "of://10.0.0.1:9999");
    }

    #[test]
    fn test_uri_ipv6_literal() {
        let config = VDiskConfig::from_uri("vxhs://[fd00::1]:9000/{x}").unwrap();
        assert_eq!(config.hosts[0], HostAddr::new("fd00::1", 9000));
    }

    #[test]
    fn test_uri_errors() {
        assert!(matches!(
            VDiskConfig::from_uri("http://10.0.0.1/{x}"),
            Err(ConfigError::InvalidUri { .. })
        ));
        assert!(matches!(
            VDiskConfig::from_uri("vxhs://10.0.0.1:9999/"),
            Err(ConfigError::InvalidUri { .. })
        ));
        assert!(matches!(
            VDiskConfig::from_uri("vxhs://10.0.0.1:notaport/{x}"),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_json_target() {
        let config = VDiskConfig::parse(
            r#"json:{"driver":"vxhs","vdisk_id":"{abc}",
               "server":[{"host":"1.2.3.4","port":"9999"},{"host":"4.5.6.7","port":9998}]}"#,
        )
        .unwrap();
        assert_eq!(config.vdisk_id, "{abc}");
        assert_eq!(
            config.hosts,
            vec![HostAddr::new("1.2.3.4", 9999), HostAddr::new("4.5.6.7", 9998)]
        );
    }

    #[test]
    fn test_json_missing_fields() {
        let err = VDiskConfig::from_json(r#"{"server":[{"host":"a","port":1}]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingParameter("vdisk_id")));

        let err = VDiskConfig::from_json(r#"{"vdisk_id":"{a}","server":[]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingParameter("server")));

        let err = VDiskConfig::from_json(
            r#"{"vdisk_id":"{a}","server":[{"host":"a","port":1},{"host":"b"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingServerField {
                field: "port",
                index: 1
            }
        ));
    }

    #[test]
    fn test_json_rejects_unsupported_options() {
        let err = VDiskConfig::from_json(
            r#"{"vdisk_id":"{a}","server":[{"host":"a","port":1,"to":5}]}"#,
        )
        .unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(err.to_string(), "Parameter 'to' not supported");

        let err = VDiskConfig::from_json(
            r#"{"vdisk_id":"{a}","server":[{"host":"a","port":1,"ipv6":true}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Parameters 'ipv4/ipv6' not supported");

        let err = VDiskConfig::from_json(
            r#"{"driver":"nbd","vdisk_id":"{a}","server":[{"host":"a","port":1}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedDriver(_)));
    }

    #[test]
    fn test_default_driver_config() {
        let config = DriverConfig::default();
        assert_eq!(config.max_io_size, 1024 * 1024);
        assert_eq!(config.failover_retry_interval(), Duration::from_secs(5));
        assert_eq!(config.failover_timeout(), Some(Duration::from_secs(120)));

        let forever = DriverConfig {
            failover_timeout_ms: 0,
            ..DriverConfig::default()
        };
        assert_eq!(forever.failover_timeout(), None);
    }
}
