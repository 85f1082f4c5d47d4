use crate::firewall_driver::{DriverConfig, DriverKind, RejectPolicy};
use crate::knock_protocol::{KnockSettings, ProtocolVersion};
use crate::protocol::Protocol;
use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// iptables limits chain names to 28 characters; `-ALLOW` takes 6 of them
const MAX_CHAIN_PREFIX_LEN: usize = 22;
/// The multiport match accepts at most 15 ports, a range counts as two
const MAX_MULTIPORT_PORTS: usize = 15;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub server: ServerSettings,
    pub firewall: FirewallSettings,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding the login page, served at `/`
    #[serde(default)]
    pub docroot: Option<PathBuf>,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    pub passfile: PathBuf,

    /// Seconds a sync timestamp stays valid
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u32,

    /// Where the browser goes after authenticating; the page reloads itself if unset
    #[serde(default)]
    pub redirect_url: Option<String>,

    #[serde(default)]
    pub protocol: ProtocolVersion,

    #[serde(default)]
    pub single_use_tokens: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallSettings {
    pub plugin: DriverKind,

    /// Guarded ports, e.g. `80,443` or `8000:8010`
    pub dports: String,

    #[serde(default)]
    pub protocol: Option<String>,

    #[serde(default = "default_iptables_path")]
    pub iptables_path: PathBuf,

    /// Seconds a single iptables invocation may take
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub options: DriverOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverOptions {
    #[serde(default)]
    pub chain: Option<String>,

    #[serde(default)]
    pub log_rejected: bool,

    #[serde(default)]
    pub accept_local: bool,

    #[serde(default)]
    pub reject_policy: RejectPolicy,

    /// Guarded port -> local listening port, netfilter driver only
    #[serde(default)]
    pub forward: Option<BTreeMap<u16, u16>>,
}

fn default_listen_addr() -> IpAddr {
    Ipv4Addr::UNSPECIFIED.into()
}

fn default_port() -> u16 {
    4777
}

fn default_endpoint() -> String {
    "/catflap".to_string()
}

fn default_token_ttl() -> u32 {
    15
}

fn default_iptables_path() -> PathBuf {
    PathBuf::from("iptables")
}

fn default_timeout() -> u64 {
    10
}

impl Settings {
    pub fn load(file_path: &Path) -> anyhow::Result<Self> {
        let file = File::open(file_path).with_context(|| {
            format!(
                "Cannot read configuration file at '{}'",
                file_path.display()
            )
        })?;
        Self::parse(BufReader::new(file)).with_context(|| {
            format!(
                "Failed to parse configuration file at '{}'",
                file_path.display()
            )
        })
    }

    fn parse(reader: impl Read) -> anyhow::Result<Self> {
        let settings: Settings = serde_yaml::from_reader(reader)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let endpoint = &self.server.endpoint;
        if !endpoint.starts_with('/') || endpoint.len() < 2 || endpoint.ends_with('/') {
            bail!(
                "Invalid endpoint '{}': expected an absolute path such as '/catflap'",
                endpoint
            );
        }

        parse_port_list(&self.firewall.dports)?;
        self.protocol()?;

        let chain = self.chain();
        if chain.is_empty()
            || chain.len() > MAX_CHAIN_PREFIX_LEN
            || !chain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "Invalid chain name '{}': expected up to {} letters, digits, '-' or '_'",
                chain,
                MAX_CHAIN_PREFIX_LEN
            );
        }

        Ok(())
    }

    fn chain(&self) -> &str {
        self.firewall.options.chain.as_deref().unwrap_or("CATFLAP")
    }

    fn protocol(&self) -> anyhow::Result<Protocol> {
        match &self.firewall.protocol {
            None => Ok(Protocol::default()),
            Some(protocol) => {
                Protocol::parse(protocol).ok_or_else(|| anyhow!("Unknown protocol '{}'", protocol))
            }
        }
    }

    pub fn driver_config(&self) -> anyhow::Result<DriverConfig> {
        let options = &self.firewall.options;
        let ports = parse_port_list(&self.firewall.dports)?;

        // Without explicit forwards, every guarded port leads to the knock server
        let forward = match &options.forward {
            Some(forward) => forward.clone(),
            None => ports
                .iter()
                .filter_map(|entry| match entry {
                    PortEntry::Single(port) => Some((*port, self.server.port)),
                    PortEntry::Range(..) => None,
                })
                .collect(),
        };

        // Re-rendered so that no whitespace reaches the command line
        let dports = ports
            .iter()
            .map(PortEntry::to_string)
            .collect::<Vec<_>>()
            .join(",");

        Ok(DriverConfig {
            chain: self.chain().to_string(),
            dports,
            protocol: self.protocol()?,
            log_rejected: options.log_rejected,
            accept_local: options.accept_local,
            reject_policy: options.reject_policy,
            forward,
        })
    }

    pub fn knock_settings(&self) -> KnockSettings {
        KnockSettings {
            token_ttl: i64::from(self.server.token_ttl),
            redirect_url: self.server.redirect_url.clone(),
            version: self.server.protocol,
            single_use_tokens: self.server.single_use_tokens,
        }
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.firewall.timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEntry {
    Single(u16),
    Range(u16, u16),
}

/// Multiport syntax, `port` or `first:last`
impl std::fmt::Display for PortEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Single(port) => write!(f, "{}", port),
            Self::Range(first, last) => write!(f, "{}:{}", first, last),
        }
    }
}

/// Parses multiport syntax: comma-separated ports and `first:last` ranges
pub fn parse_port_list(input: &str) -> anyhow::Result<Vec<PortEntry>> {
    let mut entries = Vec::new();
    let mut slots = 0;

    for item in input.trim().split(',') {
        let item = item.trim();
        let parse_port =
            |port: &str| u16::from_str(port.trim()).with_context(|| format!("Invalid port '{}'", port));

        let entry = match item.split_once(':') {
            Some((first, last)) => {
                let (first, last) = (parse_port(first)?, parse_port(last)?);
                if first > last {
                    bail!("Invalid port range '{}'", item);
                }
                slots += 2;
                PortEntry::Range(first, last)
            }
            None => {
                slots += 1;
                PortEntry::Single(parse_port(item)?)
            }
        };
        entries.push(entry);
    }

    if slots > MAX_MULTIPORT_PORTS {
        bail!(
            "Too many ports in '{}': at most {} are supported",
            input,
            MAX_MULTIPORT_PORTS
        );
    }

    Ok(entries)
}
