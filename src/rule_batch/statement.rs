use crate::protocol::Protocol;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use tokio::net::lookup_host;

/// Name of the control-plane tool every statement is addressed to
pub const TOOL: &str = "iptables";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    New,
    Delete,
    Flush,
    #[allow(dead_code)] // builder vocabulary the drivers do not need
    Rename,
    ListRules,
    #[allow(dead_code)]
    List,
    #[allow(dead_code)]
    Zero,
    #[allow(dead_code)]
    Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Add,
    Delete,
    Insert,
    #[allow(dead_code)] // builder vocabulary the drivers do not need
    Replace,
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    Chain(ChainOp),
    Rule(RuleOp),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Jump(String),
    Goto(String),
}

/// Extra arguments for chain operations
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainOptions<'a> {
    /// `-n`, numeric output for listings
    pub numeric: bool,
    pub rulenum: Option<u32>,
    /// New name for `Rename`, target verdict for `Policy`
    pub to: Option<&'a str>,
}

/// Arguments for rule operations.
///
/// `match_module` and `ports` fall back to the ambient context of the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleOptions<'a> {
    pub chain: Option<&'a str>,
    pub rulenum: Option<u32>,
    pub src: Option<&'a str>,
    pub dst: Option<&'a str>,
    pub out_interface: Option<&'a str>,
    pub in_interface: Option<&'a str>,
    /// Defaults to TCP
    pub protocol: Option<Protocol>,
    pub match_module: Option<&'a str>,
    pub ports: Option<&'a str>,
    pub jump: Option<&'a str>,
    pub goto: Option<&'a str>,
    pub to_port: Option<u16>,
}

/// Ambient defaults a batch hands to each statement it builds
#[derive(Debug, Clone, Copy, Default)]
pub struct Context<'a> {
    pub table: Option<&'a str>,
    pub match_module: Option<&'a str>,
    pub ports: Option<&'a str>,
}

#[derive(Debug, Error)]
#[error("'{address}' does not resolve to an IP address")]
pub struct AddressError {
    pub address: String,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("A target chain is required for rule operations")]
    MissingChain,

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
}

/// One fully specified iptables command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStatement {
    table: Option<String>,
    operation: Operation,
    chain: String,
    rulenum: Option<u32>,
    numeric: bool,
    to: Option<String>,
    source: Option<IpAddr>,
    destination: Option<IpAddr>,
    out_interface: Option<String>,
    in_interface: Option<String>,
    protocol: Option<Protocol>,
    match_module: Option<String>,
    ports: Option<String>,
    target: Option<Target>,
    to_port: Option<u16>,
}

/// Parses an IP literal; IPv4-mapped IPv6 addresses become plain IPv4
pub fn parse_address(suspect: &str) -> Result<IpAddr, AddressError> {
    let suspect = suspect.trim();
    IpAddr::from_str(suspect)
        .map(|addr| addr.to_canonical())
        .map_err(|_| AddressError {
            address: suspect.to_string(),
        })
}

/// Checks that `suspect` is an IP literal or a host name that resolves to one.
///
/// Anything that is not shaped like a host name is rejected before any lookup happens.
pub async fn validate_address(suspect: &str) -> Result<IpAddr, AddressError> {
    if let Ok(addr) = parse_address(suspect) {
        return Ok(addr);
    }

    let suspect = suspect.trim();
    let error = || AddressError {
        address: suspect.to_string(),
    };

    if !is_host_name(suspect) {
        return Err(error());
    }

    lookup_host((suspect, 0))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip().to_canonical())
        .ok_or_else(error)
}

fn is_host_name(input: &str) -> bool {
    !input.is_empty()
        && input.len() <= 253
        && input.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl RuleStatement {
    pub fn chain(context: Context, op: ChainOp, chain: &str, options: ChainOptions) -> Self {
        Self {
            table: context.table.map(str::to_string),
            operation: Operation::Chain(op),
            chain: chain.to_string(),
            rulenum: options.rulenum,
            numeric: options.numeric,
            to: options.to.map(str::to_string),
            source: None,
            destination: None,
            out_interface: None,
            in_interface: None,
            protocol: None,
            match_module: None,
            ports: None,
            target: None,
            to_port: None,
        }
    }

    pub fn rule(context: Context, op: RuleOp, options: RuleOptions) -> Result<Self, RuleError> {
        let chain = options.chain.ok_or(RuleError::MissingChain)?;
        let source = options.src.map(parse_address).transpose()?;
        let destination = options.dst.map(parse_address).transpose()?;

        let target = match (options.jump, options.goto) {
            (Some(jump), _) => Some(Target::Jump(jump.to_string())),
            (None, Some(goto)) => Some(Target::Goto(goto.to_string())),
            (None, None) => None,
        };

        Ok(Self {
            table: context.table.map(str::to_string),
            operation: Operation::Rule(op),
            chain: chain.to_string(),
            rulenum: options.rulenum,
            numeric: false,
            to: None,
            source,
            destination,
            out_interface: options.out_interface.map(str::to_string),
            in_interface: options.in_interface.map(str::to_string),
            protocol: Some(options.protocol.unwrap_or_default()),
            match_module: options
                .match_module
                .or(context.match_module)
                .map(str::to_string),
            ports: options.ports.or(context.ports).map(str::to_string),
            target,
            to_port: options.to_port,
        })
    }

    fn command_flag(&self) -> &'static str {
        match self.operation {
            Operation::Chain(ChainOp::New) => "-N",
            Operation::Chain(ChainOp::Delete) => "-X",
            Operation::Chain(ChainOp::Flush) => "-F",
            Operation::Chain(ChainOp::Rename) => "-E",
            Operation::Chain(ChainOp::ListRules) => "-S",
            Operation::Chain(ChainOp::List) => "-L",
            Operation::Chain(ChainOp::Zero) => "-Z",
            Operation::Chain(ChainOp::Policy) => "-P",
            Operation::Rule(RuleOp::Add) => "-A",
            Operation::Rule(RuleOp::Delete) => "-D",
            Operation::Rule(RuleOp::Insert) => "-I",
            Operation::Rule(RuleOp::Replace) => "-R",
            Operation::Rule(RuleOp::Check) => "-C",
        }
    }

    fn ports_flag(&self) -> &'static str {
        // The multiport match only understands the plural form
        if self.match_module.as_deref() == Some("multiport") {
            "--dports"
        } else {
            "--dport"
        }
    }
}

impl fmt::Display for RuleStatement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", TOOL)?;
        if let Some(table) = &self.table {
            write!(f, " -t {}", table)?;
        }
        write!(f, " {} {}", self.command_flag(), self.chain)?;
        if let Some(rulenum) = self.rulenum {
            write!(f, " {}", rulenum)?;
        }
        if let Some(to) = &self.to {
            write!(f, " {}", to)?;
        }
        if self.numeric {
            write!(f, " -n")?;
        }
        if let Some(source) = &self.source {
            write!(f, " -s {}", source)?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " -d {}", destination)?;
        }
        if let Some(out_interface) = &self.out_interface {
            write!(f, " -o {}", out_interface)?;
        }
        if let Some(in_interface) = &self.in_interface {
            write!(f, " -i {}", in_interface)?;
        }
        if let Some(protocol) = &self.protocol {
            write!(f, " -p {}", protocol)?;
        }
        if let Some(match_module) = &self.match_module {
            write!(f, " -m {}", match_module)?;
        }
        if let Some(ports) = &self.ports {
            write!(f, " {} {}", self.ports_flag(), ports)?;
        }
        match &self.target {
            Some(Target::Jump(target)) => write!(f, " -j {}", target)?,
            Some(Target::Goto(target)) => write!(f, " -g {}", target)?,
            None => (),
        }
        if let Some(to_port) = self.to_port {
            write!(f, " --to-port {}", to_port)?;
        }
        Ok(())
    }
}
