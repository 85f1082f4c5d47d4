pub mod iptables;
pub mod netfilter;
pub mod noop;

use crate::executor::{ExecError, Executor};
use crate::protocol::Protocol;
use crate::rule_batch::{AddressError, RuleError, RuleOptions};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FirewallError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl From<AddressError> for FirewallError {
    fn from(e: AddressError) -> Self {
        Self::Rule(RuleError::InvalidAddress(e))
    }
}

/// The operations every firewall backend provides.
///
/// Address-taking operations validate the address before anything is sent to the firewall.
/// The live firewall is the only record of granted addresses; drivers keep no state about them.
pub trait FirewallDriver: Send + Sync {
    fn install_rules(&self) -> DriverFuture<'_, ()>;

    fn uninstall_rules(&self) -> DriverFuture<'_, ()>;

    /// Flushes the allow chain only
    fn purge_rules(&self) -> DriverFuture<'_, ()>;

    fn list_rules(&self) -> DriverFuture<'_, String>;

    /// Asks the firewall whether an allow rule for `address` exists
    fn check_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, bool>;

    fn add_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, ()>;

    fn delete_address<'a>(&'a self, address: &'a str) -> DriverFuture<'a, ()>;

    /// Adds `address` unless it is already granted. Returns whether a rule was added.
    fn grant<'a>(&'a self, address: &'a str) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            if self.check_address(address).await? {
                return Ok(false);
            }
            self.add_address(address).await?;
            Ok(true)
        })
    }

    /// Removes `address` if it is granted. Returns whether a rule was removed.
    fn revoke<'a>(&'a self, address: &'a str) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            if !self.check_address(address).await? {
                return Ok(false);
            }
            self.delete_address(address).await?;
            Ok(true)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Default-deny allow/deny chains in the filter table
    Iptables,
    /// Allow/deny chains in the nat table, denied traffic is redirected to the knock server
    Netfilter,
    /// No firewall integration
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectPolicy {
    Reject,
    #[default]
    Drop,
}

impl RejectPolicy {
    pub fn target(self) -> &'static str {
        match self {
            Self::Reject => "REJECT",
            Self::Drop => "DROP",
        }
    }
}

/// Per-driver options, fixed once the driver is built
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Prefix of the `-ALLOW` and `-DENY` chains
    pub chain: String,
    /// Guarded ports in multiport syntax, e.g. `80,443`
    pub dports: String,
    pub protocol: Protocol,
    pub log_rejected: bool,
    pub accept_local: bool,
    pub reject_policy: RejectPolicy,
    /// Guarded port -> local port denied traffic is redirected to
    pub forward: BTreeMap<u16, u16>,
}

impl DriverConfig {
    pub fn allow_chain(&self) -> String {
        format!("{}-ALLOW", self.chain)
    }

    pub fn deny_chain(&self) -> String {
        format!("{}-DENY", self.chain)
    }

    /// The per-client rule shared by all operations on the allow chain
    fn client_rule<'a>(
        &'a self,
        allow_chain: &'a str,
        address: &'a str,
        rulenum: Option<u32>,
    ) -> RuleOptions<'a> {
        RuleOptions {
            chain: Some(allow_chain),
            rulenum,
            src: Some(address),
            protocol: Some(self.protocol),
            jump: Some("ACCEPT"),
            ..Default::default()
        }
    }
}

pub fn create(kind: DriverKind, config: DriverConfig, executor: Executor) -> Box<dyn FirewallDriver> {
    match kind {
        DriverKind::Iptables => Box::new(iptables::IptablesDriver::new(config, executor)),
        DriverKind::Netfilter => Box::new(netfilter::NetfilterDriver::new(config, executor)),
        DriverKind::None => Box::new(noop::NoopDriver::new()),
    }
}
